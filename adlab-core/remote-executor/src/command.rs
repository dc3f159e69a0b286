//! 远程命令与执行结果

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{RemoteError, Result};
use crate::target::Target;

/// 默认命令超时（域控提升等脚本可能运行较久）
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// 重启导致的通道断开特征（小写匹配）
const DISCONNECT_MARKERS: &[&str] = &[
    "connection reset",
    "connection closed",
    "closed by remote host",
    "forcibly closed",
    "broken pipe",
    "operation was interrupted",
    "vm is being restarted",
    "machine is restarting",
];

/// 脚本参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptParameter {
    pub name: String,
    pub value: String,
    /// 敏感参数（密码、令牌），日志中显示为 ***
    #[serde(default)]
    pub sensitive: bool,
}

impl ScriptParameter {
    pub fn plain(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    pub fn sensitive(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: true,
        }
    }

    /// 可用于日志的值
    pub fn display_value(&self) -> &str {
        if self.sensitive {
            "***"
        } else {
            &self.value
        }
    }
}

/// 提交给远程执行器的一条命令
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    pub target: Target,
    /// 脚本正文，原样投递
    pub script: String,
    pub parameters: Vec<ScriptParameter>,
    pub timeout: Duration,
    /// 脚本会主动触发目标重启，通道断开属于预期
    pub expect_reboot: bool,
}

impl RemoteCommand {
    pub fn new(target: Target, script: impl Into<String>) -> Self {
        Self {
            target,
            script: script.into(),
            parameters: Vec::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            expect_reboot: false,
        }
    }

    pub fn parameter(mut self, parameter: ScriptParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn parameters(mut self, parameters: impl IntoIterator<Item = ScriptParameter>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn expect_reboot(mut self, expect: bool) -> Self {
        self.expect_reboot = expect;
        self
    }

    /// 敏感参数的原值（用于输出脱敏）
    pub fn sensitive_values(&self) -> Vec<String> {
        self.parameters
            .iter()
            .filter(|p| p.sensitive)
            .map(|p| p.value.clone())
            .collect()
    }

    /// 参数的日志表示
    pub fn describe_parameters(&self) -> String {
        self.parameters
            .iter()
            .map(|p| format!("{}={}", p.name, p.display_value()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// 执行结论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExecutionOutcome {
    /// 脚本执行成功
    Succeeded,
    /// 脚本已执行但失败
    Failed { exit_code: Option<i32> },
    /// 目标按预期重启，通道中断
    ExpectedDisconnect,
}

/// 命令执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub target: Target,
    /// 标准输出
    pub stdout: String,
    /// 标准错误
    pub stderr: String,
    /// 退出码（Run Command 不一定提供）
    pub exit_code: Option<i32>,
    pub outcome: ExecutionOutcome,
}

impl ExecutionResult {
    pub fn succeeded(target: Target, stdout: impl Into<String>) -> Self {
        Self {
            target,
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            outcome: ExecutionOutcome::Succeeded,
        }
    }

    pub fn failed(target: Target, stderr: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            target,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
            outcome: ExecutionOutcome::Failed { exit_code },
        }
    }

    pub fn expected_disconnect(target: Target, detail: impl Into<String>) -> Self {
        Self {
            target,
            stdout: String::new(),
            stderr: detail.into(),
            exit_code: None,
            outcome: ExecutionOutcome::ExpectedDisconnect,
        }
    }

    /// 脚本是否成功执行
    pub fn exit_succeeded(&self) -> bool {
        self.outcome == ExecutionOutcome::Succeeded
    }

    /// 是否为预期的重启断开
    pub fn is_expected_disconnect(&self) -> bool {
        self.outcome == ExecutionOutcome::ExpectedDisconnect
    }

    /// 获取合并的输出（stdout + stderr）
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// 远程执行器
///
/// 实现方不得自动重试：域控提升等远程副作用不能盲目重复执行。
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// 在目标上执行脚本并收集输出
    async fn run(&self, command: &RemoteCommand, cancel: &CancellationToken)
        -> Result<ExecutionResult>;

    /// 执行器名称
    fn name(&self) -> &'static str;
}

/// 判断错误输出是否为通道断开
pub fn looks_like_disconnect(text: &str) -> bool {
    let lower = text.to_lowercase();
    DISCONNECT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// 处理通道断开：预期重启时返回 `ExpectedDisconnect`，否则为错误
pub(crate) fn classify_disconnect(
    command: &RemoteCommand,
    message: String,
) -> Result<ExecutionResult> {
    if command.expect_reboot {
        Ok(ExecutionResult::expected_disconnect(
            command.target.clone(),
            message,
        ))
    } else {
        Err(RemoteError::Disconnected {
            target: command.target.to_string(),
            message,
        })
    }
}

/// 在超时和取消约束下等待远程操作
pub async fn with_deadline<T, F>(
    target: &Target,
    timeout: Duration,
    cancel: &CancellationToken,
    future: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(RemoteError::Cancelled(target.to_string())),
        result = tokio::time::timeout(timeout, future) => match result {
            Ok(inner) => inner,
            Err(_) => Err(RemoteError::Timeout {
                target: target.to_string(),
                seconds: timeout.as_secs(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_parameter_hidden() {
        let command = RemoteCommand::new(Target::new("primary", "dc01"), "Write-Output ok")
            .parameter(ScriptParameter::plain("DomainName", "managed-connections.net"))
            .parameter(ScriptParameter::sensitive("SafeModePassword", "P@ss$word"));

        let described = command.describe_parameters();
        assert!(described.contains("DomainName=managed-connections.net"));
        assert!(described.contains("SafeModePassword=***"));
        assert!(!described.contains("P@ss$word"));
        assert_eq!(command.sensitive_values(), vec!["P@ss$word".to_string()]);
    }

    #[test]
    fn test_classify_disconnect() {
        let target = Target::new("primary", "dc01");
        let rebooting = RemoteCommand::new(target.clone(), "Restart-Computer").expect_reboot(true);
        let result = classify_disconnect(&rebooting, "connection reset".to_string()).unwrap();
        assert!(result.is_expected_disconnect());
        assert!(!result.exit_succeeded());

        let plain = RemoteCommand::new(target, "Get-Service");
        assert!(matches!(
            classify_disconnect(&plain, "connection reset".to_string()),
            Err(RemoteError::Disconnected { .. })
        ));
    }

    #[test]
    fn test_looks_like_disconnect() {
        assert!(looks_like_disconnect("ssh: Connection closed by remote host"));
        assert!(looks_like_disconnect("An existing connection was forcibly closed"));
        assert!(!looks_like_disconnect("Access is denied."));
    }

    #[test]
    fn test_combined_output() {
        let mut result = ExecutionResult::succeeded(Target::new("primary", "dc01"), "hello");
        assert_eq!(result.combined_output(), "hello");
        result.stderr = "warn".to_string();
        assert_eq!(result.combined_output(), "hello\nwarn");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_timeout() {
        let target = Target::new("primary", "dc01");
        let cancel = CancellationToken::new();
        let result: Result<()> = with_deadline(&target, Duration::from_secs(5), &cancel, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RemoteError::Timeout { seconds: 5, .. })));
    }

    #[tokio::test]
    async fn test_with_deadline_cancelled() {
        let target = Target::new("primary", "dc01");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = with_deadline(&target, Duration::from_secs(5), &cancel, async {
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RemoteError::Cancelled(_))));
    }
}
