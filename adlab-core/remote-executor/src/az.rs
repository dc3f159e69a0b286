//! Azure CLI 调用与 Run Command 执行器
//!
//! 所有 az 调用都以参数向量方式启动进程，不经过 shell；
//! 脚本正文写入临时文件后以 `@file` 形式交给 az，避免引号和换行被破坏。

use async_trait::async_trait;
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{
    classify_disconnect, looks_like_disconnect, with_deadline, ExecutionOutcome, ExecutionResult,
    RemoteCommand, RemoteExecutor,
};
use crate::error::{RemoteError, Result};
use crate::ssh::wrap_with_parameters;
use crate::target::Inventory;

/// 进程输出
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Azure CLI 封装
#[derive(Debug, Clone)]
pub struct AzCli {
    program: PathBuf,
    subscription: Option<String>,
}

impl Default for AzCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("az"),
            subscription: None,
        }
    }
}

impl AzCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定 az 可执行文件路径
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// 指定订阅
    pub fn with_subscription(mut self, subscription: Option<String>) -> Self {
        self.subscription = subscription;
        self
    }

    /// 执行 az 命令
    ///
    /// 子进程在 future 被丢弃时会被终止（取消 / 超时）。
    pub async fn run(&self, args: &[String]) -> std::io::Result<ProcessOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if let Some(subscription) = &self.subscription {
            cmd.arg("--subscription").arg(subscription);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("执行 az {}", args.first().map(String::as_str).unwrap_or(""));

        let output = cmd.spawn()?.wait_with_output().await?;

        Ok(ProcessOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_code: output.status.code(),
        })
    }
}

/// Run Command 返回的状态条目
#[derive(Debug, Deserialize)]
struct RunCommandStatus {
    code: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunCommandResponse {
    #[serde(default)]
    value: Vec<RunCommandStatus>,
}

/// 解析后的 Run Command 输出（stdout / stderr 分通道）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub failed: bool,
}

/// 解析 `az vm run-command invoke` 的 JSON 输出
///
/// 每个通道以 `ComponentStatus/StdOut/succeeded`、`ComponentStatus/StdErr/succeeded`
/// 这样的状态码区分。StdErr 有内容或任一状态码以 `/failed` 结尾视为脚本失败。
pub fn parse_run_command_output(json: &str) -> Result<RunCommandOutput> {
    let response: RunCommandResponse = serde_json::from_str(json)
        .map_err(|e| RemoteError::ParseError(format!("Run Command 输出不是有效 JSON: {}", e)))?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut failed = false;

    for status in &response.value {
        let message = status.message.as_deref().unwrap_or("");
        if status.code.contains("/StdOut/") {
            stdout.push_str(message);
        } else if status.code.contains("/StdErr/") {
            stderr.push_str(message);
        }
        if status.code.ends_with("/failed") {
            failed = true;
        }
    }

    let stderr = stderr.trim().to_string();
    if !stderr.is_empty() {
        failed = true;
    }

    Ok(RunCommandOutput {
        stdout: stdout.trim().to_string(),
        stderr,
        failed,
    })
}

/// 基于 `az vm run-command invoke` 的执行器
pub struct AzRunCommandExecutor {
    az: AzCli,
    inventory: Inventory,
}

impl AzRunCommandExecutor {
    pub fn new(az: AzCli, inventory: Inventory) -> Self {
        Self { az, inventory }
    }

    /// 组装 az 参数
    fn build_args(&self, command: &RemoteCommand, script_path: &str) -> Result<Vec<String>> {
        let resource_group = self.inventory.resource_group(&command.target)?;

        let mut args: Vec<String> = [
            "vm",
            "run-command",
            "invoke",
            "--resource-group",
            resource_group,
            "--name",
            command.target.node.as_str(),
            "--command-id",
            "RunPowerShellScript",
            "--output",
            "json",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push("--scripts".to_string());
        args.push(format!("@{}", script_path));

        // 参数一律随脚本文件投递，不使用 `--parameters`
        Ok(args)
    }
}

#[async_trait]
impl RemoteExecutor for AzRunCommandExecutor {
    async fn run(
        &self,
        command: &RemoteCommand,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let target = command.target.to_string();
        info!("Run Command: {} ({})", target, command.describe_parameters());

        // 脚本写入临时文件，文件在本函数结束时删除
        let mut script_file = tempfile::Builder::new()
            .prefix("adlab-")
            .suffix(".ps1")
            .tempfile()
            .map_err(|e| RemoteError::Delivery {
                target: target.clone(),
                message: format!("创建脚本临时文件失败: {}", e),
            })?;
        let body = wrap_with_parameters(&command.script, &command.parameters);
        script_file
            .write_all(body.as_bytes())
            .and_then(|_| script_file.flush())
            .map_err(|e| RemoteError::Delivery {
                target: target.clone(),
                message: format!("写入脚本临时文件失败: {}", e),
            })?;

        let script_path = script_file.path().to_string_lossy().to_string();
        let args = self.build_args(command, &script_path)?;

        let output = with_deadline(&command.target, command.timeout, cancel, async {
            self.az.run(&args).await.map_err(|e| RemoteError::Delivery {
                target: target.clone(),
                message: format!("启动 az 进程失败: {}", e),
            })
        })
        .await?;

        if !output.is_success() {
            if looks_like_disconnect(&output.stderr) {
                warn!("Run Command 通道断开: {}", target);
                return classify_disconnect(command, output.stderr);
            }
            return Err(RemoteError::Transport {
                target,
                message: output.stderr,
            });
        }

        let parsed = parse_run_command_output(&output.stdout)?;
        debug!(
            "Run Command 完成: {}, stdout 长度: {}, stderr 长度: {}",
            target,
            parsed.stdout.len(),
            parsed.stderr.len()
        );

        let outcome = if parsed.failed {
            ExecutionOutcome::Failed { exit_code: None }
        } else {
            ExecutionOutcome::Succeeded
        };

        Ok(ExecutionResult {
            target: command.target.clone(),
            stdout: parsed.stdout,
            stderr: parsed.stderr,
            exit_code: if parsed.failed { None } else { Some(0) },
            outcome,
        })
    }

    fn name(&self) -> &'static str {
        "az-run-command"
    }
}
