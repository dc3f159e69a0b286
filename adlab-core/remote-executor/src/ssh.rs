//! SSH + PowerShell 执行器
//!
//! 使用系统 ssh 命令连接 Windows OpenSSH，脚本以 `-EncodedCommand`
//! (UTF-16LE Base64) 投递，命令行上只出现 Base64 字符，不受任何 shell 引号规则影响。

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{
    classify_disconnect, looks_like_disconnect, with_deadline, ExecutionOutcome, ExecutionResult,
    RemoteCommand, RemoteExecutor, ScriptParameter,
};
use crate::config::SshConfig;
use crate::error::{RemoteError, Result};
use crate::target::Inventory;

/// ssh 客户端自身出错时的退出码
const SSH_TRANSPORT_EXIT: i32 = 255;

/// 将 PowerShell 脚本编码为 `-EncodedCommand` 参数
pub fn encode_powershell_command(script: &str) -> String {
    let utf16_bytes: Vec<u8> = script
        .encode_utf16()
        .flat_map(|c| c.to_le_bytes())
        .collect();
    BASE64.encode(utf16_bytes)
}

/// 解码 `-EncodedCommand` 参数
pub fn decode_powershell_command(encoded: &str) -> Result<String> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| RemoteError::ParseError(format!("Base64 解码失败: {}", e)))?;
    if bytes.len() % 2 != 0 {
        return Err(RemoteError::ParseError("UTF-16 字节数为奇数".to_string()));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| RemoteError::ParseError(e.to_string()))
}

/// PowerShell 单引号字符串字面量
fn quote_powershell(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// 将参数通过 splatting 传入脚本块
///
/// 脚本正文保持原样放入脚本块中，参数值以单引号字面量赋值。
pub fn wrap_with_parameters(script: &str, parameters: &[ScriptParameter]) -> String {
    if parameters.is_empty() {
        return script.to_string();
    }

    let assignments = parameters
        .iter()
        .map(|p| format!("{} = {}", p.name, quote_powershell(&p.value)))
        .collect::<Vec<_>>()
        .join("; ");

    format!(
        "$adlabArgs = @{{ {} }}\n& {{\n{}\n}} @adlabArgs\n",
        assignments, script
    )
}

/// 通过 SSH 执行 PowerShell 的执行器
pub struct SshPowerShellExecutor {
    config: SshConfig,
    inventory: Inventory,
}

impl SshPowerShellExecutor {
    pub fn new(config: SshConfig, inventory: Inventory) -> Self {
        Self { config, inventory }
    }

    /// 组装 ssh 参数
    fn build_args(&self, command: &RemoteCommand) -> Result<Vec<String>> {
        let endpoint = self.inventory.resolve(&command.target)?;

        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs()),
            "-p".to_string(),
            self.config.port.to_string(),
        ];

        if let Some(identity) = self.config.identity_path() {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }

        // 区域配置了跳板机时经由跳板机访问
        if let Some(jump) = &endpoint.ssh_host {
            args.push("-J".to_string());
            args.push(self.config.jump_spec(jump));
        }

        let script = wrap_with_parameters(&command.script, &command.parameters);

        args.push(format!("{}@{}", self.config.username, command.target.node));
        args.extend(
            [
                "powershell.exe",
                "-NoProfile",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-EncodedCommand",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(encode_powershell_command(&script));

        Ok(args)
    }
}

#[async_trait]
impl RemoteExecutor for SshPowerShellExecutor {
    async fn run(
        &self,
        command: &RemoteCommand,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let target = command.target.to_string();
        info!("SSH PowerShell: {} ({})", target, command.describe_parameters());

        let args = self.build_args(command)?;

        let child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::Delivery {
                target: target.clone(),
                message: format!("启动 SSH 进程失败: {}", e),
            })?;

        // 超时或取消时 future 被丢弃，子进程随之终止
        let output = with_deadline(&command.target, command.timeout, cancel, async {
            child
                .wait_with_output()
                .await
                .map_err(|e| RemoteError::Delivery {
                    target: target.clone(),
                    message: format!("等待 SSH 进程失败: {}", e),
                })
        })
        .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_code = output.status.code();

        debug!(
            "SSH 命令完成, 退出码: {:?}, stdout 长度: {}, stderr 长度: {}",
            exit_code,
            stdout.len(),
            stderr.len()
        );

        if exit_code == Some(SSH_TRANSPORT_EXIT) || exit_code.is_none() {
            if looks_like_disconnect(&stderr) {
                warn!("SSH 通道断开: {}", target);
                return classify_disconnect(command, stderr);
            }
            return Err(RemoteError::Transport {
                target,
                message: stderr,
            });
        }

        let outcome = if exit_code == Some(0) {
            ExecutionOutcome::Succeeded
        } else {
            ExecutionOutcome::Failed { exit_code }
        };

        Ok(ExecutionResult {
            target: command.target.clone(),
            stdout,
            stderr,
            exit_code,
            outcome,
        })
    }

    fn name(&self) -> &'static str {
        "ssh-powershell"
    }
}
