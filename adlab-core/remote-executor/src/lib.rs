//! ADLab 远程执行器
//!
//! 提供在实验室虚拟机上执行脚本的能力，支持：
//! - Azure Run Command（脚本经临时文件投递）
//! - SSH + PowerShell `-EncodedCommand`
//! - 区分"命令无法送达"与"脚本执行失败"
//! - 预期重启导致的通道断开
//! - 节点电源 / 代理状态查询
//! - Key Vault 密钥读取与输出脱敏
//!
//! # 示例
//!
//! ```ignore
//! use adlab_remote_executor::{AzCli, AzRunCommandExecutor, Inventory, RemoteCommand, Target};
//!
//! let executor = AzRunCommandExecutor::new(AzCli::new(), inventory);
//! let command = RemoteCommand::new(Target::new("primary", "dc01"), "Get-ADDomain");
//! let result = executor.run(&command, &cancel).await?;
//! println!("{}", result.stdout);
//! ```

mod az;
mod command;
mod config;
mod error;
mod probe;
mod secret;
mod ssh;
mod target;

pub use az::{parse_run_command_output, AzCli, AzRunCommandExecutor, ProcessOutput, RunCommandOutput};
pub use command::{
    looks_like_disconnect, with_deadline, ExecutionOutcome, ExecutionResult, RemoteCommand,
    RemoteExecutor, ScriptParameter, DEFAULT_COMMAND_TIMEOUT,
};
pub use config::SshConfig;
pub use error::{RemoteError, Result};
pub use probe::{parse_instance_view, AzInstanceViewProbe, NodeStatus, PowerState, StatusProbe};
pub use secret::{redact_text, KeyVaultSecretStore, Secret, SecretStore, StaticSecretStore};
pub use ssh::{
    decode_powershell_command, encode_powershell_command, wrap_with_parameters,
    SshPowerShellExecutor,
};
pub use target::{Inventory, RegionEndpoint, Target};

pub use tokio_util::sync::CancellationToken;
