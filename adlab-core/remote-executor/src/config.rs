//! SSH 执行器配置
//!
//! 对应 `[execution.ssh]`，仅在 `backend = "ssh"` 时使用。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// SSH 连接配置
///
/// 未指定 `identity_file` 时交给 ssh 自行选择默认密钥或 ssh-agent。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Windows 上的登录用户
    pub username: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 私钥文件，支持 `~/`
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// 跳板机登录用户，缺省与 `username` 相同
    #[serde(default)]
    pub jump_user: Option<String>,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

impl SshConfig {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            port: default_port(),
            identity_file: None,
            jump_user: None,
            connect_timeout: default_connect_timeout(),
        }
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn with_jump_user(mut self, user: impl Into<String>) -> Self {
        self.jump_user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// 展开后的私钥路径
    pub fn identity_path(&self) -> Option<PathBuf> {
        self.identity_file.as_deref().map(expand_home)
    }

    /// `-J` 参数值
    pub fn jump_spec(&self, host: &str) -> String {
        let user = self.jump_user.as_deref().unwrap_or(&self.username);
        format!("{}@{}", user, host)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
