//! 远程执行错误定义

use thiserror::Error;

/// 远程执行结果类型
pub type Result<T> = std::result::Result<T, RemoteError>;

/// 远程执行错误类型
///
/// 注意区分两类失败：
/// - 命令无法送达（传输层失败），返回本错误
/// - 命令已执行但脚本失败，返回 `Ok(ExecutionResult)`，由 `outcome` 表示
#[derive(Error, Debug)]
pub enum RemoteError {
    /// 传输错误（az / ssh 无法建立连接或返回传输层错误）
    #[error("传输失败 ({target}): {message}")]
    Transport { target: String, message: String },

    /// 脚本投递失败（临时文件、进程启动等本地问题）
    #[error("脚本投递失败 ({target}): {message}")]
    Delivery { target: String, message: String },

    /// 执行通道意外断开（目标重启等），且调用方未声明预期重启
    #[error("执行通道断开 ({target}): {message}")]
    Disconnected { target: String, message: String },

    /// 超时错误
    #[error("远程操作超时 ({target}): {seconds} 秒")]
    Timeout { target: String, seconds: u64 },

    /// 操作被取消
    #[error("远程操作已取消 ({0})")]
    Cancelled(String),

    /// 目标无法解析（区域或节点未定义）
    #[error("未知目标: {0}")]
    UnknownTarget(String),

    /// 输出解析错误
    #[error("输出解析失败: {0}")]
    ParseError(String),

    /// 密钥读取错误
    #[error("密钥读取失败: {0}")]
    SecretError(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),
}

impl RemoteError {
    /// 是否为传输层问题（命令未能确认送达）
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RemoteError::Transport { .. }
                | RemoteError::Disconnected { .. }
                | RemoteError::Timeout { .. }
        )
    }
}
