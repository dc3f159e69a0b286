//! CLI 命令处理模块

pub mod deploy;
pub mod dr;
pub mod output; // 报告输出
pub mod phases;
pub mod plan;
pub mod roles;
pub mod users;
