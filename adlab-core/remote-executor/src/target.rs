//! 远程目标与实验室清单

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{RemoteError, Result};

/// 远程节点标识（区域组 + 节点名）
///
/// 仅作为查找键使用，不持有任何资源。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    /// 区域组名称（如 primary / secondary）
    pub region: String,
    /// 节点名称（即虚拟机名）
    pub node: String,
}

impl Target {
    pub fn new(region: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            node: node.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.node)
    }
}

/// 区域的访问端点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionEndpoint {
    /// Azure 资源组
    pub resource_group: String,
    /// SSH 跳板主机（仅 SSH 执行器使用）
    #[serde(default)]
    pub ssh_host: Option<String>,
}

/// 实验室清单：区域组 -> 访问端点
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    regions: HashMap<String, RegionEndpoint>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册区域
    pub fn with_region(mut self, name: impl Into<String>, endpoint: RegionEndpoint) -> Self {
        self.regions.insert(name.into(), endpoint);
        self
    }

    /// 解析目标所在区域的端点
    pub fn resolve(&self, target: &Target) -> Result<&RegionEndpoint> {
        self.regions
            .get(&target.region)
            .ok_or_else(|| RemoteError::UnknownTarget(target.to_string()))
    }

    /// 获取目标所在资源组
    pub fn resource_group(&self, target: &Target) -> Result<&str> {
        Ok(self.resolve(target)?.resource_group.as_str())
    }
}
