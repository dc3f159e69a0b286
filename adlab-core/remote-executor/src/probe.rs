//! 节点状态查询
//!
//! 就绪轮询和角色转移前置检查都通过状态探针读取节点电源 / 代理状态，
//! 状态查询走管理面（ARM），不依赖节点自身在线。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::az::AzCli;
use crate::command::with_deadline;
use crate::error::{RemoteError, Result};
use crate::target::{Inventory, Target};

/// 电源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Running,
    Starting,
    Stopping,
    Stopped,
    Deallocating,
    Deallocated,
    Unknown,
}

impl PowerState {
    /// 从 `PowerState/running` 这样的状态码解析
    pub fn from_code(code: &str) -> Self {
        match code.trim_start_matches("PowerState/") {
            "running" => PowerState::Running,
            "starting" => PowerState::Starting,
            "stopping" => PowerState::Stopping,
            "stopped" => PowerState::Stopped,
            "deallocating" => PowerState::Deallocating,
            "deallocated" => PowerState::Deallocated,
            _ => PowerState::Unknown,
        }
    }

    /// 节点确定已关机
    pub fn is_off(&self) -> bool {
        matches!(self, PowerState::Stopped | PowerState::Deallocated)
    }
}

/// 节点状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub power_state: PowerState,
    /// 虚拟机代理是否报告 Ready
    pub agent_ready: bool,
    #[serde(default)]
    pub provisioning_state: Option<String>,
}

impl NodeStatus {
    pub fn new(power_state: PowerState, agent_ready: bool) -> Self {
        Self {
            power_state,
            agent_ready,
            provisioning_state: None,
        }
    }

    /// 电源运行且代理就绪
    pub fn is_responsive(&self) -> bool {
        self.power_state == PowerState::Running && self.agent_ready
    }
}

/// 状态探针
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn query(&self, target: &Target) -> Result<NodeStatus>;
}

#[derive(Debug, Deserialize)]
struct InstanceStatus {
    code: String,
    #[serde(rename = "displayStatus", default)]
    display_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmAgent {
    #[serde(default)]
    statuses: Vec<InstanceStatus>,
}

#[derive(Debug, Deserialize)]
struct InstanceView {
    #[serde(default)]
    statuses: Vec<InstanceStatus>,
    #[serde(rename = "vmAgent", default)]
    vm_agent: Option<VmAgent>,
}

/// 解析 `az vm get-instance-view --query instanceView` 输出
pub fn parse_instance_view(json: &str) -> Result<NodeStatus> {
    let view: InstanceView = serde_json::from_str(json)
        .map_err(|e| RemoteError::ParseError(format!("instanceView 解析失败: {}", e)))?;

    let power_state = view
        .statuses
        .iter()
        .find(|s| s.code.starts_with("PowerState/"))
        .map(|s| PowerState::from_code(&s.code))
        .unwrap_or(PowerState::Unknown);

    let provisioning_state = view
        .statuses
        .iter()
        .find(|s| s.code.starts_with("ProvisioningState/"))
        .map(|s| s.code.trim_start_matches("ProvisioningState/").to_string());

    let agent_ready = view
        .vm_agent
        .map(|agent| {
            agent
                .statuses
                .iter()
                .any(|s| s.display_status.as_deref() == Some("Ready"))
        })
        .unwrap_or(false);

    Ok(NodeStatus {
        power_state,
        agent_ready,
        provisioning_state,
    })
}

/// 基于 `az vm get-instance-view` 的状态探针
pub struct AzInstanceViewProbe {
    az: AzCli,
    inventory: Inventory,
    query_timeout: Duration,
}

impl AzInstanceViewProbe {
    pub fn new(az: AzCli, inventory: Inventory) -> Self {
        Self {
            az,
            inventory,
            query_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }
}

#[async_trait]
impl StatusProbe for AzInstanceViewProbe {
    async fn query(&self, target: &Target) -> Result<NodeStatus> {
        let resource_group = self.inventory.resource_group(target)?;
        let args: Vec<String> = [
            "vm",
            "get-instance-view",
            "--resource-group",
            resource_group,
            "--name",
            target.node.as_str(),
            "--query",
            "instanceView",
            "--output",
            "json",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        // 单次查询不可取消，由超时兜底；取消由上层轮询器处理
        let never = CancellationToken::new();
        let output = with_deadline(target, self.query_timeout, &never, async {
            self.az.run(&args).await.map_err(|e| RemoteError::Delivery {
                target: target.to_string(),
                message: format!("启动 az 进程失败: {}", e),
            })
        })
        .await?;

        if !output.is_success() {
            return Err(RemoteError::Transport {
                target: target.to_string(),
                message: output.stderr,
            });
        }

        let status = parse_instance_view(&output.stdout)?;
        debug!("{} 状态: {:?}", target, status);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instance_view_ready() {
        let json = r#"{
            "statuses": [
                {"code": "ProvisioningState/succeeded", "displayStatus": "Provisioning succeeded"},
                {"code": "PowerState/running", "displayStatus": "VM running"}
            ],
            "vmAgent": {
                "vmAgentVersion": "2.7.41491.1102",
                "statuses": [{"code": "ProvisioningState/succeeded", "displayStatus": "Ready"}]
            }
        }"#;
        let status = parse_instance_view(json).unwrap();
        assert_eq!(status.power_state, PowerState::Running);
        assert!(status.agent_ready);
        assert!(status.is_responsive());
        assert_eq!(status.provisioning_state.as_deref(), Some("succeeded"));
    }

    #[test]
    fn test_parse_instance_view_deallocated() {
        let json = r#"{"statuses": [{"code": "PowerState/deallocated"}]}"#;
        let status = parse_instance_view(json).unwrap();
        assert_eq!(status.power_state, PowerState::Deallocated);
        assert!(status.power_state.is_off());
        assert!(!status.agent_ready);
    }

    #[test]
    fn test_power_state_unknown_code() {
        assert_eq!(PowerState::from_code("PowerState/hibernated"), PowerState::Unknown);
        assert!(!PowerState::Unknown.is_off());
    }
}
