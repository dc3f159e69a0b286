//! 容灾流程
//!
//! 故障转移把全部 FSMO 角色从主域控移到灾备域控，故障恢复再移回。
//! 角色转移失败是致命错误；检查清单只报告 Pass / Warn / Fail，不中断流程。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use adlab_remote_executor::{
    redact_text, NodeStatus, RemoteCommand, RemoteError, RemoteExecutor, ScriptParameter,
    StatusProbe, Target,
};

use crate::config::LabConfig;
use crate::health::{ExpectedPattern, HealthGate};
use crate::poller::{PollOutcome, ReadinessPoller, ReadyCondition};
use crate::roles::{default_replication_gate, RoleHolders, RoleScripts, RoleSet, RoleTransferController};
use crate::{OrchestratorError, Result};

const DNS_CHECK: &str = r#"param([string]$DomainName)
$records = @(Resolve-DnsName -Name $DomainName -Server 127.0.0.1 -Type A -ErrorAction SilentlyContinue)
Write-Output "DnsRecords: $($records.Count)"
"#;

const SYSVOL_CHECK: &str = r#"Get-SmbShare -Name SYSVOL, NETLOGON -ErrorAction SilentlyContinue | ForEach-Object { Write-Output "Share: $($_.Name)" }
"#;

/// 故障转移方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrMode {
    /// 平滑转移，要求主域控在线且复制健康
    Graceful,
    /// 强制夺取，要求主域控已确认关机
    Seize,
}

impl fmt::Display for DrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrMode::Graceful => f.write_str("graceful"),
            DrMode::Seize => f.write_str("seize"),
        }
    }
}

/// 容灾操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "operation", content = "mode")]
pub enum DrOperation {
    Failover(DrMode),
    Failback,
}

/// 检查项状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for ChecklistStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecklistStatus::Pass => f.write_str("PASS"),
            ChecklistStatus::Warn => f.write_str("WARN"),
            ChecklistStatus::Fail => f.write_str("FAIL"),
        }
    }
}

/// 检查清单项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub name: String,
    pub status: ChecklistStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl ChecklistItem {
    fn new(name: &str, status: ChecklistStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

/// 预检时的节点状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 容灾报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub operation: DrOperation,
    pub source: Target,
    pub destination: Target,
    pub preflight: Vec<NodeSnapshot>,
    /// 转移后的角色持有者
    pub holders: RoleHolders,
    pub checklist: Vec<ChecklistItem>,
    pub duration_ms: u64,
}

impl DrReport {
    fn new(operation: DrOperation, source: Target, destination: Target) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            operation,
            source,
            destination,
            preflight: Vec::new(),
            holders: RoleHolders::default(),
            checklist: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn count(&self, status: ChecklistStatus) -> usize {
        self.checklist.iter().filter(|i| i.status == status).count()
    }

    /// 进程退出码：检查项失败为 2，严格模式下警告也为 2
    pub fn exit_code(&self, strict: bool) -> i32 {
        let failed = self.count(ChecklistStatus::Fail) > 0;
        let warned = self.count(ChecklistStatus::Warn) > 0;
        if failed || (strict && warned) {
            2
        } else {
            0
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_yaml(&self) -> serde_yaml::Result<String> {
        serde_yaml::to_string(self)
    }
}

/// 检查清单使用的脚本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistScripts {
    pub replication: String,
    pub dns: String,
    pub sysvol: String,
}

impl Default for ChecklistScripts {
    fn default() -> Self {
        Self {
            replication: RoleScripts::default().replication_check,
            dns: DNS_CHECK.to_string(),
            sysvol: SYSVOL_CHECK.to_string(),
        }
    }
}

/// 容灾执行器
pub struct DrRunner {
    config: Arc<LabConfig>,
    executor: Arc<dyn RemoteExecutor>,
    probe: Arc<dyn StatusProbe>,
    controller: RoleTransferController,
    poller: ReadinessPoller,
    scripts: ChecklistScripts,
    cancel: CancellationToken,
}

impl DrRunner {
    pub fn new(
        config: Arc<LabConfig>,
        executor: Arc<dyn RemoteExecutor>,
        probe: Arc<dyn StatusProbe>,
        cancel: CancellationToken,
    ) -> Self {
        let controller =
            RoleTransferController::new(executor.clone(), probe.clone(), cancel.clone())
                .with_command_timeout(config.execution.command_timeout);
        let poller = ReadinessPoller::new(config.polling.interval, cancel.clone());
        Self {
            config,
            executor,
            probe,
            controller,
            poller,
            scripts: ChecklistScripts::default(),
            cancel,
        }
    }

    pub fn with_scripts(mut self, scripts: ChecklistScripts) -> Self {
        self.scripts = scripts;
        self
    }

    /// 查询当前 FSMO 持有者，优先在主域控上查询
    pub async fn query_holders(&self) -> Result<(Target, RoleHolders)> {
        let primary = self.config.primary_dc()?;
        let secondary = self.config.secondary_dc()?;

        let on = match self.probe.query(&primary).await {
            Ok(status) if status.is_responsive() => primary,
            _ => {
                info!("{} 不可用，改为在 {} 上查询", primary, secondary);
                secondary
            }
        };
        let holders = self.controller.query_holders(&on).await?;
        Ok((on, holders))
    }

    /// 故障转移：主域控 -> 灾备域控
    pub async fn failover(&self, mode: DrMode) -> Result<DrReport> {
        let started = Instant::now();
        let primary = self.config.primary_dc()?;
        let secondary = self.config.secondary_dc()?;
        let mut report = DrReport::new(DrOperation::Failover(mode), primary.clone(), secondary.clone());
        info!("故障转移 ({}) {} -> {}", mode, primary, secondary);

        report.preflight = self.preflight(&[primary.clone(), secondary.clone()]).await;
        self.require_responsive(&report.preflight, &secondary)?;

        let roles = RoleSet::all();
        report.holders = match mode {
            DrMode::Graceful => {
                self.controller
                    .transfer_graceful(&primary, &secondary, &roles)
                    .await?
            }
            DrMode::Seize => self.controller.seize_forced(&primary, &secondary, &roles).await?,
        };

        report.checklist = self.checklist(&secondary, &report.holders).await?;
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// 故障恢复：等待主域控就绪后平滑转移回主域控
    pub async fn failback(&self) -> Result<DrReport> {
        let started = Instant::now();
        let primary = self.config.primary_dc()?;
        let secondary = self.config.secondary_dc()?;
        let mut report = DrReport::new(DrOperation::Failback, secondary.clone(), primary.clone());
        info!("故障恢复 {} -> {}", secondary, primary);

        match self
            .poller
            .wait_for(
                self.probe.as_ref(),
                &primary,
                ReadyCondition::AgentReady,
                self.config.polling.ready_timeout,
            )
            .await
        {
            PollOutcome::Ready => {}
            PollOutcome::Cancelled => return Err(OrchestratorError::Cancelled),
            PollOutcome::TimedOut => {
                return Err(OrchestratorError::StepFailed(format!(
                    "{} 在 {}s 内未就绪，无法恢复",
                    primary,
                    self.config.polling.ready_timeout.as_secs()
                )))
            }
        }

        report.preflight = self.preflight(&[secondary.clone(), primary.clone()]).await;
        report.holders = self
            .controller
            .transfer_graceful(&secondary, &primary, &RoleSet::all())
            .await?;

        report.checklist = self.checklist(&primary, &report.holders).await?;
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    async fn preflight(&self, targets: &[Target]) -> Vec<NodeSnapshot> {
        let mut snapshots = Vec::with_capacity(targets.len());
        for target in targets {
            let snapshot = match self.probe.query(target).await {
                Ok(status) => {
                    info!(
                        "预检 {}: {:?}, 代理就绪: {}",
                        target, status.power_state, status.agent_ready
                    );
                    NodeSnapshot {
                        target: target.clone(),
                        status: Some(status),
                        error: None,
                    }
                }
                Err(e) => {
                    warn!("预检 {} 状态查询失败: {}", target, e);
                    NodeSnapshot {
                        target: target.clone(),
                        status: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            snapshots.push(snapshot);
        }
        snapshots
    }

    fn require_responsive(&self, preflight: &[NodeSnapshot], target: &Target) -> Result<()> {
        let responsive = preflight
            .iter()
            .find(|s| &s.target == target)
            .and_then(|s| s.status.as_ref())
            .is_some_and(NodeStatus::is_responsive);
        if responsive {
            Ok(())
        } else {
            Err(OrchestratorError::StepFailed(format!(
                "目标域控 {} 不可用，无法接收角色",
                target
            )))
        }
    }

    /// 转移后的健康检查清单
    async fn checklist(&self, on: &Target, holders: &RoleHolders) -> Result<Vec<ChecklistItem>> {
        let mut items = Vec::with_capacity(4);

        let held = holders.held_by(&on.node);
        let missing = RoleSet::of(RoleSet::all().iter().filter(|r| !held.contains(*r)));
        items.push(if missing.is_empty() {
            ChecklistItem::new("fsmo", ChecklistStatus::Pass, format!("{} 持有全部角色", on))
        } else {
            ChecklistItem::new("fsmo", ChecklistStatus::Fail, format!("缺失 {}", missing))
        });

        items.push(
            self.gated_item(
                "replication",
                RemoteCommand::new(on.clone(), self.scripts.replication.as_str()),
                &default_replication_gate(),
            )
            .await?,
        );

        let dns_gate = gate(ExpectedPattern::minimum_count("dns", r"DnsRecords:\s*(\d+)", 1));
        items.push(
            self.gated_item(
                "dns",
                RemoteCommand::new(on.clone(), self.scripts.dns.as_str()).parameter(
                    ScriptParameter::plain("DomainName", self.config.lab.domain.as_str()),
                ),
                &dns_gate,
            )
            .await?,
        );

        let sysvol_gate = gate(ExpectedPattern::presence("sysvol", r"Share:\s*SYSVOL"));
        items.push(
            self.gated_item(
                "sysvol",
                RemoteCommand::new(on.clone(), self.scripts.sysvol.as_str()),
                &sysvol_gate,
            )
            .await?,
        );

        for item in &items {
            match item.status {
                ChecklistStatus::Pass => info!("[{}] {}: {}", item.status, item.name, item.detail),
                _ => warn!("[{}] {}: {}", item.status, item.name, item.detail),
            }
        }
        Ok(items)
    }

    /// 远程执行一项检查；执行失败记为 Fail，无法确认记为 Warn
    async fn gated_item(
        &self,
        name: &str,
        command: RemoteCommand,
        gate: &HealthGate,
    ) -> Result<ChecklistItem> {
        let command = command.timeout(self.config.execution.command_timeout);
        let result = match self.executor.run(&command, &self.cancel).await {
            Ok(result) => result,
            Err(RemoteError::Cancelled(_)) => return Err(OrchestratorError::Cancelled),
            Err(e) => return Ok(ChecklistItem::new(name, ChecklistStatus::Warn, e.to_string())),
        };

        if !result.exit_succeeded() {
            return Ok(ChecklistItem::new(
                name,
                ChecklistStatus::Fail,
                redact_text(&result.combined_output(), &[]),
            ));
        }

        let verdict = gate.verdict(&result.stdout);
        let status = if !verdict.ok {
            ChecklistStatus::Fail
        } else if !verdict.is_confirmed() {
            ChecklistStatus::Warn
        } else {
            ChecklistStatus::Pass
        };
        Ok(ChecklistItem::new(name, status, verdict.describe()))
    }
}

fn gate(pattern: ExpectedPattern) -> HealthGate {
    HealthGate::from_patterns(&[pattern]).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_with(statuses: &[ChecklistStatus]) -> DrReport {
        let mut report = DrReport::new(
            DrOperation::Failover(DrMode::Graceful),
            Target::new("primary", "dc01"),
            Target::new("secondary", "dc02"),
        );
        for (i, status) in statuses.iter().enumerate() {
            report
                .checklist
                .push(ChecklistItem::new(&format!("item{}", i), *status, ""));
        }
        report
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(report_with(&[ChecklistStatus::Pass]).exit_code(true), 0);
        let warned = report_with(&[ChecklistStatus::Pass, ChecklistStatus::Warn]);
        assert_eq!(warned.exit_code(false), 0);
        assert_eq!(warned.exit_code(true), 2);
        assert_eq!(report_with(&[ChecklistStatus::Fail]).exit_code(false), 2);
    }

    #[test]
    fn test_report_serialization() {
        let report = report_with(&[ChecklistStatus::Warn]);
        let json = report.to_json().unwrap();
        assert!(json.contains("\"operation\": \"failover\""));
        assert!(json.contains("\"mode\": \"graceful\""));
        assert!(json.contains("\"warn\""));
    }
}
