//! FSMO 角色转移
//!
//! 两种模式：
//! - 平滑转移：原持有者在线，复制健康时才执行
//! - 强制夺取：原持有者必须经状态查询确认已关机，操作不可逆
//!
//! 两种模式都以转移后的持有者查询结果为准。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use adlab_remote_executor::{
    redact_text, ExecutionResult, RemoteCommand, RemoteError, RemoteExecutor, ScriptParameter,
    StatusProbe, Target,
};

use crate::health::{ExpectedPattern, HealthGate};

/// FSMO 角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsmoRole {
    SchemaMaster,
    DomainNamingMaster,
    PdcEmulator,
    RidMaster,
    InfrastructureMaster,
}

impl FsmoRole {
    pub const ALL: [FsmoRole; 5] = [
        FsmoRole::SchemaMaster,
        FsmoRole::DomainNamingMaster,
        FsmoRole::PdcEmulator,
        FsmoRole::RidMaster,
        FsmoRole::InfrastructureMaster,
    ];

    /// `Move-ADDirectoryServerOperationMasterRole` 使用的名称
    pub fn powershell_name(&self) -> &'static str {
        match self {
            FsmoRole::SchemaMaster => "SchemaMaster",
            FsmoRole::DomainNamingMaster => "DomainNamingMaster",
            FsmoRole::PdcEmulator => "PDCEmulator",
            FsmoRole::RidMaster => "RIDMaster",
            FsmoRole::InfrastructureMaster => "InfrastructureMaster",
        }
    }

    /// `netdom query fsmo` 输出中的行首标签
    fn netdom_label(&self) -> &'static str {
        match self {
            FsmoRole::SchemaMaster => "schema master",
            FsmoRole::DomainNamingMaster => "domain naming master",
            FsmoRole::PdcEmulator => "pdc",
            FsmoRole::RidMaster => "rid pool manager",
            FsmoRole::InfrastructureMaster => "infrastructure master",
        }
    }
}

impl fmt::Display for FsmoRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.powershell_name())
    }
}

/// 角色集合
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoleSet(BTreeSet<FsmoRole>);

impl RoleSet {
    pub fn all() -> Self {
        Self(FsmoRole::ALL.iter().copied().collect())
    }

    pub fn of(roles: impl IntoIterator<Item = FsmoRole>) -> Self {
        Self(roles.into_iter().collect())
    }

    pub fn contains(&self, role: FsmoRole) -> bool {
        self.0.contains(&role)
    }

    pub fn insert(&mut self, role: FsmoRole) {
        self.0.insert(role);
    }

    pub fn iter(&self) -> impl Iterator<Item = FsmoRole> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 逗号分隔的 PowerShell 名称
    pub fn to_parameter(&self) -> String {
        self.iter()
            .map(|r| r.powershell_name())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("(无)")
        } else {
            f.write_str(&self.to_parameter())
        }
    }
}

/// 角色持有者
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoleHolders {
    /// 角色 -> 持有者短主机名 (小写)
    holders: BTreeMap<FsmoRole, String>,
}

impl RoleHolders {
    /// 解析 `netdom query fsmo` 输出
    ///
    /// ```text
    /// Schema master               DC01.managed-connections.net
    /// Domain naming master        DC01.managed-connections.net
    /// PDC                         DC01.managed-connections.net
    /// RID pool manager            DC01.managed-connections.net
    /// Infrastructure master       DC01.managed-connections.net
    /// The command completed successfully.
    /// ```
    pub fn parse(output: &str) -> Result<Self, RoleTransferError> {
        let mut holders = BTreeMap::new();

        for line in output.lines() {
            let lower = line.trim().to_lowercase();
            let Some(role) = FsmoRole::ALL
                .iter()
                .copied()
                .find(|r| lower.starts_with(r.netdom_label()))
            else {
                continue;
            };
            if let Some(host) = line.split_whitespace().last() {
                holders.insert(role, short_host(host));
            }
        }

        if holders.is_empty() {
            return Err(RoleTransferError::ParseError(
                "输出中没有找到任何 FSMO 角色".to_string(),
            ));
        }
        Ok(Self { holders })
    }

    pub fn holder(&self, role: FsmoRole) -> Option<&str> {
        self.holders.get(&role).map(String::as_str)
    }

    /// 指定节点持有的角色
    pub fn held_by(&self, node: &str) -> RoleSet {
        let node = short_host(node);
        RoleSet::of(
            self.holders
                .iter()
                .filter(|(_, holder)| **holder == node)
                .map(|(role, _)| *role),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (FsmoRole, &str)> {
        self.holders.iter().map(|(role, holder)| (*role, holder.as_str()))
    }
}

fn short_host(host: &str) -> String {
    host.split('.').next().unwrap_or(host).to_lowercase()
}

/// 角色转移错误
#[derive(Error, Debug)]
pub enum RoleTransferError {
    #[error("源域控 {node} 不可达，拒绝平滑转移 (不会自动改为强制夺取): {detail}")]
    SourceUnreachable { node: String, detail: String },

    #[error("复制状态不健康，未执行转移: {detail}")]
    ReplicationUnhealthy { detail: String },

    #[error("复制健康未能确认，未执行转移: {detail}")]
    ReplicationUnconfirmed { detail: String },

    #[error("原持有者 {node} 仍在运行 ({state})，拒绝强制夺取")]
    PriorHolderReachable { node: String, state: String },

    #[error("无法确认原持有者 {node} 已关机，拒绝强制夺取: {detail}")]
    PriorHolderUnverified { node: String, detail: String },

    #[error("角色转移不完整: 已确认 {confirmed}，缺失 {missing}")]
    IncompleteTransfer { confirmed: RoleSet, missing: RoleSet },

    #[error("{node} 上的脚本执行失败: {detail}")]
    ScriptFailed { node: String, detail: String },

    #[error("远程执行失败: {0}")]
    Remote(#[from] RemoteError),

    #[error("角色输出解析失败: {0}")]
    ParseError(String),

    #[error("角色转移已取消")]
    Cancelled,
}

/// 角色操作使用的远程脚本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleScripts {
    /// 查询持有者，输出 `netdom query fsmo` 格式
    pub query: String,
    /// 复制健康检查
    pub replication_check: String,
    /// 平滑转移，参数 `TargetDc`、`Roles`
    pub transfer: String,
    /// 强制夺取，参数 `TargetDc`、`Roles`
    pub seize: String,
}

impl Default for RoleScripts {
    fn default() -> Self {
        Self {
            query: "netdom query fsmo\n".to_string(),
            replication_check: r#"$ErrorActionPreference = 'Stop'
$failures = @(Get-ADReplicationFailure -Target $env:COMPUTERNAME -Scope Server | Where-Object { $_.FailureCount -gt 0 })
Write-Output "ReplicationFailures: $($failures.Count)"
repadmin /replsummary
"#
            .to_string(),
            transfer: r#"param([string]$TargetDc, [string]$Roles)
$ErrorActionPreference = 'Stop'
Move-ADDirectoryServerOperationMasterRole -Identity $TargetDc -OperationMasterRole ($Roles -split ',') -Confirm:$false
"#
            .to_string(),
            seize: r#"param([string]$TargetDc, [string]$Roles)
$ErrorActionPreference = 'Stop'
Move-ADDirectoryServerOperationMasterRole -Identity $TargetDc -OperationMasterRole ($Roles -split ',') -Force -Confirm:$false
"#
            .to_string(),
        }
    }
}

/// 默认复制健康门控
pub fn default_replication_gate() -> HealthGate {
    let patterns = [ExpectedPattern::failure_count(
        "replication",
        r"(?i)ReplicationFailures:\s*(\d+)",
    )];
    HealthGate::from_patterns(&patterns).unwrap_or_default()
}

/// 角色转移控制器
pub struct RoleTransferController {
    executor: Arc<dyn RemoteExecutor>,
    probe: Arc<dyn StatusProbe>,
    scripts: RoleScripts,
    replication_gate: HealthGate,
    allow_unconfirmed_replication: bool,
    command_timeout: Duration,
    cancel: CancellationToken,
}

impl RoleTransferController {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        probe: Arc<dyn StatusProbe>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            probe,
            scripts: RoleScripts::default(),
            replication_gate: default_replication_gate(),
            allow_unconfirmed_replication: false,
            command_timeout: Duration::from_secs(10 * 60),
            cancel,
        }
    }

    pub fn with_scripts(mut self, scripts: RoleScripts) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_replication_gate(mut self, gate: HealthGate) -> Self {
        self.replication_gate = gate;
        self
    }

    /// 复制检查输出无法判定时仍执行平滑转移，需操作员显式开启
    pub fn allow_unconfirmed_replication(mut self, allow: bool) -> Self {
        self.allow_unconfirmed_replication = allow;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    async fn run(&self, command: RemoteCommand) -> Result<ExecutionResult, RoleTransferError> {
        let command = command.timeout(self.command_timeout);
        self.executor
            .run(&command, &self.cancel)
            .await
            .map_err(|e| match e {
                RemoteError::Cancelled(_) => RoleTransferError::Cancelled,
                other => RoleTransferError::Remote(other),
            })
    }

    fn move_command(&self, script: &str, to: &Target, roles: &RoleSet) -> RemoteCommand {
        RemoteCommand::new(to.clone(), script).parameters([
            ScriptParameter::plain("TargetDc", to.node.as_str()),
            ScriptParameter::plain("Roles", roles.to_parameter()),
        ])
    }

    /// 在 `on` 上查询当前持有者
    pub async fn query_holders(&self, on: &Target) -> Result<RoleHolders, RoleTransferError> {
        let result = self
            .run(RemoteCommand::new(on.clone(), self.scripts.query.as_str()))
            .await?;
        if !result.exit_succeeded() {
            return Err(RoleTransferError::ScriptFailed {
                node: on.to_string(),
                detail: redact_text(&result.combined_output(), &[]),
            });
        }
        RoleHolders::parse(&result.stdout)
    }

    /// 检查 `to` 是否持有全部角色
    async fn confirm(&self, to: &Target, roles: &RoleSet) -> Result<RoleHolders, RoleTransferError> {
        let holders = self.query_holders(to).await?;
        let held = holders.held_by(&to.node);
        let confirmed = RoleSet::of(roles.iter().filter(|r| held.contains(*r)));
        let missing = RoleSet::of(roles.iter().filter(|r| !held.contains(*r)));

        if !missing.is_empty() {
            error!("{} 缺少角色: {}", to, missing);
            return Err(RoleTransferError::IncompleteTransfer { confirmed, missing });
        }

        info!("已确认 {} 持有角色: {}", to, confirmed);
        Ok(holders)
    }

    /// 平滑转移
    ///
    /// 源不可达时返回 `SourceUnreachable`，复制不健康时返回 `ReplicationUnhealthy`，
    /// 两种情况都不会尝试转移。
    pub async fn transfer_graceful(
        &self,
        from: &Target,
        to: &Target,
        roles: &RoleSet,
    ) -> Result<RoleHolders, RoleTransferError> {
        info!("平滑转移角色 {} : {} -> {}", roles, from, to);

        match self.probe.query(from).await {
            Ok(status) if status.is_responsive() => {}
            Ok(status) => {
                return Err(RoleTransferError::SourceUnreachable {
                    node: from.to_string(),
                    detail: format!("{:?}, 代理就绪: {}", status.power_state, status.agent_ready),
                })
            }
            Err(e) => {
                return Err(RoleTransferError::SourceUnreachable {
                    node: from.to_string(),
                    detail: e.to_string(),
                })
            }
        }

        let check = self
            .run(RemoteCommand::new(
                to.clone(),
                self.scripts.replication_check.as_str(),
            ))
            .await?;
        if !check.exit_succeeded() {
            return Err(RoleTransferError::ReplicationUnhealthy {
                detail: format!("复制检查脚本失败: {}", redact_text(&check.stderr, &[])),
            });
        }
        let verdict = self.replication_gate.verdict(&check.stdout);
        if !verdict.ok {
            warn!("复制不健康，取消转移: {}", verdict.describe());
            return Err(RoleTransferError::ReplicationUnhealthy {
                detail: verdict.describe(),
            });
        }
        if !verdict.is_confirmed() {
            if !self.allow_unconfirmed_replication {
                warn!("复制健康未能确认，取消转移: {}", verdict.describe());
                return Err(RoleTransferError::ReplicationUnconfirmed {
                    detail: verdict.describe(),
                });
            }
            warn!("复制健康未能确认，按操作员选择继续平滑转移: {}", verdict.describe());
        }

        let result = self
            .run(self.move_command(&self.scripts.transfer, to, roles))
            .await?;
        if !result.exit_succeeded() {
            warn!(
                "转移脚本报告失败，以持有者查询为准: {}",
                redact_text(&result.stderr, &[])
            );
        }

        self.confirm(to, roles).await
    }

    /// 强制夺取
    ///
    /// 原持有者必须经状态查询确认已关机 / 已释放，否则不发出任何远程命令。
    pub async fn seize_forced(
        &self,
        prior: &Target,
        to: &Target,
        roles: &RoleSet,
    ) -> Result<RoleHolders, RoleTransferError> {
        match self.probe.query(prior).await {
            Ok(status) if status.power_state.is_off() => {
                info!("已确认原持有者 {} 处于 {:?}", prior, status.power_state);
            }
            Ok(status) => {
                return Err(RoleTransferError::PriorHolderReachable {
                    node: prior.to_string(),
                    state: format!("{:?}", status.power_state),
                })
            }
            Err(e) => {
                return Err(RoleTransferError::PriorHolderUnverified {
                    node: prior.to_string(),
                    detail: e.to_string(),
                })
            }
        }

        warn!(
            "强制夺取角色 {} 到 {}: 操作不可逆，存在一致性风险；{} 不得以域控身份重新上线，需先做元数据清理",
            roles, to, prior
        );

        let result = self.run(self.move_command(&self.scripts.seize, to, roles)).await?;
        if !result.exit_succeeded() {
            warn!(
                "夺取脚本报告失败，以持有者查询为准: {}",
                redact_text(&result.stderr, &[])
            );
        }

        self.confirm(to, roles).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETDOM: &str = "Schema master               DC01.managed-connections.net
Domain naming master        DC01.managed-connections.net
PDC                         DC02.managed-connections.net
RID pool manager            DC01.managed-connections.net
Infrastructure master       dc01.managed-connections.net
The command completed successfully.
";

    #[test]
    fn test_parse_netdom() {
        let holders = RoleHolders::parse(NETDOM).unwrap();
        assert_eq!(holders.holder(FsmoRole::SchemaMaster), Some("dc01"));
        assert_eq!(holders.holder(FsmoRole::PdcEmulator), Some("dc02"));
        assert_eq!(holders.held_by("DC01").len(), 4);
        assert_eq!(
            holders.held_by("dc02.managed-connections.net"),
            RoleSet::of([FsmoRole::PdcEmulator])
        );
    }

    #[test]
    fn test_parse_netdom_garbage() {
        assert!(matches!(
            RoleHolders::parse("The specified domain either does not exist"),
            Err(RoleTransferError::ParseError(_))
        ));
    }

    #[test]
    fn test_role_set_parameter() {
        let roles = RoleSet::of([FsmoRole::RidMaster, FsmoRole::PdcEmulator]);
        assert_eq!(roles.to_parameter(), "PDCEmulator,RIDMaster");
        assert_eq!(RoleSet::all().len(), 5);
        assert_eq!(RoleSet::default().to_string(), "(无)");
    }

    #[test]
    fn test_default_replication_gate() {
        let gate = default_replication_gate();
        assert!(gate.verdict("ReplicationFailures: 0").is_confirmed());
        assert!(!gate.verdict("ReplicationFailures: 2").ok);
    }
}
