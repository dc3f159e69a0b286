//! ADLab 编排器
//!
//! 分阶段部署 / 容灾编排引擎：按固定顺序执行阶段，每个阶段由资源部署、
//! 远程命令、就绪等待和验证步骤组成；容灾流程在健康门控通过后转移 FSMO 角色。

pub mod catalog;
pub mod config;
pub mod deployer;
pub mod dr;
pub mod health;
pub mod orchestrator;
pub mod phase;
pub mod poller;
pub mod report;
pub mod roles;
pub mod state;
pub mod users;

pub use catalog::standard_plan;
pub use config::{ExecutorBackend, LabConfig, NodeConfig, NodeRole, RegionConfig};
pub use deployer::{
    deployment_name, AzDeploymentDeployer, DeployError, DeployRequest, DeployResult,
    ResourceDeployer,
};
pub use dr::{
    ChecklistItem, ChecklistScripts, ChecklistStatus, DrMode, DrOperation, DrReport, DrRunner,
    NodeSnapshot,
};
pub use health::{
    evaluate, CheckStatus, ExpectedPattern, HealthCheck, HealthGate, HealthReport, HealthVerdict,
    MatchKind, OutputMatcher, VerdictDetail,
};
pub use orchestrator::{Collaborators, PhaseOrchestrator};
pub use phase::{
    plan_from_yaml, plan_to_yaml, ArtifactKind, ParamValue, Phase, PhaseId, PhaseSelection,
    ScriptSource, Step, StepPolicy,
};
pub use poller::{PollOutcome, ReadinessPoller, ReadyCondition, DEFAULT_POLL_INTERVAL};
pub use report::{
    OrchestratorState, PhaseResult, PhaseStatus, RunReport, StepReport, StepStatus, TargetOutcome,
};
pub use roles::{
    default_replication_gate, FsmoRole, RoleHolders, RoleSet, RoleScripts, RoleTransferController,
    RoleTransferError,
};
pub use state::{ArtifactProducer, RunState, SasTokenProducer};
pub use users::{LabUser, Roster, RosterGenerator, UserRole, DEFAULT_SEED, DEFAULT_USER_COUNT};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("阶段计划错误: {0}")]
    PlanError(String),

    #[error("资源部署失败: {0}")]
    Deploy(#[from] DeployError),

    #[error("远程执行失败: {0}")]
    Remote(#[from] adlab_remote_executor::RemoteError),

    #[error("角色转移失败: {0}")]
    RoleTransfer(#[from] RoleTransferError),

    #[error("步骤失败: {0}")]
    StepFailed(String),

    #[error("依赖产物 {kind} 无法获得: {message}")]
    ArtifactUnavailable { kind: ArtifactKind, message: String },

    #[error("密钥 {name} 读取失败: {message}")]
    SecretUnavailable { name: String, message: String },

    #[error("操作已取消")]
    Cancelled,

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerdeError(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
