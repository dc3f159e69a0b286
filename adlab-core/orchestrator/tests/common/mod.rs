//! 集成测试共用的伪造实现

#![allow(dead_code)]

use adlab_orchestrator::*;
use adlab_remote_executor::{
    CancellationToken, ExecutionResult, NodeStatus, PowerState, RemoteCommand, RemoteError,
    RemoteExecutor, Secret, StaticSecretStore, StatusProbe, Target,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const LAB: &str = r#"
[lab]
name = "adlab"
domain = "managed-connections.net"

[azure]
storage_account = "adlabscripts"

[regions.primary]
resource_group = "rg-adlab-eus"
location = "eastus"

[regions.secondary]
resource_group = "rg-adlab-wus"
location = "westus2"

[[nodes]]
name = "dc01"
region = "primary"
role = "primary-dc"
private_ip = "10.10.1.4"

[[nodes]]
name = "dc02"
region = "secondary"
role = "secondary-dc"
private_ip = "10.20.1.4"

[[nodes]]
name = "app01"
region = "primary"
role = "app-server"

[[nodes]]
name = "app02"
region = "secondary"
role = "app-server"

[[nodes]]
name = "cl01"
region = "primary"
role = "client"

[[nodes]]
name = "cl02"
region = "primary"
role = "client"

[[nodes]]
name = "cl03"
region = "secondary"
role = "client"

[polling]
interval = "15s"
ready_timeout = "2m"
reboot_settle = "10s"
"#;

pub const ADMIN_PASSWORD: &str = "Adm1n!Pass";
pub const DSRM_PASSWORD: &str = "Dsrm!Pass9";
pub const SAS_TOKEN: &str = "sv=2024&sig=AbCdEf123";

pub fn lab() -> Arc<LabConfig> {
    Arc::new(LabConfig::from_toml_str(LAB).unwrap())
}

pub fn dc01() -> Target {
    Target::new("primary", "dc01")
}

pub fn dc02() -> Target {
    Target::new("secondary", "dc02")
}

pub fn running() -> NodeStatus {
    NodeStatus::new(PowerState::Running, true)
}

pub fn deallocated() -> NodeStatus {
    NodeStatus::new(PowerState::Deallocated, false)
}

/// `netdom query fsmo` 输出，所有角色都在 `holder` 上
pub fn netdom(holder: &str) -> String {
    netdom_split(holder, holder)
}

/// 前三个角色在 `first` 上，其余在 `rest` 上
pub fn netdom_split(first: &str, rest: &str) -> String {
    format!(
        "Schema master               {first}.managed-connections.net\r\n\
         Domain naming master        {first}.managed-connections.net\r\n\
         PDC                         {first}.managed-connections.net\r\n\
         RID pool manager            {rest}.managed-connections.net\r\n\
         Infrastructure master       {rest}.managed-connections.net\r\n\
         The command completed successfully.\r\n"
    )
}

type Handler = Box<dyn Fn(&RemoteCommand) -> adlab_remote_executor::Result<ExecutionResult> + Send + Sync>;

/// 远程执行器：按处理函数返回结果并记录每次调用
pub struct FakeExecutor {
    handler: Handler,
    calls: Mutex<Vec<RemoteCommand>>,
    hang: bool,
}

impl FakeExecutor {
    pub fn new(
        handler: impl Fn(&RemoteCommand) -> adlab_remote_executor::Result<ExecutionResult>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            hang: false,
        }
    }

    /// 所有命令都成功，标准输出为空
    pub fn succeeding() -> Self {
        Self::new(|command| Ok(ExecutionResult::succeeded(command.target.clone(), "")))
    }

    /// 命令一直挂起直到被取消
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::succeeding()
        }
    }

    pub fn calls(&self) -> Vec<RemoteCommand> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run(
        &self,
        command: &RemoteCommand,
        cancel: &CancellationToken,
    ) -> adlab_remote_executor::Result<ExecutionResult> {
        self.calls.lock().unwrap().push(command.clone());
        if self.hang {
            cancel.cancelled().await;
            return Err(RemoteError::Cancelled(command.target.to_string()));
        }
        (self.handler)(command)
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// 状态探针：未登记的节点查询失败
#[derive(Default)]
pub struct FakeProbe {
    statuses: Mutex<HashMap<Target, NodeStatus>>,
    queries: AtomicUsize,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, target: Target, status: NodeStatus) -> Self {
        self.set(target, status);
        self
    }

    /// 所有节点都已就绪
    pub fn all_running(config: &LabConfig) -> Self {
        let probe = Self::new();
        for target in config.all_targets() {
            probe.set(target, running());
        }
        probe
    }

    pub fn set(&self, target: Target, status: NodeStatus) {
        self.statuses.lock().unwrap().insert(target, status);
    }

    pub fn remove(&self, target: &Target) {
        self.statuses.lock().unwrap().remove(target);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusProbe for FakeProbe {
    async fn query(&self, target: &Target) -> adlab_remote_executor::Result<NodeStatus> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .ok_or_else(|| RemoteError::Transport {
                target: target.to_string(),
                message: "instance view unavailable".to_string(),
            })
    }
}

/// 部署器：记录请求，可对指定阶段返回失败
#[derive(Default)]
pub struct FakeDeployer {
    fail_on: Option<PhaseId>,
    requests: Mutex<Vec<DeployRequest>>,
}

impl FakeDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(phase: PhaseId) -> Self {
        Self {
            fail_on: Some(phase),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<DeployRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceDeployer for FakeDeployer {
    async fn deploy(
        &self,
        request: &DeployRequest,
        _cancel: &CancellationToken,
    ) -> std::result::Result<DeployResult, DeployError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail_on == Some(request.phase) {
            return Err(DeployError::DeploymentFailed {
                phase: request.phase.to_string(),
                status: "Failed".to_string(),
                exit_code: Some(1),
                detail: "QuotaExceeded".to_string(),
            });
        }
        Ok(DeployResult {
            success: true,
            deployment_name: format!("adlab-{}-20260101000000", request.phase),
            outputs: serde_json::json!({ "vnetId": format!("vnet-{}", request.phase) }),
        })
    }
}

/// 访问令牌生成器：`value` 为 None 时生成失败
pub struct FakeTokenProducer {
    value: Option<String>,
    calls: AtomicUsize,
}

impl FakeTokenProducer {
    pub fn new(value: Option<&str>) -> Self {
        Self {
            value: value.map(str::to_string),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactProducer for FakeTokenProducer {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::ScriptAccessToken
    }

    async fn produce(&self, _cancel: &CancellationToken) -> adlab_orchestrator::Result<Secret> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.value {
            Some(value) => Ok(Secret::new(value.as_str())),
            None => Err(OrchestratorError::ArtifactUnavailable {
                kind: ArtifactKind::ScriptAccessToken,
                message: "AuthorizationFailed".to_string(),
            }),
        }
    }
}

pub fn secrets() -> Arc<StaticSecretStore> {
    Arc::new(
        StaticSecretStore::new()
            .with_secret("adminPassword", Secret::new(ADMIN_PASSWORD))
            .with_secret("dsrmPassword", Secret::new(DSRM_PASSWORD)),
    )
}

/// 测试装配
pub struct Harness {
    pub config: Arc<LabConfig>,
    pub executor: Arc<FakeExecutor>,
    pub deployer: Arc<FakeDeployer>,
    pub probe: Arc<FakeProbe>,
    pub producer: Arc<FakeTokenProducer>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(executor: FakeExecutor) -> Self {
        let config = lab();
        let probe = FakeProbe::all_running(&config);
        Self {
            config,
            executor: Arc::new(executor),
            deployer: Arc::new(FakeDeployer::new()),
            probe: Arc::new(probe),
            producer: Arc::new(FakeTokenProducer::new(Some(SAS_TOKEN))),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deployer(mut self, deployer: FakeDeployer) -> Self {
        self.deployer = Arc::new(deployer);
        self
    }

    pub fn with_producer(mut self, producer: FakeTokenProducer) -> Self {
        self.producer = Arc::new(producer);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        let producer: Arc<dyn ArtifactProducer> = self.producer.clone();
        Collaborators {
            executor: self.executor.clone(),
            deployer: self.deployer.clone(),
            probe: self.probe.clone(),
            secrets: secrets(),
            producers: vec![producer],
        }
    }

    pub fn orchestrator(&self, plan: Vec<Phase>) -> PhaseOrchestrator {
        PhaseOrchestrator::new(
            self.config.clone(),
            plan,
            self.collaborators(),
            self.cancel.clone(),
        )
        .unwrap()
    }
}
