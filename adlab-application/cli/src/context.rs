//! 运行上下文
//!
//! 加载配置并装配 Azure 后端的执行器、探针、密钥存储与部署器。

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use adlab_orchestrator::{
    ArtifactProducer, AzDeploymentDeployer, Collaborators, ExecutorBackend, LabConfig,
    SasTokenProducer,
};
use adlab_remote_executor::{
    AzCli, AzInstanceViewProbe, AzRunCommandExecutor, KeyVaultSecretStore, RemoteExecutor,
    Secret, SshPowerShellExecutor, StatusProbe,
};

use crate::GlobalArgs;

pub struct LabContext {
    pub config: Arc<LabConfig>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub probe: Arc<dyn StatusProbe>,
    az: AzCli,
}

impl LabContext {
    pub fn load(global: &GlobalArgs) -> Result<Self> {
        let config = load_config(global)?;
        let az = AzCli::new().with_subscription(config.azure.subscription.clone());
        let inventory = config.inventory();

        let executor: Arc<dyn RemoteExecutor> = match config.execution.backend {
            ExecutorBackend::RunCommand => {
                Arc::new(AzRunCommandExecutor::new(az.clone(), inventory.clone()))
            }
            ExecutorBackend::Ssh => {
                let ssh = config
                    .execution
                    .ssh
                    .clone()
                    .context("backend = \"ssh\" 需要 [execution.ssh] 配置")?;
                Arc::new(SshPowerShellExecutor::new(ssh, inventory.clone()))
            }
        };
        let probe: Arc<dyn StatusProbe> = Arc::new(AzInstanceViewProbe::new(az.clone(), inventory));
        tracing::debug!("远程执行后端: {}", executor.name());

        Ok(Self {
            config: Arc::new(config),
            executor,
            probe,
            az,
        })
    }

    /// 编排器所需的全部外部能力
    pub fn collaborators(&self, global: &GlobalArgs) -> Collaborators {
        let mut secrets = KeyVaultSecretStore::new(self.az.clone(), self.config.azure.key_vault.clone());
        if let Some(password) = &global.admin_password {
            secrets = secrets.with_override(
                self.config.lab.admin_password_secret.as_str(),
                Secret::new(password.as_str()),
            );
        }
        if let Some(password) = &global.dsrm_password {
            secrets = secrets.with_override(
                self.config.lab.dsrm_password_secret.as_str(),
                Secret::new(password.as_str()),
            );
        }

        let token = SasTokenProducer::new(
            self.az.clone(),
            self.config.azure.storage_account.clone(),
            self.config.azure.script_container.as_str(),
        )
        .with_ttl(self.config.azure.token_ttl);
        let token: Arc<dyn ArtifactProducer> = Arc::new(token);

        Collaborators {
            executor: self.executor.clone(),
            deployer: Arc::new(AzDeploymentDeployer::new(self.az.clone())),
            probe: self.probe.clone(),
            secrets: Arc::new(secrets),
            producers: vec![token],
        }
    }
}

/// 只加载配置，不装配后端
pub fn load_config(global: &GlobalArgs) -> Result<LabConfig> {
    let explicit = global
        .config
        .as_ref()
        .map(|p| PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).into_owned()));
    LabConfig::load(explicit.as_deref()).context("加载实验室配置失败")
}
