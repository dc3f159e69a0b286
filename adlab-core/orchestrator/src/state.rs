//! 运行状态
//!
//! 保存跨阶段传递的产物和每个阶段的部署输出。只由编排器在步骤之间修改。

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use adlab_remote_executor::{with_deadline, AzCli, RemoteError, Secret, Target};

use crate::phase::{ArtifactKind, PhaseId};
use crate::{OrchestratorError, Result};

/// 产物生成器
#[async_trait]
pub trait ArtifactProducer: Send + Sync {
    /// 生成的产物类型
    fn kind(&self) -> ArtifactKind;

    async fn produce(&self, cancel: &CancellationToken) -> Result<Secret>;
}

/// 运行状态
#[derive(Debug, Default)]
pub struct RunState {
    artifacts: HashMap<ArtifactKind, Secret>,
    deploy_outputs: BTreeMap<PhaseId, serde_json::Value>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&Secret> {
        self.artifacts.get(&kind)
    }

    pub fn has_artifact(&self, kind: ArtifactKind) -> bool {
        self.artifacts.contains_key(&kind)
    }

    /// 写入产物 (空值被拒绝)
    pub fn set_artifact(&mut self, kind: ArtifactKind, value: Secret) -> Result<()> {
        if value.is_empty() {
            return Err(OrchestratorError::ArtifactUnavailable {
                kind,
                message: "产物为空".to_string(),
            });
        }
        self.artifacts.insert(kind, value);
        Ok(())
    }

    /// 产物缺失时调用生成器
    ///
    /// 生成失败或结果为空时返回错误，不会用空值代替缺失的产物。
    pub async fn produce_if_absent(
        &mut self,
        kind: ArtifactKind,
        producers: &[Arc<dyn ArtifactProducer>],
        cancel: &CancellationToken,
    ) -> Result<Secret> {
        if let Some(existing) = self.artifacts.get(&kind) {
            return Ok(existing.clone());
        }

        let producer = producers
            .iter()
            .find(|p| p.kind() == kind)
            .ok_or_else(|| OrchestratorError::ArtifactUnavailable {
                kind,
                message: "没有可用的生成器".to_string(),
            })?;

        info!("产物 {} 缺失，按需生成", kind);
        let value = producer.produce(cancel).await.map_err(|e| match e {
            OrchestratorError::Cancelled => OrchestratorError::Cancelled,
            other => OrchestratorError::ArtifactUnavailable {
                kind,
                message: other.to_string(),
            },
        })?;

        self.set_artifact(kind, value.clone())?;
        Ok(value)
    }

    /// 记录阶段的部署输出 (同一阶段多次部署时按键合并)
    pub fn record_outputs(&mut self, phase: PhaseId, outputs: serde_json::Value) {
        if let (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(new)) =
            (self.deploy_outputs.get_mut(&phase), &outputs)
        {
            existing.extend(new.clone());
            return;
        }
        self.deploy_outputs.insert(phase, outputs);
    }

    pub fn outputs(&self, phase: PhaseId) -> Option<&serde_json::Value> {
        self.deploy_outputs.get(&phase)
    }

    /// 当前持有的敏感值原文 (用于输出脱敏)
    pub fn sensitive_values(&self) -> Vec<String> {
        self.artifacts
            .values()
            .map(|s| s.expose().to_string())
            .collect()
    }
}

/// 脚本容器只读 SAS 令牌生成器
///
/// 调用 `az storage container generate-sas`，令牌只保存在内存中。
pub struct SasTokenProducer {
    az: AzCli,
    account: Option<String>,
    container: String,
    ttl: Duration,
}

impl SasTokenProducer {
    pub fn new(az: AzCli, account: Option<String>, container: impl Into<String>) -> Self {
        Self {
            az,
            account,
            container: container.into(),
            ttl: Duration::from_secs(8 * 3600),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// 令牌过期时间 (UTC, 分钟精度)
    fn expiry(&self) -> Result<String> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| OrchestratorError::ConfigError(format!("无效的令牌有效期: {}", e)))?;
        Ok((chrono::Utc::now() + ttl)
            .format("%Y-%m-%dT%H:%MZ")
            .to_string())
    }
}

#[async_trait]
impl ArtifactProducer for SasTokenProducer {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::ScriptAccessToken
    }

    async fn produce(&self, cancel: &CancellationToken) -> Result<Secret> {
        let account = self.account.as_deref().ok_or_else(|| {
            OrchestratorError::ConfigError("未配置 azure.storage_account".to_string())
        })?;

        let args: Vec<String> = vec![
            "storage".to_string(),
            "container".to_string(),
            "generate-sas".to_string(),
            "--account-name".to_string(),
            account.to_string(),
            "--name".to_string(),
            self.container.clone(),
            "--permissions".to_string(),
            "r".to_string(),
            "--expiry".to_string(),
            self.expiry()?,
            "--auth-mode".to_string(),
            "login".to_string(),
            "--as-user".to_string(),
            "--https-only".to_string(),
            "--output".to_string(),
            "tsv".to_string(),
        ];

        let key = Target::new("storage", account);
        let output = with_deadline(&key, Duration::from_secs(120), cancel, async {
            self.az.run(&args).await.map_err(|e| RemoteError::Delivery {
                target: key.to_string(),
                message: format!("启动 az 进程失败: {}", e),
            })
        })
        .await
        .map_err(|e| match e {
            RemoteError::Cancelled(_) => OrchestratorError::Cancelled,
            other => OrchestratorError::Remote(other),
        })?;

        if !output.is_success() {
            warn!("生成 SAS 令牌失败 (退出码 {:?})", output.exit_code);
            return Err(OrchestratorError::ArtifactUnavailable {
                kind: self.kind(),
                message: output.stderr,
            });
        }

        let token = output.stdout.trim().trim_matches('"').to_string();
        info!(
            "已生成容器 {}/{} 的只读令牌 (有效期 {}h)",
            account,
            self.container,
            self.ttl.as_secs() / 3600
        );
        Ok(Secret::new(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProducer {
        value: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ArtifactProducer for FixedProducer {
        fn kind(&self) -> ArtifactKind {
            ArtifactKind::ScriptAccessToken
        }

        async fn produce(&self, _cancel: &CancellationToken) -> Result<Secret> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Secret::new(self.value))
        }
    }

    #[tokio::test]
    async fn test_produce_if_absent_runs_once() {
        let producer = Arc::new(FixedProducer {
            value: "sv=2022&sig=abc",
            calls: AtomicUsize::new(0),
        });
        let producers: Vec<Arc<dyn ArtifactProducer>> = vec![producer.clone()];
        let mut state = RunState::new();
        let cancel = CancellationToken::new();

        let first = state
            .produce_if_absent(ArtifactKind::ScriptAccessToken, &producers, &cancel)
            .await
            .unwrap();
        let second = state
            .produce_if_absent(ArtifactKind::ScriptAccessToken, &producers, &cancel)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
        assert!(state.has_artifact(ArtifactKind::ScriptAccessToken));
    }

    #[tokio::test]
    async fn test_empty_artifact_is_rejected() {
        let producers: Vec<Arc<dyn ArtifactProducer>> = vec![Arc::new(FixedProducer {
            value: "",
            calls: AtomicUsize::new(0),
        })];
        let mut state = RunState::new();

        let err = state
            .produce_if_absent(
                ArtifactKind::ScriptAccessToken,
                &producers,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ArtifactUnavailable { .. }));
        assert!(!state.has_artifact(ArtifactKind::ScriptAccessToken));
    }

    #[tokio::test]
    async fn test_missing_producer() {
        let mut state = RunState::new();
        let result = state
            .produce_if_absent(ArtifactKind::ScriptAccessToken, &[], &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::ArtifactUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_sas_producer_requires_account() {
        let producer = SasTokenProducer::new(AzCli::new(), None, "scripts");
        let result = producer.produce(&CancellationToken::new()).await;
        assert!(matches!(result, Err(OrchestratorError::ConfigError(_))));
    }

    #[test]
    fn test_record_outputs_merges() {
        let mut state = RunState::new();
        state.record_outputs(PhaseId::Infra, serde_json::json!({"vnetId": "a"}));
        state.record_outputs(PhaseId::Infra, serde_json::json!({"storageId": "b"}));
        let outputs = state.outputs(PhaseId::Infra).unwrap();
        assert_eq!(outputs["vnetId"], "a");
        assert_eq!(outputs["storageId"], "b");
        assert!(state.outputs(PhaseId::Vms).is_none());
    }
}
