//! 资源模板部署
//!
//! 通过 `az deployment group create` 部署 Bicep / ARM 模板。参数写入临时参数文件，
//! 密码等敏感值不会出现在命令行或日志中。部署失败不做回滚。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use adlab_remote_executor::{redact_text, with_deadline, AzCli, RemoteError, Secret, Target};

use crate::phase::PhaseId;

/// 部署错误
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("阶段 {phase} 部署失败 (状态: {status}, 退出码: {exit_code:?}): {detail}")]
    DeploymentFailed {
        phase: String,
        status: String,
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("部署命令执行失败: {0}")]
    CommandFailed(String),

    #[error("部署输出解析失败: {0}")]
    ParseError(String),

    #[error("部署已取消")]
    Cancelled,
}

/// 部署请求
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub phase: PhaseId,
    /// 资源名前缀
    pub prefix: String,
    pub template: PathBuf,
    pub resource_group: String,
    pub location: String,
    /// 普通参数
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// 敏感参数
    pub secrets: BTreeMap<String, Secret>,
}

impl DeployRequest {
    /// 创建请求并填入固定参数集
    ///
    /// 固定参数: `prefix`、`location`、`domainName`、`adminUsername`、`adminPassword`。
    pub fn new(
        phase: PhaseId,
        prefix: impl Into<String>,
        template: impl Into<PathBuf>,
        resource_group: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        let prefix = prefix.into();
        let location = location.into();
        let mut parameters = BTreeMap::new();
        parameters.insert("prefix".to_string(), serde_json::json!(prefix));
        parameters.insert("location".to_string(), serde_json::json!(location));

        Self {
            phase,
            prefix,
            template: template.into(),
            resource_group: resource_group.into(),
            location,
            parameters,
            secrets: BTreeMap::new(),
        }
    }

    pub fn with_domain(self, domain: &str) -> Self {
        self.parameter("domainName", serde_json::json!(domain))
    }

    pub fn with_admin(self, username: &str, password: Secret) -> Self {
        self.parameter("adminUsername", serde_json::json!(username))
            .secret("adminPassword", password)
    }

    pub fn parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn secret(mut self, name: impl Into<String>, value: Secret) -> Self {
        self.secrets.insert(name.into(), value);
        self
    }

    /// ARM 参数文件内容
    pub fn parameters_document(&self) -> serde_json::Value {
        let mut parameters = serde_json::Map::new();
        for (name, value) in &self.parameters {
            parameters.insert(name.clone(), serde_json::json!({ "value": value }));
        }
        for (name, secret) in &self.secrets {
            parameters.insert(name.clone(), serde_json::json!({ "value": secret.expose() }));
        }
        serde_json::json!({
            "$schema": "https://schema.management.azure.com/schemas/2019-04-01/deploymentParameters.json#",
            "contentVersion": "1.0.0.0",
            "parameters": parameters,
        })
    }

    fn secret_values(&self) -> Vec<String> {
        self.secrets
            .values()
            .map(|s| s.expose().to_string())
            .collect()
    }
}

/// 部署结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResult {
    pub success: bool,
    pub deployment_name: String,
    /// 模板输出 (名称 -> 值)
    pub outputs: serde_json::Value,
}

/// 资源部署器
#[async_trait]
pub trait ResourceDeployer: Send + Sync {
    async fn deploy(
        &self,
        request: &DeployRequest,
        cancel: &CancellationToken,
    ) -> Result<DeployResult, DeployError>;
}

/// 部署名: `<prefix>-<phase>-<yyyyMMddHHmmss>`
pub fn deployment_name(prefix: &str, phase: PhaseId, at: DateTime<Utc>) -> String {
    format!("{}-{}-{}", prefix, phase.name(), at.format("%Y%m%d%H%M%S"))
}

#[derive(Debug, Deserialize)]
struct DeploymentProperties {
    #[serde(rename = "provisioningState", default)]
    provisioning_state: Option<String>,
    #[serde(default)]
    outputs: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct DeploymentResponse {
    properties: DeploymentProperties,
}

/// 解析部署输出，返回 (provisioningState, 输出)
///
/// ARM 输出形如 `{"vnetId": {"type": "String", "value": "..."}}`，这里展开为 `{"vnetId": "..."}`。
pub fn parse_deployment_output(json: &str) -> Result<(String, serde_json::Value), DeployError> {
    let response: DeploymentResponse =
        serde_json::from_str(json).map_err(|e| DeployError::ParseError(e.to_string()))?;

    let status = response
        .properties
        .provisioning_state
        .unwrap_or_else(|| "Unknown".to_string());

    let outputs = response
        .properties
        .outputs
        .unwrap_or_default()
        .into_iter()
        .map(|(name, output)| {
            let value = output.get("value").cloned().unwrap_or(serde_json::Value::Null);
            (name, value)
        })
        .collect::<serde_json::Map<_, _>>();

    Ok((status, serde_json::Value::Object(outputs)))
}

/// 基于 `az deployment group create` 的部署器
pub struct AzDeploymentDeployer {
    az: AzCli,
    timeout: Duration,
    used_names: Mutex<HashSet<String>>,
}

impl AzDeploymentDeployer {
    pub fn new(az: AzCli) -> Self {
        Self {
            az,
            timeout: Duration::from_secs(60 * 60),
            used_names: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 分配本进程内唯一的部署名 (同一秒内重复时追加序号)
    fn allocate_name(&self, prefix: &str, phase: PhaseId) -> String {
        let base = deployment_name(prefix, phase, Utc::now());
        let mut used = match self.used_names.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut name = base.clone();
        let mut suffix = 2;
        while !used.insert(name.clone()) {
            name = format!("{}-{}", base, suffix);
            suffix += 1;
        }
        name
    }
}

#[async_trait]
impl ResourceDeployer for AzDeploymentDeployer {
    async fn deploy(
        &self,
        request: &DeployRequest,
        cancel: &CancellationToken,
    ) -> Result<DeployResult, DeployError> {
        let name = self.allocate_name(&request.prefix, request.phase);
        let phase = request.phase.to_string();
        info!(
            "部署 {} -> {} ({})",
            name,
            request.resource_group,
            request.template.display()
        );

        let mut params_file = tempfile::Builder::new()
            .prefix("adlab-params-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| DeployError::CommandFailed(format!("创建参数文件失败: {}", e)))?;
        let document = serde_json::to_vec_pretty(&request.parameters_document())
            .map_err(|e| DeployError::CommandFailed(format!("序列化参数失败: {}", e)))?;
        params_file
            .write_all(&document)
            .and_then(|_| params_file.flush())
            .map_err(|e| DeployError::CommandFailed(format!("写入参数文件失败: {}", e)))?;

        let args: Vec<String> = vec![
            "deployment".to_string(),
            "group".to_string(),
            "create".to_string(),
            "--resource-group".to_string(),
            request.resource_group.clone(),
            "--name".to_string(),
            name.clone(),
            "--template-file".to_string(),
            request.template.to_string_lossy().to_string(),
            "--parameters".to_string(),
            format!("@{}", params_file.path().to_string_lossy()),
            "--output".to_string(),
            "json".to_string(),
        ];
        debug!("部署参数: {:?}", request.parameters.keys().collect::<Vec<_>>());

        let key = Target::new(request.resource_group.as_str(), name.as_str());
        let output = with_deadline(&key, self.timeout, cancel, async {
            self.az.run(&args).await.map_err(|e| RemoteError::Delivery {
                target: key.to_string(),
                message: format!("启动 az 进程失败: {}", e),
            })
        })
        .await
        .map_err(|e| match e {
            RemoteError::Cancelled(_) => DeployError::Cancelled,
            other => DeployError::CommandFailed(other.to_string()),
        })?;

        let secrets = request.secret_values();
        if !output.is_success() {
            let detail = redact_text(&output.stderr, &secrets);
            error!("部署 {} 失败: {}", name, detail);
            return Err(DeployError::DeploymentFailed {
                phase,
                status: "Failed".to_string(),
                exit_code: output.exit_code,
                detail,
            });
        }

        let (status, outputs) = parse_deployment_output(&output.stdout)?;
        if !status.eq_ignore_ascii_case("Succeeded") {
            return Err(DeployError::DeploymentFailed {
                phase,
                status,
                exit_code: output.exit_code,
                detail: format!("部署 {} 未成功完成", name),
            });
        }

        info!("部署 {} 完成", name);
        Ok(DeployResult {
            success: true,
            deployment_name: name,
            outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_deployment_name_format() {
        let at = Utc.with_ymd_and_hms(2026, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(
            deployment_name("adlab", PhaseId::DnsPeering, at),
            "adlab-dns-peering-20260307090501"
        );
    }

    #[test]
    fn test_allocate_name_unique() {
        let deployer = AzDeploymentDeployer::new(AzCli::new());
        let names: HashSet<String> = (0..5)
            .map(|_| deployer.allocate_name("adlab", PhaseId::Infra))
            .collect();
        assert_eq!(names.len(), 5);
        assert!(names.iter().all(|n| n.starts_with("adlab-infra-")));
    }

    #[test]
    fn test_parameters_document() {
        let request = DeployRequest::new(
            PhaseId::Vms,
            "adlab",
            "infra/vms.bicep",
            "rg-adlab-eus",
            "eastus",
        )
        .with_domain("managed-connections.net")
        .with_admin("labadmin", Secret::new("Hunter2!"));

        let doc = request.parameters_document();
        assert_eq!(doc["parameters"]["prefix"]["value"], "adlab");
        assert_eq!(doc["parameters"]["location"]["value"], "eastus");
        assert_eq!(doc["parameters"]["adminUsername"]["value"], "labadmin");
        assert_eq!(doc["parameters"]["adminPassword"]["value"], "Hunter2!");
        assert_eq!(doc["contentVersion"], "1.0.0.0");

        // Debug 输出中不含密码
        assert!(!format!("{:?}", request).contains("Hunter2!"));
    }

    #[test]
    fn test_parse_deployment_output() {
        let json = r#"{
            "name": "adlab-infra-20260307090501",
            "properties": {
                "provisioningState": "Succeeded",
                "outputs": {
                    "vnetId": {"type": "String", "value": "/subscriptions/x/vnet"},
                    "dnsServers": {"type": "Array", "value": ["10.10.1.4"]}
                }
            }
        }"#;
        let (status, outputs) = parse_deployment_output(json).unwrap();
        assert_eq!(status, "Succeeded");
        assert_eq!(outputs["vnetId"], "/subscriptions/x/vnet");
        assert_eq!(outputs["dnsServers"][0], "10.10.1.4");
    }

    #[test]
    fn test_parse_deployment_output_without_outputs() {
        let (status, outputs) =
            parse_deployment_output(r#"{"properties": {"provisioningState": "Failed"}}"#).unwrap();
        assert_eq!(status, "Failed");
        assert_eq!(outputs, serde_json::json!({}));
        assert!(matches!(
            parse_deployment_output("[]"),
            Err(DeployError::ParseError(_))
        ));
    }
}
