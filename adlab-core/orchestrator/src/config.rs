//! 实验室配置
//!
//! 配置在启动时构造一次，以 `Arc<LabConfig>` 显式传入各组件，不存在全局配置。
//!
//! 配置文件搜索路径 (按优先级):
//! 1. 命令行 `--config` 指定的路径
//! 2. `ADLAB_CONFIG` 环境变量指定的路径
//! 3. `./adlab.toml` (当前目录)
//! 4. `~/.config/adlab/config.toml` (用户配置目录)
//! 5. `/etc/adlab/config.toml` (系统配置目录)
//!
//! 之后应用环境变量覆盖：`ADLAB_STRICT`、`ADLAB_POLL_INTERVAL_SECS`、`ADLAB_KEY_VAULT`。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use adlab_remote_executor::{Inventory, RegionEndpoint, SshConfig, Target};

use crate::{OrchestratorError, Result};

// ============================================
// 核心配置结构
// ============================================

/// 实验室配置 (顶层)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabConfig {
    #[serde(default)]
    pub lab: LabSection,

    #[serde(default)]
    pub azure: AzureSection,

    /// 区域组 (名称 -> 配置)
    #[serde(default)]
    pub regions: BTreeMap<String, RegionConfig>,

    /// 节点列表
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// 实验室基本信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabSection {
    /// 资源名前缀
    #[serde(default = "default_lab_name")]
    pub name: String,

    /// AD 域名
    #[serde(default = "default_domain")]
    pub domain: String,

    /// 管理员用户名
    #[serde(default = "default_admin_username")]
    pub admin_username: String,

    /// 管理员密码在密钥存储中的名称
    #[serde(default = "default_admin_password_secret")]
    pub admin_password_secret: String,

    /// DSRM 密码在密钥存储中的名称
    #[serde(default = "default_dsrm_password_secret")]
    pub dsrm_password_secret: String,

    /// 主区域组名称
    #[serde(default = "default_primary_region")]
    pub primary_region: String,

    /// 灾备区域组名称
    #[serde(default = "default_secondary_region")]
    pub secondary_region: String,
}

/// Azure 相关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureSection {
    #[serde(default)]
    pub subscription: Option<String>,

    /// Key Vault 名称（密钥存储）
    #[serde(default)]
    pub key_vault: Option<String>,

    /// Bicep 模板目录
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,

    /// 远程脚本目录
    #[serde(default = "default_script_dir")]
    pub script_dir: PathBuf,

    /// 存放脚本与用户数据的存储账户
    #[serde(default)]
    pub storage_account: Option<String>,

    /// 脚本容器
    #[serde(default = "default_script_container")]
    pub script_container: String,

    /// 访问令牌有效期
    #[serde(with = "humantime_serde", default = "default_token_ttl")]
    pub token_ttl: Duration,
}

/// 区域组配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub resource_group: String,
    pub location: String,
    /// SSH 跳板机 (可选)
    #[serde(default)]
    pub ssh_host: Option<String>,
}

/// 节点角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    PrimaryDc,
    SecondaryDc,
    AppServer,
    Client,
}

impl NodeRole {
    pub fn is_domain_controller(&self) -> bool {
        matches!(self, NodeRole::PrimaryDc | NodeRole::SecondaryDc)
    }
}

/// 节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub region: String,
    pub role: NodeRole,
    #[serde(default)]
    pub private_ip: Option<String>,
}

impl NodeConfig {
    pub fn target(&self) -> Target {
        Target::new(&self.region, &self.name)
    }
}

/// 轮询配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// 轮询间隔
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub interval: Duration,

    /// 单个节点就绪超时
    #[serde(with = "humantime_serde", default = "default_ready_timeout")]
    pub ready_timeout: Duration,

    /// 重启后的稳定等待
    #[serde(with = "humantime_serde", default = "default_reboot_settle")]
    pub reboot_settle: Duration,
}

/// 执行器后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorBackend {
    /// Azure Run Command (默认)
    #[default]
    RunCommand,
    /// SSH + PowerShell
    Ssh,
}

/// 执行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// 单条远程命令超时
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,

    /// 严格模式：验证 / 就绪失败时进程返回非零
    #[serde(default)]
    pub strict: bool,

    #[serde(default)]
    pub backend: ExecutorBackend,

    /// SSH 后端配置
    #[serde(default)]
    pub ssh: Option<SshConfig>,
}

// ============================================
// 默认值
// ============================================

fn default_lab_name() -> String {
    "adlab".to_string()
}

fn default_domain() -> String {
    "managed-connections.net".to_string()
}

fn default_admin_username() -> String {
    "labadmin".to_string()
}

fn default_admin_password_secret() -> String {
    "adminPassword".to_string()
}

fn default_dsrm_password_secret() -> String {
    "dsrmPassword".to_string()
}

fn default_primary_region() -> String {
    "primary".to_string()
}

fn default_secondary_region() -> String {
    "secondary".to_string()
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("infra")
}

fn default_script_dir() -> PathBuf {
    PathBuf::from("scripts")
}

fn default_script_container() -> String {
    "scripts".to_string()
}

fn default_token_ttl() -> Duration {
    Duration::from_secs(8 * 3600)
}

fn default_poll_interval() -> Duration {
    crate::poller::DEFAULT_POLL_INTERVAL
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(20 * 60)
}

fn default_reboot_settle() -> Duration {
    Duration::from_secs(60)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

impl Default for LabSection {
    fn default() -> Self {
        Self {
            name: default_lab_name(),
            domain: default_domain(),
            admin_username: default_admin_username(),
            admin_password_secret: default_admin_password_secret(),
            dsrm_password_secret: default_dsrm_password_secret(),
            primary_region: default_primary_region(),
            secondary_region: default_secondary_region(),
        }
    }
}

impl Default for AzureSection {
    fn default() -> Self {
        Self {
            subscription: None,
            key_vault: None,
            template_dir: default_template_dir(),
            script_dir: default_script_dir(),
            storage_account: None,
            script_container: default_script_container(),
            token_ttl: default_token_ttl(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            ready_timeout: default_ready_timeout(),
            reboot_settle: default_reboot_settle(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            command_timeout: default_command_timeout(),
            strict: false,
            backend: ExecutorBackend::default(),
            ssh: None,
        }
    }
}

// ============================================
// 加载与校验
// ============================================

impl LabConfig {
    /// 加载配置 (显式路径优先，否则按搜索路径查找)
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => Self::find_config_file().ok_or_else(|| {
                OrchestratorError::ConfigError(
                    "未找到配置文件 (ADLAB_CONFIG, ./adlab.toml, ~/.config/adlab/config.toml, /etc/adlab/config.toml)"
                        .to_string(),
                )
            })?,
        };

        tracing::debug!("加载配置: {:?}", path);
        let mut config = Self::load_from_file(&path)?;
        config.apply_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载 (不应用环境变量)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            OrchestratorError::ConfigError(format!("读取配置文件失败 {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content)
    }

    /// 从 TOML 字符串解析
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| OrchestratorError::ConfigError(format!("解析配置失败: {}", e)))
    }

    /// 查找配置文件 (按优先级搜索)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = env::var("ADLAB_CONFIG") {
            let p = PathBuf::from(path);
            if p.exists() {
                return Some(p);
            }
        }

        let mut candidates = vec![PathBuf::from("./adlab.toml")];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("adlab").join("config.toml"));
        }
        candidates.push(PathBuf::from("/etc/adlab/config.toml"));

        candidates.into_iter().find(|p| p.exists())
    }

    /// 从环境变量覆盖
    fn apply_env_vars(&mut self) -> Result<()> {
        if let Ok(strict) = env::var("ADLAB_STRICT") {
            self.execution.strict = matches!(strict.as_str(), "1" | "true" | "yes");
        }
        if let Ok(secs) = env::var("ADLAB_POLL_INTERVAL_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                OrchestratorError::ConfigError(format!("无效的 ADLAB_POLL_INTERVAL_SECS: {}", secs))
            })?;
            self.polling.interval = Duration::from_secs(secs);
        }
        if let Ok(vault) = env::var("ADLAB_KEY_VAULT") {
            self.azure.key_vault = Some(vault);
        }
        Ok(())
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.lab.domain.is_empty() {
            return Err(OrchestratorError::ConfigError("域名不能为空".to_string()));
        }

        if self.polling.interval.is_zero() {
            return Err(OrchestratorError::ConfigError("轮询间隔不能为 0".to_string()));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !self.regions.contains_key(&node.region) {
                return Err(OrchestratorError::ConfigError(format!(
                    "节点 {} 引用了未定义的区域 {}",
                    node.name, node.region
                )));
            }
            if !seen.insert(node.name.to_lowercase()) {
                return Err(OrchestratorError::ConfigError(format!(
                    "节点名称重复: {}",
                    node.name
                )));
            }
        }

        for role in [NodeRole::PrimaryDc, NodeRole::SecondaryDc] {
            if self.nodes.iter().filter(|n| n.role == role).count() > 1 {
                return Err(OrchestratorError::ConfigError(format!(
                    "角色 {:?} 只能有一个节点",
                    role
                )));
            }
        }

        if self.execution.backend == ExecutorBackend::Ssh && self.execution.ssh.is_none() {
            return Err(OrchestratorError::ConfigError(
                "backend = \"ssh\" 需要 [execution.ssh] 配置".to_string(),
            ));
        }

        Ok(())
    }

    /// 构建远程执行清单
    pub fn inventory(&self) -> Inventory {
        self.regions
            .iter()
            .fold(Inventory::new(), |inventory, (name, region)| {
                inventory.with_region(
                    name.clone(),
                    RegionEndpoint {
                        resource_group: region.resource_group.clone(),
                        ssh_host: region.ssh_host.clone(),
                    },
                )
            })
    }

    /// 所有节点目标
    pub fn all_targets(&self) -> Vec<Target> {
        self.nodes.iter().map(NodeConfig::target).collect()
    }

    /// 指定角色的节点目标
    pub fn targets_with_role(&self, role: NodeRole) -> Vec<Target> {
        self.nodes
            .iter()
            .filter(|n| n.role == role)
            .map(NodeConfig::target)
            .collect()
    }

    /// 加入域的成员节点 (非域控)
    pub fn member_targets(&self) -> Vec<Target> {
        self.nodes
            .iter()
            .filter(|n| !n.role.is_domain_controller())
            .map(NodeConfig::target)
            .collect()
    }

    fn single_role(&self, role: NodeRole) -> Result<Target> {
        self.targets_with_role(role)
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::ConfigError(format!("未配置 {:?} 节点", role)))
    }

    /// 主域控
    pub fn primary_dc(&self) -> Result<Target> {
        self.single_role(NodeRole::PrimaryDc)
    }

    /// 灾备域控
    pub fn secondary_dc(&self) -> Result<Target> {
        self.single_role(NodeRole::SecondaryDc)
    }

    /// 区域配置
    pub fn region(&self, name: &str) -> Result<&RegionConfig> {
        self.regions
            .get(name)
            .ok_or_else(|| OrchestratorError::ConfigError(format!("未定义区域: {}", name)))
    }

    /// 节点私有 IP
    pub fn private_ip(&self, target: &Target) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| n.name == target.node && n.region == target.region)
            .and_then(|n| n.private_ip.as_deref())
    }

    /// 域的 DN 形式 (managed-connections.net -> DC=managed-connections,DC=net)
    pub fn domain_dn(&self) -> String {
        self.lab
            .domain
            .split('.')
            .map(|part| format!("DC={}", part))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
[lab]
name = "adlab"
domain = "managed-connections.net"

[azure]
storage_account = "adlabscripts"
token_ttl = "4h"

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
ready_timeout = "20m"
"#;

    pub(crate) fn sample() -> LabConfig {
        LabConfig::from_toml_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_sample() {
        let config = sample();
        assert!(config.validate().is_ok());
        assert_eq!(config.nodes.len(), 7);
        assert_eq!(config.azure.token_ttl, Duration::from_secs(4 * 3600));
        assert_eq!(config.polling.interval, Duration::from_secs(15));
        assert_eq!(config.polling.reboot_settle, Duration::from_secs(60));
        assert_eq!(config.execution.backend, ExecutorBackend::RunCommand);
        assert!(!config.execution.strict);
    }

    #[test]
    fn test_role_lookup() {
        let config = sample();
        assert_eq!(config.primary_dc().unwrap(), Target::new("primary", "dc01"));
        assert_eq!(config.secondary_dc().unwrap(), Target::new("secondary", "dc02"));
        assert_eq!(config.member_targets().len(), 5);
        assert_eq!(config.private_ip(&Target::new("primary", "dc01")), Some("10.10.1.4"));
    }

    #[test]
    fn test_domain_dn() {
        assert_eq!(sample().domain_dn(), "DC=managed-connections,DC=net");
    }

    #[test]
    fn test_validate_unknown_region() {
        let mut config = sample();
        config.nodes[0].region = "tertiary".to_string();
        assert!(matches!(
            config.validate(),
            Err(OrchestratorError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validate_duplicate_node() {
        let mut config = sample();
        config.nodes[1].name = "DC01".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_ssh_backend_needs_config() {
        let mut config = sample();
        config.execution.backend = ExecutorBackend::Ssh;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inventory_from_regions() {
        let inventory = sample().inventory();
        assert_eq!(
            inventory
                .resource_group(&Target::new("secondary", "dc02"))
                .unwrap(),
            "rg-adlab-wus"
        );
    }

    #[test]
    fn test_example_config_parses() {
        let config =
            LabConfig::from_toml_str(include_str!("../../../adlab.example.toml")).unwrap();
        assert_eq!(config.nodes.len(), 7);
        assert_eq!(config.execution.backend, ExecutorBackend::RunCommand);
        assert_eq!(config.polling.ready_timeout, Duration::from_secs(20 * 60));
        assert_eq!(config.azure.key_vault.as_deref(), Some("kv-adlab"));
    }
}
