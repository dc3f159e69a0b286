//! 密钥读取与输出脱敏

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::az::AzCli;
use crate::command::with_deadline;
use crate::error::{RemoteError, Result};
use crate::target::Target;

/// 敏感值，Debug / Display 均不输出原文
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// 取出原文（仅在投递给远端时使用）
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// 密钥存储（按名称读取）
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Secret>;
}

/// 内存密钥存储（命令行参数 / 测试）
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, Secret>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: Secret) -> Self {
        self.secrets.insert(name.into(), value);
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get(&self, name: &str) -> Result<Secret> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| RemoteError::SecretError(format!("未找到密钥: {}", name)))
    }
}

/// Azure Key Vault 密钥存储
///
/// 命令行显式提供的值优先于 Key Vault。
pub struct KeyVaultSecretStore {
    az: AzCli,
    vault: Option<String>,
    overrides: StaticSecretStore,
}

impl KeyVaultSecretStore {
    pub fn new(az: AzCli, vault: Option<String>) -> Self {
        Self {
            az,
            vault,
            overrides: StaticSecretStore::new(),
        }
    }

    pub fn with_override(mut self, name: impl Into<String>, value: Secret) -> Self {
        self.overrides = self.overrides.with_secret(name, value);
        self
    }
}

#[async_trait]
impl SecretStore for KeyVaultSecretStore {
    async fn get(&self, name: &str) -> Result<Secret> {
        if let Ok(secret) = self.overrides.get(name).await {
            debug!("使用命令行提供的密钥: {}", name);
            return Ok(secret);
        }

        let vault = self.vault.as_deref().ok_or_else(|| {
            RemoteError::SecretError(format!("密钥 {} 未通过参数提供，且未配置 Key Vault", name))
        })?;

        info!("从 Key Vault 读取密钥: {}/{}", vault, name);
        let args: Vec<String> = [
            "keyvault", "secret", "show", "--vault-name", vault, "--name", name, "--query",
            "value", "--output", "tsv",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let key = Target::new("keyvault", vault);
        let never = CancellationToken::new();
        let output = with_deadline(&key, Duration::from_secs(60), &never, async {
            self.az
                .run(&args)
                .await
                .map_err(|e| RemoteError::SecretError(format!("启动 az 进程失败: {}", e)))
        })
        .await?;

        if !output.is_success() || output.stdout.is_empty() {
            return Err(RemoteError::SecretError(format!(
                "读取密钥 {} 失败: {}",
                name, output.stderr
            )));
        }

        Ok(Secret::new(output.stdout))
    }
}

fn redaction_regexes() -> &'static [Regex] {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        [
            r#"(?i)(password\s*[:=]\s*)[^\s"';]+"#,
            r#"(?i)(token\s*[:=]\s*)[^\s"';]+"#,
            r#"(?i)(sig=)[^&\s"']+"#,
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// 脱敏文本：替换已知密钥原文以及 `password=` / `token=` / SAS `sig=` 片段
pub fn redact_text(input: &str, secrets: &[String]) -> String {
    let mut output = input.to_string();

    for secret in secrets {
        if !secret.trim().is_empty() {
            output = output.replace(secret.as_str(), "***");
        }
    }

    for regex in redaction_regexes() {
        output = regex.replace_all(&output, "${1}***").to_string();
    }

    output
}
