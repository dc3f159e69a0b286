//! 阶段与步骤定义

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use adlab_remote_executor::Target;

use crate::health::ExpectedPattern;
use crate::poller::ReadyCondition;
use crate::{OrchestratorError, Result};

/// 阶段标识，声明顺序即执行顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PhaseId {
    #[serde(rename = "infra")]
    Infra,
    #[serde(rename = "vms")]
    Vms,
    #[serde(rename = "validate")]
    Validate,
    #[serde(rename = "primarydc")]
    PrimaryDc,
    #[serde(rename = "dns-peering")]
    DnsPeering,
    #[serde(rename = "secondarydc")]
    SecondaryDc,
    #[serde(rename = "appservers")]
    AppServers,
    #[serde(rename = "adconfig")]
    AdConfig,
    #[serde(rename = "domainjoin")]
    DomainJoin,
    #[serde(rename = "groups")]
    Groups,
}

impl PhaseId {
    /// 全部阶段 (固定顺序)
    pub const ALL: [PhaseId; 10] = [
        PhaseId::Infra,
        PhaseId::Vms,
        PhaseId::Validate,
        PhaseId::PrimaryDc,
        PhaseId::DnsPeering,
        PhaseId::SecondaryDc,
        PhaseId::AppServers,
        PhaseId::AdConfig,
        PhaseId::DomainJoin,
        PhaseId::Groups,
    ];

    /// 序号 (从 1 开始)
    pub fn ordinal(&self) -> usize {
        *self as usize + 1
    }

    pub fn from_ordinal(ordinal: usize) -> Option<Self> {
        ordinal
            .checked_sub(1)
            .and_then(|index| Self::ALL.get(index).copied())
    }

    pub fn name(&self) -> &'static str {
        match self {
            PhaseId::Infra => "infra",
            PhaseId::Vms => "vms",
            PhaseId::Validate => "validate",
            PhaseId::PrimaryDc => "primarydc",
            PhaseId::DnsPeering => "dns-peering",
            PhaseId::SecondaryDc => "secondarydc",
            PhaseId::AppServers => "appservers",
            PhaseId::AdConfig => "adconfig",
            PhaseId::DomainJoin => "domainjoin",
            PhaseId::Groups => "groups",
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            PhaseId::Infra => "网络、存储与脚本容器",
            PhaseId::Vms => "虚拟机部署并等待代理就绪",
            PhaseId::Validate => "逐节点连通性验证",
            PhaseId::PrimaryDc => "主域控提升",
            PhaseId::DnsPeering => "跨区域 DNS 与网络对等",
            PhaseId::SecondaryDc => "灾备域控提升与复制验证",
            PhaseId::AppServers => "应用服务器配置",
            PhaseId::AdConfig => "OU 与用户导入",
            PhaseId::DomainJoin => "成员节点加入域",
            PhaseId::Groups => "安全组与成员关系",
        }
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PhaseId {
    type Err = OrchestratorError;

    /// 支持名称 (infra) 或序号 (1)
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(ordinal) = s.parse::<usize>() {
            return Self::from_ordinal(ordinal)
                .ok_or_else(|| OrchestratorError::PlanError(format!("阶段序号超出范围: {}", s)));
        }
        Self::ALL
            .iter()
            .copied()
            .find(|id| id.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| OrchestratorError::PlanError(format!("未知阶段: {}", s)))
    }
}

/// 操作员请求的阶段集合
///
/// 集合只是过滤条件，执行顺序始终是固定顺序。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PhaseSelection {
    phases: BTreeSet<PhaseId>,
}

impl PhaseSelection {
    pub fn all() -> Self {
        Self {
            phases: PhaseId::ALL.iter().copied().collect(),
        }
    }

    pub fn of(phases: impl IntoIterator<Item = PhaseId>) -> Self {
        Self {
            phases: phases.into_iter().collect(),
        }
    }

    /// 解析 `all`、`3,1`、`2-5`、`vms,validate` 等形式
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(OrchestratorError::PlanError("阶段选择不能为空".to_string()));
        }
        if input.eq_ignore_ascii_case("all") {
            return Ok(Self::all());
        }

        let mut phases = BTreeSet::new();
        for token in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let Ok(id) = token.parse::<PhaseId>() {
                phases.insert(id);
                continue;
            }
            let (start, end) = parse_range(token)?;
            phases.extend(PhaseId::ALL.iter().copied().filter(|id| *id >= start && *id <= end));
        }
        if phases.is_empty() {
            return Err(OrchestratorError::PlanError(format!(
                "阶段选择未包含任何阶段: {}",
                input
            )));
        }

        Ok(Self { phases })
    }

    pub fn contains(&self, id: PhaseId) -> bool {
        self.phases.contains(&id)
    }

    /// 按固定顺序迭代
    pub fn iter(&self) -> impl Iterator<Item = PhaseId> + '_ {
        self.phases.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

/// 解析 `a-b` 区间 (阶段名本身可能含 `-`，逐个分割点尝试)
fn parse_range(token: &str) -> Result<(PhaseId, PhaseId)> {
    for (index, _) in token.match_indices('-') {
        let (left, right) = (&token[..index], &token[index + 1..]);
        if let (Ok(start), Ok(end)) = (left.parse::<PhaseId>(), right.parse::<PhaseId>()) {
            if start > end {
                return Err(OrchestratorError::PlanError(format!(
                    "阶段区间起点晚于终点: {}",
                    token
                )));
            }
            return Ok((start, end));
        }
    }
    Err(OrchestratorError::PlanError(format!("无法解析阶段: {}", token)))
}

/// 跨阶段传递的产物
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// 脚本容器的只读访问令牌 (SAS)
    ScriptAccessToken,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::ScriptAccessToken => f.write_str("script-access-token"),
        }
    }
}

/// 参数值，执行时解析
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    /// 字面量
    Literal(String),
    /// 结构化值 (仅模板部署使用；远程脚本中序列化为 JSON 文本)
    Json(serde_json::Value),
    /// 从密钥存储读取
    Secret(String),
    /// 从运行状态读取
    Artifact(ArtifactKind),
}

impl ParamValue {
    pub fn literal(value: impl Into<String>) -> Self {
        ParamValue::Literal(value.into())
    }

    /// 是否敏感
    pub fn is_sensitive(&self) -> bool {
        matches!(self, ParamValue::Secret(_) | ParamValue::Artifact(_))
    }
}

/// 脚本来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptSource {
    Inline(String),
    File(PathBuf),
}

impl ScriptSource {
    /// 读取脚本正文
    pub async fn load(&self) -> Result<String> {
        match self {
            ScriptSource::Inline(body) => Ok(body.clone()),
            ScriptSource::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                OrchestratorError::PlanError(format!("读取脚本失败 {:?}: {}", path, e))
            }),
        }
    }
}

/// 步骤失败时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepPolicy {
    /// 记录失败，阶段继续 (默认)
    #[default]
    Continue,
    /// 立即停止整个运行
    Halt,
}

/// 阶段中的单个步骤
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// 部署声明式资源模板
    ResourceDeploy {
        template: PathBuf,
        /// 部署所在区域组
        region: String,
        #[serde(default)]
        parameters: BTreeMap<String, ParamValue>,
    },

    /// 在单个节点上执行脚本
    RemoteCommand {
        target: Target,
        description: String,
        script: ScriptSource,
        #[serde(default)]
        parameters: BTreeMap<String, ParamValue>,
        /// 脚本会触发重启
        #[serde(default)]
        expect_reboot: bool,
        #[serde(default)]
        on_failure: StepPolicy,
    },

    /// 等待节点达到指定状态
    Wait {
        targets: Vec<Target>,
        condition: ReadyCondition,
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },

    /// 在多个节点上执行验证脚本并匹配输出
    Validate {
        targets: Vec<Target>,
        description: String,
        script: ScriptSource,
        #[serde(default)]
        parameters: BTreeMap<String, ParamValue>,
        #[serde(default)]
        expect: Vec<ExpectedPattern>,
    },

    /// 固定的稳定等待 (重启后)
    Pause {
        #[serde(with = "humantime_serde")]
        duration: Duration,
        reason: String,
    },
}

impl Step {
    /// 步骤描述
    pub fn describe(&self) -> String {
        match self {
            Step::ResourceDeploy {
                template, region, ..
            } => format!("部署模板 {} ({})", template.display(), region),
            Step::RemoteCommand {
                target,
                description,
                ..
            } => format!("{} @ {}", description, target),
            Step::Wait {
                targets, condition, ..
            } => format!("等待 {} 个节点 {}", targets.len(), condition),
            Step::Validate {
                targets,
                description,
                ..
            } => format!("{} ({} 个节点)", description, targets.len()),
            Step::Pause { duration, reason } => {
                format!("暂停 {} 秒: {}", duration.as_secs(), reason)
            }
        }
    }

    /// 步骤参数中引用的产物
    pub fn referenced_artifacts(&self) -> Vec<ArtifactKind> {
        let parameters = match self {
            Step::ResourceDeploy { parameters, .. }
            | Step::RemoteCommand { parameters, .. }
            | Step::Validate { parameters, .. } => parameters,
            Step::Wait { .. } | Step::Pause { .. } => return Vec::new(),
        };
        parameters
            .values()
            .filter_map(|value| match value {
                ParamValue::Artifact(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }
}

/// 阶段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: PhaseId,
    pub description: String,
    pub steps: Vec<Step>,
    /// 依赖的产物 (缺失时按需生成)
    #[serde(default)]
    pub consumes: Vec<ArtifactKind>,
    /// 阶段完成后生成的产物
    #[serde(default)]
    pub produces: Vec<ArtifactKind>,
}

impl Phase {
    pub fn new(id: PhaseId) -> Self {
        Self {
            id,
            description: id.summary().to_string(),
            steps: Vec::new(),
            consumes: Vec::new(),
            produces: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn consumes(mut self, kind: ArtifactKind) -> Self {
        self.consumes.push(kind);
        self
    }

    pub fn produces(mut self, kind: ArtifactKind) -> Self {
        self.produces.push(kind);
        self
    }

    /// 步骤引用的产物必须在 `consumes` 中声明
    pub fn validate(&self) -> Result<()> {
        for step in &self.steps {
            for kind in step.referenced_artifacts() {
                if !self.consumes.contains(&kind) {
                    return Err(OrchestratorError::PlanError(format!(
                        "阶段 {} 的步骤引用了未声明的产物 {}",
                        self.id, kind
                    )));
                }
            }
        }
        Ok(())
    }
}

/// 将计划导出为 YAML
pub fn plan_to_yaml(phases: &[Phase]) -> Result<String> {
    serde_yaml::to_string(phases).map_err(|e| OrchestratorError::SerdeError(e.to_string()))
}

/// 从 YAML 加载计划
pub fn plan_from_yaml(yaml: &str) -> Result<Vec<Phase>> {
    serde_yaml::from_str(yaml).map_err(|e| OrchestratorError::SerdeError(e.to_string()))
}
