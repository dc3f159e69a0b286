//! 健康门控
//!
//! 用正则匹配诊断工具 (repadmin、dcdiag、Get-ADUser 等) 的自由文本输出。
//! 输出格式没有契约保证，因此匹配结果是尽力而为的：模式未出现时结论为
//! "未确认" 而不是 "失败"，只作为警告上报。

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::{OrchestratorError, Result};

/// 单项检查结论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum CheckStatus {
    /// 输出确认条件成立
    Confirmed,
    /// 输出明确表明条件不成立
    Failed(String),
    /// 输出中没有找到可判断的内容
    NotConfirmed,
}

/// 输出匹配器
pub trait OutputMatcher: Send + Sync {
    fn label(&self) -> &str;

    fn check(&self, output: &str) -> CheckStatus;
}

/// 正则编译失败时按字面量匹配
fn compile_pattern(pattern: &str) -> Option<Regex> {
    Regex::new(pattern)
        .or_else(|_| {
            debug!("模式不是有效正则，按字面量匹配: {}", pattern);
            Regex::new(&regex::escape(pattern))
        })
        .ok()
}

/// 第一个捕获组中的数字
fn captured_counts(regex: Option<&Regex>, output: &str) -> Vec<u64> {
    let Some(regex) = regex else {
        return Vec::new();
    };
    regex
        .captures_iter(output)
        .filter_map(|caps| caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok()))
        .collect()
}

/// 模式必须出现
pub struct PresenceMatcher {
    label: String,
    regex: Option<Regex>,
}

impl PresenceMatcher {
    pub fn new(label: impl Into<String>, pattern: &str) -> Self {
        Self {
            label: label.into(),
            regex: compile_pattern(pattern),
        }
    }
}

impl OutputMatcher for PresenceMatcher {
    fn label(&self) -> &str {
        &self.label
    }

    fn check(&self, output: &str) -> CheckStatus {
        if self.regex.as_ref().is_some_and(|r| r.is_match(output)) {
            CheckStatus::Confirmed
        } else {
            CheckStatus::NotConfirmed
        }
    }
}

/// 捕获的失败计数之和必须为 0
///
/// 模式的第一个捕获组为计数，例如 `(?i)(\d+)\s+fail`。
pub struct FailureCountMatcher {
    label: String,
    regex: Option<Regex>,
}

impl FailureCountMatcher {
    pub fn new(label: impl Into<String>, pattern: &str) -> Self {
        Self {
            label: label.into(),
            regex: compile_pattern(pattern),
        }
    }
}

impl OutputMatcher for FailureCountMatcher {
    fn label(&self) -> &str {
        &self.label
    }

    fn check(&self, output: &str) -> CheckStatus {
        let counts = captured_counts(self.regex.as_ref(), output);
        if counts.is_empty() {
            return CheckStatus::NotConfirmed;
        }
        let total: u64 = counts.iter().sum();
        if total == 0 {
            CheckStatus::Confirmed
        } else {
            CheckStatus::Failed(format!("{} 个失败", total))
        }
    }
}

/// 捕获的计数必须不小于期望值
pub struct MinimumCountMatcher {
    label: String,
    regex: Option<Regex>,
    minimum: u64,
}

impl MinimumCountMatcher {
    pub fn new(label: impl Into<String>, pattern: &str, minimum: u64) -> Self {
        Self {
            label: label.into(),
            regex: compile_pattern(pattern),
            minimum,
        }
    }
}

impl OutputMatcher for MinimumCountMatcher {
    fn label(&self) -> &str {
        &self.label
    }

    fn check(&self, output: &str) -> CheckStatus {
        match captured_counts(self.regex.as_ref(), output).into_iter().max() {
            None => CheckStatus::NotConfirmed,
            Some(count) if count >= self.minimum => CheckStatus::Confirmed,
            Some(count) => CheckStatus::Failed(format!(
                "数量 {} 小于期望的 {}",
                count, self.minimum
            )),
        }
    }
}

/// 匹配方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MatchKind {
    #[default]
    Presence,
    FailureCount,
    MinimumCount { minimum: u64 },
}

/// 可序列化的期望模式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedPattern {
    pub label: String,
    pub pattern: String,
    #[serde(default, rename = "match")]
    pub kind: MatchKind,
}

impl ExpectedPattern {
    pub fn presence(label: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            pattern: pattern.into(),
            kind: MatchKind::Presence,
        }
    }

    pub fn failure_count(label: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            pattern: pattern.into(),
            kind: MatchKind::FailureCount,
        }
    }

    pub fn minimum_count(
        label: impl Into<String>,
        pattern: impl Into<String>,
        minimum: u64,
    ) -> Self {
        Self {
            label: label.into(),
            pattern: pattern.into(),
            kind: MatchKind::MinimumCount { minimum },
        }
    }

    /// 构建匹配器，计数类模式必须是有效正则且含捕获组
    pub fn matcher(&self) -> Result<Box<dyn OutputMatcher>> {
        match self.kind {
            MatchKind::Presence => Ok(Box::new(PresenceMatcher::new(&self.label, &self.pattern))),
            MatchKind::FailureCount => {
                self.validate_counting()?;
                Ok(Box::new(FailureCountMatcher::new(&self.label, &self.pattern)))
            }
            MatchKind::MinimumCount { minimum } => {
                self.validate_counting()?;
                Ok(Box::new(MinimumCountMatcher::new(
                    &self.label,
                    &self.pattern,
                    minimum,
                )))
            }
        }
    }

    fn validate_counting(&self) -> Result<()> {
        let regex = Regex::new(&self.pattern).map_err(|e| {
            OrchestratorError::PlanError(format!("检查 {} 的模式无效: {}", self.label, e))
        })?;
        if regex.captures_len() < 2 {
            return Err(OrchestratorError::PlanError(format!(
                "检查 {} 的计数模式缺少捕获组",
                self.label
            )));
        }
        Ok(())
    }
}

/// 按标签判断每个模式是否出现
///
/// 模式缺失时结果为 `false`，不会报错。
pub fn evaluate(output: &str, expected: &BTreeMap<String, String>) -> BTreeMap<String, bool> {
    expected
        .iter()
        .map(|(label, pattern)| {
            let found = compile_pattern(pattern).is_some_and(|r| r.is_match(output));
            if !found {
                warn!("未确认 {}: 输出中未找到 `{}` (尽力而为的匹配，请人工核实)", label, pattern);
            }
            (label.clone(), found)
        })
        .collect()
}

/// 单项检查结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub label: String,
    #[serde(flatten)]
    pub status: CheckStatus,
}

/// 全部检查结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthReport {
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn confirmed(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Confirmed)
            .map(|c| c.label.as_str())
            .collect()
    }

    pub fn failures(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter_map(|c| match &c.status {
                CheckStatus::Failed(detail) => Some(format!("{}: {}", c.label, detail)),
                _ => None,
            })
            .collect()
    }

    pub fn unconfirmed(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::NotConfirmed)
            .map(|c| c.label.as_str())
            .collect()
    }
}

/// 结论细节
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictDetail {
    /// 已确认的检查
    Matched(Vec<String>),
    /// 失败原因
    Failure(Vec<String>),
}

/// 健康结论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthVerdict {
    /// 没有任何检查明确失败
    pub ok: bool,
    pub detail: VerdictDetail,
    /// 未确认的检查 (警告)
    #[serde(default)]
    pub unconfirmed: Vec<String>,
}

impl HealthVerdict {
    /// 所有检查都已确认
    pub fn is_confirmed(&self) -> bool {
        self.ok && self.unconfirmed.is_empty()
    }

    pub fn describe(&self) -> String {
        let mut parts = match &self.detail {
            VerdictDetail::Matched(labels) if labels.is_empty() => Vec::new(),
            VerdictDetail::Matched(labels) => vec![format!("已确认: {}", labels.join(", "))],
            VerdictDetail::Failure(reasons) => vec![format!("失败: {}", reasons.join("; "))],
        };
        if !self.unconfirmed.is_empty() {
            parts.push(format!("未确认: {}", self.unconfirmed.join(", ")));
        }
        parts.join(" | ")
    }
}

/// 健康门控 (一组可替换的匹配器)
#[derive(Default)]
pub struct HealthGate {
    matchers: Vec<Box<dyn OutputMatcher>>,
}

impl HealthGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_matcher(mut self, matcher: Box<dyn OutputMatcher>) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn from_patterns(patterns: &[ExpectedPattern]) -> Result<Self> {
        patterns
            .iter()
            .try_fold(Self::new(), |gate, pattern| Ok(gate.with_matcher(pattern.matcher()?)))
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn check(&self, output: &str) -> HealthReport {
        HealthReport {
            checks: self
                .matchers
                .iter()
                .map(|m| HealthCheck {
                    label: m.label().to_string(),
                    status: m.check(output),
                })
                .collect(),
        }
    }

    pub fn verdict(&self, output: &str) -> HealthVerdict {
        let report = self.check(output);
        let failures = report.failures();
        let unconfirmed: Vec<String> = report.unconfirmed().into_iter().map(String::from).collect();
        for label in &unconfirmed {
            warn!("健康检查 {} 未确认 (输出格式可能已变化，请人工核实)", label);
        }

        if failures.is_empty() {
            HealthVerdict {
                ok: true,
                detail: VerdictDetail::Matched(
                    report.confirmed().into_iter().map(String::from).collect(),
                ),
                unconfirmed,
            }
        } else {
            HealthVerdict {
                ok: false,
                detail: VerdictDetail::Failure(failures),
                unconfirmed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_zero_fail() {
        let expected = BTreeMap::from([("replication".to_string(), "0 fail".to_string())]);
        let result = evaluate("DC01  0 fail  5 total", &expected);
        assert_eq!(result.get("replication"), Some(&true));
    }

    #[test]
    fn test_evaluate_missing_pattern_is_false() {
        let expected = BTreeMap::from([
            ("replication".to_string(), "0 fail".to_string()),
            ("sysvol".to_string(), "SYSVOL".to_string()),
        ]);
        let result = evaluate("nothing useful here", &expected);
        assert_eq!(result.get("replication"), Some(&false));
        assert_eq!(result.get("sysvol"), Some(&false));
    }

    #[test]
    fn test_evaluate_invalid_regex_is_literal() {
        let expected = BTreeMap::from([("paren".to_string(), "status (ok".to_string())]);
        assert_eq!(evaluate("status (ok)", &expected)["paren"], true);
    }

    #[test]
    fn test_failure_count_matcher() {
        let matcher = FailureCountMatcher::new("replication", r"(?i)(\d+)\s+fail");
        assert_eq!(matcher.check("DC01 0 fail\nDC02 0 fail"), CheckStatus::Confirmed);
        assert!(matches!(
            matcher.check("DC01 0 fail\nDC02 3 fail"),
            CheckStatus::Failed(_)
        ));
        assert_eq!(matcher.check("repadmin: access denied"), CheckStatus::NotConfirmed);
    }

    #[test]
    fn test_minimum_count_matcher() {
        let matcher = MinimumCountMatcher::new("users", r"UserCount:\s*(\d+)", 100);
        assert_eq!(matcher.check("UserCount: 100"), CheckStatus::Confirmed);
        assert!(matches!(matcher.check("UserCount: 42"), CheckStatus::Failed(_)));
        assert_eq!(matcher.check(""), CheckStatus::NotConfirmed);
    }

    #[test]
    fn test_verdict_failure_and_unconfirmed() {
        let gate = HealthGate::from_patterns(&[
            ExpectedPattern::failure_count("replication", r"(\d+) fail"),
            ExpectedPattern::presence("sysvol", "SYSVOL"),
        ])
        .unwrap();

        let healthy = gate.verdict("0 fail\nSYSVOL shared");
        assert!(healthy.ok);
        assert!(healthy.is_confirmed());
        assert_eq!(
            healthy.detail,
            VerdictDetail::Matched(vec!["replication".to_string(), "sysvol".to_string()])
        );

        let partial = gate.verdict("0 fail");
        assert!(partial.ok);
        assert!(!partial.is_confirmed());
        assert_eq!(partial.unconfirmed, vec!["sysvol".to_string()]);

        let broken = gate.verdict("2 fail\nSYSVOL shared");
        assert!(!broken.ok);
        assert!(matches!(broken.detail, VerdictDetail::Failure(_)));
        assert!(broken.describe().contains("replication"));
    }

    #[test]
    fn test_counting_pattern_requires_group() {
        assert!(ExpectedPattern::failure_count("x", r"\d+ fail").matcher().is_err());
        assert!(ExpectedPattern::minimum_count("x", r"(", 1).matcher().is_err());
        assert!(ExpectedPattern::presence("x", r"(").matcher().is_ok());
    }

    #[test]
    fn test_expected_pattern_yaml() {
        let yaml = "label: users\npattern: 'UserCount: (\\d+)'\nmatch:\n  kind: minimum_count\n  minimum: 100\n";
        let pattern: ExpectedPattern = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(pattern.kind, MatchKind::MinimumCount { minimum: 100 });

        let default_kind: ExpectedPattern =
            serde_yaml::from_str("label: dns\npattern: Resolved").unwrap();
        assert_eq!(default_kind.kind, MatchKind::Presence);
    }
}
