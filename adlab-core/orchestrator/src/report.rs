//! 运行报告

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use adlab_remote_executor::Target;

use crate::phase::PhaseId;

/// 编排器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "phase")]
pub enum OrchestratorState {
    Idle,
    Running(PhaseId),
    Completed(PhaseId),
    Failed(PhaseId),
    /// 终态：致命失败或取消后停止
    Halted,
    /// 终态：所有请求的阶段都已执行
    AllCompleted,
}

impl OrchestratorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrchestratorState::Halted | OrchestratorState::AllCompleted)
    }

    /// 状态转移是否合法
    pub fn can_transition_to(&self, next: &OrchestratorState) -> bool {
        use OrchestratorState::*;
        match (self, next) {
            (Idle, Running(_)) | (Completed(_), Running(_)) => true,
            (Running(a), Completed(b)) | (Running(a), Failed(b)) => a == b,
            (Idle, AllCompleted) | (Completed(_), AllCompleted) => true,
            (Idle, Halted) | (Completed(_), Halted) | (Failed(_), Halted) => true,
            (Running(_), Halted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorState::Idle => write!(f, "idle"),
            OrchestratorState::Running(p) => write!(f, "running({})", p),
            OrchestratorState::Completed(p) => write!(f, "completed({})", p),
            OrchestratorState::Failed(p) => write!(f, "failed({})", p),
            OrchestratorState::Halted => write!(f, "halted"),
            OrchestratorState::AllCompleted => write!(f, "all-completed"),
        }
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    /// 有非致命失败 (超时、验证不匹配等)
    Degraded,
    /// 致命失败
    Failed,
    Skipped,
}

/// 单个目标上的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub target: Target,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// 步骤报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    /// 步骤索引
    pub step_index: usize,

    /// 步骤描述
    pub description: String,

    /// 步骤状态
    pub status: StepStatus,

    /// 错误信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// 耗时（毫秒）
    pub duration_ms: u64,

    /// 通过的目标数
    pub passed_count: usize,

    /// 失败的目标数
    pub failed_count: usize,

    /// 警告 (不影响运行)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    /// 逐目标结果
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetOutcome>,
}

impl StepReport {
    pub fn new(index: usize, description: impl Into<String>) -> Self {
        Self {
            step_index: index,
            description: description.into(),
            status: StepStatus::Success,
            error: None,
            duration_ms: 0,
            passed_count: 0,
            failed_count: 0,
            warnings: Vec::new(),
            targets: Vec::new(),
        }
    }

    pub fn skipped(index: usize, description: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            ..Self::new(index, description)
        }
    }

    /// 记录一个目标的结果，失败的目标将步骤降级
    pub fn record(&mut self, target: Target, passed: bool, detail: impl Into<String>) {
        if passed {
            self.passed_count += 1;
        } else {
            self.failed_count += 1;
            if self.status == StepStatus::Success {
                self.status = StepStatus::Degraded;
            }
        }
        self.targets.push(TargetOutcome {
            target,
            passed,
            detail: detail.into(),
        });
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
        if self.status == StepStatus::Success {
            self.status = StepStatus::Degraded;
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
    }
}

/// 阶段状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Passed,
    Degraded,
    Failed,
    NotRun,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseStatus::Passed => f.write_str("passed"),
            PhaseStatus::Degraded => f.write_str("degraded"),
            PhaseStatus::Failed => f.write_str("failed"),
            PhaseStatus::NotRun => f.write_str("not-run"),
        }
    }
}

/// 阶段结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: PhaseId,
    pub description: String,
    pub status: PhaseStatus,
    pub passed_count: usize,
    pub failed_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub steps: Vec<StepReport>,
}

impl PhaseResult {
    pub fn new(phase: PhaseId, description: impl Into<String>) -> Self {
        Self {
            phase,
            description: description.into(),
            status: PhaseStatus::Passed,
            passed_count: 0,
            failed_count: 0,
            warnings: Vec::new(),
            error: None,
            duration_ms: 0,
            steps: Vec::new(),
        }
    }

    pub fn not_run(phase: PhaseId, description: impl Into<String>) -> Self {
        Self {
            status: PhaseStatus::NotRun,
            ..Self::new(phase, description)
        }
    }

    pub fn add_step(&mut self, step: StepReport) {
        self.passed_count += step.passed_count;
        self.failed_count += step.failed_count;
        self.warnings.extend(step.warnings.iter().cloned());

        match step.status {
            StepStatus::Failed => {
                self.status = PhaseStatus::Failed;
                if self.error.is_none() {
                    self.error = step.error.clone();
                }
            }
            StepStatus::Degraded if self.status == PhaseStatus::Passed => {
                self.status = PhaseStatus::Degraded;
            }
            _ => {}
        }

        self.steps.push(step);
    }
}

/// 运行报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub phases: Vec<PhaseResult>,
    pub final_state: OrchestratorState,
    /// 状态转移历史
    pub transitions: Vec<OrchestratorState>,
    /// 是否被操作员中断
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            phases: Vec::new(),
            final_state: OrchestratorState::Idle,
            transitions: vec![OrchestratorState::Idle],
            cancelled: false,
            duration_ms: 0,
        }
    }

    pub fn phase(&self, id: PhaseId) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == id)
    }

    pub fn count(&self, status: PhaseStatus) -> usize {
        self.phases.iter().filter(|p| p.status == status).count()
    }

    /// 是否有致命失败
    pub fn has_failure(&self) -> bool {
        self.count(PhaseStatus::Failed) > 0
    }

    pub fn is_degraded(&self) -> bool {
        self.count(PhaseStatus::Degraded) > 0
    }

    /// 进程退出码
    ///
    /// - 0: 全部成功；宽松模式下降级也为 0
    /// - 1: 致命失败
    /// - 2: 严格模式下存在降级阶段
    /// - 130: 被操作员中断
    pub fn exit_code(&self, strict: bool) -> i32 {
        if self.cancelled {
            130
        } else if self.has_failure() || self.final_state == OrchestratorState::Halted {
            1
        } else if strict && self.is_degraded() {
            2
        } else {
            0
        }
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// 导出为 YAML
    pub fn to_yaml(&self) -> serde_yaml::Result<String> {
        serde_yaml::to_string(self)
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_record_degrades() {
        let mut step = StepReport::new(0, "validate");
        step.record(Target::new("primary", "dc01"), true, "");
        step.record(Target::new("primary", "cl01"), false, "timeout");
        assert_eq!(step.status, StepStatus::Degraded);
        assert_eq!(step.passed_count, 1);
        assert_eq!(step.failed_count, 1);
    }

    #[test]
    fn test_phase_status_from_steps() {
        let mut phase = PhaseResult::new(PhaseId::Validate, "validate");
        let mut degraded = StepReport::new(0, "a");
        degraded.warn("not confirmed");
        phase.add_step(degraded);
        assert_eq!(phase.status, PhaseStatus::Degraded);

        let mut failed = StepReport::new(1, "b");
        failed.fail("deploy failed");
        phase.add_step(failed);
        assert_eq!(phase.status, PhaseStatus::Failed);
        assert_eq!(phase.error.as_deref(), Some("deploy failed"));
        assert_eq!(phase.warnings.len(), 1);
    }

    #[test]
    fn test_exit_code_policy() {
        let mut report = RunReport::new();
        report.final_state = OrchestratorState::AllCompleted;
        report.phases.push(PhaseResult::new(PhaseId::Infra, "infra"));
        assert_eq!(report.exit_code(false), 0);
        assert_eq!(report.exit_code(true), 0);

        let mut degraded = PhaseResult::new(PhaseId::Validate, "validate");
        degraded.status = PhaseStatus::Degraded;
        report.phases.push(degraded);
        assert_eq!(report.exit_code(false), 0);
        assert_eq!(report.exit_code(true), 2);

        report.final_state = OrchestratorState::Halted;
        assert_eq!(report.exit_code(false), 1);

        report.cancelled = true;
        assert_eq!(report.exit_code(false), 130);
    }

    #[test]
    fn test_state_transitions() {
        use OrchestratorState::*;
        assert!(Idle.can_transition_to(&Running(PhaseId::Infra)));
        assert!(Running(PhaseId::Infra).can_transition_to(&Completed(PhaseId::Infra)));
        assert!(!Running(PhaseId::Infra).can_transition_to(&Completed(PhaseId::Vms)));
        assert!(Failed(PhaseId::Vms).can_transition_to(&Halted));
        assert!(!Failed(PhaseId::Vms).can_transition_to(&Running(PhaseId::Validate)));
        assert!(!Halted.can_transition_to(&Running(PhaseId::Infra)));
        assert!(AllCompleted.is_terminal());
    }

    #[test]
    fn test_report_json() {
        let mut report = RunReport::new();
        report.phases.push(PhaseResult::not_run(PhaseId::Groups, "groups"));
        let json = report.to_json().unwrap();
        assert!(json.contains("\"not_run\""));
        assert!(json.contains("\"run_id\""));
    }
}
