//! 阶段编排器
//!
//! 按固定顺序执行请求的阶段。失败分两级：
//! - 致命：部署失败、密钥 / 产物获取失败、`Halt` 策略的远程命令失败，
//!   当前阶段标记为 Failed，后续阶段标记为 NotRun
//! - 降级：就绪超时、验证不匹配、`Continue` 策略的远程命令失败，
//!   记录到报告中，运行继续

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use adlab_remote_executor::{
    redact_text, ExecutionResult, RemoteCommand, RemoteError, RemoteExecutor, ScriptParameter,
    SecretStore, StatusProbe, Target,
};

use crate::config::LabConfig;
use crate::deployer::{DeployRequest, ResourceDeployer};
use crate::health::HealthGate;
use crate::phase::{ArtifactKind, ParamValue, Phase, PhaseId, PhaseSelection, Step, StepPolicy};
use crate::poller::{PollOutcome, ReadinessPoller};
use crate::report::{OrchestratorState, PhaseResult, PhaseStatus, RunReport, StepReport};
use crate::state::{ArtifactProducer, RunState};
use crate::{OrchestratorError, Result};

/// 编排器依赖的外部能力
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn RemoteExecutor>,
    pub deployer: Arc<dyn ResourceDeployer>,
    pub probe: Arc<dyn StatusProbe>,
    pub secrets: Arc<dyn SecretStore>,
    pub producers: Vec<Arc<dyn ArtifactProducer>>,
}

/// 阶段编排器
pub struct PhaseOrchestrator {
    config: Arc<LabConfig>,
    phases: Vec<Phase>,
    collaborators: Collaborators,
    poller: ReadinessPoller,
    cancel: CancellationToken,
    state: RunState,
}

impl PhaseOrchestrator {
    /// 创建编排器，计划按阶段序号排序，重复的阶段会被拒绝
    pub fn new(
        config: Arc<LabConfig>,
        mut phases: Vec<Phase>,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> Result<Self> {
        phases.sort_by_key(|p| p.id);
        for pair in phases.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(OrchestratorError::PlanError(format!(
                    "阶段重复定义: {}",
                    pair[0].id
                )));
            }
        }
        for phase in &phases {
            phase.validate()?;
        }

        let poller = ReadinessPoller::new(config.polling.interval, cancel.clone());
        Ok(Self {
            config,
            phases,
            collaborators,
            poller,
            cancel,
            state: RunState::new(),
        })
    }

    /// 使用预置的运行状态 (例如已有的访问令牌)
    pub fn with_state(mut self, state: RunState) -> Self {
        self.state = state;
        self
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// 执行选中的阶段
    ///
    /// 错误不会越过编排器边界，全部记录在返回的报告中。
    pub async fn execute(&mut self, selection: &PhaseSelection) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::new();
        info!(
            "运行 {} 开始, 阶段: {}",
            report.run_id,
            selection
                .iter()
                .map(|id| id.name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let selected: Vec<Phase> = self
            .phases
            .iter()
            .filter(|p| selection.contains(p.id))
            .cloned()
            .collect();
        for id in selection.iter() {
            if !selected.iter().any(|p| p.id == id) {
                warn!("计划中没有阶段 {}，已忽略", id);
            }
        }

        let mut halted = false;
        for phase in &selected {
            if halted || self.cancel.is_cancelled() {
                if self.cancel.is_cancelled() {
                    report.cancelled = true;
                }
                report
                    .phases
                    .push(PhaseResult::not_run(phase.id, phase.description.as_str()));
                continue;
            }

            transition(&mut report, OrchestratorState::Running(phase.id));
            let result = self.run_phase(phase).await;

            if result.status == PhaseStatus::Failed {
                error!(
                    "阶段 {} 失败: {}",
                    phase.id,
                    result.error.as_deref().unwrap_or("未知错误")
                );
                transition(&mut report, OrchestratorState::Failed(phase.id));
                halted = true;
            } else {
                info!(
                    "阶段 {} 完成: {} (通过 {}, 失败 {})",
                    phase.id, result.status, result.passed_count, result.failed_count
                );
                transition(&mut report, OrchestratorState::Completed(phase.id));
            }
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                halted = true;
            }
            report.phases.push(result);
        }

        let terminal = if halted {
            OrchestratorState::Halted
        } else {
            OrchestratorState::AllCompleted
        };
        transition(&mut report, terminal);
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            "运行 {} 结束: {} (通过 {}, 降级 {}, 失败 {}, 未执行 {})",
            report.run_id,
            report.final_state,
            report.count(PhaseStatus::Passed),
            report.count(PhaseStatus::Degraded),
            report.count(PhaseStatus::Failed),
            report.count(PhaseStatus::NotRun)
        );
        report
    }

    async fn run_phase(&mut self, phase: &Phase) -> PhaseResult {
        let started = Instant::now();
        let mut result = PhaseResult::new(phase.id, phase.description.as_str());
        info!(
            "===== 阶段 {} {}: {} =====",
            phase.id.ordinal(),
            phase.id,
            phase.description
        );

        for kind in &phase.consumes {
            if let Err(e) = self.ensure_artifact(*kind).await {
                let mut step = StepReport::new(0, format!("准备产物 {}", kind));
                step.fail(e.to_string());
                result.add_step(step);
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        }

        for (index, step) in phase.steps.iter().enumerate() {
            if self.cancel.is_cancelled() || result.status == PhaseStatus::Failed {
                let mut skipped = StepReport::skipped(index, step.describe());
                if self.cancel.is_cancelled() && result.status != PhaseStatus::Failed {
                    skipped.fail(OrchestratorError::Cancelled.to_string());
                }
                result.add_step(skipped);
                continue;
            }

            let step_started = Instant::now();
            let mut report = self.run_step(phase.id, index, step).await;
            report.duration_ms = step_started.elapsed().as_millis() as u64;
            result.add_step(report);
        }

        if result.status != PhaseStatus::Failed {
            for kind in &phase.produces {
                if let Err(e) = self.ensure_artifact(*kind).await {
                    let mut step = StepReport::new(phase.steps.len(), format!("生成产物 {}", kind));
                    step.fail(e.to_string());
                    result.add_step(step);
                    break;
                }
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn ensure_artifact(&mut self, kind: ArtifactKind) -> Result<()> {
        self.state
            .produce_if_absent(kind, &self.collaborators.producers, &self.cancel)
            .await
            .map(|_| ())
    }

    async fn run_step(&mut self, phase: PhaseId, index: usize, step: &Step) -> StepReport {
        let mut report = StepReport::new(index, step.describe());
        info!("[{}] 步骤 {}: {}", phase, index + 1, report.description);

        let outcome = match step {
            Step::ResourceDeploy {
                template,
                region,
                parameters,
            } => {
                self.deploy(phase, template, region, parameters, &mut report)
                    .await
            }
            Step::RemoteCommand {
                target,
                script,
                parameters,
                expect_reboot,
                on_failure,
                ..
            } => {
                self.remote_command(
                    target,
                    script,
                    parameters,
                    *expect_reboot,
                    *on_failure,
                    &mut report,
                )
                .await
            }
            Step::Wait {
                targets,
                condition,
                timeout,
            } => {
                let outcomes = self
                    .poller
                    .wait_all(
                        self.collaborators.probe.as_ref(),
                        targets,
                        *condition,
                        *timeout,
                    )
                    .await;
                wait_outcomes(outcomes, &mut report)
            }
            Step::Validate {
                targets,
                script,
                parameters,
                expect,
                ..
            } => {
                self.validate(targets, script, parameters, expect, &mut report)
                    .await
            }
            Step::Pause { duration, reason } => {
                info!("暂停 {}s: {}", duration.as_secs(), reason);
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(OrchestratorError::Cancelled),
                    _ = tokio::time::sleep(*duration) => Ok(()),
                }
            }
        };

        if let Err(e) = outcome {
            report.fail(e.to_string());
        }
        report
    }

    async fn deploy(
        &mut self,
        phase: PhaseId,
        template: &std::path::Path,
        region: &str,
        parameters: &BTreeMap<String, ParamValue>,
        report: &mut StepReport,
    ) -> Result<()> {
        let region_config = self.config.region(region)?;
        let admin_password = self.secret(&self.config.lab.admin_password_secret).await?;

        let mut request = DeployRequest::new(
            phase,
            self.config.lab.name.as_str(),
            template,
            region_config.resource_group.as_str(),
            region_config.location.as_str(),
        )
        .with_domain(&self.config.lab.domain)
        .with_admin(&self.config.lab.admin_username, admin_password);

        for (name, value) in parameters {
            request = match value {
                ParamValue::Literal(text) => request.parameter(name, serde_json::json!(text)),
                ParamValue::Json(json) => request.parameter(name, json.clone()),
                ParamValue::Secret(secret) => {
                    let value = self.secret(secret).await?;
                    request.secret(name, value)
                }
                ParamValue::Artifact(kind) => {
                    let value = self
                        .state
                        .produce_if_absent(*kind, &self.collaborators.producers, &self.cancel)
                        .await?;
                    request.secret(name, value)
                }
            };
        }

        let result = self
            .collaborators
            .deployer
            .deploy(&request, &self.cancel)
            .await?;
        info!("部署 {} 成功", result.deployment_name);
        self.state.record_outputs(phase, result.outputs);
        report.passed_count += 1;
        Ok(())
    }

    async fn remote_command(
        &mut self,
        target: &Target,
        script: &crate::phase::ScriptSource,
        parameters: &BTreeMap<String, ParamValue>,
        expect_reboot: bool,
        policy: StepPolicy,
        report: &mut StepReport,
    ) -> Result<()> {
        let body = script.load().await?;
        let parameters = self.script_parameters(parameters).await?;
        let command = RemoteCommand::new(target.clone(), body)
            .parameters(parameters)
            .timeout(self.config.execution.command_timeout)
            .expect_reboot(expect_reboot);
        let secrets = self.sensitive_values(&command);

        match self.collaborators.executor.run(&command, &self.cancel).await {
            Ok(result) if result.is_expected_disconnect() => {
                info!("{} 按预期重启", target);
                report.record(target.clone(), true, "预期重启");
                Ok(())
            }
            Ok(result) if result.exit_succeeded() => {
                report.record(target.clone(), true, "");
                Ok(())
            }
            Ok(result) => {
                let detail = redact_text(&result.combined_output(), &secrets);
                warn!("{} 脚本失败: {}", target, detail);
                match policy {
                    StepPolicy::Halt => Err(OrchestratorError::StepFailed(format!(
                        "{} 脚本失败: {}",
                        target, detail
                    ))),
                    StepPolicy::Continue => {
                        report.record(target.clone(), false, detail);
                        Ok(())
                    }
                }
            }
            Err(RemoteError::Cancelled(_)) => Err(OrchestratorError::Cancelled),
            Err(e) => {
                let detail = redact_text(&e.to_string(), &secrets);
                warn!("{} 命令无法执行: {}", target, detail);
                match policy {
                    StepPolicy::Halt => Err(OrchestratorError::StepFailed(format!(
                        "{} 命令无法执行: {}",
                        target, detail
                    ))),
                    StepPolicy::Continue => {
                        report.record(target.clone(), false, detail);
                        Ok(())
                    }
                }
            }
        }
    }

    async fn validate(
        &mut self,
        targets: &[Target],
        script: &crate::phase::ScriptSource,
        parameters: &BTreeMap<String, ParamValue>,
        expect: &[crate::health::ExpectedPattern],
        report: &mut StepReport,
    ) -> Result<()> {
        let gate = HealthGate::from_patterns(expect)?;
        let body = script.load().await?;
        let parameters = self.script_parameters(parameters).await?;

        let commands: Vec<RemoteCommand> = targets
            .iter()
            .map(|target| {
                RemoteCommand::new(target.clone(), body.as_str())
                    .parameters(parameters.iter().cloned())
                    .timeout(self.config.execution.command_timeout)
            })
            .collect();
        let secrets = commands
            .first()
            .map(|c| self.sensitive_values(c))
            .unwrap_or_default();

        let executor = self.collaborators.executor.as_ref();
        let cancel = &self.cancel;
        let results = join_all(commands.iter().map(|c| executor.run(c, cancel))).await;

        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(result) => {
                    let (passed, detail) = judge(&gate, &result, &secrets);
                    if !passed {
                        warn!("{} 验证未通过: {}", target, detail);
                    }
                    report.record(target.clone(), passed, detail);
                }
                Err(RemoteError::Cancelled(_)) => return Err(OrchestratorError::Cancelled),
                Err(e) => {
                    let detail = redact_text(&e.to_string(), &secrets);
                    warn!("{} 验证命令无法执行: {}", target, detail);
                    report.record(target.clone(), false, detail);
                }
            }
        }

        info!(
            "验证结果: 通过 {}, 失败 {}",
            report.passed_count, report.failed_count
        );
        Ok(())
    }

    async fn secret(&self, name: &str) -> Result<adlab_remote_executor::Secret> {
        self.collaborators
            .secrets
            .get(name)
            .await
            .map_err(|e| OrchestratorError::SecretUnavailable {
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    /// 执行时解析参数，密钥与产物标记为敏感
    async fn script_parameters(
        &mut self,
        parameters: &BTreeMap<String, ParamValue>,
    ) -> Result<Vec<ScriptParameter>> {
        let mut resolved = Vec::with_capacity(parameters.len());
        for (name, value) in parameters {
            let parameter = match value {
                ParamValue::Literal(text) => ScriptParameter::plain(name, text.as_str()),
                ParamValue::Json(json) => ScriptParameter::plain(name, json.to_string()),
                ParamValue::Secret(secret) => {
                    ScriptParameter::sensitive(name, self.secret(secret).await?.expose())
                }
                ParamValue::Artifact(kind) => {
                    let value = self
                        .state
                        .produce_if_absent(*kind, &self.collaborators.producers, &self.cancel)
                        .await?;
                    ScriptParameter::sensitive(name, value.expose())
                }
            };
            resolved.push(parameter);
        }
        Ok(resolved)
    }

    fn sensitive_values(&self, command: &RemoteCommand) -> Vec<String> {
        let mut values = command.sensitive_values();
        values.extend(self.state.sensitive_values());
        values
    }
}

/// 验证结论: 脚本成功且所有检查都已确认才算通过
fn judge(gate: &HealthGate, result: &ExecutionResult, secrets: &[String]) -> (bool, String) {
    if !result.exit_succeeded() {
        return (false, redact_text(&result.combined_output(), secrets));
    }
    if gate.is_empty() {
        return (true, String::new());
    }
    let verdict = gate.verdict(&result.stdout);
    (verdict.is_confirmed(), redact_text(&verdict.describe(), secrets))
}

fn wait_outcomes(outcomes: Vec<(Target, PollOutcome)>, report: &mut StepReport) -> Result<()> {
    for (target, outcome) in outcomes {
        match outcome {
            PollOutcome::Ready => report.record(target, true, ""),
            PollOutcome::TimedOut => {
                report.warn(format!("{} 等待就绪超时", target));
                report.record(target, false, "超时");
            }
            PollOutcome::Cancelled => return Err(OrchestratorError::Cancelled),
        }
    }
    Ok(())
}

fn transition(report: &mut RunReport, next: OrchestratorState) {
    if !report.final_state.can_transition_to(&next) {
        warn!("非预期的状态转移: {} -> {}", report.final_state, next);
    }
    report.final_state = next;
    report.transitions.push(next);
}
