//! 就绪轮询
//!
//! 以固定间隔查询节点状态直到条件满足或超时。超时是一种结果而不是错误，
//! 由调用方决定如何处理。

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use adlab_remote_executor::{NodeStatus, PowerState, StatusProbe, Target};

/// 默认轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// 可序列化的就绪条件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyCondition {
    /// 运行中且虚拟机代理就绪
    AgentReady,
    /// 电源状态为运行中
    Running,
    /// 已关机或已释放
    Stopped,
}

impl ReadyCondition {
    pub fn is_met(&self, status: &NodeStatus) -> bool {
        match self {
            ReadyCondition::AgentReady => status.is_responsive(),
            ReadyCondition::Running => status.power_state == PowerState::Running,
            ReadyCondition::Stopped => status.power_state.is_off(),
        }
    }
}

impl fmt::Display for ReadyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyCondition::AgentReady => f.write_str("agent-ready"),
            ReadyCondition::Running => f.write_str("running"),
            ReadyCondition::Stopped => f.write_str("stopped"),
        }
    }
}

/// 轮询结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

impl PollOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready)
    }
}

/// 就绪轮询器
#[derive(Debug, Clone)]
pub struct ReadinessPoller {
    interval: Duration,
    cancel: CancellationToken,
}

impl ReadinessPoller {
    pub fn new(interval: Duration, cancel: CancellationToken) -> Self {
        Self { interval, cancel }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 轮询直到 `predicate` 成立
    ///
    /// 查询失败视为"尚未就绪"。两次查询之间至少间隔 `interval`。
    pub async fn wait_until_ready<F>(
        &self,
        probe: &dyn StatusProbe,
        target: &Target,
        predicate: F,
        deadline: Duration,
    ) -> PollOutcome
    where
        F: Fn(&NodeStatus) -> bool + Send + Sync,
    {
        let started = Instant::now();
        let deadline_at = started + deadline;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let status = tokio::select! {
                _ = self.cancel.cancelled() => return PollOutcome::Cancelled,
                status = probe.query(target) => status,
            };

            match status {
                Ok(status) if predicate(&status) => {
                    info!(
                        "{} 已就绪 (第 {} 次查询, 耗时 {}s)",
                        target,
                        attempt,
                        started.elapsed().as_secs()
                    );
                    return PollOutcome::Ready;
                }
                Ok(status) => debug!("{} 第 {} 次查询: {:?}", target, attempt, status),
                Err(e) => debug!("{} 第 {} 次查询失败，视为未就绪: {}", target, attempt, e),
            }

            if Instant::now() >= deadline_at {
                warn!(
                    "{} 等待就绪超时 ({}s, {} 次查询)",
                    target,
                    deadline.as_secs(),
                    attempt
                );
                return PollOutcome::TimedOut;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// 轮询直到满足可序列化条件
    pub async fn wait_for(
        &self,
        probe: &dyn StatusProbe,
        target: &Target,
        condition: ReadyCondition,
        deadline: Duration,
    ) -> PollOutcome {
        self.wait_until_ready(probe, target, |status| condition.is_met(status), deadline)
            .await
    }

    /// 并发等待多个节点，单个节点超时不影响其他节点
    pub async fn wait_all(
        &self,
        probe: &dyn StatusProbe,
        targets: &[Target],
        condition: ReadyCondition,
        deadline: Duration,
    ) -> Vec<(Target, PollOutcome)> {
        info!("等待 {} 个节点达到 {}", targets.len(), condition);
        let outcomes = join_all(
            targets
                .iter()
                .map(|target| self.wait_for(probe, target, condition, deadline)),
        )
        .await;
        targets.iter().cloned().zip(outcomes).collect()
    }
}
