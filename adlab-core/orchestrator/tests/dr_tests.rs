//! 容灾流程集成测试

mod common;

use adlab_orchestrator::*;
use adlab_remote_executor::{CancellationToken, ExecutionResult, RemoteCommand};
use common::*;
use std::sync::Arc;
use std::time::Duration;

/// 健康实验室：FSMO 在 `holder` 上，DNS 记录数由 `dns_records` 决定
fn lab_executor(holder: &'static str, dns_records: Option<u32>) -> FakeExecutor {
    FakeExecutor::new(move |command: &RemoteCommand| {
        let script = command.script.as_str();
        let stdout = if script.contains("netdom query fsmo") {
            netdom(holder)
        } else if script.contains("Get-ADReplicationFailure") {
            "ReplicationFailures: 0".to_string()
        } else if script.contains("Resolve-DnsName") {
            dns_records
                .map(|n| format!("DnsRecords: {}", n))
                .unwrap_or_default()
        } else if script.contains("Get-SmbShare") {
            "Share: NETLOGON\r\nShare: SYSVOL".to_string()
        } else {
            String::new()
        };
        Ok(ExecutionResult::succeeded(command.target.clone(), stdout))
    })
}

fn runner(executor: &Arc<FakeExecutor>, probe: &Arc<FakeProbe>, cancel: CancellationToken) -> DrRunner {
    DrRunner::new(lab(), executor.clone(), probe.clone(), cancel)
}

#[tokio::test]
async fn test_graceful_failover_with_checklist() {
    let executor = Arc::new(lab_executor("DC02", Some(2)));
    let probe = Arc::new(FakeProbe::new().with(dc01(), running()).with(dc02(), running()));

    let report = runner(&executor, &probe, CancellationToken::new())
        .failover(DrMode::Graceful)
        .await
        .unwrap();

    assert_eq!(report.operation, DrOperation::Failover(DrMode::Graceful));
    assert_eq!(report.destination, dc02());
    assert_eq!(report.holders.held_by("dc02"), RoleSet::all());
    let names: Vec<&str> = report.checklist.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["fsmo", "replication", "dns", "sysvol"]);
    assert!(report
        .checklist
        .iter()
        .all(|i| i.status == ChecklistStatus::Pass));
    assert_eq!(report.exit_code(true), 0);
    assert_eq!(report.preflight.len(), 2);

    let dns = executor
        .calls()
        .into_iter()
        .find(|c| c.script.contains("Resolve-DnsName"))
        .unwrap();
    assert_eq!(dns.target, dc02());
    assert_eq!(dns.parameters[0].value, "managed-connections.net");
}

#[tokio::test]
async fn test_seize_failover_refused_while_primary_running() {
    let executor = Arc::new(lab_executor("DC02", Some(2)));
    let probe = Arc::new(FakeProbe::new().with(dc01(), running()).with(dc02(), running()));

    let result = runner(&executor, &probe, CancellationToken::new())
        .failover(DrMode::Seize)
        .await;

    assert!(matches!(
        result,
        Err(OrchestratorError::RoleTransfer(
            RoleTransferError::PriorHolderReachable { .. }
        ))
    ));
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn test_seize_failover_when_primary_lost() {
    let executor = Arc::new(lab_executor("DC02", Some(1)));
    let probe = Arc::new(
        FakeProbe::new()
            .with(dc01(), deallocated())
            .with(dc02(), running()),
    );

    let report = runner(&executor, &probe, CancellationToken::new())
        .failover(DrMode::Seize)
        .await
        .unwrap();

    assert_eq!(report.holders.held_by("dc02"), RoleSet::all());
    assert_eq!(report.count(ChecklistStatus::Pass), 4);
}

#[tokio::test]
async fn test_failover_requires_destination() {
    let executor = Arc::new(lab_executor("DC02", Some(2)));
    let probe = Arc::new(FakeProbe::new().with(dc01(), running()));

    let result = runner(&executor, &probe, CancellationToken::new())
        .failover(DrMode::Graceful)
        .await;

    assert!(matches!(result, Err(OrchestratorError::StepFailed(_))));
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failback_waits_for_primary() {
    let executor = Arc::new(lab_executor("DC01", None));
    let probe = Arc::new(
        FakeProbe::new()
            .with(dc01(), deallocated())
            .with(dc02(), running()),
    );

    let delayed = probe.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(40)).await;
        delayed.set(dc01(), running());
    });

    let started = tokio::time::Instant::now();
    let report = runner(&executor, &probe, CancellationToken::new())
        .failback()
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(40));
    assert_eq!(report.operation, DrOperation::Failback);
    assert_eq!(report.source, dc02());
    assert_eq!(report.holders.held_by("dc01"), RoleSet::all());

    let dns = report.checklist.iter().find(|i| i.name == "dns").unwrap();
    assert_eq!(dns.status, ChecklistStatus::Warn);
    assert_eq!(report.exit_code(false), 0);
    assert_eq!(report.exit_code(true), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failback_times_out() {
    let executor = Arc::new(lab_executor("DC01", Some(1)));
    let probe = Arc::new(
        FakeProbe::new()
            .with(dc01(), deallocated())
            .with(dc02(), running()),
    );

    let result = runner(&executor, &probe, CancellationToken::new())
        .failback()
        .await;

    assert!(matches!(result, Err(OrchestratorError::StepFailed(_))));
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn test_query_holders_falls_back_to_secondary() {
    let executor = Arc::new(lab_executor("DC02", Some(1)));
    let probe = Arc::new(
        FakeProbe::new()
            .with(dc01(), deallocated())
            .with(dc02(), running()),
    );

    let (on, holders) = runner(&executor, &probe, CancellationToken::new())
        .query_holders()
        .await
        .unwrap();

    assert_eq!(on, dc02());
    assert_eq!(holders.holder(FsmoRole::SchemaMaster), Some("dc02"));
}
