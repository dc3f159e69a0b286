//! Run Command 执行器测试（使用伪造的 az 可执行文件）

#![cfg(unix)]

use adlab_remote_executor::*;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 写入一个伪造的 az 脚本
fn fake_az(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("az");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn inventory() -> Inventory {
    Inventory::new().with_region(
        "primary",
        RegionEndpoint {
            resource_group: "rg-adlab-eus".to_string(),
            ssh_host: None,
        },
    )
}

#[tokio::test]
async fn test_script_delivered_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let delivered = dir.path().join("delivered.ps1");
    let body = format!(
        r#"for arg in "$@"; do
  case "$arg" in
    @*) cp "${{arg#@}}" "{}" ;;
  esac
done
echo '{{"value":[{{"code":"ComponentStatus/StdOut/succeeded","message":"ok"}},{{"code":"ComponentStatus/StdErr/succeeded","message":""}}]}}'"#,
        delivered.display()
    );
    let az = AzCli::new().with_program(fake_az(dir.path(), &body));
    let executor = AzRunCommandExecutor::new(az, inventory());

    let script = "param([string]$Name)\r\nWrite-Output \"Hello, $Name\"\n$x = 'single ''quoted'''\n`$notvar; $(Get-Date) | Out-Null\n";
    let command = RemoteCommand::new(Target::new("primary", "dc01"), script);

    let result = executor.run(&command, &CancellationToken::new()).await.unwrap();

    assert!(result.exit_succeeded());
    assert_eq!(result.stdout, "ok");
    assert_eq!(std::fs::read(&delivered).unwrap(), script.as_bytes());
}

#[tokio::test]
async fn test_plain_parameters_travel_as_literals() {
    let dir = tempfile::tempdir().unwrap();
    let delivered = dir.path().join("delivered.ps1");
    let argv = dir.path().join("argv.txt");
    let body = format!(
        r#"echo "$@" > "{}"
for arg in "$@"; do
  case "$arg" in
    @*) cp "${{arg#@}}" "{}" ;;
  esac
done
echo '{{"value":[{{"code":"ComponentStatus/StdOut/succeeded","message":"UserCount: 100"}}]}}'"#,
        argv.display(),
        delivered.display()
    );
    let az = AzCli::new().with_program(fake_az(dir.path(), &body));
    let executor = AzRunCommandExecutor::new(az, inventory());

    let script = "param([string]$SearchBase, [string]$Owner)\nGet-ADUser -Filter * -SearchBase $SearchBase";
    let command = RemoteCommand::new(Target::new("primary", "dc01"), script)
        .parameter(ScriptParameter::plain(
            "SearchBase",
            "OU=Users,OU=ADLab,DC=managed-connections,DC=net",
        ))
        .parameter(ScriptParameter::plain("Owner", "O'Brien Team"));

    let result = executor.run(&command, &CancellationToken::new()).await.unwrap();
    assert_eq!(result.stdout, "UserCount: 100");

    let command_line = std::fs::read_to_string(&argv).unwrap();
    assert!(!command_line.contains("--parameters"));
    assert!(!command_line.contains("OU=Users"));
    let file = std::fs::read_to_string(&delivered).unwrap();
    assert!(file.contains(script));
    assert!(file.contains("SearchBase = 'OU=Users,OU=ADLab,DC=managed-connections,DC=net'"));
    assert!(file.contains("Owner = 'O''Brien Team'"));
}

#[tokio::test]
async fn test_sensitive_parameters_travel_in_script_file() {
    let dir = tempfile::tempdir().unwrap();
    let delivered = dir.path().join("delivered.ps1");
    let argv = dir.path().join("argv.txt");
    let body = format!(
        r#"echo "$@" > "{}"
for arg in "$@"; do
  case "$arg" in
    @*) cp "${{arg#@}}" "{}" ;;
  esac
done
echo '{{"value":[{{"code":"ComponentStatus/StdOut/succeeded","message":"ok"}}]}}'"#,
        argv.display(),
        delivered.display()
    );
    let az = AzCli::new().with_program(fake_az(dir.path(), &body));
    let executor = AzRunCommandExecutor::new(az, inventory());

    let script = "param($DomainName, $SafeModePassword)
Install-ADDSForest -DomainName $DomainName";
    let command = RemoteCommand::new(Target::new("primary", "dc01"), script)
        .parameter(ScriptParameter::plain("DomainName", "managed-connections.net"))
        .parameter(ScriptParameter::sensitive("SafeModePassword", "Hunter2!"))
        .expect_reboot(true);

    let result = executor.run(&command, &CancellationToken::new()).await.unwrap();
    assert!(result.exit_succeeded());

    let command_line = std::fs::read_to_string(&argv).unwrap();
    assert!(!command_line.contains("Hunter2!"));
    let file = std::fs::read_to_string(&delivered).unwrap();
    assert!(file.contains(script));
    assert!(file.contains("SafeModePassword = 'Hunter2!'"));
}

#[tokio::test]
async fn test_expected_disconnect_on_reboot() {
    let dir = tempfile::tempdir().unwrap();
    let az = AzCli::new().with_program(fake_az(
        dir.path(),
        "echo 'An existing connection was forcibly closed by the remote host' >&2\nexit 1",
    ));
    let executor = AzRunCommandExecutor::new(az, inventory());
    let target = Target::new("primary", "dc01");

    let rebooting = RemoteCommand::new(target.clone(), "Install-ADDSForest").expect_reboot(true);
    let result = executor.run(&rebooting, &CancellationToken::new()).await.unwrap();
    assert!(result.is_expected_disconnect());

    let plain = RemoteCommand::new(target, "Get-ADDomain");
    let err = executor.run(&plain, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RemoteError::Disconnected { .. }));
}

#[tokio::test]
async fn test_transport_failure_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let az = AzCli::new().with_program(fake_az(
        dir.path(),
        "echo '(ResourceNotFound) The Resource dc01 was not found.' >&2\nexit 3",
    ));
    let executor = AzRunCommandExecutor::new(az, inventory());

    let command = RemoteCommand::new(Target::new("primary", "dc01"), "hostname");
    let err = executor.run(&command, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RemoteError::Transport { .. }));
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_script_failure_is_result() {
    let dir = tempfile::tempdir().unwrap();
    let az = AzCli::new().with_program(fake_az(
        dir.path(),
        r#"echo '{"value":[{"code":"ComponentStatus/StdOut/succeeded","message":""},{"code":"ComponentStatus/StdErr/succeeded","message":"Access is denied."}]}'"#,
    ));
    let executor = AzRunCommandExecutor::new(az, inventory());

    let command = RemoteCommand::new(Target::new("primary", "dc01"), "Get-ADUser x");
    let result = executor.run(&command, &CancellationToken::new()).await.unwrap();
    assert!(!result.exit_succeeded());
    assert_eq!(result.stderr, "Access is denied.");
}

#[tokio::test]
async fn test_command_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let az = AzCli::new().with_program(fake_az(dir.path(), "sleep 10"));
    let executor = AzRunCommandExecutor::new(az, inventory());

    let command = RemoteCommand::new(Target::new("primary", "dc01"), "hostname")
        .timeout(Duration::from_millis(300));
    let err = executor.run(&command, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RemoteError::Timeout { .. }));
}
