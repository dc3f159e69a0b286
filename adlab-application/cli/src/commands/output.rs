//! CLI 报告输出
//!
//! 运行报告与容灾报告的彩色终端输出，以及 JSON/YAML 导出。

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

use adlab_orchestrator::{
    ChecklistStatus, DrReport, PhaseStatus, RoleHolders, RunReport, StepStatus,
};

/// 创建旋转进度指示器
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// 打印部署运行报告
pub fn print_run_report(report: &RunReport) {
    println!("\n{}", "=".repeat(60));
    println!("{}", "部署报告".bold());
    println!("{}", "=".repeat(60));
    println!();

    println!("运行 ID:  {}", report.run_id.cyan());
    println!("最终状态: {}", report.final_state.to_string().bold());
    println!("执行时间: {} ms", report.duration_ms.to_string().yellow());
    println!();

    for phase in &report.phases {
        let icon = match phase.status {
            PhaseStatus::Passed => "✓".green(),
            PhaseStatus::Degraded => "!".yellow(),
            PhaseStatus::Failed => "✗".red(),
            PhaseStatus::NotRun => "⊘".bright_black(),
        };
        println!(
            "{} {:<12} {:<10} {}",
            icon.bold(),
            phase.phase.to_string(),
            phase.status.to_string(),
            phase.description.bright_black()
        );

        if phase.status == PhaseStatus::NotRun {
            continue;
        }

        for step in &phase.steps {
            let marker = match step.status {
                StepStatus::Success => "·".green(),
                StepStatus::Degraded => "·".yellow(),
                StepStatus::Failed => "·".red(),
                StepStatus::Skipped => "·".bright_black(),
            };
            println!(
                "   {} {} ({}/{} 目标, {} ms)",
                marker,
                step.description,
                step.passed_count,
                step.passed_count + step.failed_count,
                step.duration_ms
            );
            for target in step.targets.iter().filter(|t| !t.passed) {
                println!(
                    "      {} {}: {}",
                    "✗".red(),
                    target.target,
                    target.detail.bright_black()
                );
            }
        }

        for warning in &phase.warnings {
            println!("   {} {}", "警告:".yellow(), warning);
        }
        if let Some(error) = &phase.error {
            println!("   {} {}", "错误:".red(), error.red());
        }
    }

    println!();
    println!("{}", "=".repeat(60));
    let status = if report.cancelled {
        format!("{} 部署被中断", "✗".red().bold())
    } else if report.has_failure() {
        format!("{} 部署失败", "✗".red().bold())
    } else if report.is_degraded() {
        format!("{} 部署完成 (存在降级阶段)", "!".yellow().bold())
    } else {
        format!("{} 部署成功", "✓".green().bold())
    };
    println!("{}", status);
    println!("{}", "=".repeat(60));
}

/// 打印角色持有者
pub fn print_holders(holders: &RoleHolders) {
    for (role, node) in holders.iter() {
        println!("  {:<22} {}", role.to_string(), node.cyan());
    }
}

/// 打印容灾报告
pub fn print_dr_report(report: &DrReport) {
    println!("\n{}", "=".repeat(60));
    println!("{}", "容灾报告".bold());
    println!("{}", "=".repeat(60));
    println!();

    println!("运行 ID:  {}", report.run_id.cyan());
    println!("源:       {}", report.source);
    println!("目标:     {}", report.destination.to_string().bold());
    println!("执行时间: {} ms", report.duration_ms.to_string().yellow());
    println!();

    println!("预检:");
    for snapshot in &report.preflight {
        match (&snapshot.status, &snapshot.error) {
            (Some(status), _) => println!(
                "  {:<20} {:?} (代理就绪: {})",
                snapshot.target.to_string(),
                status.power_state,
                status.agent_ready
            ),
            (None, Some(error)) => println!(
                "  {:<20} {}",
                snapshot.target.to_string(),
                error.bright_black()
            ),
            (None, None) => println!("  {:<20} -", snapshot.target.to_string()),
        }
    }
    println!();

    println!("FSMO 角色:");
    print_holders(&report.holders);
    println!();

    println!("检查清单:");
    for item in &report.checklist {
        let status = match item.status {
            ChecklistStatus::Pass => item.status.to_string().green(),
            ChecklistStatus::Warn => item.status.to_string().yellow(),
            ChecklistStatus::Fail => item.status.to_string().red(),
        };
        println!(
            "  [{}] {:<12} {}",
            status.bold(),
            item.name,
            item.detail.bright_black()
        );
    }
    println!("{}", "=".repeat(60));
}

/// 按扩展名把报告写入文件 (.yaml/.yml 为 YAML，其余为 JSON)
pub fn write_report(path: &str, json: &str, yaml: impl FnOnce() -> Result<String>) -> Result<()> {
    let expanded = shellexpand::tilde(path).to_string();
    let ext = Path::new(&expanded).extension().and_then(|s| s.to_str());
    let content = match ext {
        Some("yaml") | Some("yml") => yaml()?,
        _ => json.to_string(),
    };
    std::fs::write(&expanded, content).with_context(|| format!("写入报告失败: {}", expanded))?;
    println!("{} 报告已保存: {}", "✓".green(), expanded.cyan());
    Ok(())
}
