//! 部署命令

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use adlab_orchestrator::{plan_from_yaml, standard_plan, PhaseOrchestrator, PhaseSelection};
use adlab_remote_executor::CancellationToken;

use super::output;
use crate::context::LabContext;
use crate::GlobalArgs;

pub async fn handle(
    global: &GlobalArgs,
    phases: &str,
    plan: Option<PathBuf>,
    strict: bool,
    json: bool,
    report_path: Option<String>,
    cancel: CancellationToken,
) -> Result<i32> {
    let selection = PhaseSelection::parse(phases).context("阶段选择无效")?;

    let spinner = output::spinner("加载实验室配置...");
    let context = LabContext::load(global)?;
    let plan = match plan {
        Some(path) => {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("读取计划文件失败: {:?}", path))?;
            plan_from_yaml(&content)?
        }
        None => standard_plan(&context.config)?,
    };
    spinner.finish_with_message(format!(
        "{} 实验室 {} ({} 个节点, {} 个阶段)",
        "✓".green().bold(),
        context.config.lab.name.cyan(),
        context.config.nodes.len(),
        plan.len()
    ));

    let mut orchestrator = PhaseOrchestrator::new(
        context.config.clone(),
        plan,
        context.collaborators(global),
        cancel,
    )?;

    info!("执行阶段: {}", phases);
    let report = orchestrator.execute(&selection).await;

    let report_json = report.to_json()?;
    if json {
        println!("{}", report_json);
    } else {
        output::print_run_report(&report);
    }

    if let Some(path) = report_path {
        output::write_report(&path, &report_json, || Ok(report.to_yaml()?))?;
    }

    Ok(report.exit_code(strict || context.config.execution.strict))
}
