//! 角色查询命令

use anyhow::Result;
use colored::Colorize;

use adlab_orchestrator::DrRunner;
use adlab_remote_executor::CancellationToken;

use super::output;
use crate::context::LabContext;
use crate::GlobalArgs;

pub async fn handle(global: &GlobalArgs, cancel: CancellationToken) -> Result<i32> {
    let context = LabContext::load(global)?;
    let runner = DrRunner::new(
        context.config.clone(),
        context.executor.clone(),
        context.probe.clone(),
        cancel,
    );

    let spinner = output::spinner("查询 FSMO 角色持有者...");
    let result = runner.query_holders().await;
    spinner.finish_and_clear();

    let (queried_on, holders) = result?;
    println!("{} 查询节点: {}\n", "✓".green().bold(), queried_on.to_string().cyan());
    output::print_holders(&holders);
    Ok(0)
}
