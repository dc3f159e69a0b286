//! 容灾命令

use anyhow::Result;
use colored::Colorize;

use adlab_orchestrator::{DrMode, DrReport, DrRunner};
use adlab_remote_executor::CancellationToken;

use super::output;
use crate::context::LabContext;
use crate::GlobalArgs;

fn runner(global: &GlobalArgs, cancel: CancellationToken) -> Result<(DrRunner, bool)> {
    let context = LabContext::load(global)?;
    let strict = context.config.execution.strict;
    let runner = DrRunner::new(
        context.config.clone(),
        context.executor.clone(),
        context.probe.clone(),
        cancel,
    );
    Ok((runner, strict))
}

pub async fn failover(
    global: &GlobalArgs,
    seize: bool,
    strict: bool,
    json: bool,
    cancel: CancellationToken,
) -> Result<i32> {
    let (runner, config_strict) = runner(global, cancel)?;
    let mode = if seize { DrMode::Seize } else { DrMode::Graceful };

    let spinner = output::spinner(format!("故障转移 ({})...", mode));
    let result = runner.failover(mode).await;
    spinner.finish_and_clear();

    finish(result?, strict || config_strict, json)
}

pub async fn failback(
    global: &GlobalArgs,
    strict: bool,
    json: bool,
    cancel: CancellationToken,
) -> Result<i32> {
    let (runner, config_strict) = runner(global, cancel)?;

    let spinner = output::spinner("等待主域控恢复并回切角色...");
    let result = runner.failback().await;
    spinner.finish_and_clear();

    finish(result?, strict || config_strict, json)
}

fn finish(report: DrReport, strict: bool, json: bool) -> Result<i32> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        output::print_dr_report(&report);
    }

    let code = report.exit_code(strict);
    if !json {
        if code == 0 {
            println!("{} 容灾操作完成", "✓".green().bold());
        } else {
            println!("{} 容灾操作完成，检查清单未全部通过", "!".yellow().bold());
        }
    }
    Ok(code)
}
