//! 阶段列表命令

use anyhow::Result;
use colored::Colorize;

use adlab_orchestrator::PhaseId;

pub fn handle() -> Result<i32> {
    println!("{}\n", "标准部署阶段:".bold());
    println!("{:<4} {:<14} {}", "#".bold(), "名称".bold(), "说明".bold());
    println!("{}", "-".repeat(60));
    for phase in PhaseId::ALL {
        println!(
            "{:<4} {:<14} {}",
            phase.ordinal(),
            phase.name().cyan(),
            phase.summary()
        );
    }
    println!("\n选择示例: {}", "all | 3,1 | 2-5 | vms,validate".bright_black());
    Ok(0)
}
