//! 用户名单命令

use anyhow::Result;
use colored::Colorize;
use std::path::PathBuf;
use tracing::debug;

use adlab_orchestrator::RosterGenerator;

use crate::context::load_config;
use crate::{GlobalArgs, UsersAction};

const FALLBACK_DOMAIN: &str = "managed-connections.net";

pub async fn handle(global: &GlobalArgs, action: UsersAction) -> Result<i32> {
    match action {
        UsersAction::Generate {
            count,
            seed,
            output,
            domain,
        } => generate(global, count, seed, &output, domain).await,
    }
}

async fn generate(
    global: &GlobalArgs,
    count: usize,
    seed: u64,
    output: &str,
    domain: Option<String>,
) -> Result<i32> {
    let domain = match domain {
        Some(domain) => domain,
        None => match load_config(global) {
            Ok(config) => config.lab.domain,
            Err(e) => {
                debug!("未加载配置，使用默认域名: {:#}", e);
                FALLBACK_DOMAIN.to_string()
            }
        },
    };

    let roster = RosterGenerator::new(domain.as_str())
        .with_count(count)
        .with_seed(seed)
        .generate();

    let dir = PathBuf::from(shellexpand::tilde(output).into_owned());
    let (csv, json) = roster.write_to(&dir).await?;

    println!(
        "{} 已生成 {} 个用户 (域: {}, 种子: {})",
        "✓".green().bold(),
        roster.len().to_string().cyan(),
        domain.cyan(),
        seed
    );
    println!("  CSV:  {}", csv.display());
    println!("  JSON: {}", json.display());
    println!();

    println!("{:<24} {}", "部门/角色".bold(), "人数".bold());
    println!("{}", "-".repeat(32));
    for (group, n) in roster.summary() {
        println!("{:<24} {}", group, n);
    }
    Ok(0)
}
