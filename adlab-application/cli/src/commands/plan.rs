//! 计划输出命令

use anyhow::{bail, Result};

use adlab_orchestrator::{plan_to_yaml, standard_plan};

use crate::context::load_config;
use crate::GlobalArgs;

pub fn handle(global: &GlobalArgs, format: &str) -> Result<i32> {
    let config = load_config(global)?;
    let plan = standard_plan(&config)?;

    match format {
        "yaml" | "yml" => print!("{}", plan_to_yaml(&plan)?),
        "json" => println!("{}", serde_json::to_string_pretty(&plan)?),
        other => bail!("不支持的输出格式: {} (可选 yaml/json)", other),
    }
    Ok(0)
}
