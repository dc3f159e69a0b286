//! ADLab CLI 应用

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use adlab_remote_executor::CancellationToken;

mod commands;
mod context;

#[derive(Parser)]
#[command(name = "adlab")]
#[command(about = "ADLab - 多区域 Active Directory 实验室部署与容灾编排", long_about = None)]
#[command(version)]
struct Cli {
    /// 日志级别 (RUST_LOG 优先)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 管理员密码 (覆盖 Key Vault 中的值)
    #[arg(long, env = "ADLAB_ADMIN_PASSWORD", hide_env_values = true, global = true)]
    admin_password: Option<String>,

    /// DSRM 密码 (覆盖 Key Vault 中的值)
    #[arg(long, env = "ADLAB_DSRM_PASSWORD", hide_env_values = true, global = true)]
    dsrm_password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 按阶段部署实验室
    Deploy {
        /// 阶段选择 (all, 3,1, 2-5, vms,validate)
        #[arg(short, long, default_value = "all")]
        phases: String,

        /// 使用自定义计划文件 (YAML) 代替标准计划
        #[arg(long)]
        plan: Option<PathBuf>,

        /// 严格模式：降级阶段也返回非零退出码
        #[arg(long)]
        strict: bool,

        /// JSON 格式输出报告
        #[arg(long)]
        json: bool,

        /// 报告输出文件 (.json / .yaml)
        #[arg(short, long)]
        report: Option<String>,
    },

    /// 列出标准阶段
    Phases,

    /// 输出解析后的部署计划
    Plan {
        /// 输出格式 (yaml/json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// 故障转移到灾备域控
    Failover {
        /// 强制夺取角色 (主域控已确认不可恢复时使用)
        #[arg(long)]
        seize: bool,

        /// 严格模式：检查清单警告也返回非零退出码
        #[arg(long)]
        strict: bool,

        /// JSON 格式输出报告
        #[arg(long)]
        json: bool,
    },

    /// 故障恢复到主域控
    Failback {
        /// 严格模式：检查清单警告也返回非零退出码
        #[arg(long)]
        strict: bool,

        /// JSON 格式输出报告
        #[arg(long)]
        json: bool,
    },

    /// 显示当前 FSMO 角色持有者
    Roles,

    /// 用户名单管理
    Users {
        #[command(subcommand)]
        action: UsersAction,
    },
}

#[derive(Subcommand)]
pub enum UsersAction {
    /// 生成用户名单 (CSV + JSON)
    Generate {
        /// 用户数量
        #[arg(short = 'n', long, default_value_t = adlab_orchestrator::DEFAULT_USER_COUNT)]
        count: usize,

        /// 随机种子
        #[arg(short, long, default_value_t = adlab_orchestrator::DEFAULT_SEED)]
        seed: u64,

        /// 输出目录
        #[arg(short, long, default_value = "data")]
        output: String,

        /// 域名 (默认取配置文件，无配置时为 managed-connections.net)
        #[arg(short, long)]
        domain: Option<String>,
    },
}

/// 全局参数
pub struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub admin_password: Option<String>,
    pub dsrm_password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 日志输出到 stderr，stdout 留给报告
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("ADLab CLI 启动");

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在停止...");
            interrupt.cancel();
        }
    });

    let global = GlobalArgs {
        config: cli.config,
        admin_password: cli.admin_password,
        dsrm_password: cli.dsrm_password,
    };

    let code = match cli.command {
        Commands::Deploy {
            phases,
            plan,
            strict,
            json,
            report,
        } => {
            commands::deploy::handle(&global, &phases, plan, strict, json, report, cancel).await?
        }
        Commands::Phases => commands::phases::handle()?,
        Commands::Plan { format } => commands::plan::handle(&global, &format)?,
        Commands::Failover {
            seize,
            strict,
            json,
        } => commands::dr::failover(&global, seize, strict, json, cancel).await?,
        Commands::Failback { strict, json } => {
            commands::dr::failback(&global, strict, json, cancel).await?
        }
        Commands::Roles => commands::roles::handle(&global, cancel).await?,
        Commands::Users { action } => commands::users::handle(&global, action).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
