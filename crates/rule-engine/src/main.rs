//! 规则引擎命令行
//!
//! 从规则包（Schema、规则集、规则的 JSON 文件）加载内存仓储，
//! 执行规则集、查看编译产物或生成匹配载荷。

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rule_engine::repository::{Bundle, InMemoryRuleRepository, InMemorySchemaRepository};
use rule_engine::{
    CompiledRuleCache, ExecuteRequest, ExecutionEngine, HttpWebhookClient, RuleService,
};
use rules_shared::config::AppConfig;
use rules_shared::observability;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const SERVICE_NAME: &str = "rule-engine";

#[derive(Parser, Debug)]
#[command(name = "rule-engine")]
#[command(version, about = "业务规则引擎命令行工具")]
#[command(propagate_version = true)]
struct Cli {
    /// 规则包文件（包含 schemas、ruleSets、rules）
    #[arg(short, long, global = true)]
    bundle: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 对一组事实执行规则集
    Execute {
        /// 规则集（项目）ID
        #[arg(short, long)]
        project: String,

        /// 事实文件：JSON 数组
        #[arg(short, long)]
        facts: PathBuf,

        /// 只返回结果，不提交
        #[arg(long)]
        dry_run: bool,

        /// 输入事实的 Schema ID
        #[arg(long)]
        schema: Option<String>,
    },

    /// 编译规则并输出编译产物与 DRL
    Compile {
        #[arg(short, long)]
        rule: String,
    },

    /// 生成能命中规则的示例事实
    Payload {
        #[arg(short, long)]
        rule: String,
    },
}

/// 由规则包构建的内存仓储
struct Workspace {
    rules: Arc<InMemoryRuleRepository>,
    schemas: Arc<InMemorySchemaRepository>,
    cache: CompiledRuleCache,
}

impl Workspace {
    fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.context("缺少 --bundle 参数")?;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("读取规则包失败: {}", path.display()))?;
        let bundle = Bundle::from_json(&raw)
            .with_context(|| format!("解析规则包失败: {}", path.display()))?;

        let rules = Arc::new(InMemoryRuleRepository::new());
        let schemas = Arc::new(InMemorySchemaRepository::new());
        bundle.seed(&schemas, &rules);

        Ok(Self {
            rules,
            schemas,
            cache: CompiledRuleCache::new(),
        })
    }

    fn service(&self) -> RuleService {
        RuleService::new(self.rules.clone(), self.schemas.clone(), self.cache.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig {
            service_name: SERVICE_NAME.to_string(),
            ..Default::default()
        }
    });
    let _guard = observability::init(&config.service_name, &config.observability).await?;

    let workspace = Workspace::load(cli.bundle.as_deref())?;

    match cli.command {
        Commands::Execute {
            project,
            facts,
            dry_run,
            schema,
        } => {
            let raw = std::fs::read_to_string(&facts)
                .with_context(|| format!("读取事实文件失败: {}", facts.display()))?;
            let facts: Vec<Value> = serde_json::from_str(&raw).context("事实文件必须是 JSON 数组")?;

            let engine = ExecutionEngine::new(
                workspace.rules.clone(),
                workspace.schemas.clone(),
                Arc::new(HttpWebhookClient::new(config.engine.webhook_timeout())),
            )
            .with_config(config.engine.clone())
            .with_cache(workspace.cache.clone());

            let request = ExecuteRequest {
                facts,
                dry_run,
                schema_id: schema,
                as_of: None,
            };
            let report = engine.execute(&project, request).await;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !report.success {
                anyhow::bail!(
                    "执行失败: {}",
                    report.error_message.unwrap_or_default()
                );
            }
            info!(fired = report.fired_rules.len(), "执行完成");
        }
        Commands::Compile { rule } => {
            let compiled = workspace.service().regenerate(&rule).await?;
            println!("{}", serde_json::to_string_pretty(compiled.as_ref())?);
            println!();
            println!("{}", compiled.drl);
        }
        Commands::Payload { rule } => match workspace.service().get_match_payload(&rule).await {
            Ok(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
            Err(e) => {
                warn!(rule_id = %rule, code = e.code(), "无法生成匹配载荷");
                return Err(e.into());
            }
        },
    }

    Ok(())
}
