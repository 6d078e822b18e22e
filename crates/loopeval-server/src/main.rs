use anyhow::Result;
use clap::{Parser, ValueEnum};
use loopeval_core::config::EngineConfig;
use loopeval_core::dataset::MemoryEvalSets;
use loopeval_core::engine::EngineBuilder;
use loopeval_core::idgen::SnowflakeIds;
use loopeval_core::storage::Store;
use loopeval_evaluators::llm::{fake::FakeLlm, openai::OpenAIClient, LlmClient, Unconfigured};
use loopeval_evaluators::targets::StaticSources;
use loopeval_server::config;
use loopeval_server::methods::MethodContext;
use loopeval_server::server::Server;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Provider {
    None,
    Fake,
    Openai,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SQLite file; `:memory:` keeps nothing after exit
    #[arg(long, default_value = ".loopeval/eval.db")]
    db: PathBuf,

    /// Engine config (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    strict_config: bool,

    /// LLM backing prompt evaluators and prompt targets
    #[arg(long, value_enum, default_value = "none")]
    llm: Provider,

    /// Snowflake node id, unique per process sharing a database
    #[arg(long, default_value_t = 0)]
    node: u16,
}

use tracing_subscriber::{fmt, EnvFilter};

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_llm(p: Provider) -> Result<Arc<dyn LlmClient>> {
    Ok(match p {
        Provider::None => Arc::new(Unconfigured),
        Provider::Fake => Arc::new(FakeLlm::new(r#"{"score": 1, "reason": "fake judge"}"#)),
        Provider::Openai => Arc::new(OpenAIClient::from_env()?),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::ServerConfig::from_env();
    init_logging(&cfg.log_level);

    let engine_cfg = match &args.config {
        Some(path) => EngineConfig::load(path, args.strict_config).map_err(|e| anyhow::anyhow!("{}", e))?,
        None => EngineConfig::default(),
    }
    .with_env();

    tracing::info!(event = "server_start", db = ?args.db, llm = ?args.llm, config = ?cfg);

    let store = if args.db.to_str() == Some(":memory:") {
        Store::memory_with_schema()?
    } else {
        if let Some(parent) = args.db.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Store::open_with_schema(&args.db)?
    };

    let ids = Arc::new(SnowflakeIds::new(args.node));
    let eval_sets = Arc::new(MemoryEvalSets::new(ids.clone()));
    let (evaluators, targets) = loopeval_evaluators::default_registries(build_llm(args.llm)?, StaticSources::new());
    let engine = EngineBuilder::new(store, engine_cfg)
        .ids(ids)
        .eval_sets(eval_sets.clone())
        .evaluators(evaluators)
        .targets(targets)
        .build()?;
    engine.start().await?;

    let ctx = MethodContext { engine, eval_sets };
    let served = Server::run(&ctx, cfg).await;
    ctx.engine.shutdown().await;
    served
}
