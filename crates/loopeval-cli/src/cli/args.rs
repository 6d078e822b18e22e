use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "loopeval", version, about = "Run LLM evaluation experiments locally")]
pub struct Cli {
    /// Log filter for the JSON logs on stderr
    #[arg(long, global = true, env = "LOOPEVAL_LOG", default_value = "warn")]
    pub log: String,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run an experiment file to completion
    Run(RunArgs),
    /// Show stored results of a finished experiment
    Results(ResultsArgs),
    /// Write a sample experiment file
    Init(InitArgs),
    Version,
}

#[derive(Parser, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = "loopeval.yaml")]
    pub file: PathBuf,

    #[arg(long, default_value = ".loopeval/eval.db")]
    pub db: PathBuf,

    /// Engine config (YAML); defaults apply when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Reject unknown keys in the engine config
    #[arg(long)]
    pub strict_config: bool,

    /// text | json
    #[arg(long, default_value = "text")]
    pub format: String,

    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 600)]
    pub timeout_secs: u64,
}

#[derive(Parser, Clone)]
pub struct ResultsArgs {
    #[arg(long, default_value = ".loopeval/eval.db")]
    pub db: PathBuf,

    #[arg(long)]
    pub expt_id: i64,

    #[arg(long, default_value_t = 1)]
    pub space_id: i64,

    /// Maximum turn rows to print
    #[arg(long, default_value_t = 50)]
    pub limit: usize,

    /// text | json
    #[arg(long, default_value = "text")]
    pub format: String,
}

#[derive(Parser, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "loopeval.yaml")]
    pub file: PathBuf,
}
