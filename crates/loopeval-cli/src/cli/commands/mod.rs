use super::args::*;
use std::path::Path;

pub mod results;
pub mod run;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const EVAL_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Run(args) => run::cmd_run(args).await,
        Command::Results(args) => results::cmd_results(args),
        Command::Init(args) => cmd_init(args),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(args: InitArgs) -> anyhow::Result<i32> {
    write_file_if_missing(&args.file, crate::templates::SAMPLE_EXPERIMENT)?;
    Ok(exit_codes::OK)
}

fn write_file_if_missing(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !path.exists() {
        std::fs::write(path, content)?;
        eprintln!("created {}", path.display());
    } else {
        eprintln!("note: {} already exists (skipped)", path.display());
    }
    Ok(())
}

pub(crate) fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if path.to_str() == Some(":memory:") {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub(crate) fn open_store(path: &Path) -> anyhow::Result<loopeval_core::storage::Store> {
    if path.to_str() == Some(":memory:") {
        return loopeval_core::storage::Store::memory_with_schema();
    }
    loopeval_core::storage::Store::open_with_schema(path)
}

/// Config errors map to exit 2, everything else bubbles up as fatal.
pub(crate) fn config_error(e: anyhow::Error) -> anyhow::Result<i32> {
    if e.to_string().starts_with("config error") {
        eprintln!("{}", e);
        return Ok(exit_codes::CONFIG_ERROR);
    }
    Err(e)
}
