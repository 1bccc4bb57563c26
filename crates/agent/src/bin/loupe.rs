//! Loupe editor agent
//!
//! Speaks the agent protocol on stdin/stdout; logs go to stderr.
//!
//! ```text
//! loupe --codec msgpack
//! loupe --legacy
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use loupe_agent::{Agent, AgentConfig, AgentSettings, Broker, Input, MethodRegistry, Output};
use loupe_goimport::GoTypeCheck;
use loupe_store::{set_profiling, EnvMap};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "loupe")]
#[command(about = "Language assistance agent for text editors", long_about = None)]
#[command(version)]
struct Cli {
    /// Wire codec: json, cbor or msgpack
    #[arg(long)]
    codec: Option<String>,

    /// Agent name used in logs and the profile
    #[arg(long)]
    name: Option<String>,

    /// TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serve the line-oriented method-call protocol instead
    #[arg(long)]
    legacy: bool,

    /// Print reduction timings to stderr on exit
    #[arg(long)]
    profile: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let mut settings = match &cli.config {
        Some(path) => AgentSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => AgentSettings::default(),
    };
    if cli.profile {
        settings.profiling = true;
    }
    set_profiling(settings.profiling);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting the async runtime")?;
    let res = runtime.block_on(serve(cli, settings));
    // A reader blocked on stdin must not keep the process alive.
    runtime.shutdown_background();
    res
}

async fn serve(cli: Cli, settings: AgentSettings) -> Result<()> {
    let env = EnvMap::from_os();
    if cli.legacy {
        let name = cli.name.unwrap_or_else(|| settings.name.clone());
        let registry = Arc::new(MethodRegistry::with_builtins(env));
        let stats = Broker::new(name, registry, settings.legacy_workers)
            .serve(Input::Stdin, Output::Stdout)
            .await?;
        log::info!("served {} calls", stats.served);
        return Ok(());
    }

    let concurrency = settings.import_concurrency;
    let agent = Agent::new(AgentConfig {
        name: cli.name.unwrap_or_default(),
        codec: cli.codec.unwrap_or_default(),
        env,
        settings,
        ..Default::default()
    })?;
    agent.use_reducer(GoTypeCheck::new().with_concurrency(concurrency));
    agent.run().await?;
    Ok(())
}
