use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::{bail, Context, IntoDiagnostic, Result};
use sendfilter::config::Cfg;
use sendfilter::{
    DisposableDomainCache, FileSystemStorage, FilterEngine, HickoryResolver, HttpListFetcher,
    MemoryStorage, MxRecordCache, SqliteDirectory, Storage, SystemClock,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filters recipient addresses and prints the accepted and rejected sets as JSON.
#[derive(Parser)]
#[command(name = "mailsendfilter", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: Utf8PathBuf,

    /// Addresses to filter. Read from stdin, one per line, when none are given.
    addresses: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Cfg::load(args.config.as_str()).wrap_err("error loading configuration")?;
    init_tracing(&cfg);

    let engine = build_engine(&cfg).await?;
    let config = cfg.filter_configuration();

    let addresses = if args.addresses.is_empty() {
        read_stdin().await?
    } else {
        args.addresses
    };
    info!(count = addresses.len(), "filtering addresses");

    let outcome = match cfg.filter_timeout() {
        Some(limit) => engine.filter_emails_within(addresses, &config, limit).await?,
        None => engine.filter_emails(addresses, &config).await?,
    };

    let json = serde_json::to_string_pretty(&outcome).into_diagnostic()?;
    println!("{}", json);

    Ok(())
}

fn init_tracing(cfg: &Cfg) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if cfg.log_format.as_deref() == Some("json") {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn build_engine(cfg: &Cfg) -> Result<FilterEngine> {
    let backend = cfg.backend()?;

    let storage: Arc<dyn Storage> = match cfg.storage.storage_type.as_str() {
        "filesystem" => Arc::new(
            FileSystemStorage::new(&cfg.storage.base_path)
                .await
                .wrap_err("error initializing storage")?,
        ),
        "memory" => Arc::new(MemoryStorage::new()),
        other => bail!("unknown storage type '{}', use 'filesystem' or 'memory'", other),
    };

    let clock = Arc::new(SystemClock);
    let fetcher = Arc::new(HttpListFetcher::new(cfg.fetch_timeout())?);
    let resolver = Arc::new(HickoryResolver::from_system_conf()?);
    let directory = SqliteDirectory::open(&cfg.directory.path, backend)
        .await
        .wrap_err_with(|| format!("error opening account directory {}", cfg.directory.path))?;

    Ok(FilterEngine::new(
        Arc::new(DisposableDomainCache::new(
            storage.clone(),
            fetcher,
            clock.clone(),
            cfg.fetch_timeout(),
        )),
        Arc::new(MxRecordCache::new(
            storage,
            resolver,
            clock.clone(),
            cfg.lookup_timeout(),
        )),
        Arc::new(directory),
        clock,
    ))
}

async fn read_stdin() -> Result<Vec<String>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut addresses = Vec::new();
    while let Some(line) = lines.next_line().await.into_diagnostic()? {
        let line = line.trim();
        if !line.is_empty() {
            addresses.push(line.to_string());
        }
    }
    Ok(addresses)
}
