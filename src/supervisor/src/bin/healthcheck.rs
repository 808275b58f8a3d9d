//! healthcheck binary. Exit 0 when the application reports ready, 1 otherwise.

use assembler::layout::DEFAULT_MANIFEST_PATH;
use assembler::ImageManifest;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use supervisor::{health_url, probe_readiness, Readiness, RuntimeConfig, RuntimeDefaults};

#[derive(Parser, Debug)]
#[command(name = "healthcheck", version, about = "Probe the application's health endpoint")]
struct Args {
    #[arg(long = "manifest", default_value = DEFAULT_MANIFEST_PATH)]
    manifest: PathBuf,

    #[arg(long = "timeout-secs", default_value_t = 5)]
    timeout_secs: u64,

    #[arg(long = "url", help = "Probe this URL instead of the configured listener")]
    url: Option<String>,
}

fn run(args: Args) -> anyhow::Result<Readiness> {
    let url = match args.url {
        Some(url) => url,
        None => {
            let defaults = match ImageManifest::load(&args.manifest) {
                Ok(manifest) => RuntimeDefaults::from(&manifest.launch),
                Err(e) => {
                    tracing::debug!("manifest unavailable ({}), using built-in ports", e);
                    RuntimeDefaults::default()
                }
            };
            health_url(&RuntimeConfig::from_env(&defaults)?)
        }
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(probe_readiness(&url, Duration::from_secs(args.timeout_secs))))
}

fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(Readiness::Ready) => std::process::exit(0),
        Ok(Readiness::NotReady(reason)) => {
            eprintln!("not ready: {}", reason);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("healthcheck failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
