//! bootstrap-supervisor binary. The container's entrypoint via start.sh.

use assembler::layout::DEFAULT_MANIFEST_PATH;
use clap::Parser;
use std::path::PathBuf;
use supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "bootstrap-supervisor", version, about = "Select the listener and exec the application")]
struct Args {
    #[arg(long = "manifest", default_value = DEFAULT_MANIFEST_PATH)]
    manifest: PathBuf,

    #[arg(long = "dev-root", default_value = supervisor::supervisor::DEFAULT_DEV_ROOT, hide = true)]
    dev_root: PathBuf,
}

fn run(args: Args) -> anyhow::Result<()> {
    let supervisor = Supervisor::from_manifest_path(&args.manifest)?.with_dev_root(args.dev_root);
    // Only returns if exec failed
    match supervisor.run()? {}
}

fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        tracing::error!("Bootstrap failed: {}", e);
        eprintln!("Bootstrap failed: {:#}", e);
        std::process::exit(1);
    }
}
