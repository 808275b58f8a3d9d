//! image-assembler binary. Runs once inside the image build.

use assembler::{
    BuildParameters, CommandInstaller, CommandProbe, ComputeRuntime, GpuPolicy, ImageAssembler,
    SystemAccounts, VpnAgent,
};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "image-assembler", version, about = "Provision a service image from build parameters")]
struct Args {
    #[arg(short = 'c', long = "config", help = "Build parameters (TOML); defaults apply when omitted")]
    config: Option<PathBuf>,

    #[arg(long = "root", help = "Host directory the image is assembled into")]
    root: Option<PathBuf>,

    #[arg(long = "use-gpu", help = "Install the GPU runtime instead of the CPU one")]
    use_gpu: bool,

    #[arg(long = "gpu-variant", default_value = "cu121")]
    gpu_variant: String,

    #[arg(long = "gpu-policy", help = "require | warn")]
    gpu_policy: Option<GpuPolicy>,

    #[arg(long = "uid")]
    uid: Option<u32>,

    #[arg(long = "gid")]
    gid: Option<u32>,

    #[arg(long = "build-id", help = "Version marker exported to the application")]
    build_id: Option<String>,

    #[arg(long = "vpn-agent", help = "Image path of the VPN agent binary")]
    vpn_agent: Option<PathBuf>,
}

fn apply_overrides(mut params: BuildParameters, args: &Args) -> BuildParameters {
    if args.use_gpu {
        params.compute = ComputeRuntime::Gpu {
            variant: args.gpu_variant.clone(),
        };
    }
    if let Some(policy) = args.gpu_policy {
        params.gpu_policy = policy;
    }
    if let Some(uid) = args.uid {
        params.uid = uid;
    }
    if let Some(gid) = args.gid {
        params.gid = gid;
    }
    if let Some(build_id) = &args.build_id {
        params.build_identifier = build_id.clone();
    }
    if let Some(binary) = &args.vpn_agent {
        params.vpn_agent = VpnAgent::Present {
            binary: binary.clone(),
        };
    }
    if let Some(root) = &args.root {
        params.layout.root = root.clone();
    }
    params
}

fn run(args: Args) -> anyhow::Result<()> {
    let params = match &args.config {
        Some(path) => BuildParameters::load(path)?,
        None => {
            tracing::warn!("[assembler] No config file given, using defaults");
            BuildParameters::default()
        }
    };
    let params = apply_overrides(params, &args);

    eprintln!("  Build: {}", params.build_identifier);
    eprintln!("  Compute: {}", params.compute);
    eprintln!("  Identity: uid {} gid {}", params.uid, params.gid);
    eprintln!("  Root: {}", params.layout.root.display());

    let accounts = SystemAccounts::new(params.layout.root.clone());
    let installer = CommandInstaller::new(params.installer.clone());
    let probe = CommandProbe::new(params.probes.clone());

    let manifest = ImageAssembler::new(&params, &accounts, &installer, &probe).assemble()?;

    eprintln!(
        "  Image assembled: {} model caches verified, runtime {}",
        manifest.model_caches.len(),
        manifest.runtime.version
    );
    Ok(())
}

fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        tracing::error!("Image assembly failed: {}", e);
        eprintln!("Image assembly failed: {:#}", e);
        std::process::exit(1);
    }
}
