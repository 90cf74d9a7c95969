use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use smallrender::config::{Config, TimingPreset};
use smallrender::monlog::MonitorLog;
use smallrender::node::Node;
use smallrender::{farm, fsio, shutdown};

#[derive(Parser, Debug)]
#[command(name = "smallrender")]
#[command(about = "Peer-to-peer render farm orchestrator over a shared filesystem")]
struct Args {
    /// Shared filesystem mount point; the farm tree is created underneath
    #[arg(long)]
    sync_root: Option<PathBuf>,

    /// Config file path (defaults to config.json in the app data dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run the scheduler on this node (exactly one peer per farm)
    #[arg(long)]
    coordinator: bool,

    /// Capability tags, comma-separated (e.g. "gpu,blender-4")
    #[arg(long, default_value = "")]
    tags: String,

    /// Timing preset: local-nas | cloud-fs
    #[arg(long)]
    preset: Option<String>,

    /// Do not launch the renderer agent automatically
    #[arg(long)]
    no_agent: bool,
}

fn parse_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_config(args: &Args, data_dir: &std::path::Path) -> Config {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join("config.json"));

    let mut config = fsio::safe_read_json::<Config>(&config_path).unwrap_or_default();

    if let Some(sync_root) = &args.sync_root {
        config.sync_root = sync_root.clone();
    }
    if args.coordinator {
        config.is_coordinator = true;
    }
    if !args.tags.is_empty() {
        config.tags = parse_tags(&args.tags);
    }
    if let Some(preset) = args.preset.as_deref() {
        let preset = match preset {
            "cloud-fs" => TimingPreset::CloudFs,
            "local-nas" => TimingPreset::LocalNas,
            _ => {
                tracing::warn!(preset, "Unknown preset, using local-nas");
                TimingPreset::LocalNas
            }
        };
        config.timing_preset = preset;
        config.timing = preset.timing();
    }
    if args.no_agent {
        config.auto_start_agent = false;
    }

    config
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let data_dir = farm::app_data_dir();

    let node_id = match farm::load_or_generate_node_id(&data_dir) {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load node identity");
            return ExitCode::from(1);
        }
    };

    let config = load_config(&args, &data_dir);

    tracing::info!(
        node_id = %node_id,
        sync_root = %config.sync_root.display(),
        is_coordinator = config.is_coordinator,
        tags = ?config.tags,
        preset = config.timing_preset.name(),
        "Starting smallrender node"
    );

    let log = MonitorLog::new();
    let cancel = shutdown::install_shutdown_handler();

    let node = match Node::start(config, node_id, log, cancel.clone()).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(error = %e, "Farm init failed");
            return ExitCode::from(1);
        }
    };

    node.run(cancel).await;
    ExitCode::SUCCESS
}
