use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::prelude::*;
use url::Url;

use sidebar_hub::client::{self, PeerConfig};
use sidebar_hub::config::{ChannelTuning, FileConfig, HubConfig, ServerConfig, load_config};
use sidebar_hub::preferences::PreferenceStore;
use sidebar_hub::protocol::{PeerName, PeerSource, new_page_session_id};
use sidebar_hub::server::{self, AppState};
use sidebar_hub::session::TabDescriptor;

#[derive(Parser)]
#[command(name = "sidebar-hub")]
#[command(about = "Keeps page sidebars and their content scripts in sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.sidebar-hub)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub in the foreground
    Serve(ServeArgs),

    /// Run a headless page peer against a running hub
    Connect(ConnectArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Port to listen on (overrides config.toml)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    ContentScript,
    Sidebar,
}

impl From<Role> for PeerSource {
    fn from(role: Role) -> Self {
        match role {
            Role::ContentScript => PeerSource::ContentScript,
            Role::Sidebar => PeerSource::Sidebar,
        }
    }
}

#[derive(Parser)]
struct ConnectArgs {
    /// Which half of the page session to play
    #[arg(long, value_enum)]
    role: Role,

    /// Tab the page lives in
    #[arg(long)]
    tab: u64,

    /// Hub WebSocket endpoint
    #[arg(long, default_value = "ws://127.0.0.1:7878/ws")]
    hub: Url,

    /// Page session id (default: freshly generated)
    #[arg(long)]
    page_session: Option<String>,

    #[arg(long, default_value = "1")]
    window: u64,

    #[arg(long, default_value = "about:blank")]
    url: String,

    #[arg(long, default_value = "")]
    title: String,

    /// Report the tab as active
    #[arg(long)]
    active: bool,

    /// Native zoom factor of the tab
    #[arg(long)]
    zoom: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = HubConfig::new(cli.data_dir.clone())?;
    let fc: FileConfig = load_config(&config.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {:?}", config.config_toml_path()))?;

    match cli.command {
        Commands::Serve(args) => run_server(args, &config, &fc).await,
        Commands::Connect(args) => run_connect(args, &fc).await,
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "sidebar_hub=debug,page_channel=debug,tower_http=debug,info"
    } else {
        "sidebar_hub=info,page_channel=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

async fn run_server(args: ServeArgs, config: &HubConfig, fc: &FileConfig) -> Result<()> {
    info!("Starting sidebar hub");

    let server_config = ServerConfig::from_file(&fc.server, args.port);
    let tuning = ChannelTuning::from_file(&fc.channel);
    let preferences = PreferenceStore::load(config.preferences_path(&fc.preferences));

    let hub = sidebar_hub::spawn(preferences, tuning.channel_options());
    server::serve(AppState::new(hub), &server_config.bind_addr).await?;

    info!("Shutdown complete");
    Ok(())
}

async fn run_connect(args: ConnectArgs, fc: &FileConfig) -> Result<()> {
    let source = PeerSource::from(args.role);
    let page_session_id = args.page_session.unwrap_or_else(new_page_session_id);
    let peer = PeerConfig {
        hub_url: args.hub,
        name: PeerName::new(source, page_session_id),
        tab: TabDescriptor {
            id: args.tab,
            window_id: args.window,
            url: args.url,
            title: args.title,
            active: args.active,
            zoom_factor: args.zoom,
        },
    };

    let tuning = ChannelTuning::from_file(&fc.channel);
    client::run_peer(peer, tuning.channel_options()).await
}
