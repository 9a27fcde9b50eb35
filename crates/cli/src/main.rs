use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use relaygate_browser::{BrowserConfig, BrowserManager, load_roster};
use relaygate_config::ModelCatalog;
use relaygate_gateway::{AppState, agent_router, router};
use relaygate_pipeline::{Pipeline, PipelineConfig};
use relaygate_registry::Registry;
use relaygate_switcher::{Switcher, SwitcherConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "relaygate", about = "relaygate — multi-tenant API adapter")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WS gateway (default when no subcommand is given).
    Serve,
    /// Load configuration and print validation diagnostics without starting the gateway.
    ValidateConfig,
    /// Print the on-disk identity roster (auth index, email, whether it has a deep link).
    ListIdentities,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    install_tracing(&cli.log_level, cli.json_logs);

    let exit_code = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_serve().await,
        Commands::ValidateConfig => run_validate_config(),
        Commands::ListIdentities => run_list_identities().await,
    };
    std::process::exit(exit_code);
}

fn install_tracing(log_level: &str, json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn run_validate_config() -> i32 {
    let config = match relaygate_config::load() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            return 1;
        }
    };

    let result = relaygate_config::validate(&config);
    for diagnostic in &result.diagnostics {
        match diagnostic.severity {
            relaygate_config::Severity::Error => error!("{}", diagnostic.message),
            relaygate_config::Severity::Warning => warn!("{}", diagnostic.message),
        }
    }
    if result.has_errors() { 1 } else { 0 }
}

async fn run_list_identities() -> i32 {
    let config = match relaygate_config::load() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            return 1;
        }
    };

    let roster = match load_roster(&PathBuf::from(&config.auth_dir)).await {
        Ok(roster) => roster,
        Err(err) => {
            error!(error = %err, "failed to load identity roster");
            return 1;
        }
    };

    if roster.is_empty() {
        println!("no identities found under {}", config.auth_dir);
        return 0;
    }
    for identity in &roster {
        println!(
            "{}\t{}\t{}",
            identity.auth_index,
            identity.email.as_deref().unwrap_or("-"),
            identity.state.app_url.as_deref().unwrap_or("-"),
        );
    }
    0
}

async fn run_serve() -> i32 {
    let config = match relaygate_config::load() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            return 1;
        }
    };

    let validation = relaygate_config::validate(&config);
    for diagnostic in &validation.diagnostics {
        match diagnostic.severity {
            relaygate_config::Severity::Error => error!("{}", diagnostic.message),
            relaygate_config::Severity::Warning => warn!("{}", diagnostic.message),
        }
    }
    if validation.has_errors() {
        error!("refusing to start with invalid configuration");
        return 1;
    }

    let auth_dir = PathBuf::from(&config.auth_dir);
    let roster = match load_roster(&auth_dir).await {
        Ok(roster) => roster,
        Err(err) => {
            error!(error = %err, "failed to load identity roster");
            return 1;
        }
    };
    info!(count = roster.len(), "loaded identity roster");

    let models = load_model_catalog(&config.models_path);

    let browser_config = BrowserConfig {
        proxy_url: config.browser_proxy_url.clone(),
        ..BrowserConfig::default()
    };
    let manager = Arc::new(BrowserManager::new(browser_config, auth_dir));

    // §4.B: the grace-timer callback only logs here. Recovery itself is lazy — the next
    // request through `Pipeline::recover` (§4.E.1) notices the dead socket and re-activates,
    // so the callback does not need to drive activation itself.
    let on_connection_lost: relaygate_registry::ConnectionLostCallback = Arc::new(|| {
        warn!("connection registry: grace window elapsed with no reconnection");
    });
    let registry = Arc::new(Registry::new(on_connection_lost));

    let switcher_config = SwitcherConfig::from(&config);
    let switcher = Arc::new(Switcher::new(
        switcher_config,
        manager.clone(),
        registry.clone(),
        roster,
    ));

    let pipeline_config = PipelineConfig::from(&config);
    let pipeline = Arc::new(Pipeline::new(
        registry.clone(),
        switcher.clone(),
        manager.clone(),
        registry.clone(),
        pipeline_config,
    ));

    // `0.0.0.0:<port>` is a bind address, not something a client can route a `location`
    // header back to — substitute `localhost` for the rewrite contract's authority (§6).
    let own_authority = config
        .listen_addr
        .replace("0.0.0.0", "localhost")
        .replace("[::]", "localhost");
    let state = Arc::new(AppState::new(
        registry,
        switcher,
        manager,
        pipeline,
        config.api_keys.clone(),
        models,
        own_authority,
    ));

    let api_listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, addr = %config.listen_addr, "failed to bind API listener");
            return 1;
        }
    };
    let agent_addr = format!("127.0.0.1:{}", config.agent_ws_port);
    let agent_listener = match tokio::net::TcpListener::bind(&agent_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, addr = %agent_addr, "failed to bind agent WebSocket listener");
            return 1;
        }
    };

    info!(addr = %config.listen_addr, "serving API");
    info!(addr = %agent_addr, "serving agent WebSocket");

    let api_app = router(state.clone());
    let agent_app = agent_router(state);

    let api_server = axum::serve(api_listener, api_app);
    let agent_server = axum::serve(agent_listener, agent_app);

    tokio::select! {
        result = api_server => {
            if let Err(err) = result {
                error!(error = %err, "API server exited");
                return 1;
            }
        }
        result = agent_server => {
            if let Err(err) = result {
                error!(error = %err, "agent WebSocket server exited");
                return 1;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }
    0
}

fn load_model_catalog(path: &str) -> ModelCatalog {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(catalog) => catalog,
            Err(err) => {
                warn!(error = %err, path, "failed to parse model catalog, serving empty list");
                ModelCatalog { models: Vec::new() }
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path, "model catalog not found, serving empty list");
            ModelCatalog { models: Vec::new() }
        }
        Err(err) => {
            warn!(error = %err, path, "failed to read model catalog, serving empty list");
            ModelCatalog { models: Vec::new() }
        }
    }
}
