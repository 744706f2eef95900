//! plugwright - plugin lifecycle manager for a host application

use clap::{Parser, Subcommand};
use plugwright::config::{self, AppConfig, DEFAULT_CONFIG_YAML};
use plugwright::install::Ecosystem;
use plugwright::server::{self, AppState};
use plugwright::terminal::{ExecRequest, EXEC_COMPLETED, EXEC_SUCCESS};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "plugwright")]
#[command(author, version, about = "Plugin lifecycle manager for a host application")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration to .plugwright/config.yaml
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Start the HTTP server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Show current configuration
    Config,

    /// List plugins present in the install directory
    List,

    /// Show the install state of a plugin
    State {
        app: String,
    },

    /// Upload a packaged plugin (zip)
    Upload {
        archive: PathBuf,
    },

    /// Install an uploaded plugin
    Install {
        app: String,

        /// Run pending dependency installs and stream their output
        #[arg(long)]
        run_deps: bool,
    },

    /// Uninstall a plugin (deployed files are backed up first)
    Uninstall {
        app: String,
    },

    /// Mark a dependency install as finished (npm, composer or all)
    Complete {
        app: String,
        ecosystem: String,
    },

    /// Run an allow-listed command and stream its output
    Exec {
        /// Command key, e.g. web-build.pnpm
        key: String,

        /// Extend payload, e.g. module-install:<app>
        #[arg(long, default_value = "")]
        extend: String,
    },

    /// Restart the host process
    Reload,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "plugwright=debug,tower_http=debug"
    } else {
        "plugwright=info,tower_http=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Init { force } => cmd_init(force),
        Commands::Serve { port, host } => cmd_serve(port, host).await,
        Commands::Config => cmd_config(),
        Commands::List => cmd_list(),
        Commands::State { app } => cmd_state(&app),
        Commands::Upload { archive } => cmd_upload(&archive).await,
        Commands::Install { app, run_deps } => cmd_install(&app, run_deps).await,
        Commands::Uninstall { app } => cmd_uninstall(&app).await,
        Commands::Complete { app, ecosystem } => cmd_complete(&app, &ecosystem).await,
        Commands::Exec { key, extend } => cmd_exec(&key, &extend).await,
        Commands::Reload => cmd_reload(),
    }
}

fn load() -> anyhow::Result<AppConfig> {
    config::load_config().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        info!("Run 'plugwright init' to create a configuration file.");
        anyhow::anyhow!(e)
    })
}

fn app_state() -> anyhow::Result<AppState> {
    AppState::from_config(load()?, None)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_dir = PathBuf::from(".plugwright");
    let config_file = config_dir.join("config.yaml");

    if config_file.exists() && !force {
        error!("Configuration already exists. Use --force to overwrite.");
        return Ok(());
    }

    fs::create_dir_all(&config_dir)?;
    fs::write(&config_file, DEFAULT_CONFIG_YAML)?;
    info!(path = ?config_file, "Created configuration");
    println!("Configuration written to {}", config_file.display());
    Ok(())
}

async fn cmd_serve(port: Option<u16>, host: Option<String>) -> anyhow::Result<()> {
    let mut config = load()?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    server::start_server(config).await
}

fn cmd_config() -> anyhow::Result<()> {
    let config = load()?;
    println!("plugwright Configuration\n");
    println!("Server:");
    println!("  Host: {}", config.server.host);
    println!("  Port: {}", config.server.port);
    println!();
    println!("Paths:");
    println!("  Base: {:?}", config.paths.base());
    println!("  Frontend: {:?}", config.paths.frontend());
    println!("  Public: {:?}", config.paths.public());
    println!("  Install dir: {:?}", config.paths.install_dir());
    println!();
    println!("Database: {}", match &config.database.path {
        Some(path) => path.display().to_string(),
        None => "not configured (SQL scripts skipped)".to_string(),
    });
    println!("Restart mode: {}", config.host.restart_mode);
    println!(
        "Terminal: poll {}ms, auth {}",
        config.terminal.poll_interval_ms,
        if config.auth.is_configured() {
            "configured"
        } else {
            "no tokens"
        }
    );
    Ok(())
}

fn cmd_list() -> anyhow::Result<()> {
    let state = app_state()?;
    let plugins = state.installer.installed_list();
    if plugins.is_empty() {
        println!("No plugins found in {:?}", state.installer.layout().install_dir);
        return Ok(());
    }
    for manifest in &plugins {
        let app = manifest.app().unwrap_or_default();
        println!(
            "{:<24} {:<10} {}",
            app,
            manifest.version().unwrap_or_default(),
            state.installer.install_state(&app)
        );
    }
    Ok(())
}

fn cmd_state(app: &str) -> anyhow::Result<()> {
    let state = app_state()?;
    println!("{}", state.installer.install_state(app));
    Ok(())
}

async fn cmd_upload(archive: &Path) -> anyhow::Result<()> {
    let state = app_state()?;
    // upload consumes its input, so hand it a copy
    let install_dir = state.installer.layout().install_dir.clone();
    fs::create_dir_all(&install_dir)?;
    let staged = install_dir.join(format!("incoming-{}.zip", uuid::Uuid::new_v4().simple()));
    fs::copy(archive, &staged)?;

    let installer = state.installer.clone();
    let manifest = tokio::task::spawn_blocking(move || installer.upload(&staged)).await??;
    print_json(&manifest)
}

async fn cmd_install(app: &str, run_deps: bool) -> anyhow::Result<()> {
    let state = app_state()?;
    let installer = state.installer.clone();
    let name = app.to_string();
    let outcome = tokio::task::spawn_blocking(move || installer.install(&name)).await??;
    print_json(&outcome)?;

    if outcome.pending.is_empty() {
        return Ok(());
    }
    if !run_deps {
        for pending in &outcome.pending {
            println!(
                "Pending {} install: plugwright exec {} --extend {}",
                pending.ecosystem, pending.command, pending.extend
            );
        }
        return Ok(());
    }
    for pending in &outcome.pending {
        if !stream_exec(&state, &pending.command, &pending.extend).await {
            warn!(command = %pending.command, "Dependency install failed");
        }
    }
    println!("{}", state.installer.install_state(app));
    Ok(())
}

async fn cmd_uninstall(app: &str) -> anyhow::Result<()> {
    let state = app_state()?;
    let installer = state.installer.clone();
    let name = app.to_string();
    let backup = tokio::task::spawn_blocking(move || installer.uninstall(&name)).await??;
    match backup {
        Some(path) => println!("Uninstalled {} (backup: {})", app, path.display()),
        None => println!("Uninstalled {}", app),
    }
    Ok(())
}

async fn cmd_complete(app: &str, ecosystem: &str) -> anyhow::Result<()> {
    let ecosystem: Ecosystem = ecosystem.parse()?;
    let state = app_state()?;
    let installer = state.installer.clone();
    let name = app.to_string();
    tokio::task::spawn_blocking(move || installer.dependent_install_complete(&name, ecosystem))
        .await??;
    println!("{}", state.installer.install_state(app));
    Ok(())
}

async fn cmd_exec(key: &str, extend: &str) -> anyhow::Result<()> {
    let state = app_state()?;
    if !stream_exec(&state, key, extend).await {
        anyhow::bail!("command {} failed", key);
    }
    Ok(())
}

/// Run a command through the terminal, printing each message. Returns
/// whether it reported success.
async fn stream_exec(state: &AppState, key: &str, extend: &str) -> bool {
    let mut rx = state.terminal.exec(ExecRequest {
        command: key.to_string(),
        uuid: uuid::Uuid::new_v4().to_string(),
        extend: extend.to_string(),
        token: None,
        auth: false,
    });
    let mut succeeded = false;
    while let Some(message) = rx.recv().await {
        if message.data == EXEC_SUCCESS {
            succeeded = true;
        }
        if message.data != EXEC_COMPLETED {
            println!("{}", message.data.trim_end());
        }
    }
    succeeded
}

fn cmd_reload() -> anyhow::Result<()> {
    let state = app_state()?;
    if state.installer.host().restart() {
        println!("Host restart requested");
    } else {
        println!("Graceful restart unavailable; host stop requested");
    }
    Ok(())
}
