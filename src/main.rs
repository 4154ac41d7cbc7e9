use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;

mod application;
mod domain;
mod infrastructure;
mod plugins;

use application::services::CommandService;
use infrastructure::config::Config;
use plugins::{FactoryRegistry, PluginManager, PluginWatcher, ReloadRequest};

#[derive(Parser)]
#[command(name = "tally-bot")]
#[command(about = "A chat analytics bot with hot-reloadable plugins", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot
    Run,
    /// Show version
    Version,
    /// Generate default config
    InitConfig,
}

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run_bot(cli.config),
        Commands::Version => {
            println!("tally-bot v{}", env!("CARGO_PKG_VERSION"));
        }
        Commands::InitConfig => match Config::init_file(&cli.config) {
            Ok(()) => println!("Wrote default config to {}", cli.config),
            Err(e) => {
                tracing::error!("Failed to write config: {}", e);
                std::process::exit(1);
            }
        },
    }
}

fn run_bot(config_path: String) {
    let config = Config::load_or_default(&config_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting {}", config.bot.name);

    let rt = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    rt.block_on(async {
        let manager = Arc::new(PluginManager::new(
            &config.plugins.directory,
            FactoryRegistry::with_builtins(),
        ));

        match manager.reload(ReloadRequest::manual()).await {
            Ok(outcome) => tracing::info!(
                "Plugin system ready: {} active, {} failed",
                outcome.activated.len(),
                outcome.failed.len()
            ),
            Err(e) => tracing::warn!("Initial plugin load failed: {}", e),
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reload_loop = tokio::spawn(Arc::clone(&manager).run(shutdown_rx.clone()));

        let overlay = manager.overlay();
        let watcher = if overlay.settings.hot_reload {
            let watcher = PluginWatcher::new(
                &config.plugins.directory,
                overlay.settings.reload_check_interval(),
                manager.request_sender(),
            );
            Some(tokio::spawn(watcher.run(shutdown_rx)))
        } else {
            tracing::info!("Hot reload disabled by overlay config");
            None
        };

        let service = CommandService::new(Arc::clone(&manager), &config.bot.prefix);
        run_console(&service, &config.bot.prefix).await;

        let _ = shutdown_tx.send(true);
        if let Some(handle) = watcher {
            let _ = handle.await;
        }
        let _ = reload_loop.await;
        manager.shutdown_all().await;
        tracing::info!("Shutdown complete");
    });
}

/// Dev-mode REPL on stdin. `exit` or end of input quits.
async fn run_console(service: &CommandService, prefix: &str) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    println!("Console mode. Type {}help for commands, 'exit' to quit.", prefix);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Failed to read input: {}", e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        match service.parse("console", line) {
            Some(msg) => println!("{}", service.dispatch(msg).await),
            None => println!("Commands start with {}. Try {}help", prefix, prefix),
        }
    }
}
