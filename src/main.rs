//! Entry point: a `clap`-derived CLI with `run`, `status`, and `doctor`
//! subcommands (§6.1), wiring the crawl loop together with its observability
//! server as a sibling task (§2.1, §5.1).

mod action;
mod config;
mod context_builder;
mod crawl_loop;
mod device;
mod errors;
mod events;
mod flags;
mod hooks;
mod model;
mod ocr;
mod persistence;
mod prompt;
mod screen_state;
mod server;
mod stuck;
mod types;

use crate::config::Config;
use crate::crawl_loop::CrawlLoop;
use crate::device::{AdbDeviceClient, DeviceClient};
use crate::events::EventBus;
use crate::flags::FlagController;
use crate::model::fallback::{FallbackConfig, ProviderConfig};
use crate::model::{HttpModelAdapter, ModelAdapter};
use crate::server::AppState;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hermitcrawl", version, about = "Autonomous AI-driven mobile app exploration agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the crawl loop to completion against a target app.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Query a running instance's /status endpoint over HTTP.
    Status {
        #[arg(long, default_value = "http://127.0.0.1:8420")]
        endpoint: String,
    },
    /// Preflight checks: config validity, adb reachability, workspace paths.
    Doctor {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Run { config } => run_crawl(config).await,
        Commands::Status { endpoint } => run_status(endpoint).await,
        Commands::Doctor { config } => run_doctor(config).await,
    };

    std::process::exit(exit_code);
}

async fn run_crawl(config_path: PathBuf) -> i32 {
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {e}");
            return 1;
        }
    };

    let device: Arc<dyn DeviceClient> = Arc::new(AdbDeviceClient::new(
        config.device.adb_device.clone(),
        config.device.max_session_retries,
    ));

    let model: Arc<dyn ModelAdapter> = Arc::new(HttpModelAdapter::new(
        config.model.clone(),
        Vec::<ProviderConfig>::new(),
        FallbackConfig::default(),
    ));

    let events = EventBus::new();
    let flag_config = crate::flags::FlagConfig { dir: config.flags.dir.clone() };
    let flags = Arc::new(FlagController::new(&flag_config));

    let server_events = events.clone();
    let server_flags = flags.clone();
    let server_host = config.server.host.clone();
    let server_port = config.server.port;
    let server_handle = tokio::spawn(async move {
        let state = AppState::new(server_events, server_flags);
        let router = server::build_router(state);
        let addr = format!("{server_host}:{server_port}");
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("observability server listening on {addr}");
                if let Err(e) = axum::serve(listener, router).await {
                    error!("observability server error: {e}");
                }
            }
            Err(e) => error!("failed to bind observability server on {addr}: {e}"),
        }
    });

    // Clear a stale shutdown flag from a previous run so a fresh run starts clean.
    flags.remove(crate::flags::FlagKind::Shutdown);

    let crawl_loop = match CrawlLoop::new(config, device, model, events) {
        Ok(l) => l,
        Err(e) => {
            error!("failed to initialize crawl loop: {e}");
            server_handle.abort();
            return 1;
        }
    };

    let outcome = match crawl_loop.run().await {
        Ok(o) => o,
        Err(e) => {
            error!("crawl loop failed: {e}");
            server_handle.abort();
            return 1;
        }
    };

    let code = outcome.exit_code();
    info!("run finished with outcome {outcome:?}, exit code {code}");
    server_handle.abort();
    code
}

async fn run_status(endpoint: String) -> i32 {
    let url = format!("{}/status", endpoint.trim_end_matches('/'));
    match reqwest::get(&url).await {
        Ok(resp) => match resp.text().await {
            Ok(body) => {
                println!("{body}");
                0
            }
            Err(e) => {
                eprintln!("failed to read status response: {e}");
                1
            }
        },
        Err(e) => {
            eprintln!("failed to reach {url}: {e}");
            1
        }
    }
}

async fn run_doctor(config_path: PathBuf) -> i32 {
    let mut ok = true;

    match Config::load(&config_path) {
        Ok(config) => {
            println!("[ok] config parses: {}", config_path.display());

            match std::process::Command::new("adb").arg("devices").output() {
                Ok(out) if out.status.success() => {
                    let listing = String::from_utf8_lossy(&out.stdout);
                    let device_count = listing.lines().skip(1).filter(|l| l.contains("device")).count();
                    if device_count > 0 {
                        println!("[ok] adb on PATH, {device_count} device(s) attached");
                    } else {
                        println!("[warn] adb on PATH but no devices attached");
                        ok = false;
                    }
                }
                Ok(_) => {
                    println!("[fail] `adb devices` returned non-zero");
                    ok = false;
                }
                Err(e) => {
                    println!("[fail] adb not found on PATH: {e}");
                    ok = false;
                }
            }

            let session_dir = PathBuf::from(&config.agent.session_dir);
            match std::fs::create_dir_all(&session_dir) {
                Ok(()) => println!("[ok] session directory creatable: {}", session_dir.display()),
                Err(e) => {
                    println!("[fail] cannot create session directory {}: {e}", session_dir.display());
                    ok = false;
                }
            }

            if config.model.endpoint.is_empty() {
                println!("[fail] model endpoint is empty");
                ok = false;
            } else {
                println!("[ok] model backend `{}` at {}", config.model.backend, config.model.endpoint);
            }
        }
        Err(e) => {
            println!("[fail] config does not parse: {e}");
            ok = false;
        }
    }

    if ok {
        0
    } else {
        1
    }
}
