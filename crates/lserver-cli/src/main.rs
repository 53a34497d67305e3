//! # LServer CLI Entry Point
//!
//! Main binary for the LServer load-simulation server. Provides the server
//! itself plus control-plane client commands for scripting.
//!
//! ## Usage
//!
//! ```bash
//! # Start a server
//! lserver serve -c lserver.yaml
//!
//! # Sample per-server statistics (delta fields reset on read)
//! lserver stats 127.0.0.1:8081
//!
//! # Inspect worker contexts
//! lserver contexts 127.0.0.1:8081
//!
//! # Reconfigure at runtime
//! lserver add-context 127.0.0.1:8081 --num-threads 4
//! lserver deactivate-context 127.0.0.1:8081 --index 2
//! ```
//!
//! Client commands print raw JSON to stdout for piping into `jq` and
//! friends; logging stays on stderr and is only initialized for `serve`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use argh::FromArgs;

use lserver_common::Config;
use lserver_server::{ControlClient, ControlRequest, HttpProtocol, Portal, ServerManager};
use lserver_vm::VirtualMachine;

/// Exit code for an unreadable or invalid configuration file.
const EXIT_INVALID_CONFIG: i32 = 2;

#[derive(FromArgs)]
/// LServer - a reconfigurable TCP load-simulation server
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Stats(StatsArgs),
    Contexts(ContextsArgs),
    AddContext(AddContextArgs),
    DeactivateContext(DeactivateContextArgs),
}

/// Arguments for running the server.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// start an LServer instance
struct ServeArgs {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    config: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "stats")]
/// fetch per-server statistics from a running instance
struct StatsArgs {
    /// control-plane address (e.g. 127.0.0.1:8081)
    #[argh(positional)]
    address: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "contexts")]
/// list worker contexts of every server
struct ContextsArgs {
    /// control-plane address (e.g. 127.0.0.1:8081)
    #[argh(positional)]
    address: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "add-context")]
/// add (or reactivate) a worker context
struct AddContextArgs {
    /// control-plane address (e.g. 127.0.0.1:8081)
    #[argh(positional)]
    address: String,

    /// server to reconfigure
    #[argh(option, long = "server-id", default = "0")]
    server_id: i32,

    /// thread count for the new context (1..=64)
    #[argh(option, long = "num-threads", default = "1")]
    num_threads: usize,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "deactivate-context")]
/// deactivate a worker context by index
struct DeactivateContextArgs {
    /// control-plane address (e.g. 127.0.0.1:8081)
    #[argh(positional)]
    address: String,

    /// server to reconfigure
    #[argh(option, long = "server-id", default = "0")]
    server_id: i32,

    /// context slot index to deactivate
    #[argh(option, long = "index")]
    index: usize,
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    match cli.command {
        Commands::Serve(args) => run_serve(args),
        Commands::Stats(args) => run_control(&args.address, ControlRequest::GetStats),
        Commands::Contexts(args) => run_control(&args.address, ControlRequest::GetContextsInfo),
        Commands::AddContext(args) => run_control(
            &args.address,
            ControlRequest::AddContext {
                server_id: args.server_id,
                num_threads: args.num_threads,
            },
        ),
        Commands::DeactivateContext(args) => run_control(
            &args.address,
            ControlRequest::DeactivateContext {
                server_id: args.server_id,
                context_index: args.index,
            },
        ),
    }
}

fn run_serve(args: ServeArgs) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("could not load config: {}", e);
            std::process::exit(EXIT_INVALID_CONFIG);
        }
    };
    let control_addr = match config.control_addr() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("could not load config: {}", e);
            std::process::exit(EXIT_INVALID_CONFIG);
        }
    };
    let header_interval = config.logging.header_interval;

    let manager = ServerManager::new();
    let vm = Arc::new(VirtualMachine::new());
    let handle = manager.create_server(config, move || HttpProtocol::new(vm.clone()))?;
    tracing::info!("server {} started", handle);

    let portal = Portal::start(manager.clone(), header_interval, control_addr)?;

    wait_for_shutdown_signal();
    tracing::info!("shutting down");

    manager.stop();
    portal.stop();
    manager.wait();
    Ok(())
}

/// Parks the main thread until SIGINT or SIGTERM arrives.
///
/// The signal watcher needs an async runtime, but shutdown tears worker
/// runtimes down and therefore must run on a plain thread; the channel
/// moves it back here.
fn wait_for_shutdown_signal() {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!("signal watcher runtime: {}", e);
                let _ = tx.send(());
                return;
            }
        };
        runtime.block_on(async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        });
        let _ = tx.send(());
    });
    let _ = rx.recv();
}

/// Makes one control-plane call and prints the raw JSON result.
fn run_control(address: &str, request: ControlRequest) -> Result<()> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid control address {}: {}", address, e))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let response = runtime.block_on(ControlClient::new(addr).call(&request))?;

    if !response.success {
        anyhow::bail!(
            "control request failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    println!(
        "{}",
        serde_json::to_string(&response.result.unwrap_or(serde_json::Value::Null))?
    );
    Ok(())
}
