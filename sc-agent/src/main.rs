//! ScreenControl agent entry point.
//!
//! ```text
//! screencontrol-agent                  Run in the foreground
//! screencontrol-agent --service        Run under the Windows SCM
//! screencontrol-agent --install        Install as Windows service
//! screencontrol-agent --uninstall      Remove Windows service
//! screencontrol-agent --config <path>  Load a custom config TOML
//! screencontrol-agent --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::info;

use sc_agent::config::AgentConfig;
use sc_agent::service::{AGENT_VERSION, AgentService, RunOutcome};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "screencontrol-agent", about = "ScreenControl remote management agent")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "screencontrol-agent.toml")]
    config: PathBuf,

    /// Run under the Windows Service Control Manager.
    #[arg(long)]
    service: bool,

    /// Install as a Windows service.
    #[arg(long)]
    install: bool,

    /// Uninstall the Windows service.
    #[arg(long)]
    uninstall: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&AgentConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    #[cfg(target_os = "windows")]
    {
        if cli.install {
            sc_agent::win_service::install_service(&cli.config)?;
            println!("Service installed.");
            return Ok(());
        }
        if cli.uninstall {
            sc_agent::win_service::uninstall_service()?;
            println!("Service uninstalled.");
            return Ok(());
        }
        if cli.service {
            let config = AgentConfig::load(&cli.config);
            sc_agent::logging::init(&config.logging);
            return sc_agent::win_service::run_as_windows_service(config);
        }
    }
    #[cfg(not(target_os = "windows"))]
    {
        if cli.install || cli.uninstall || cli.service {
            eprintln!("Windows service management is only available on Windows.");
            std::process::exit(1);
        }
    }

    let config = AgentConfig::load(&cli.config);
    sc_agent::logging::init(&config.logging);

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(run_console(config))?;
    if let RunOutcome::UpdateHandedOff { version } = outcome {
        info!("exiting for update to {version}");
    }
    Ok(())
}

async fn run_console(config: AgentConfig) -> Result<RunOutcome, Box<dyn std::error::Error>> {
    info!("screencontrol-agent v{AGENT_VERSION}");
    info!("update channel: {}", config.update.channel);
    info!("bridge port: {}", config.bridge.port);

    let service = AgentService::new(config);
    tokio::spawn(watch_signals(service.stop_handle()));
    service.run().await
}

/// Clear the running flag on Ctrl-C, or SIGTERM on Unix.
async fn watch_signals(running: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Ctrl-C received; shutting down"),
                    _ = term.recv() => info!("SIGTERM received; shutting down"),
                }
            }
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
                info!("Ctrl-C received; shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received; shutting down");
    }
    running.store(false, Ordering::SeqCst);
}
