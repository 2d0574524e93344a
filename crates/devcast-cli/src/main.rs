//! `devcast` – expose a virtual device over the devcast protocol.
//!
//! The binary:
//!
//! 1. Initialises tracing (see `devcast_server::telemetry`).
//! 2. Loads `~/.devcast/config.toml`, writing the defaults on first run.
//! 3. Runs a virtual device session on an in-process transport.
//! 4. Intercepts **Ctrl-C** to broadcast a disconnect and shut down cleanly.

mod config;
mod device;

use colored::Colorize;
use tracing::warn;

fn main() {
    let _telemetry = devcast_server::telemetry::init_tracing("devcast");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };
    println!();

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – disconnecting device …".yellow().bold());
        let _ = stop_tx.send(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the session can only be killed");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            println!("{}: {}", "Failed to start the async runtime".red(), e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(device::run(cfg, stop_rx)) {
        println!("{}: {}", "Device session failed".red(), e);
        std::process::exit(1);
    }
    println!("{}", "  ✓ Exiting devcast.".green());
}

fn print_banner() {
    println!();
    println!("{}", r#"      __                             __ "#.bold().cyan());
    println!("{}", r#"  ___/ /__ _  _________ ____ ___ / /_"#.bold().cyan());
    println!("{}", r#" / _  / -_) |/ / __/ _ `(_-</ __/ __/"#.bold().cyan());
    println!("{}", r#" \_,_/\__/|___/\__/\_,_/___/\__/\__/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "devcast".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Device exposure over publish/subscribe");
    println!();
}
