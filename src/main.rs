use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::error;

use vlessmux::candidate::CandidateConfig;
use vlessmux::cli::{Cli, ConfigsCommand, TopCommand};
use vlessmux::config::{self, AppConfig};
use vlessmux::logging;
use vlessmux::orchestrator::Orchestrator;
use vlessmux::shared::latency::Latency;
use vlessmux::validator::ConnectionValidator;

fn main() {
    let cli = Cli::parse();

    let mut config = config::load_config();
    init_logging(&config, cli.verbose);
    apply_overrides(&mut config, &cli);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = ?e.to_string(), "runtime_create_failed");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(run(cli.command, config)) {
        error!(error = ?e.to_string(), "command_failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(config: &AppConfig, verbose: bool) {
    match config.general.log_file.as_deref() {
        Some(path) => {
            if let Err(e) = logging::init_file(path, verbose) {
                eprintln!("Warning: cannot log to {}: {:#}", path.display(), e);
                logging::init_terminal(verbose);
            }
        }
        None => logging::init_terminal(verbose),
    }
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(port) = cli.socks_port {
        config.engine.socks_port = port;
    }
    if let Some(binary) = &cli.binary {
        config.engine.binary = Some(binary.clone());
    }
    if let Some(url) = &cli.remote_url {
        config.remote.url = Some(url.clone());
    }
}

async fn run(command: TopCommand, config: AppConfig) -> anyhow::Result<()> {
    match command {
        TopCommand::Up => cmd_up(&config).await,
        TopCommand::Configs { command } => cmd_configs(command, &config),
        TopCommand::Remote => cmd_remote(&config).await,
        TopCommand::Ping { index } => cmd_ping(index, &config).await,
        TopCommand::Check => cmd_check(&config).await,
    }
}

async fn cmd_up(config: &AppConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config);
    orchestrator.start().await;
    println!("Selecting a server...");

    let state = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            orchestrator.destroy().await;
            println!("Cancelled.");
            return Ok(());
        }
        state = orchestrator.wait_settled() => state,
    };

    if !state.is_ready {
        orchestrator.destroy().await;
        bail!(
            "{}",
            state
                .error_message
                .unwrap_or_else(|| "connection failed".to_string())
        );
    }

    println!(
        "Proxy ready on socks5://127.0.0.1:{} via {} (Ctrl-C to stop)",
        orchestrator.socks_port(),
        state.best_server_host.as_deref().unwrap_or("-")
    );

    let result = tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C");
    orchestrator.destroy().await;
    println!("Disconnected.");
    result
}

fn cmd_configs(command: ConfigsCommand, config: &AppConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config);
    match command {
        ConfigsCommand::List => {
            let configs = orchestrator.custom_configs();
            if configs.is_empty() {
                println!("No custom configs stored.");
                return Ok(());
            }
            print_config_header();
            for (index, cfg) in configs.iter().enumerate() {
                print_config_row(index, cfg, None);
            }
        }
        ConfigsCommand::Add { file } => {
            let raw = read_document(file.as_deref())?;
            orchestrator
                .add_custom_config(&raw)
                .context("config rejected")?;
            println!("Stored custom config #{}", orchestrator.custom_configs().len() - 1);
        }
        ConfigsCommand::Remove { index } => {
            let before = orchestrator.custom_configs().len();
            orchestrator
                .remove_custom_config(index)
                .context("failed to update custom configs")?;
            if index < before {
                println!("Removed custom config #{}", index);
            } else {
                println!("No custom config at position {}", index);
            }
        }
    }
    Ok(())
}

async fn cmd_remote(config: &AppConfig) -> anyhow::Result<()> {
    if config.remote.url.is_none() {
        bail!("no remote candidate list configured (set remote.url or pass --remote-url)");
    }
    let orchestrator = Orchestrator::from_config(config);
    let ranked = orchestrator.ranked_remote_candidates().await;
    if ranked.is_empty() {
        println!("No responsive servers.");
        return Ok(());
    }
    print_config_header();
    for (index, (cfg, latency)) in ranked.iter().enumerate() {
        print_config_row(index, cfg, Some(Latency::Reachable(*latency)));
    }
    Ok(())
}

async fn cmd_ping(index: usize, config: &AppConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config);
    let configs = orchestrator.custom_configs();
    let Some(cfg) = configs.get(index) else {
        bail!("no custom config at position {} ({} stored)", index, configs.len());
    };
    let latency = orchestrator.ping_server(cfg).await;
    print_config_header();
    print_config_row(index, cfg, Some(latency));
    Ok(())
}

async fn cmd_check(config: &AppConfig) -> anyhow::Result<()> {
    let validator = ConnectionValidator::new(
        config.validation.test_url.clone(),
        Duration::from_millis(config.validation.timeout_ms),
    );
    let port = config.engine.socks_port;
    if validator.check_via(port).await {
        println!("OK: {} reachable through 127.0.0.1:{}", config.validation.test_url, port);
        Ok(())
    } else {
        bail!("no connectivity through 127.0.0.1:{}", port)
    }
}

fn read_document(file: Option<&Path>) -> anyhow::Result<String> {
    match file {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        _ => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("failed to read stdin")?;
            Ok(raw)
        }
    }
}

fn print_config_header() {
    println!(
        "{:>3}  {:<28} {:<32} {:<10} {:<8} {:>8}",
        "#", "Label", "Endpoint", "Network", "Security", "Latency"
    );
    println!("{}", "-".repeat(94));
}

fn print_config_row(index: usize, cfg: &CandidateConfig, latency: Option<Latency>) {
    let endpoint = cfg
        .endpoint()
        .map(|(host, port)| format!("{}:{}", host, port))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:>3}  {:<28} {:<32} {:<10} {:<8} {:>8}",
        index,
        truncate(&cfg.label(), 28),
        truncate(&endpoint, 32),
        cfg.network().unwrap_or("tcp"),
        cfg.security().unwrap_or("none"),
        format_latency(latency)
    );
}

fn format_latency(latency: Option<Latency>) -> String {
    match latency {
        Some(Latency::Reachable(d)) => format!("{}ms", d.as_millis()),
        Some(Latency::Unreachable) => "timeout".to_string(),
        None => "-".to_string(),
    }
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        value.to_string()
    } else {
        let kept: String = value.chars().take(max.saturating_sub(1)).collect();
        format!("{}~", kept)
    }
}
