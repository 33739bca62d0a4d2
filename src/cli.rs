use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "vlessmux",
    about = "Local SOCKS5 proxy with automatic server selection",
    version = env!("VLESSMUX_BUILD_VERSION")
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TopCommand,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Local SOCKS5 port the engine listens on
    #[arg(long, global = true)]
    pub socks_port: Option<u16>,

    /// Path to the proxy engine executable
    #[arg(long, global = true)]
    pub binary: Option<PathBuf>,

    /// Remote candidate list URL
    #[arg(long, global = true)]
    pub remote_url: Option<String>,
}

#[derive(Subcommand)]
pub enum TopCommand {
    /// Connect and keep the proxy up until Ctrl-C
    Up,

    /// Manage custom server configs
    Configs {
        #[command(subcommand)]
        command: ConfigsCommand,
    },

    /// Fetch the remote candidate list and rank it by latency
    Remote,

    /// Measure TCP latency to a stored custom config
    Ping {
        /// Position in `configs list`
        index: usize,
    },

    /// Check connectivity through an already-running local proxy
    Check,
}

#[derive(Subcommand)]
pub enum ConfigsCommand {
    /// List stored custom configs in priority order
    List,

    /// Store a custom config (JSON document)
    Add {
        /// JSON file to read; `-` or omitted reads stdin
        file: Option<PathBuf>,
    },

    /// Remove a custom config by position
    Remove {
        index: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_overrides_after_subcommand() {
        let cli = Cli::try_parse_from([
            "vlessmux",
            "up",
            "--socks-port",
            "1080",
            "--remote-url",
            "https://example.com/list.txt",
            "-v",
        ])
        .expect("parse");
        assert!(matches!(cli.command, TopCommand::Up));
        assert_eq!(cli.socks_port, Some(1080));
        assert_eq!(cli.remote_url.as_deref(), Some("https://example.com/list.txt"));
        assert!(cli.verbose);
    }

    #[test]
    fn parses_configs_remove() {
        let cli = Cli::try_parse_from(["vlessmux", "configs", "remove", "2"]).expect("parse");
        match cli.command {
            TopCommand::Configs {
                command: ConfigsCommand::Remove { index },
            } => assert_eq!(index, 2),
            _ => panic!("unexpected command"),
        }
    }
}
