use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Once, OnceLock};

use slog::Drain;

const LEVEL_ENV: &str = "VLESSMUX_LOG";

fn parse_level(value: &str) -> Option<log::LevelFilter> {
    let lower = value.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return None;
    }
    let level = if lower.contains("trace") {
        log::LevelFilter::Trace
    } else if lower.contains("debug") {
        log::LevelFilter::Debug
    } else if lower.contains("warn") {
        log::LevelFilter::Warn
    } else if lower.contains("error") {
        log::LevelFilter::Error
    } else if lower.contains("off") {
        log::LevelFilter::Off
    } else {
        log::LevelFilter::Info
    };
    Some(level)
}

/// `VLESSMUX_LOG` wins over `RUST_LOG`; either wins over `--verbose`.
fn resolve_level(verbose: bool) -> log::LevelFilter {
    [LEVEL_ENV, "RUST_LOG"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find_map(|value| parse_level(&value))
        .unwrap_or(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
}

fn install<D>(drain: D, level: log::LevelFilter)
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    static GUARD: OnceLock<slog_scope::GlobalLoggerGuard> = OnceLock::new();
    static STDLOG: Once = Once::new();

    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    let logger = slog::Logger::root(drain, slog::o!("app" => "vlessmux"));

    if GUARD.get().is_none() {
        let _ = GUARD.set(slog_scope::set_global_logger(logger));
    }
    STDLOG.call_once(|| {
        let _ = slog_stdlog::init();
    });
    log::set_max_level(level);
}

pub fn init_terminal(verbose: bool) {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    install(drain, resolve_level(verbose));
}

pub fn init_file(path: &Path, verbose: bool) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    install(drain, resolve_level(verbose));
    Ok(())
}
