//! src/bin/socksrotor_cli.rs
//! Ambient smoke-test binary: loads a TOML config, wires the engine to
//! stdout logging, starts it, and waits for Ctrl-C. Not part of the
//! library's public contract (SPEC_FULL.md §1 "Crate shape").

use std::sync::{Arc, RwLock};

use anyhow::Context;
use serde::Deserialize;
use socksrotor_core::{ProxyEngine, ProxyEntry, Settings};

#[derive(Debug, Deserialize)]
struct CliConfig {
    #[serde(default = "default_port")]
    listen_port: u16,
    #[serde(default)]
    proxies: Vec<ProxyEntry>,
    #[serde(default)]
    settings: Settings,
}

fn default_port() -> u16 {
    1080
}

fn main() -> anyhow::Result<()> {
    socksrotor_core::logging::init("socksrotor_core=info");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "socksrotor.toml".to_string());
    let cfg = load_config(&config_path)
        .with_context(|| format!("loading config from {config_path}"))?;

    let proxies = Arc::new(RwLock::new(cfg.proxies));

    let on_failed = Arc::new(|host: &str, port: u16, reason: &str| {
        println!("[proxy-failed] {host}:{port} — {reason}");
    });
    let on_reactivated = Arc::new(|host: &str, port: u16| {
        println!("[proxy-reactivated] {host}:{port}");
    });
    let on_log = Arc::new(|level: tracing::Level, message: &str| {
        println!("[{level}] {message}");
    });
    let on_log_error = Arc::new(|level: tracing::Level, message: &str| {
        eprintln!("[{level}] {message}");
    });

    let engine = Arc::new(ProxyEngine::new(
        cfg.listen_port,
        proxies,
        cfg.settings,
        on_failed,
        on_reactivated,
        on_log,
        on_log_error,
    )?);

    engine.start()?;
    println!("socksrotor listening on 127.0.0.1:{}", cfg.listen_port);

    wait_for_ctrl_c()?;

    engine.stop();
    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<CliConfig> {
    if !std::path::Path::new(path).exists() {
        anyhow::bail!("config file {path} not found; see socksrotor.example.toml");
    }
    let settings = config::Config::builder()
        .add_source(config::File::from(std::path::Path::new(path)))
        .build()?;
    Ok(settings.try_deserialize()?)
}

fn wait_for_ctrl_c() -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(tokio::signal::ctrl_c())?;
    Ok(())
}
