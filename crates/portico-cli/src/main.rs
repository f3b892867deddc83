//! # Portico entry point
//!
//! Starts the gateway: connects to the coordination store, performs the
//! initial table load, starts the config watchers and serves HTTP.
//!
//! ## Usage
//!
//! ```bash
//! # Minimal: one etcd endpoint
//! portico --etcd-addr http://127.0.0.1:2379
//!
//! # Several endpoints, extra plugins, debug endpoints
//! portico --addr :9000 \
//!     --etcd-addr http://10.0.0.1:2379 --etcd-addr http://10.0.0.2:2379 \
//!     --plugin rbac --plugin ratelimit:/etc/portico/ratelimit.json \
//!     --debug
//! ```

use anyhow::Result;
use argh::FromArgs;
use portico_common::EtcdStore;
use portico_gateway::{Engine, HttpServer, DEFAULT_WATCH_INTERVAL};
use portico_plugin::{parse_extension, PluginRef};
use std::net::SocketAddr;
use std::sync::Arc;

/// Portico API gateway.
#[derive(FromArgs)]
struct Cli {
    /// http listen address, `:9000` binds all interfaces
    #[argh(option, default = "\":9000\".into()")]
    addr: String,

    /// log files folder
    #[argh(option, default = "\"./logs\".into()")]
    logpath: String,

    /// log to stderr at debug level and extend the request timeout
    #[argh(switch)]
    debug: bool,

    /// coordination store endpoint, repeatable, at least one required
    #[argh(option, long = "etcd-addr")]
    etcd_addr: Vec<String>,

    /// extra plugin, form `name[:path-to-config.json]`, repeatable
    #[argh(option, long = "plugin")]
    plugin: Vec<String>,
}

/// `:9000` means every interface, like a bare port in a listen address.
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn init_logging(logpath: &str, debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if debug {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        std::fs::create_dir_all(logpath)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(std::path::Path::new(logpath).join("portico.log"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    }
    Ok(())
}

/// Resolve the `--plugin` flags; bad entries are logged and skipped so
/// one broken flag does not take the others down.
fn resolve_plugins(flags: &[String]) -> Vec<PluginRef> {
    let mut plugins = Vec::with_capacity(flags.len());
    for flag in flags {
        match parse_extension(flag) {
            Ok(plugin) => {
                tracing::info!(plugin = plugin.name(), "extension resolved");
                plugins.push(plugin);
            }
            Err(err) => {
                tracing::warn!(flag = %flag, error = %err, "skipping plugin flag");
            }
        }
    }
    plugins
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    if cli.etcd_addr.is_empty() {
        eprintln!("--etcd-addr must be set to one or more endpoints");
        std::process::exit(255);
    }

    init_logging(&cli.logpath, cli.debug)?;

    let addr: SocketAddr = match normalize_addr(&cli.addr).parse() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("invalid listen address {}: {err}", cli.addr);
            std::process::exit(255);
        }
    };

    let store = match EtcdStore::connect(cli.etcd_addr.clone()).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(error = %err, "could not connect to coordination store");
            eprintln!("could not connect to coordination store: {err}");
            std::process::exit(1);
        }
    };

    let plugins = resolve_plugins(&cli.plugin);
    let engine = Engine::new(store, plugins).await?;
    engine.spawn_watchers(DEFAULT_WATCH_INTERVAL);

    HttpServer::new(engine, cli.debug).run(addr).await?;
    Ok(())
}
