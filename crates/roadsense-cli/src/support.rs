use crate::config::{Config, TransportKind};
use roadsense_pipeline::{FeedSnapshot, OutboxTransport, StdoutTransport, Transport};
use roadsense_store::JsonlCollisionStore;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

pub fn load_config_or_exit(path: Option<&str>) -> Config {
    let config = Config::load(path.map(Path::new)).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    });
    tracing::debug!(
        config = path.unwrap_or(crate::config::DEFAULT_CONFIG_PATH),
        store = %config.store.path.display(),
        transport = ?config.transport.kind,
        "resolved configuration"
    );
    config
}

pub fn open_store(config: &Config) -> JsonlCollisionStore {
    JsonlCollisionStore::new(&config.store.path)
        .with_claim_ttl_seconds(config.store.claim_ttl_seconds)
        .with_lock_policy(config.lock_policy())
}

pub fn load_feeds_or_exit(config: &Config) -> FeedSnapshot {
    FeedSnapshot::load(&config.feed_sources()).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    })
}

pub fn transport_for(config: &Config) -> Arc<dyn Transport> {
    match config.transport.kind {
        TransportKind::Outbox => Arc::new(OutboxTransport::new(&config.transport.outbox_path)),
        TransportKind::Stdout => Arc::new(StdoutTransport::default()),
    }
}

pub fn runtime_or_exit() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("error: failed to create tokio runtime: {e}");
            std::process::exit(1);
        })
}

pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("error: failed to render json: {e}");
            std::process::exit(1);
        }
    }
}

pub fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
