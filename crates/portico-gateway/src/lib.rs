//! Portico gateway runtime: the engine that ties the plugin chain and
//! dispatch core together, the config watchers that hot-reload the rule
//! tables, and the HTTP front-end.

pub mod engine;
pub mod server;
pub mod watcher;

pub use engine::Engine;
pub use server::HttpServer;
pub use watcher::{OpCode, WatchEvent, Watcher, DEFAULT_WATCH_INTERVAL};
