//! Plugin middleware for the Portico gateway.
//!
//! Plugins form an ordered chain executed before dispatch. Each request
//! is carried through the chain by a pooled [`Context`]; a plugin may let
//! the request continue, drive the rest of the chain itself via
//! [`Context::next`], or abort and produce its own response.

pub mod cache;
pub mod context;
pub mod context_pool;
pub mod httplog;
pub mod ratelimit;
pub mod rbac;
pub mod registry;

pub use context::{Context, ResponseParts};
pub use context_pool::ContextPool;
pub use registry::parse_extension;

use std::sync::Arc;

/// Lifecycle state reported by a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
    Working,
    Stopped,
    Reloading,
}

/// The plugin contract.
///
/// `handle` runs once per request, in registration order. A plugin that
/// neither calls [`Context::next`] nor aborts simply lets the chain
/// advance past it; a plugin that aborts stops the chain and owns the
/// response.
pub trait Plugin: Send + Sync + std::fmt::Debug {
    fn handle(&self, ctx: &mut Context);

    /// Disabled plugins are skipped by the chain.
    fn enabled(&self) -> bool;

    fn status(&self) -> PluginStatus;

    fn name(&self) -> &str;

    fn enable(&self, enabled: bool);
}

/// Shared handle type for chain members.
pub type PluginRef = Arc<dyn Plugin>;
