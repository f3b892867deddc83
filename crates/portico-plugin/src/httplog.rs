//! Access-log plugin.
//!
//! Drives the rest of the chain itself so that it can observe the final
//! status and latency of the request as seen by the plugins.

use crate::{Context, Plugin, PluginStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct HttpLog {
    enabled: AtomicBool,
}

impl HttpLog {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
        }
    }
}

impl Default for HttpLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for HttpLog {
    fn handle(&self, ctx: &mut Context) {
        let start = Instant::now();
        let method = ctx.method().clone();
        let path = ctx.path().to_string();

        ctx.next();

        tracing::info!(
            method = %method,
            path = %path,
            status = ctx.response().status.as_u16(),
            aborted = ctx.aborted(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "request passed plugin chain"
        );
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn status(&self) -> PluginStatus {
        if self.enabled() {
            PluginStatus::Working
        } else {
            PluginStatus::Stopped
        }
    }

    fn name(&self) -> &str {
        "plugin.httplog"
    }

    fn enable(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}
