//! Bounded pool of pre-allocated request contexts.

use crate::context::Context;
use crate::PluginRef;
use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use http::request::Parts;
use portico_common::{GatewayError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lends out [`Context`]s for the duration of one request.
///
/// `get` takes a parked context from the queue and re-prepares it, or
/// builds a fresh one when the queue is empty. `put` resets the context
/// and parks it again; when the queue is full the context is simply
/// dropped. After `close`, `get` fails with
/// [`GatewayError::PoolClosed`].
pub struct ContextPool {
    queue: ArrayQueue<Context>,
    plugins: Arc<[PluginRef]>,
    closed: AtomicBool,
}

impl ContextPool {
    /// Build a pool holding up to `capacity` contexts, `initial` of them
    /// pre-allocated. The plugin list is captured once and shared by
    /// every context the pool ever hands out.
    pub fn new(initial: usize, capacity: usize, plugins: Vec<PluginRef>) -> Self {
        let plugins: Arc<[PluginRef]> = plugins.into();
        let queue = ArrayQueue::new(capacity.max(1));
        for _ in 0..initial.min(capacity) {
            let _ = queue.push(Context::new(plugins.clone()));
        }
        Self {
            queue,
            plugins,
            closed: AtomicBool::new(false),
        }
    }

    /// Borrow a context prepared for the given request.
    pub fn get(&self, head: Parts, body: Bytes) -> Result<Context> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::PoolClosed);
        }
        let mut ctx = self
            .queue
            .pop()
            .unwrap_or_else(|| Context::new(self.plugins.clone()));
        ctx.prepare(head, body);
        Ok(ctx)
    }

    /// Return a context. Resets it first; drops it when the pool is
    /// closed or full.
    pub fn put(&self, mut ctx: Context) {
        ctx.reset();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.queue.push(ctx);
    }

    /// Close the pool and drain the parked contexts.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        while self.queue.pop().is_some() {}
    }

    pub fn idle(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{request_head, Behavior, ScriptedPlugin};

    fn pool(initial: usize, capacity: usize) -> ContextPool {
        ContextPool::new(
            initial,
            capacity,
            vec![ScriptedPlugin::new("noop", Behavior::Passive) as PluginRef],
        )
    }

    #[test]
    fn test_get_prefers_parked_context() {
        let pool = pool(2, 4);
        assert_eq!(pool.idle(), 2);
        let ctx = pool.get(request_head("GET", "/a"), Bytes::new()).unwrap();
        assert_eq!(pool.idle(), 1);
        pool.put(ctx);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_get_falls_back_to_factory_when_empty() {
        let pool = pool(0, 2);
        assert_eq!(pool.idle(), 0);
        let ctx = pool.get(request_head("GET", "/a"), Bytes::new()).unwrap();
        assert_eq!(ctx.path(), "/a");
    }

    #[test]
    fn test_round_trip_yields_fresh_context() {
        let pool = pool(1, 1);

        let mut ctx = pool
            .get(request_head("POST", "/submit?a=1"), Bytes::new())
            .unwrap();
        ctx.abort_with_status(http::StatusCode::IM_A_TEAPOT);
        ctx.set_error(GatewayError::PageNotFound);
        pool.put(ctx);

        let ctx = pool.get(request_head("GET", "/fresh"), Bytes::new()).unwrap();
        assert_eq!(*ctx.method(), http::Method::GET);
        assert_eq!(ctx.path(), "/fresh");
        assert!(ctx.form().is_empty());
        assert!(!ctx.aborted());
        assert!(ctx.error().is_none());
        assert_eq!(ctx.plugin_idx(), -1);
    }

    #[test]
    fn test_put_beyond_capacity_drops_context() {
        let pool = pool(0, 1);
        let a = pool.get(request_head("GET", "/a"), Bytes::new()).unwrap();
        let b = pool.get(request_head("GET", "/b"), Bytes::new()).unwrap();
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_closed_pool_rejects_get() {
        let pool = pool(2, 2);
        pool.close();
        assert_eq!(pool.idle(), 0, "close drains parked contexts");
        let err = pool
            .get(request_head("GET", "/a"), Bytes::new())
            .unwrap_err();
        assert!(matches!(err, GatewayError::PoolClosed));
    }
}
