//! Per-request carrier threaded through the plugin chain and dispatcher.

use crate::PluginRef;
use bytes::Bytes;
use http::{header, request::Parts, HeaderMap, HeaderValue, Method, StatusCode};
use portico_common::{CodeInfo, GatewayError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Response headers that must not be copied verbatim from an upstream
/// response; they describe the connection or are recomputed by the
/// front-end when the buffered body is written out.
const HOP_BY_HOP: [header::HeaderName; 5] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
    header::TRAILER,
    header::UPGRADE,
];

/// The buffered response a request accumulates while moving through the
/// chain and dispatch. Written out once, when the request completes.
#[derive(Debug)]
pub struct ResponseParts {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseParts {
    fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

impl Default for ResponseParts {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-request state: the parsed request, the plugin cursor, the abort
/// flag and the buffered response.
///
/// A context is exclusively owned for the duration of one request; it is
/// lent out by the [`ContextPool`](crate::ContextPool) and returned when
/// the response has been written.
#[derive(Debug)]
pub struct Context {
    method: Method,
    path: String,
    query: Option<String>,
    form: HashMap<String, String>,
    head: Option<Parts>,
    body: Bytes,

    plugins: Arc<[PluginRef]>,
    plugin_idx: i64,

    aborted: bool,
    error: Option<GatewayError>,
    response: ResponseParts,
}

impl Context {
    /// A blank context bound to the given (immutable) plugin list.
    pub fn new(plugins: Arc<[PluginRef]>) -> Self {
        Self {
            method: Method::GET,
            path: String::new(),
            query: None,
            form: HashMap::new(),
            head: None,
            body: Bytes::new(),
            plugins,
            plugin_idx: -1,
            aborted: false,
            error: None,
            response: ResponseParts::new(),
        }
    }

    /// Re-arm the context for a new request. The body has already been
    /// read in full so that form parsing here does not deprive the
    /// upstream forward of it.
    pub fn prepare(&mut self, head: Parts, body: Bytes) {
        self.method = head.method.clone();
        self.path = head.uri.path().to_string();
        self.query = head.uri.query().map(str::to_string);
        self.form = parse_form(&head, &body);
        self.head = Some(head);
        self.body = body;
        self.plugin_idx = -1;
        self.aborted = false;
        self.error = None;
        self.response = ResponseParts::new();
    }

    /// Clear all per-request state. Called by the pool on `put`; not
    /// meant to be called directly.
    pub fn reset(&mut self) {
        self.method = Method::GET;
        self.path.clear();
        self.query = None;
        self.form.clear();
        self.head = None;
        self.body = Bytes::new();
        self.plugin_idx = -1;
        self.aborted = false;
        self.error = None;
        self.response = ResponseParts::new();
    }

    /// Advance the chain. Enabled plugins run in registration order; a
    /// plugin that drives the rest of the chain itself (by calling `next`
    /// inside `handle`) is not re-invoked, and a plugin that neither
    /// advances nor aborts is simply stepped past. Once `abort` has been
    /// called every `next` is a no-op.
    pub fn next(&mut self) {
        if self.aborted {
            return;
        }
        self.plugin_idx += 1;
        while (self.plugin_idx as usize) < self.plugins.len() {
            let plugin = self.plugins[self.plugin_idx as usize].clone();
            if plugin.enabled() {
                plugin.handle(self);
            }
            if self.aborted {
                return;
            }
            self.plugin_idx += 1;
        }
    }

    /// Stop the chain. Does not touch the response; the caller is
    /// expected to have written one.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Stop the chain and set the response status.
    pub fn abort_with_status(&mut self, status: StatusCode) {
        self.aborted = true;
        self.response.status = status;
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Record `err` and write a JSON error body with status 500. Does not
    /// abort the chain by itself.
    pub fn set_error(&mut self, err: GatewayError) {
        let info = CodeInfo::system_err(err.to_string());
        self.error = Some(err);
        self.write_json(StatusCode::INTERNAL_SERVER_ERROR, &info);
    }

    pub fn error(&self) -> Option<&GatewayError> {
        self.error.as_ref()
    }

    /// Serialize `value`, set the JSON content type and abort with
    /// `status`. A plugin that produces a response must not continue the
    /// chain, so this always aborts.
    pub fn json<T: Serialize>(&mut self, status: StatusCode, value: &T) {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.abort_with_status(status);
                self.response
                    .headers
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
                self.response.body = Bytes::from(bytes);
            }
            Err(err) => {
                self.set_error(GatewayError::Json(err));
                self.abort_with_status(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }

    /// Respond with a plain-text body and abort with `status`.
    pub fn string(&mut self, status: StatusCode, body: impl Into<String>) {
        self.abort_with_status(status);
        self.response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.response.body = Bytes::from(body.into());
    }

    fn write_json<T: Serialize>(&mut self, status: StatusCode, value: &T) {
        if let Ok(bytes) = serde_json::to_vec(value) {
            self.response.status = status;
            self.response
                .headers
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            self.response.body = Bytes::from(bytes);
        }
    }

    /// Copy an upstream response into the buffered response, dropping
    /// hop-by-hop headers.
    pub fn write_upstream(&mut self, status: StatusCode, headers: HeaderMap, body: Bytes) {
        self.response.status = status;
        self.response.headers.clear();
        for (name, value) in headers.iter() {
            if !HOP_BY_HOP.contains(name) {
                self.response.headers.append(name, value.clone());
            }
        }
        self.response.body = body;
    }

    /// Write a cached or locally produced response verbatim.
    pub fn write_response(&mut self, status: StatusCode, headers: HeaderMap, body: Bytes) {
        self.response.status = status;
        self.response.headers = headers;
        self.response.body = body;
    }

    /// Take the buffered response, leaving a fresh one behind.
    pub fn take_response(&mut self) -> ResponseParts {
        std::mem::take(&mut self.response)
    }

    pub fn response(&self) -> &ResponseParts {
        &self.response
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Overwrite the URL path (rewrite / prefix stripping).
    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Parsed form values from the query string and, for urlencoded
    /// requests, the body.
    pub fn form(&self) -> &HashMap<String, String> {
        &self.form
    }

    pub fn request_head(&self) -> Option<&Parts> {
        self.head.as_ref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub(crate) fn plugin_idx(&self) -> i64 {
        self.plugin_idx
    }
}

fn parse_form(head: &Parts, body: &Bytes) -> HashMap<String, String> {
    let mut form = HashMap::new();
    if let Some(query) = head.uri.query() {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            form.insert(key.into_owned(), value.into_owned());
        }
    }

    let is_urlencoded = head
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if is_urlencoded {
        for (key, value) in form_urlencoded::parse(body) {
            form.insert(key.into_owned(), value.into_owned());
        }
    }

    form
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::{Plugin, PluginStatus};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// What a scripted test plugin does when invoked.
    #[derive(Debug)]
    pub enum Behavior {
        /// Return without calling `next`.
        Passive,
        /// Drive the rest of the chain.
        CallNext,
        /// Abort without writing anything.
        Abort,
        /// Abort with a status code.
        AbortWithStatus(StatusCode),
    }

    #[derive(Debug)]
    pub struct ScriptedPlugin {
        pub name: String,
        pub enabled: AtomicBool,
        pub calls: AtomicUsize,
        pub behavior: Behavior,
    }

    impl ScriptedPlugin {
        pub fn new(name: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                enabled: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
                behavior,
            })
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Plugin for ScriptedPlugin {
        fn handle(&self, ctx: &mut Context) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Passive => {}
                Behavior::CallNext => ctx.next(),
                Behavior::Abort => ctx.abort(),
                Behavior::AbortWithStatus(status) => ctx.abort_with_status(status),
            }
        }

        fn enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn status(&self) -> PluginStatus {
            PluginStatus::Working
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn enable(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    pub fn request_head(method: &str, uri: &str) -> Parts {
        let (parts, _) = http::Request::builder()
            .method(method)
            .uri(uri)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    pub fn context_with(plugins: Vec<PluginRef>, method: &str, uri: &str) -> Context {
        let mut ctx = Context::new(plugins.into());
        ctx.prepare(request_head(method, uri), Bytes::new());
        ctx
    }
}
