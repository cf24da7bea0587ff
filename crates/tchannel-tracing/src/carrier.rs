//! Text-map carrier over call transport headers.
//!
//! Every key a tracer writes is stored under the reserved `$tracing$`
//! prefix so user headers and tracer state share one map without
//! colliding; reads see only the prefixed entries, with the prefix
//! stripped back off.

use tchannel_core::{Headers, TRACING_KEY_PREFIX};

use crate::tracer::{TextMapReader, TextMapWriter};

/// Carrier over a call's transport headers.
pub struct HeaderCarrier<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderCarrier<'a> {
    pub fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }

    /// The non-tracing subset visible to user code.
    pub fn user_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter(|(key, _)| !key.starts_with(TRACING_KEY_PREFIX))
    }
}

impl TextMapWriter for HeaderCarrier<'_> {
    fn put(&mut self, key: &str, value: &str) {
        self.headers
            .insert(format!("{TRACING_KEY_PREFIX}{key}"), value);
    }
}

impl TextMapReader for HeaderCarrier<'_> {
    fn for_each(&self, visit: &mut dyn FnMut(&str, &str)) {
        for (key, value) in self.headers.iter() {
            if let Some(stripped) = key.strip_prefix(TRACING_KEY_PREFIX) {
                visit(stripped, value);
            }
        }
    }
}

/// Remove every tracer-owned header. Returns how many were stripped.
pub fn strip_tracing_headers(headers: &mut Headers) -> usize {
    let before = headers.len();
    headers.retain(|key, _| !key.starts_with(TRACING_KEY_PREFIX));
    before - headers.len()
}
