//! The tracer collaborator surface.
//!
//! Mirrors the narrow interface the protocol needs from a tracer: build a
//! span, tag it, finish it, and move span contexts through text-map
//! carriers. Anything beyond that is discovered through explicit capability
//! queries (`protocol_ids`, the interceptor on [`TracingContext`]), never by
//! downcasting.

use std::fmt;
use std::sync::Arc;

use tchannel_core::{InboundCall, OutgoingCall, TraceFields};

/// An immutable reference to a span's identity.
pub trait SpanContext: Send + Sync {
    /// Capability probe: the 64-bit trace/span/parent ids the wire format
    /// carries, when this tracer can express them.
    fn protocol_ids(&self) -> Option<TraceFields> {
        None
    }
}

/// A started span.
pub trait Span: Send {
    fn context(&self) -> &dyn SpanContext;
    fn set_tag(&mut self, key: &str, value: &str);
    fn log(&mut self, fields: &[(&str, &str)]);
    fn finish(&mut self);
}

/// Builder handed out by [`Tracer::build_span`].
pub trait SpanBuilder {
    fn child_of(self: Box<Self>, parent: &dyn SpanContext) -> Box<dyn SpanBuilder>;
    fn with_tag(self: Box<Self>, key: &str, value: &str) -> Box<dyn SpanBuilder>;
    fn start(self: Box<Self>) -> Box<dyn Span>;
}

/// The injected tracer collaborator. Shared across tasks; thread safety is
/// the tracer's own contract.
pub trait Tracer: Send + Sync {
    fn build_span(&self, operation: &str) -> Box<dyn SpanBuilder>;

    /// Serialize a span context into a text-map carrier.
    fn inject(
        &self,
        context: &dyn SpanContext,
        carrier: &mut dyn TextMapWriter,
    ) -> Result<(), InjectError>;

    /// Recover a span context from a text-map carrier, if one is present.
    fn extract(&self, carrier: &dyn TextMapReader) -> Option<Box<dyn SpanContext>>;
}

/// Write side of a text-map carrier.
pub trait TextMapWriter {
    fn put(&mut self, key: &str, value: &str);
}

/// Read side of a text-map carrier.
pub trait TextMapReader {
    fn for_each(&self, visit: &mut dyn FnMut(&str, &str));
}

/// The tracer could not serialize a span context. Recoverable: the call
/// proceeds without injected headers.
#[derive(Debug, Clone)]
pub struct InjectError(pub String);

impl fmt::Display for InjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trace injection failed: {}", self.0)
    }
}

impl std::error::Error for InjectError {}

/// A span interceptor refused the request. Not recoverable: the failure
/// propagates to the caller before anything is sent.
#[derive(Debug, Clone)]
pub struct InterceptError(pub String);

impl fmt::Display for InterceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request span interceptor failed: {}", self.0)
    }
}

impl std::error::Error for InterceptError {}

/// Optional capability on a [`TracingContext`], invoked between span
/// creation and return on both directions.
pub trait RequestSpanInterceptor: Send + Sync {
    fn intercept_outbound(
        &self,
        span: &mut dyn Span,
        request: &OutgoingCall,
    ) -> Result<(), InterceptError>;

    fn intercept_inbound(
        &self,
        span: &mut dyn Span,
        request: &InboundCall,
    ) -> Result<(), InterceptError>;
}

/// Per-task holder of the current span, supplied by the host.
#[derive(Default)]
pub struct TracingContext {
    stack: Vec<Box<dyn Span>>,
    interceptor: Option<Arc<dyn RequestSpanInterceptor>>,
}

impl TracingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interceptor(interceptor: Arc<dyn RequestSpanInterceptor>) -> Self {
        Self {
            stack: Vec::new(),
            interceptor: Some(interceptor),
        }
    }

    pub fn current(&self) -> Option<&dyn Span> {
        self.stack.last().map(Box::as_ref)
    }

    pub fn current_mut(&mut self) -> Option<&mut (dyn Span + 'static)> {
        self.stack.last_mut().map(Box::as_mut)
    }

    pub fn push(&mut self, span: Box<dyn Span>) {
        self.stack.push(span);
    }

    pub fn pop(&mut self) -> Option<Box<dyn Span>> {
        self.stack.pop()
    }

    pub fn clear(&mut self) {
        self.stack.clear();
    }

    pub fn interceptor(&self) -> Option<&Arc<dyn RequestSpanInterceptor>> {
        self.interceptor.as_ref()
    }
}

impl fmt::Debug for TracingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingContext")
            .field("depth", &self.stack.len())
            .field("has_interceptor", &self.interceptor.is_some())
            .finish()
    }
}
