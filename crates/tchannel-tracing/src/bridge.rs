//! Span lifecycle around calls.

use tchannel_core::{
    CallError, CallResponse, HEADER_ARG_SCHEME, HEADER_CALLER_NAME, InboundCall, OutgoingCall,
    TraceFields,
};
use tracing::warn;

use crate::carrier::{HeaderCarrier, strip_tracing_headers};
use crate::tracer::{InterceptError, Span, SpanContext, Tracer, TracingContext};

/// Parent context synthesized from the wire-level trace fields when no
/// header-carried context was recovered.
struct WireSpanContext(TraceFields);

impl SpanContext for WireSpanContext {
    fn protocol_ids(&self) -> Option<TraceFields> {
        Some(self.0)
    }
}

/// Open a client-kind span for an outbound call and attach its context to
/// the request, both as wire trace fields and as `$tracing$` headers.
///
/// A missing tracer or context is a no-op. Injection failures are logged
/// and the call proceeds; an interceptor failure finishes the span and
/// propagates, before anything is sent or any id allocated.
pub fn start_outbound(
    request: &mut OutgoingCall,
    tracer: Option<&dyn Tracer>,
    context: Option<&mut TracingContext>,
) -> Result<Option<Box<dyn Span>>, InterceptError> {
    let (Some(tracer), Some(context)) = (tracer, context) else {
        return Ok(None);
    };

    let endpoint = request.endpoint().into_owned();
    let mut builder = tracer.build_span(&endpoint);
    if let Some(parent) = context.current() {
        builder = builder.child_of(parent.context());
    }
    builder = builder
        .with_tag("span.kind", "client")
        .with_tag("peer.service", &request.service);
    if let Some(scheme) = request.headers.get(HEADER_ARG_SCHEME) {
        let scheme = scheme.to_string();
        builder = builder.with_tag("as", &scheme);
    }
    let mut span = builder.start();

    if let Some(ids) = span.context().protocol_ids() {
        request.tracing = ids;
    }
    {
        let mut carrier = HeaderCarrier::new(&mut request.headers);
        if let Err(err) = tracer.inject(span.context(), &mut carrier) {
            warn!(error = %err, "proceeding without tracing headers");
        }
    }

    if let Some(interceptor) = context.interceptor().cloned() {
        if let Err(err) = interceptor.intercept_outbound(span.as_mut(), request) {
            let message = err.to_string();
            span.log(&[("event", "error"), ("message", &message)]);
            span.finish();
            return Err(err);
        }
    }
    Ok(Some(span))
}

/// Close the span opened by [`start_outbound`] with the call's outcome.
pub fn finish_outbound(span: Option<Box<dyn Span>>, outcome: &Result<CallResponse, CallError>) {
    let Some(mut span) = span else { return };
    match outcome {
        Ok(response) if response.is_ok() => {}
        Ok(_) => {
            span.set_tag("error", "true");
            span.log(&[("event", "error"), ("message", "application error response")]);
        }
        Err(err) => {
            span.set_tag("error", "true");
            let message = err.to_string();
            span.log(&[("event", "error"), ("message", &message)]);
        }
    }
    span.finish();
}

/// Open a server-kind span for an inbound call and push it on the context.
///
/// Tracer-owned headers are stripped from the request unconditionally, so
/// the handler never sees a `$tracing$` key even when no tracer is
/// configured. The parent comes from those headers when extraction
/// succeeds, else from the wire trace fields.
pub fn start_inbound(
    request: &mut InboundCall,
    tracer: Option<&dyn Tracer>,
    context: Option<&mut TracingContext>,
) -> Result<(), InterceptError> {
    let header_parent = tracer.and_then(|tracer| {
        let carrier = HeaderCarrier::new(&mut request.headers);
        tracer.extract(&carrier)
    });
    strip_tracing_headers(&mut request.headers);

    let (Some(tracer), Some(context)) = (tracer, context) else {
        return Ok(());
    };
    context.clear();

    let parent = header_parent.or_else(|| {
        (!request.tracing.is_zero())
            .then(|| Box::new(WireSpanContext(request.tracing)) as Box<dyn SpanContext>)
    });

    let endpoint = request.endpoint().into_owned();
    let mut builder = tracer.build_span(&endpoint).with_tag("span.kind", "server");
    if let Some(parent) = &parent {
        builder = builder.child_of(parent.as_ref());
    }
    if let Some(caller) = request.headers.get(HEADER_CALLER_NAME) {
        let caller = caller.to_string();
        builder = builder.with_tag("peer.service", &caller);
    }
    let mut span = builder.start();

    if let Some(interceptor) = context.interceptor().cloned() {
        if let Err(err) = interceptor.intercept_inbound(span.as_mut(), request) {
            let message = err.to_string();
            span.log(&[("event", "error"), ("message", &message)]);
            span.finish();
            return Err(err);
        }
    }
    context.push(span);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::{InjectError, SpanBuilder, TextMapReader, TextMapWriter};
    use std::sync::{Arc, Mutex};

    // A minimal recording tracer with sequential 64-bit ids.

    #[derive(Default)]
    struct State {
        next_id: u64,
        finished: Vec<FinishedSpan>,
    }

    #[derive(Clone, Debug)]
    struct FinishedSpan {
        operation: String,
        tags: Vec<(String, String)>,
        ids: TraceFields,
    }

    #[derive(Clone, Default)]
    struct TestTracer {
        state: Arc<Mutex<State>>,
    }

    impl TestTracer {
        fn finished(&self) -> Vec<FinishedSpan> {
            self.state.lock().unwrap().finished.clone()
        }
    }

    #[derive(Clone, Copy)]
    struct TestContext(TraceFields);

    impl SpanContext for TestContext {
        fn protocol_ids(&self) -> Option<TraceFields> {
            Some(self.0)
        }
    }

    struct TestBuilder {
        tracer: TestTracer,
        operation: String,
        parent: Option<TraceFields>,
        tags: Vec<(String, String)>,
    }

    impl SpanBuilder for TestBuilder {
        fn child_of(mut self: Box<Self>, parent: &dyn SpanContext) -> Box<dyn SpanBuilder> {
            self.parent = parent.protocol_ids();
            self
        }

        fn with_tag(mut self: Box<Self>, key: &str, value: &str) -> Box<dyn SpanBuilder> {
            self.tags.push((key.to_string(), value.to_string()));
            self
        }

        fn start(self: Box<Self>) -> Box<dyn Span> {
            let span_id = {
                let mut state = self.tracer.state.lock().unwrap();
                state.next_id += 1;
                state.next_id
            };
            let ids = match self.parent {
                Some(parent) => TraceFields {
                    span_id,
                    parent_id: parent.span_id,
                    trace_id: parent.trace_id,
                    flags: parent.flags,
                },
                None => TraceFields {
                    span_id,
                    parent_id: 0,
                    trace_id: span_id,
                    flags: 1,
                },
            };
            Box::new(TestSpan {
                tracer: self.tracer,
                operation: self.operation,
                tags: self.tags,
                ids,
                context: TestContext(ids),
            })
        }
    }

    struct TestSpan {
        tracer: TestTracer,
        operation: String,
        tags: Vec<(String, String)>,
        ids: TraceFields,
        context: TestContext,
    }

    impl Span for TestSpan {
        fn context(&self) -> &dyn SpanContext {
            &self.context
        }

        fn set_tag(&mut self, key: &str, value: &str) {
            self.tags.push((key.to_string(), value.to_string()));
        }

        fn log(&mut self, _fields: &[(&str, &str)]) {}

        fn finish(&mut self) {
            self.tracer.state.lock().unwrap().finished.push(FinishedSpan {
                operation: self.operation.clone(),
                tags: self.tags.clone(),
                ids: self.ids,
            });
        }
    }

    impl Tracer for TestTracer {
        fn build_span(&self, operation: &str) -> Box<dyn SpanBuilder> {
            Box::new(TestBuilder {
                tracer: self.clone(),
                operation: operation.to_string(),
                parent: None,
                tags: Vec::new(),
            })
        }

        fn inject(
            &self,
            context: &dyn SpanContext,
            carrier: &mut dyn TextMapWriter,
        ) -> Result<(), InjectError> {
            let ids = context
                .protocol_ids()
                .ok_or_else(|| InjectError("no protocol ids".into()))?;
            carrier.put("traceid", &format!("{:x}", ids.trace_id));
            carrier.put("spanid", &format!("{:x}", ids.span_id));
            Ok(())
        }

        fn extract(&self, carrier: &dyn TextMapReader) -> Option<Box<dyn SpanContext>> {
            let mut trace_id = None;
            let mut span_id = None;
            carrier.for_each(&mut |key, value| match key {
                "traceid" => trace_id = u64::from_str_radix(value, 16).ok(),
                "spanid" => span_id = u64::from_str_radix(value, 16).ok(),
                _ => {}
            });
            Some(Box::new(TestContext(TraceFields {
                span_id: span_id?,
                parent_id: 0,
                trace_id: trace_id?,
                flags: 1,
            })))
        }
    }

    fn outbound_request() -> OutgoingCall {
        let mut call = OutgoingCall::new("downstream", "do-thing");
        call.header("as", "json").unwrap();
        call
    }

    #[test]
    fn absent_tracer_or_context_is_a_noop() {
        let tracer = TestTracer::default();
        let mut ctx = TracingContext::new();
        let mut request = outbound_request();
        assert!(
            start_outbound(&mut request, None, Some(&mut ctx))
                .unwrap()
                .is_none()
        );
        assert!(
            start_outbound(&mut request, Some(&tracer), None)
                .unwrap()
                .is_none()
        );
        assert!(request.tracing.is_zero());
        assert_eq!(request.headers.len(), 1);
    }

    #[test]
    fn outbound_populates_wire_fields_and_headers() {
        let tracer = TestTracer::default();
        let mut ctx = TracingContext::new();
        let mut request = outbound_request();
        let span = start_outbound(&mut request, Some(&tracer), Some(&mut ctx))
            .unwrap()
            .unwrap();

        assert!(!request.tracing.is_zero());
        assert!(request.headers.get("$tracing$traceid").is_some());
        assert!(request.headers.get("$tracing$spanid").is_some());

        finish_outbound(Some(span), &Err(CallError::Timeout));
        let finished = tracer.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].operation, "do-thing");
        let tags = &finished[0].tags;
        assert!(tags.contains(&("span.kind".into(), "client".into())));
        assert!(tags.contains(&("peer.service".into(), "downstream".into())));
        assert!(tags.contains(&("as".into(), "json".into())));
        assert!(tags.contains(&("error".into(), "true".into())));
    }

    fn inbound_from(request: &OutgoingCall) -> InboundCall {
        // Hand-build what the connection would deliver for this request.
        let mut inbound = InboundCall::detached(request.service.clone(), request.arg1.clone());
        inbound.headers = request.headers.clone();
        inbound.ttl = request.ttl;
        inbound.tracing = request.tracing;
        inbound.arg2 = request.arg2.clone();
        inbound.arg3 = request.arg3.clone();
        inbound
    }

    #[test]
    fn inbound_links_trace_and_strips_headers() {
        let tracer = TestTracer::default();
        let mut client_ctx = TracingContext::new();
        let mut request = outbound_request();
        request.header("cn", "upstream").unwrap();
        let span = start_outbound(&mut request, Some(&tracer), Some(&mut client_ctx))
            .unwrap()
            .unwrap();
        let client_trace_id = request.tracing.trace_id;

        let mut inbound = inbound_from(&request);
        let mut server_ctx = TracingContext::new();
        start_inbound(&mut inbound, Some(&tracer), Some(&mut server_ctx)).unwrap();

        // No tracer-owned header survives into the handler's view.
        assert!(inbound.headers.iter().all(|(k, _)| !k.starts_with("$tracing$")));
        assert_eq!(inbound.headers.get("cn"), Some("upstream"));

        let server_span = server_ctx.pop().expect("span pushed on the context");
        let ids = server_span.context().protocol_ids().unwrap();
        assert_eq!(ids.trace_id, client_trace_id);

        finish_outbound(Some(span), &Err(CallError::Cancelled));
    }

    #[test]
    fn inbound_without_tracer_still_isolates_headers() {
        let mut request = outbound_request();
        request
            .headers
            .insert("$tracing$traceid".to_string(), "feed".to_string());
        let mut inbound = inbound_from(&request);
        start_inbound(&mut inbound, None, None).unwrap();
        assert!(inbound.headers.get("$tracing$traceid").is_none());
    }

    #[test]
    fn inbound_falls_back_to_wire_fields() {
        let tracer = TestTracer::default();
        let mut request = outbound_request();
        request.tracing = TraceFields {
            span_id: 11,
            parent_id: 0,
            trace_id: 77,
            flags: 1,
        };
        let mut inbound = inbound_from(&request);
        let mut ctx = TracingContext::new();
        start_inbound(&mut inbound, Some(&tracer), Some(&mut ctx)).unwrap();
        let span = ctx.pop().unwrap();
        assert_eq!(span.context().protocol_ids().unwrap().trace_id, 77);
    }

    struct RefusingInterceptor;

    impl crate::tracer::RequestSpanInterceptor for RefusingInterceptor {
        fn intercept_outbound(
            &self,
            _span: &mut dyn Span,
            _request: &OutgoingCall,
        ) -> Result<(), InterceptError> {
            Err(InterceptError("policy refused".into()))
        }

        fn intercept_inbound(
            &self,
            _span: &mut dyn Span,
            _request: &InboundCall,
        ) -> Result<(), InterceptError> {
            Ok(())
        }
    }

    #[test]
    fn interceptor_failure_finishes_span_and_propagates() {
        let tracer = TestTracer::default();
        let mut ctx = TracingContext::with_interceptor(Arc::new(RefusingInterceptor));
        let mut request = outbound_request();
        let err = match start_outbound(&mut request, Some(&tracer), Some(&mut ctx)) {
            Err(e) => e,
            Ok(_) => panic!("expected start_outbound to return an error"),
        };
        assert!(err.to_string().contains("policy refused"));
        // The span was finished on the way out.
        assert_eq!(tracer.finished().len(), 1);
    }
}
