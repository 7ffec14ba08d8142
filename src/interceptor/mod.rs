// Request interceptor: the per-call span lifecycle shared by every installation
// surface (middleware stacks, legacy client methods, driver commands and the
// smithy orchestrator).

pub mod bind;
pub mod driver;
pub mod legacy;
#[cfg(feature = "smithy")]
pub mod smithy;
pub mod stack;
pub(crate) mod utils;

use std::{
    error::Error,
    fmt,
    future::Future,
    mem,
    pin::Pin,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    task::{self, Poll},
    time::SystemTime,
};

use futures::{
    Stream,
    future::{BoxFuture, FutureExt},
    ready,
    stream::StreamExt,
};
use opentelemetry::{
    Context, KeyValue,
    global::BoxedTracer,
    metrics::Meter,
    trace::{SpanBuilder, SpanKind, SpanRef, Status, TraceContextExt, Tracer},
};
use opentelemetry_semantic_conventions::attribute as semco;
use serde_json::Value;

pub use bind::BoundFuture;

use crate::{
    config::{InstrumentationConfig, RequestHookInformation, ResponseHookInformation},
    error::{BoxError, ErrorMetadata, ServiceError},
    extensions::ExtensionRegistry,
    model::{
        EventStream, NormalizedRequest, NormalizedResponse, OperationInput, ResponseMetadata,
        SdkResponse,
    },
    semconv,
};
use utils::safe_execute;

pub const RPC_SYSTEM_AWS_API: &str = "aws-api";

// Deferred region resolution; awaited after span start, before the wrapped call.
pub type RegionFuture = BoxFuture<'static, Result<String, BoxError>>;

/// What a wrapped AWS entry point hands back to its caller.
pub type CallFuture = BoundFuture<BoxFuture<'static, Result<SdkResponse, ServiceError>>>;

/// Context key: everything polled under it bypasses instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuppressInstrumentation;

pub fn is_instrumentation_suppressed(context: &Context) -> bool {
    context.get::<SuppressInstrumentation>().is_some()
}

/// An intercepted call, normalized, plus installation-specific span attributes.
#[derive(Debug, Clone)]
pub struct InterceptedCall {
    pub request: NormalizedRequest,
    pub module_version: Option<String>,
    pub attributes: Vec<KeyValue>,
}

impl InterceptedCall {
    pub fn new(request: NormalizedRequest) -> Self {
        Self {
            request,
            module_version: None,
            attributes: Vec::new(),
        }
    }

    pub fn with_module_version(mut self, module_version: Option<String>) -> Self {
        self.module_version = module_version;
        self
    }

    pub fn with_attributes(mut self, attributes: Vec<KeyValue>) -> Self {
        self.attributes = attributes;
        self
    }
}

pub struct RequestInterceptor {
    config: Arc<InstrumentationConfig>,
    registry: Arc<ExtensionRegistry>,
    tracer: Arc<BoxedTracer>,
    meter: Meter,
    // `None` for database drivers, which carry no RPC attributes.
    rpc_system: Option<&'static str>,
    enabled: Arc<AtomicBool>,
    metric_instruments: Once,
}

impl fmt::Debug for RequestInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestInterceptor")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("rpc_system", &self.rpc_system)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl RequestInterceptor {
    pub fn new(
        config: Arc<InstrumentationConfig>,
        registry: Arc<ExtensionRegistry>,
        tracer: Arc<BoxedTracer>,
        meter: Meter,
    ) -> Self {
        Self {
            config,
            registry,
            tracer,
            meter,
            rpc_system: Some(RPC_SYSTEM_AWS_API),
            enabled: Arc::new(AtomicBool::new(true)),
            metric_instruments: Once::new(),
        }
    }

    pub fn with_rpc_system(self, rpc_system: Option<&'static str>) -> Self {
        Self { rpc_system, ..self }
    }

    /// Shares an on/off switch with the entry point.
    pub fn with_enabled_flag(self, enabled: Arc<AtomicBool>) -> Self {
        Self { enabled, ..self }
    }

    pub fn config(&self) -> &InstrumentationConfig {
        &self.config
    }

    pub fn tracer(&self) -> &BoxedTracer {
        &self.tracer
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Whether a call made under the current context gets a span.
    pub fn should_intercept(&self) -> bool {
        self.is_enabled() && !is_instrumentation_suppressed(&Context::current())
    }

    /// Phases 1 and 2: runs the pre-span hook and starts the call's span as a
    /// child of the current context.
    pub fn start(self: &Arc<Self>, call: InterceptedCall) -> ActiveCall {
        self.metric_instruments
            .call_once(|| self.registry.update_metric_instruments(&self.meter));

        let InterceptedCall {
            request,
            module_version,
            attributes,
        } = call;
        let metadata = self.registry.pre_span_hook(&request, &self.config);

        let mut span_attributes = Vec::with_capacity(attributes.len() + metadata.span_attributes.len() + 4);
        if let Some(rpc_system) = self.rpc_system {
            span_attributes.push(KeyValue::new(semco::RPC_SYSTEM, rpc_system));
            span_attributes.push(KeyValue::new(semco::RPC_SERVICE, request.resource_name.clone()));
            span_attributes.push(KeyValue::new(semco::RPC_METHOD, request.operation_name.clone()));
            if let Some(region) = &request.region {
                span_attributes.push(KeyValue::new(semco::CLOUD_REGION, region.clone()));
            }
        }
        span_attributes.extend(attributes);
        span_attributes.extend(metadata.span_attributes);

        let name = metadata.span_name.unwrap_or_else(|| {
            format!("{}.{}", request.resource_name, request.operation_name)
        });
        let start_time = opentelemetry::time::now();
        let parent = Context::current();
        let span = self.tracer.build_with_context(
            SpanBuilder::from_name(name)
                .with_start_time(start_time)
                .with_kind(metadata.span_kind.unwrap_or(SpanKind::Client))
                .with_attributes(span_attributes),
            &parent,
        );
        let context = parent.with_span(span);

        ActiveCall {
            interceptor: Arc::clone(self),
            request,
            span_end: SpanEnd(Some(context.clone())),
            context,
            start_time,
            is_incoming: metadata.is_incoming,
            is_stream: metadata.is_stream,
            module_version,
            pending: ResponseMetadata::default(),
        }
    }

    /// Drives the whole pipeline around `invoke`, the original entry point.
    ///
    /// Incoming calls come back bound to their span for `rebind_depth`
    /// continuations; everything else is returned unbound.
    pub fn intercept<E, F, Fut>(
        self: &Arc<Self>,
        call: InterceptedCall,
        region: Option<RegionFuture>,
        invoke: F,
    ) -> BoundFuture<BoxFuture<'static, Result<SdkResponse, E>>>
    where
        E: Error + ErrorMetadata + Send + Sync + 'static,
        F: FnOnce(OperationInput) -> Fut + Send + 'static,
        Fut: Future<Output = Result<SdkResponse, E>> + Send + 'static,
    {
        if !self.should_intercept() {
            return BoundFuture::unbound(invoke(call.request.operation_input).boxed());
        }

        let mut active = self.start(call);
        let rebind = active
            .is_incoming
            .then(|| (active.context.clone(), self.config.rebind_depth));

        let pipeline = async move {
            if let Some(region) = region {
                match region.await {
                    Ok(region) => active.set_region(region),
                    Err(err) => {
                        log::debug!("aws-sdk instrumentation: failed to get region from client config: {err}")
                    }
                }
            }
            active.run_pre_request_hook();
            let input = active.prepare();
            let invoke_context = active.invoke_context();
            let original = {
                let _guard = invoke_context.clone().attach();
                invoke(input)
            };
            let result = BoundFuture::new(original, invoke_context, 0).await;
            active.settle(result)
        }
        .boxed();

        match rebind {
            Some((context, depth)) => BoundFuture::new(pipeline, context, depth),
            None => BoundFuture::unbound(pipeline),
        }
    }

    fn record_response_metadata(&self, span: &SpanRef<'_>, metadata: &ResponseMetadata) {
        if let Some(request_id) = &metadata.request_id {
            span.set_attribute(KeyValue::new(semconv::AWS_REQUEST_ID, request_id.clone()));
        }
        if let Some(extended_id) = &metadata.extended_request_id {
            span.set_attribute(KeyValue::new(semconv::AWS_REQUEST_EXTENDED_ID, extended_id.clone()));
        }
        if let Some(status) = metadata.http_status_code {
            if self.config.http_semconv.emit_old() {
                span.set_attribute(KeyValue::new(semconv::HTTP_STATUS_CODE, i64::from(status)));
            }
            if self.config.http_semconv.emit_stable() {
                span.set_attribute(KeyValue::new(
                    semco::HTTP_RESPONSE_STATUS_CODE,
                    i64::from(status),
                ));
            }
        }
    }
}

/// One in-flight call between span start and settle.
///
/// Dropping it without settling still ends the span.
pub struct ActiveCall {
    interceptor: Arc<RequestInterceptor>,
    request: NormalizedRequest,
    context: Context,
    span_end: SpanEnd,
    start_time: SystemTime,
    is_incoming: bool,
    is_stream: bool,
    module_version: Option<String>,
    pending: ResponseMetadata,
}

impl fmt::Debug for ActiveCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveCall")
            .field("request", &self.request)
            .field("span", &self.context.span().span_context())
            .field("is_incoming", &self.is_incoming)
            .field("is_stream", &self.is_stream)
            .finish_non_exhaustive()
    }
}

impl ActiveCall {
    /// Context carrying the call's span.
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn request(&self) -> &NormalizedRequest {
        &self.request
    }

    pub fn is_incoming(&self) -> bool {
        self.is_incoming
    }

    pub fn set_region(&mut self, region: String) {
        if self.interceptor.rpc_system.is_some() {
            self.context
                .span()
                .set_attribute(KeyValue::new(semco::CLOUD_REGION, region.clone()));
        }
        self.request.region = Some(region);
    }

    pub fn run_pre_request_hook(&self) {
        let Some(hook) = &self.interceptor.config.pre_request_hook else {
            return;
        };
        let span = self.context.span();
        let info = RequestHookInformation {
            module_version: self.module_version.as_deref(),
            request: &self.request,
        };
        safe_execute("preRequestHook", || hook(&span, &info));
    }

    /// Phase 3: runs the post-span hook under the span and returns the input to send.
    pub fn prepare(&mut self) -> OperationInput {
        let _guard = self.context.clone().attach();
        self.interceptor.registry.post_span_hook(&mut self.request);
        self.request.operation_input.clone()
    }

    /// Context to invoke the original entry point under.
    pub fn invoke_context(&self) -> Context {
        if self.interceptor.config.suppress_internal_instrumentation {
            self.context.with_value(SuppressInstrumentation)
        } else {
            self.context.clone()
        }
    }

    /// Correlation data observed before the outcome is known; the outcome's own wins.
    pub fn record_pending_metadata(&mut self, metadata: ResponseMetadata) {
        self.pending = merge_metadata(metadata, mem::take(&mut self.pending));
    }

    /// Phase 4: enriches the span from the outcome and returns it unchanged.
    pub fn settle<E>(mut self, result: Result<SdkResponse, E>) -> Result<SdkResponse, E>
    where
        E: Error + ErrorMetadata + 'static,
    {
        match result {
            Ok(mut response) => {
                self.on_success(&mut response);
                Ok(response)
            }
            Err(err) => {
                self.on_failure(&err);
                Err(err)
            }
        }
    }

    fn on_success(&mut self, response: &mut SdkResponse) {
        let interceptor = Arc::clone(&self.interceptor);
        let metadata = merge_metadata(response.metadata.clone(), mem::take(&mut self.pending));
        interceptor.record_response_metadata(&self.context.span(), &metadata);

        let mut normalized = NormalizedResponse {
            data: mem::take(&mut response.output),
            stream: response.stream.take(),
            request: Arc::new(mem::take(&mut self.request)),
            request_id: metadata.request_id,
        };
        interceptor.registry.response_hook(
            &mut normalized,
            &self.context,
            &interceptor.tracer,
            &interceptor.config,
            self.start_time,
        );

        if self.is_stream {
            if let Some(stream) = normalized.stream.take() {
                normalized.stream = Some(
                    SpanClosingStream {
                        inner: stream,
                        span_end: self.span_end.hand_off(),
                    }
                    .boxed(),
                );
            }
        }

        if let Some(hook) = &interceptor.config.response_hook {
            let span = self.context.span();
            let info = ResponseHookInformation {
                response: &normalized,
            };
            safe_execute("responseHook", || hook(&span, &info));
        }

        response.output = normalized.data;
        response.stream = normalized.stream;
    }

    fn on_failure<E>(&mut self, err: &E)
    where
        E: Error + ErrorMetadata + 'static,
    {
        let interceptor = Arc::clone(&self.interceptor);
        let metadata = merge_metadata(
            ResponseMetadata {
                request_id: err.request_id().map(str::to_owned),
                extended_request_id: err.extended_request_id().map(str::to_owned),
                http_status_code: err.http_status_code(),
            },
            mem::take(&mut self.pending),
        );
        let span = self.context.span();
        interceptor.record_response_metadata(&span, &metadata);
        span.set_status(Status::error(err.to_string()));
        span.record_error(err);

        if let Some(hook) = &interceptor.config.exception_hook {
            let info = RequestHookInformation {
                module_version: self.module_version.as_deref(),
                request: &self.request,
            };
            let err: &(dyn Error + 'static) = err;
            safe_execute("exceptionHook", || hook(&span, &info, err));
        }
    }
}

fn merge_metadata(preferred: ResponseMetadata, fallback: ResponseMetadata) -> ResponseMetadata {
    ResponseMetadata {
        request_id: preferred.request_id.or(fallback.request_id),
        extended_request_id: preferred
            .extended_request_id
            .or(fallback.extended_request_id),
        http_status_code: preferred.http_status_code.or(fallback.http_status_code),
    }
}

// Ends the span it holds exactly once: explicitly, or when dropped.
struct SpanEnd(Option<Context>);

impl SpanEnd {
    fn hand_off(&mut self) -> SpanEnd {
        SpanEnd(self.0.take())
    }

    fn end(&mut self) {
        if let Some(context) = self.0.take() {
            context.span().end();
        }
    }
}

impl Drop for SpanEnd {
    fn drop(&mut self) {
        self.end();
    }
}

// Keeps a streaming call's span open until the stream is drained or dropped.
struct SpanClosingStream {
    inner: EventStream,
    span_end: SpanEnd,
}

impl Stream for SpanClosingStream {
    type Item = Result<Value, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = ready!(this.inner.poll_next_unpin(cx));
        if item.is_none() {
            this.span_end.end();
        }
        Poll::Ready(item)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::{StreamExt, stream};
    use opentelemetry::{
        global,
        trace::{Span as _, Status, Tracer as _},
    };
    use serde_json::json;

    use super::*;
    use crate::{
        config::SemconvStability,
        extensions::ResourceExtension,
        model::{RequestMetadata, normalize_request},
        test_support::{Harness, attribute, input, string_attribute},
    };

    struct Custom(RequestMetadata);

    impl ResourceExtension for Custom {
        fn pre_span_hook(&self, _: &NormalizedRequest, _: &InstrumentationConfig) -> RequestMetadata {
            self.0.clone()
        }
    }

    fn interceptor_with(
        harness: &Harness,
        config: InstrumentationConfig,
        metadata: RequestMetadata,
    ) -> Arc<RequestInterceptor> {
        let mut registry = ExtensionRegistry::new();
        registry.register("Custom", Custom(metadata));
        Arc::new(RequestInterceptor::new(
            Arc::new(config),
            Arc::new(registry),
            Arc::new(harness.tracer()),
            global::meter("test"),
        ))
    }

    fn call(operation: &str) -> InterceptedCall {
        InterceptedCall::new(normalize_request(
            "Custom",
            &format!("{operation}Command"),
            input(json!({"Key": "value"})),
            Some("us-east-1".to_owned()),
        ))
    }

    fn old_http() -> InstrumentationConfig {
        InstrumentationConfig::default().with_http_semconv(SemconvStability::OLD)
    }

    #[tokio::test]
    async fn success_is_transparent_and_ends_span_once() {
        let harness = Harness::new();
        let interceptor = interceptor_with(&harness, old_http(), RequestMetadata::default());

        let response = interceptor
            .intercept(call("Get"), None, |input| async move {
                Ok::<_, ServiceError>(
                    SdkResponse::new(json!({ "echo": input["Key"] }))
                        .with_request_id("req-1")
                        .with_extended_request_id("ext-1")
                        .with_http_status_code(200),
                )
            })
            .await
            .unwrap();
        assert_eq!(response.output, json!({"echo": "value"}));

        let spans = harness.spans();
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, "Custom.Get");
        assert_eq!(span.span_kind, SpanKind::Client);
        assert_eq!(string_attribute(span, semco::RPC_SYSTEM).as_deref(), Some("aws-api"));
        assert_eq!(string_attribute(span, semco::RPC_SERVICE).as_deref(), Some("Custom"));
        assert_eq!(string_attribute(span, semco::RPC_METHOD).as_deref(), Some("Get"));
        assert_eq!(string_attribute(span, semco::CLOUD_REGION).as_deref(), Some("us-east-1"));
        assert_eq!(string_attribute(span, semconv::AWS_REQUEST_ID).as_deref(), Some("req-1"));
        assert_eq!(
            string_attribute(span, semconv::AWS_REQUEST_EXTENDED_ID).as_deref(),
            Some("ext-1")
        );
        assert_eq!(attribute(span, semconv::HTTP_STATUS_CODE), Some(200_i64.into()));
        assert_eq!(attribute(span, semco::HTTP_RESPONSE_STATUS_CODE), None);
        assert_eq!(span.status, Status::Unset);
    }

    #[tokio::test]
    async fn failure_is_recorded_and_returned_unchanged() {
        let harness = Harness::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        let config = InstrumentationConfig::default()
            .with_http_semconv(SemconvStability::DUPLICATE)
            .with_exception_hook(move |_, info, err| {
                recorded
                    .lock()
                    .unwrap()
                    .push(format!("{}:{err}", info.request.operation_name));
                Ok(())
            });
        let interceptor = interceptor_with(&harness, config, RequestMetadata::default());

        let error = ServiceError::new("Throttled", "slow down")
            .with_request_id("req-2")
            .with_http_status_code(400);
        let expected = error.clone();
        let result = interceptor
            .intercept(call("Put"), None, move |_| async move { Err(error) })
            .await;
        assert_eq!(result.unwrap_err(), expected);

        let span = harness.span("Custom.Put");
        assert_eq!(span.status, Status::error("slow down"));
        assert!(span.events.events.iter().any(|event| event.name == "exception"));
        assert_eq!(string_attribute(&span, semconv::AWS_REQUEST_ID).as_deref(), Some("req-2"));
        assert_eq!(attribute(&span, semconv::HTTP_STATUS_CODE), Some(400_i64.into()));
        assert_eq!(attribute(&span, semco::HTTP_RESPONSE_STATUS_CODE), Some(400_i64.into()));
        assert_eq!(*seen.lock().unwrap(), vec!["Put:slow down".to_owned()]);
    }

    #[tokio::test]
    async fn hook_failures_never_reach_the_caller() {
        let harness = Harness::new();
        let config = old_http()
            .with_pre_request_hook(|_, _| panic!("broken hook"))
            .with_response_hook(|_, _| Err("broken hook".into()));
        let interceptor = interceptor_with(&harness, config, RequestMetadata::default());

        let response = interceptor
            .intercept(call("Get"), None, |_| async {
                Ok::<_, ServiceError>(SdkResponse::new(json!({"ok": true})))
            })
            .await
            .unwrap();
        assert_eq!(response.output, json!({"ok": true}));
        assert_eq!(harness.spans().len(), 1);
    }

    #[tokio::test]
    async fn deferred_region_is_set_after_span_start() {
        let harness = Harness::new();
        let interceptor = interceptor_with(&harness, old_http(), RequestMetadata::default());
        let mut resolved = call("Get");
        resolved.request.region = None;
        let mut failing = resolved.clone();
        failing.request.operation_name = "List".to_owned();

        interceptor
            .intercept(resolved, Some(async { Ok("eu-west-3".to_owned()) }.boxed()), |_| async {
                Ok::<_, ServiceError>(SdkResponse::new(Value::Null))
            })
            .await
            .unwrap();
        interceptor
            .intercept(failing, Some(async { Err("no region".into()) }.boxed()), |_| async {
                Ok::<_, ServiceError>(SdkResponse::new(Value::Null))
            })
            .await
            .unwrap();

        let span = harness.span("Custom.Get");
        assert_eq!(string_attribute(&span, semco::CLOUD_REGION).as_deref(), Some("eu-west-3"));
        let span = harness.span("Custom.List");
        assert_eq!(attribute(&span, semco::CLOUD_REGION), None);
    }

    #[tokio::test]
    async fn pre_request_hook_sees_the_region() {
        let harness = Harness::new();
        let seen = Arc::new(Mutex::new(None));
        let recorded = Arc::clone(&seen);
        let config = old_http().with_pre_request_hook(move |span, info| {
            span.set_attribute(KeyValue::new("hooked", true));
            *recorded.lock().unwrap() = info.request.region.clone();
            Ok(())
        });
        let interceptor = interceptor_with(&harness, config, RequestMetadata::default());
        let mut call = call("Get");
        call.request.region = None;
        interceptor
            .intercept(call, Some(async { Ok("ap-south-1".to_owned()) }.boxed()), |_| async {
                Ok::<_, ServiceError>(SdkResponse::new(Value::Null))
            })
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().as_deref(), Some("ap-south-1"));
        assert_eq!(attribute(&harness.span("Custom.Get"), "hooked"), Some(true.into()));
    }

    #[tokio::test]
    async fn wrapped_call_runs_under_the_span() {
        let harness = Harness::new();
        let interceptor = interceptor_with(&harness, old_http(), RequestMetadata::default());
        let tracer = harness.tracer();

        interceptor
            .intercept(call("Get"), None, move |_| {
                let mut nested = tracer.start("http");
                nested.end();
                async { Ok::<_, ServiceError>(SdkResponse::new(Value::Null)) }
            })
            .await
            .unwrap();

        let parent = harness.span("Custom.Get");
        let nested = harness.span("http");
        assert_eq!(nested.parent_span_id, parent.span_context.span_id());
    }

    #[tokio::test]
    async fn suppression_hides_nested_instrumented_calls() {
        let harness = Harness::new();
        let config = old_http().with_suppress_internal_instrumentation(true);
        let interceptor = interceptor_with(&harness, config, RequestMetadata::default());
        let nested = Arc::clone(&interceptor);

        interceptor
            .intercept(call("Get"), None, move |_| {
                assert!(is_instrumentation_suppressed(&Context::current()));
                nested.intercept(call("Inner"), None, |_| async {
                    Ok::<_, ServiceError>(SdkResponse::new(Value::Null))
                })
            })
            .await
            .unwrap();

        let spans = harness.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "Custom.Get");
    }

    #[tokio::test]
    async fn disabled_interceptor_passes_through() {
        let harness = Harness::new();
        let enabled = Arc::new(AtomicBool::new(false));
        let interceptor = Arc::new(
            RequestInterceptor::new(
                Arc::new(old_http()),
                Arc::new(ExtensionRegistry::new()),
                Arc::new(harness.tracer()),
                global::meter("test"),
            )
            .with_enabled_flag(Arc::clone(&enabled)),
        );

        let response = interceptor
            .intercept(call("Get"), None, |input| async move {
                Ok::<_, ServiceError>(SdkResponse::new(Value::Object(input)))
            })
            .await
            .unwrap();
        assert_eq!(response.output, json!({"Key": "value"}));
        assert!(harness.spans().is_empty());

        enabled.store(true, Ordering::Relaxed);
        assert!(interceptor.should_intercept());
    }

    #[tokio::test]
    async fn incoming_call_rebinds_continuations() {
        let harness = Harness::new();
        let metadata = RequestMetadata {
            is_incoming: true,
            span_kind: Some(SpanKind::Consumer),
            ..Default::default()
        };
        let interceptor = interceptor_with(&harness, old_http(), metadata);
        let tracer = Arc::new(harness.tracer());
        let (first, second) = (Arc::clone(&tracer), Arc::clone(&tracer));

        interceptor
            .intercept(call("Receive"), None, |_| async {
                Ok::<_, ServiceError>(SdkResponse::new(Value::Null))
            })
            .map(move |_| first.start("first").end())
            .map(move |_| second.start("second").end())
            .map(move |_| tracer.start("third").end())
            .await;

        let receive = harness.span("Custom.Receive").span_context.span_id();
        assert_eq!(harness.span("first").parent_span_id, receive);
        assert_eq!(harness.span("second").parent_span_id, receive);
        assert_ne!(harness.span("third").parent_span_id, receive);
    }

    #[tokio::test]
    async fn outgoing_call_is_not_rebound() {
        let harness = Harness::new();
        let interceptor = interceptor_with(&harness, old_http(), RequestMetadata::default());
        let tracer = harness.tracer();

        interceptor
            .intercept(call("Get"), None, |_| async {
                Ok::<_, ServiceError>(SdkResponse::new(Value::Null))
            })
            .map(move |_| tracer.start("after").end())
            .await;

        let get = harness.span("Custom.Get").span_context.span_id();
        assert_ne!(harness.span("after").parent_span_id, get);
    }

    fn streaming() -> RequestMetadata {
        RequestMetadata {
            is_stream: true,
            ..Default::default()
        }
    }

    fn chunks() -> EventStream {
        stream::iter([Ok(json!(1)), Ok(json!(2)), Ok(json!(3))]).boxed()
    }

    #[tokio::test]
    async fn stream_span_ends_after_drain() {
        let harness = Harness::new();
        let interceptor = interceptor_with(&harness, old_http(), streaming());

        let response = interceptor
            .intercept(call("Stream"), None, |_| async {
                Ok::<_, ServiceError>(SdkResponse::new(Value::Null).with_stream(chunks()))
            })
            .await
            .unwrap();
        assert!(harness.spans().is_empty());

        let mut stream = response.stream.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), json!(1));
        assert!(harness.spans().is_empty());
        assert_eq!(stream.next().await.unwrap().unwrap(), json!(2));
        assert_eq!(stream.next().await.unwrap().unwrap(), json!(3));
        assert!(harness.spans().is_empty());
        assert!(stream.next().await.is_none());
        assert_eq!(harness.spans().len(), 1);
        assert!(stream.next().await.is_none());
        drop(stream);
        assert_eq!(harness.spans().len(), 1);
    }

    #[tokio::test]
    async fn stream_span_ends_on_early_drop() {
        let harness = Harness::new();
        let interceptor = interceptor_with(&harness, old_http(), streaming());

        let response = interceptor
            .intercept(call("Stream"), None, |_| async {
                Ok::<_, ServiceError>(SdkResponse::new(Value::Null).with_stream(chunks()))
            })
            .await
            .unwrap();
        let mut stream = response.stream.unwrap();
        stream.next().await;
        assert!(harness.spans().is_empty());
        drop(stream);
        assert_eq!(harness.spans().len(), 1);
    }

    #[tokio::test]
    async fn failed_stream_call_still_ends_its_span() {
        let harness = Harness::new();
        let interceptor = interceptor_with(&harness, old_http(), streaming());

        let result = interceptor
            .intercept(call("Stream"), None, |_| async {
                Err::<SdkResponse, _>(ServiceError::new("Validation", "bad model"))
            })
            .await;
        assert!(result.is_err());
        let spans = harness.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, Status::error("bad model"));
    }
}
