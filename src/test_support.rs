// Shared test fixtures: span capture, attribute lookups and an interceptor
// wired to an in-memory exporter.

use std::sync::{
    Arc, Once,
    atomic::{AtomicUsize, Ordering},
};

use futures::{FutureExt, channel::oneshot, future};

use opentelemetry::{
    Value, global,
    global::BoxedTracer,
    metrics::{Meter, MeterProvider as _},
    trace::{SpanId, TracerProvider as _},
};
use opentelemetry_sdk::{
    metrics::{
        InMemoryMetricExporter, SdkMeterProvider,
        data::{AggregatedMetrics, MetricData},
    },
    propagation::TraceContextPropagator,
    trace::{InMemorySpanExporter, SdkTracerProvider, SpanData},
};
use serde_json::Map;

use crate::{
    config::InstrumentationConfig,
    error::ServiceError,
    extensions::ExtensionRegistry,
    interceptor::{
        BoundFuture, RequestInterceptor,
        driver::{CommandFn, ConnectionInfo, ConnectionModule, Document, DriverError, Namespace},
        legacy::{LegacyCallback, LegacyPromiseFn, LegacyRequest, LegacySdkModule, LegacySendFn},
        stack::{
            ClientConfig, ClientSendFn, Command, Handler, HandlerExecutionContext,
            MiddlewareStack, MiddlewareStackModule,
        },
    },
    model::{OperationInput, SdkResponse},
    semconv::{METRIC_DB_CLIENT_CONNECTIONS_USAGE, POOL_NAME, STATE},
};

pub(crate) fn install_propagator() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| global::set_text_map_propagator(TraceContextPropagator::new()));
}

pub(crate) struct Harness {
    pub exporter: InMemorySpanExporter,
    pub provider: SdkTracerProvider,
}

impl Harness {
    pub fn new() -> Self {
        install_propagator();
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        Self { exporter, provider }
    }

    pub fn tracer(&self) -> BoxedTracer {
        BoxedTracer::new(Box::new(self.provider.tracer("test")))
    }

    pub fn interceptor(&self, config: InstrumentationConfig) -> Arc<RequestInterceptor> {
        Arc::new(RequestInterceptor::new(
            Arc::new(config),
            Arc::new(ExtensionRegistry::with_default_extensions()),
            Arc::new(self.tracer()),
            global::meter("test"),
        ))
    }

    /// Interceptor for database drivers: no RPC attributes.
    pub fn driver_interceptor(&self, config: InstrumentationConfig) -> Arc<RequestInterceptor> {
        self.driver_interceptor_with_meter(config, global::meter("test"))
    }

    pub fn driver_interceptor_with_meter(
        &self,
        config: InstrumentationConfig,
        meter: Meter,
    ) -> Arc<RequestInterceptor> {
        Arc::new(
            RequestInterceptor::new(
                Arc::new(config),
                Arc::new(ExtensionRegistry::with_default_extensions()),
                Arc::new(self.tracer()),
                meter,
            )
            .with_rpc_system(None),
        )
    }

    pub fn spans(&self) -> Vec<SpanData> {
        self.exporter.get_finished_spans().unwrap()
    }

    pub fn span(&self, name: &str) -> SpanData {
        self.spans()
            .into_iter()
            .find(|span| span.name == name)
            .unwrap_or_else(|| panic!("no finished span named {name:?}"))
    }

    /// Runs `f` under a parent span that ends when `f` returns; returns the parent span id.
    pub fn in_parent<T>(&self, f: impl FnOnce() -> T) -> (T, SpanId) {
        use opentelemetry::trace::{TraceContextExt, Tracer};

        let tracer = self.provider.tracer("parent");
        tracer.in_span("parent", |cx| {
            let id = cx.span().span_context().span_id();
            (f(), id)
        })
    }
}

/// Metrics captured in memory; read after a flush.
pub(crate) struct MetricHarness {
    pub exporter: InMemoryMetricExporter,
    pub provider: SdkMeterProvider,
}

impl MetricHarness {
    pub fn new() -> Self {
        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder()
            .with_periodic_exporter(exporter.clone())
            .build();
        Self { exporter, provider }
    }

    pub fn meter(&self) -> Meter {
        self.provider.meter("test")
    }

    /// Current `db.client.connections.usage` value for one state and pool.
    pub fn connections_usage(&self, state: &str, pool_name: &str) -> Option<i64> {
        self.provider.force_flush().unwrap();
        let exported = self.exporter.get_finished_metrics().unwrap();
        let latest = exported.last()?;
        latest
            .scope_metrics()
            .flat_map(|scope| scope.metrics())
            .filter(|metric| metric.name() == METRIC_DB_CLIENT_CONNECTIONS_USAGE)
            .find_map(|metric| match metric.data() {
                AggregatedMetrics::I64(MetricData::Sum(sum)) => sum
                    .data_points()
                    .find(|point| {
                        let attributes: Vec<_> = point.attributes().collect();
                        attributes
                            .iter()
                            .any(|kv| kv.key.as_str() == STATE && kv.value.as_str() == state)
                            && attributes.iter().any(|kv| {
                                kv.key.as_str() == POOL_NAME && kv.value.as_str() == pool_name
                            })
                    })
                    .map(|point| point.value()),
                _ => None,
            })
    }
}

pub(crate) fn attribute(span: &SpanData, key: &str) -> Option<Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}

pub(crate) fn string_attribute(span: &SpanData, key: &str) -> Option<String> {
    attribute(span, key).map(|value| value.as_str().into_owned())
}

pub(crate) fn input(value: serde_json::Value) -> OperationInput {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Innermost handler of a fake client: answers every command synchronously.
pub(crate) fn terminal<R>(respond: R) -> Handler
where
    R: Fn(&Command) -> Result<SdkResponse, ServiceError> + Send + Sync + 'static,
{
    Arc::new(move |command: Command| BoundFuture::unbound(future::ready(respond(&command)).boxed()))
}

/// A middleware stack with no steps of its own; counts `resolve` calls.
#[derive(Clone)]
pub(crate) struct FakeStack {
    resolves: Arc<AtomicUsize>,
}

impl FakeStack {
    pub fn new(resolves: Arc<AtomicUsize>) -> Self {
        Self { resolves }
    }
}

impl MiddlewareStack for FakeStack {
    fn resolve(&self, handler: Handler, _context: HandlerExecutionContext) -> Handler {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        handler
    }

    fn clone_stack(&self) -> Box<dyn MiddlewareStack> {
        Box::new(self.clone())
    }

    fn concat(&self, _other: &dyn MiddlewareStack) -> Box<dyn MiddlewareStack> {
        Box::new(self.clone())
    }
}

/// A client `send` that builds a fresh stack per command, the way generated clients do.
pub(crate) fn fake_client(
    stacks: &MiddlewareStackModule,
    client_name: &str,
    handler: Handler,
) -> Arc<ClientSendFn> {
    let construct = stacks.construct_stack.get();
    let client_name = client_name.to_owned();
    Arc::new(move |_config: &ClientConfig, command: Command| {
        let context = HandlerExecutionContext {
            client_name: Some(client_name.clone()),
            command_name: Some(command.name.clone()),
        };
        construct().resolve(Arc::clone(&handler), context)(command)
    })
}

/// A legacy client whose `promise` runs whatever `send` is currently installed.
pub(crate) fn fake_legacy_module<R>(respond: R) -> Arc<LegacySdkModule>
where
    R: Fn(&LegacyRequest) -> Result<SdkResponse, ServiceError> + Send + Sync + 'static,
{
    let send: Arc<LegacySendFn> = Arc::new(
        move |request: Arc<LegacyRequest>, callback: Option<LegacyCallback>| {
            let result = respond(&request);
            if let Some(callback) = callback {
                callback(result);
            }
        },
    );
    Arc::new_cyclic(|module: &std::sync::Weak<LegacySdkModule>| {
        let module = module.clone();
        let promise: Arc<LegacyPromiseFn> = Arc::new(move |request: Arc<LegacyRequest>| {
            let (tx, rx) = oneshot::channel();
            if let Some(module) = module.upgrade() {
                module.send.get()(
                    request,
                    Some(Box::new(move |result: Result<SdkResponse, ServiceError>| {
                        let _ = tx.send(result);
                    })),
                );
            }
            BoundFuture::unbound(
                async move {
                    rx.await
                        .unwrap_or_else(|_| Err(ServiceError::new("Canceled", "request dropped")))
                }
                .boxed(),
            )
        });
        LegacySdkModule::new(send, promise)
    })
}

/// A driver connection answering every command synchronously.
pub(crate) fn fake_connection<R>(respond: R) -> ConnectionModule
where
    R: Fn(&Namespace, &Document) -> Result<serde_json::Value, DriverError> + Send + Sync + 'static,
{
    let command: Arc<CommandFn> = Arc::new(
        move |_connection: &ConnectionInfo, namespace: &Namespace, document: Document| {
            future::ready(respond(namespace, &document)).boxed()
        },
    );
    ConnectionModule::new(command)
}
