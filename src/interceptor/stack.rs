// Chain-based installation for the modern client generation: every middleware
// stack the library constructs (or derives through clone/concat) is decorated
// so that the handler it resolves runs the interceptor pipeline.

use std::{fmt, mem, sync::Arc};

use super::{CallFuture, InterceptedCall, RegionFuture, RequestInterceptor};
use crate::{
    error::PatchError,
    model::{OperationInput, normalize_request, remove_suffix},
    shim::{CallId, SideTable, SideTableEntry, Wrappable},
};

/// Per-call metadata the library hands to `resolve`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerExecutionContext {
    pub client_name: Option<String>,
    pub command_name: Option<String>,
}

/// One command sent through a client.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: CallId,
    pub name: String,
    pub input: OperationInput,
}

impl Command {
    pub fn new(name: impl Into<String>, input: OperationInput) -> Self {
        Self {
            id: CallId::next(),
            name: name.into(),
            input,
        }
    }
}

pub type Handler = Arc<dyn Fn(Command) -> CallFuture + Send + Sync>;

pub trait MiddlewareStack: Send + Sync {
    /// Folds the stack's steps around `handler` into one callable.
    fn resolve(&self, handler: Handler, context: HandlerExecutionContext) -> Handler;

    fn clone_stack(&self) -> Box<dyn MiddlewareStack>;

    fn concat(&self, other: &dyn MiddlewareStack) -> Box<dyn MiddlewareStack>;

    fn is_instrumented(&self) -> bool {
        false
    }
}

pub type ConstructStackFn = dyn Fn() -> Box<dyn MiddlewareStack> + Send + Sync;

// Resolves the client's region; may be slow, so it is awaited after span start.
pub type RegionProvider = Arc<dyn Fn() -> RegionFuture + Send + Sync>;

#[derive(Clone, Default)]
pub struct ClientConfig {
    pub service_id: Option<String>,
    pub region: Option<RegionProvider>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("service_id", &self.service_id)
            .field("region", &self.region.is_some())
            .finish()
    }
}

pub type ClientSendFn = dyn Fn(&ClientConfig, Command) -> CallFuture + Send + Sync;

#[derive(Debug)]
pub struct MiddlewareStackModule {
    pub construct_stack: Wrappable<ConstructStackFn>,
}

impl MiddlewareStackModule {
    pub fn new(construct_stack: Arc<ConstructStackFn>) -> Self {
        Self {
            construct_stack: Wrappable::new("constructStack", construct_stack),
        }
    }
}

#[derive(Debug)]
pub struct SmithyClientModule {
    pub send: Wrappable<ClientSendFn>,
}

impl SmithyClientModule {
    pub fn new(send: Arc<ClientSendFn>) -> Self {
        Self {
            send: Wrappable::new("send", send),
        }
    }
}

/// Installs the interceptor on middleware stacks and smithy clients.
#[derive(Debug, Clone)]
pub struct StackInstrumentation {
    interceptor: Arc<RequestInterceptor>,
    client_configs: Arc<SideTable<ClientConfig>>,
    module_version: Option<String>,
}

impl StackInstrumentation {
    pub fn new(interceptor: Arc<RequestInterceptor>) -> Self {
        Self {
            interceptor,
            client_configs: Arc::default(),
            module_version: None,
        }
    }

    pub fn with_module_version(mut self, module_version: Option<String>) -> Self {
        self.module_version = module_version;
        self
    }

    pub fn patch_stack_module(&self, module: &MiddlewareStackModule) -> Result<(), PatchError> {
        let instrumentation = self.clone();
        module.construct_stack.wrap(move |original| {
            let construct: Arc<ConstructStackFn> =
                Arc::new(move || instrumentation.instrument_stack(original()));
            construct
        })
    }

    pub fn unpatch_stack_module(module: &MiddlewareStackModule) -> Result<(), PatchError> {
        module.construct_stack.unwrap()
    }

    /// Makes the client config visible to the handler of the command being sent.
    pub fn patch_client_module(&self, module: &SmithyClientModule) -> Result<(), PatchError> {
        let client_configs = Arc::clone(&self.client_configs);
        module.send.wrap(move |original| {
            let send: Arc<ClientSendFn> = Arc::new(move |config: &ClientConfig, command: Command| {
                let _entry = SideTableEntry::insert(&client_configs, command.id, config.clone());
                original(config, command)
            });
            send
        })
    }

    pub fn unpatch_client_module(module: &SmithyClientModule) -> Result<(), PatchError> {
        module.send.unwrap()
    }

    /// Decorates `stack` unless it already is.
    pub fn instrument_stack(&self, stack: Box<dyn MiddlewareStack>) -> Box<dyn MiddlewareStack> {
        if stack.is_instrumented() {
            return stack;
        }
        Box::new(InstrumentedStack {
            inner: stack,
            instrumentation: self.clone(),
        })
    }

    fn handle(&self, resolved: &Handler, context: &HandlerExecutionContext, mut command: Command) -> CallFuture {
        let client_config = self.client_configs.remove(command.id);
        if !self.interceptor.should_intercept() {
            return resolved(command);
        }

        let service_id = client_config
            .as_ref()
            .and_then(|config| config.service_id.as_deref());
        let resource_name = service_id.unwrap_or_else(|| {
            remove_suffix(context.client_name.as_deref().unwrap_or_default(), "Client")
        });
        let command_name = context.command_name.as_deref().unwrap_or(&command.name);
        let request = normalize_request(
            resource_name,
            command_name,
            mem::take(&mut command.input),
            None,
        );
        let region = client_config
            .and_then(|config| config.region)
            .map(|provider| provider());

        let call = InterceptedCall::new(request).with_module_version(self.module_version.clone());
        let resolved = Arc::clone(resolved);
        self.interceptor.intercept(call, region, move |input| {
            command.input = input;
            resolved(command)
        })
    }
}

struct InstrumentedStack {
    inner: Box<dyn MiddlewareStack>,
    instrumentation: StackInstrumentation,
}

impl MiddlewareStack for InstrumentedStack {
    fn resolve(&self, handler: Handler, context: HandlerExecutionContext) -> Handler {
        let resolved = self.inner.resolve(handler, context.clone());
        let instrumentation = self.instrumentation.clone();
        Arc::new(move |command| instrumentation.handle(&resolved, &context, command))
    }

    // Derived stacks are decorated on their own; they never pass through the constructor.
    fn clone_stack(&self) -> Box<dyn MiddlewareStack> {
        self.instrumentation.instrument_stack(self.inner.clone_stack())
    }

    fn concat(&self, other: &dyn MiddlewareStack) -> Box<dyn MiddlewareStack> {
        self.instrumentation.instrument_stack(self.inner.concat(other))
    }

    fn is_instrumented(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use futures::FutureExt;
    use opentelemetry::{
        Context,
        trace::{SpanKind, TraceContextExt},
    };
    use serde_json::json;

    use super::*;
    use crate::{
        config::InstrumentationConfig,
        error::{BoxError, ServiceError},
        model::SdkResponse,
        semconv::{MESSAGING_BATCH_MESSAGE_COUNT, MESSAGING_DESTINATION_NAME, MESSAGING_MESSAGE_ID},
        test_support::{FakeStack, Harness, attribute, fake_client, input, string_attribute, terminal},
    };

    fn stack_module(resolves: &Arc<AtomicUsize>) -> MiddlewareStackModule {
        let resolves = Arc::clone(resolves);
        MiddlewareStackModule::new(Arc::new(move || -> Box<dyn MiddlewareStack> {
            Box::new(FakeStack::new(Arc::clone(&resolves)))
        }))
    }

    fn context(client: &str, command: &str) -> HandlerExecutionContext {
        HandlerExecutionContext {
            client_name: Some(client.to_owned()),
            command_name: Some(command.to_owned()),
        }
    }

    #[tokio::test]
    async fn cloned_stacks_are_wrapped_once() {
        let harness = Harness::new();
        let instrumentation = StackInstrumentation::new(harness.interceptor(InstrumentationConfig::default()));
        let resolves = Arc::new(AtomicUsize::new(0));
        let module = stack_module(&resolves);
        instrumentation.patch_stack_module(&module).unwrap();
        assert_eq!(
            instrumentation.patch_stack_module(&module),
            Err(PatchError::AlreadyWrapped("constructStack"))
        );

        let constructed = module.construct_stack.get()();
        let twice = constructed.clone_stack().clone_stack();
        let concatenated = twice.concat(constructed.as_ref());
        let rewrapped = instrumentation.instrument_stack(concatenated);
        assert!(rewrapped.is_instrumented());

        let handler = rewrapped.resolve(
            terminal(|_| Ok(SdkResponse::new(json!({})))),
            context("S3Client", "ListBucketsCommand"),
        );
        handler(Command::new("ListBucketsCommand", input(json!({})))).await.unwrap();

        assert_eq!(resolves.load(Ordering::SeqCst), 1);
        let spans = harness.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "S3.ListBuckets");

        StackInstrumentation::unpatch_stack_module(&module).unwrap();
        assert!(!module.construct_stack.get()().is_instrumented());
    }

    #[tokio::test]
    async fn send_message_through_client() {
        let harness = Harness::new();
        let instrumentation = StackInstrumentation::new(harness.interceptor(InstrumentationConfig::default()))
            .with_module_version(Some("3.600.0".to_owned()));
        let resolves = Arc::new(AtomicUsize::new(0));
        let stacks = stack_module(&resolves);
        instrumentation.patch_stack_module(&stacks).unwrap();

        let sent = Arc::new(Mutex::new(None));
        let observed = Arc::clone(&sent);
        let client = SmithyClientModule::new(fake_client(
            &stacks,
            "SQSClient",
            terminal(move |command| {
                *observed.lock().unwrap() = Some(command.input.clone());
                Ok(SdkResponse::new(json!({"MessageId": "m-1"})))
            }),
        ));
        instrumentation.patch_client_module(&client).unwrap();

        let region: RegionProvider = Arc::new(|| async { Ok::<_, BoxError>("us-east-1".to_owned()) }.boxed());
        let config = ClientConfig {
            service_id: Some("SQS".to_owned()),
            region: Some(region),
        };
        let command = Command::new(
            "SendMessageCommand",
            input(json!({"QueueUrl": "https://sqs.us-east-1.amazonaws.com/123/my-queue", "MessageBody": "hi"})),
        );
        client.send.get()(&config, command).await.unwrap();

        let span = harness.span("my-queue send");
        assert_eq!(span.span_kind, SpanKind::Producer);
        assert_eq!(string_attribute(&span, MESSAGING_DESTINATION_NAME).as_deref(), Some("my-queue"));
        assert_eq!(string_attribute(&span, MESSAGING_MESSAGE_ID).as_deref(), Some("m-1"));
        assert_eq!(string_attribute(&span, "cloud.region").as_deref(), Some("us-east-1"));
        assert_eq!(string_attribute(&span, "rpc.service").as_deref(), Some("SQS"));
        assert_eq!(string_attribute(&span, "rpc.method").as_deref(), Some("SendMessage"));

        let sent = sent.lock().unwrap().take().unwrap();
        assert!(sent["MessageAttributes"].get("traceparent").is_some());

        StackInstrumentation::unpatch_client_module(&client).unwrap();
        assert!(!client.send.is_wrapped());
    }

    #[tokio::test]
    async fn receive_continuation_sees_consumer_span() {
        let harness = Harness::new();
        let instrumentation = StackInstrumentation::new(harness.interceptor(InstrumentationConfig::default()));
        let resolves = Arc::new(AtomicUsize::new(0));
        let stacks = stack_module(&resolves);
        instrumentation.patch_stack_module(&stacks).unwrap();

        let handler = stacks.construct_stack.get()().resolve(
            terminal(|_| {
                Ok(SdkResponse::new(json!({"Messages": [{"MessageId": "a"}, {"MessageId": "b"}]})))
            }),
            context("SQSClient", "ReceiveMessageCommand"),
        );
        let command = Command::new(
            "ReceiveMessageCommand",
            input(json!({"QueueUrl": "https://sqs.us-east-1.amazonaws.com/123/my-queue"})),
        );
        let parent = handler(command)
            .map(|result| {
                assert!(result.is_ok());
                Context::current().span().span_context().span_id()
            })
            .await;

        let span = harness.span("my-queue receive");
        assert_eq!(span.span_kind, SpanKind::Consumer);
        assert_eq!(attribute(&span, MESSAGING_BATCH_MESSAGE_COUNT), Some(2_i64.into()));
        assert_eq!(parent, span.span_context.span_id());
    }

    #[tokio::test]
    async fn client_name_without_service_id() {
        let harness = Harness::new();
        let instrumentation = StackInstrumentation::new(harness.interceptor(InstrumentationConfig::default()));
        let resolves = Arc::new(AtomicUsize::new(0));
        let stacks = stack_module(&resolves);
        instrumentation.patch_stack_module(&stacks).unwrap();

        let handler = stacks.construct_stack.get()().resolve(
            terminal(|_| Err(ServiceError::new("NoSuchBucket", "missing").with_request_id("req-9"))),
            HandlerExecutionContext {
                client_name: Some("S3Client".to_owned()),
                command_name: None,
            },
        );
        let err = handler(Command::new("GetObjectCommand", input(json!({"Bucket": "b"}))))
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::new("NoSuchBucket", "missing").with_request_id("req-9"));

        let span = harness.span("S3.GetObject");
        assert_eq!(string_attribute(&span, "aws.s3.bucket").as_deref(), Some("b"));
        assert_eq!(string_attribute(&span, "aws.request.id").as_deref(), Some("req-9"));
    }
}
