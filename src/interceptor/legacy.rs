// Direct method installation for the legacy client generation: `send`
// (callback style) and `promise` (future style) are wrapped in place. Either
// may run the other internally, so a request already in flight is passed
// straight through.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use opentelemetry::{Context, KeyValue};

use super::{CallFuture, InterceptedCall, RequestInterceptor};
use crate::{
    error::{PatchError, ServiceError},
    model::{OperationInput, SdkResponse, normalize_legacy_request},
    semconv::{
        AWS_OPERATION, AWS_SERVICE_API, AWS_SERVICE_IDENTIFIER, AWS_SERVICE_NAME,
        AWS_SIGNATURE_VERSION,
    },
    shim::{CallId, SideTable, SideTableEntry, Wrappable},
};

/// What a legacy service client knows about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyServiceDescriptor {
    pub service_id: Option<String>,
    pub class_name: Option<String>,
    pub abbreviation: Option<String>,
    pub service_identifier: Option<String>,
    pub signature_version: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug)]
pub struct LegacyRequest {
    pub id: CallId,
    pub operation: String,
    pub params: Mutex<OperationInput>,
    pub service: LegacyServiceDescriptor,
}

impl LegacyRequest {
    pub fn new(
        service: LegacyServiceDescriptor,
        operation: impl Into<String>,
        params: OperationInput,
    ) -> Self {
        Self {
            id: CallId::next(),
            operation: operation.into(),
            params: Mutex::new(params),
            service,
        }
    }

    pub fn params(&self) -> OperationInput {
        self.params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_params(&self, params: OperationInput) {
        *self.params.lock().unwrap_or_else(PoisonError::into_inner) = params;
    }
}

pub type LegacyCallback = Box<dyn FnOnce(Result<SdkResponse, ServiceError>) + Send>;
pub type LegacySendFn = dyn Fn(Arc<LegacyRequest>, Option<LegacyCallback>) + Send + Sync;
pub type LegacyPromiseFn = dyn Fn(Arc<LegacyRequest>) -> CallFuture + Send + Sync;

#[derive(Debug)]
pub struct LegacySdkModule {
    pub send: Wrappable<LegacySendFn>,
    pub promise: Wrappable<LegacyPromiseFn>,
}

impl LegacySdkModule {
    pub fn new(send: Arc<LegacySendFn>, promise: Arc<LegacyPromiseFn>) -> Self {
        Self {
            send: Wrappable::new("Request.send", send),
            promise: Wrappable::new("Request.promise", promise),
        }
    }
}

#[derive(Clone)]
pub struct LegacyInstrumentation {
    interceptor: Arc<RequestInterceptor>,
    in_flight: Arc<SideTable<()>>,
    module_version: Option<String>,
}

impl fmt::Debug for LegacyInstrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyInstrumentation")
            .field("in_flight", &self.in_flight.len())
            .field("module_version", &self.module_version)
            .finish_non_exhaustive()
    }
}

impl LegacyInstrumentation {
    pub fn new(interceptor: Arc<RequestInterceptor>) -> Self {
        Self {
            interceptor,
            in_flight: Arc::default(),
            module_version: None,
        }
    }

    pub fn with_module_version(mut self, module_version: Option<String>) -> Self {
        self.module_version = module_version;
        self
    }

    pub fn patch(&self, module: &LegacySdkModule) -> Result<(), PatchError> {
        let instrumentation = self.clone();
        module.send.wrap(move |original| {
            let send: Arc<LegacySendFn> = Arc::new(
                move |request: Arc<LegacyRequest>, callback: Option<LegacyCallback>| {
                    instrumentation.send(&*original, request, callback)
                },
            );
            send
        })?;

        let instrumentation = self.clone();
        let patched = module.promise.wrap(move |original| {
            let promise: Arc<LegacyPromiseFn> =
                Arc::new(move |request: Arc<LegacyRequest>| instrumentation.promise(&original, request));
            promise
        });
        if let Err(err) = patched {
            module.send.unwrap()?;
            return Err(err);
        }
        Ok(())
    }

    pub fn unpatch(module: &LegacySdkModule) -> Result<(), PatchError> {
        let send = module.send.unwrap();
        let promise = module.promise.unwrap();
        send.and(promise)
    }

    fn should_intercept(&self, request: &LegacyRequest) -> bool {
        self.interceptor.should_intercept() && !self.in_flight.contains(request.id)
    }

    fn intercepted_call(&self, request: &LegacyRequest) -> InterceptedCall {
        let service = &request.service;
        let normalized = normalize_legacy_request(
            service.service_id.as_deref(),
            &request.operation,
            request.params(),
            service.region.clone(),
        );

        let mut attributes = vec![KeyValue::new(AWS_OPERATION, request.operation.clone())];
        let descriptor = [
            (AWS_SIGNATURE_VERSION, &service.signature_version),
            (AWS_SERVICE_API, &service.class_name),
            (AWS_SERVICE_IDENTIFIER, &service.service_identifier),
            (AWS_SERVICE_NAME, &service.abbreviation),
        ];
        for (key, value) in descriptor {
            if let Some(value) = value {
                attributes.push(KeyValue::new(key, value.clone()));
            }
        }

        InterceptedCall::new(normalized)
            .with_module_version(self.module_version.clone())
            .with_attributes(attributes)
    }

    fn send(
        &self,
        original: &LegacySendFn,
        request: Arc<LegacyRequest>,
        callback: Option<LegacyCallback>,
    ) {
        if !self.should_intercept(&request) {
            return original(request, callback);
        }

        let mut active = self.interceptor.start(self.intercepted_call(&request));
        active.run_pre_request_hook();
        request.set_params(active.prepare());
        let marker = SideTableEntry::insert(&self.in_flight, request.id, ());

        // Incoming calls hand their span to the callback; others restore the caller's context.
        let callback_context = if active.is_incoming() {
            active.context().clone()
        } else {
            Context::current()
        };
        let invoke_context = active.invoke_context();
        let settle: LegacyCallback = Box::new(move |result| {
            let result = active.settle(result);
            drop(marker);
            if let Some(callback) = callback {
                let _guard = callback_context.attach();
                callback(result);
            }
        });

        let _guard = invoke_context.attach();
        original(request, Some(settle));
    }

    fn promise(&self, original: &Arc<LegacyPromiseFn>, request: Arc<LegacyRequest>) -> CallFuture {
        if !self.should_intercept(&request) {
            return original(request);
        }

        let call = self.intercepted_call(&request);
        let in_flight = Arc::clone(&self.in_flight);
        let original = Arc::clone(original);
        self.interceptor.intercept(call, None, move |input| {
            request.set_params(input);
            let marker = SideTableEntry::insert(&in_flight, request.id, ());
            let pending = original(request);
            async move {
                let _marker = marker;
                pending.await
            }
        })
    }
}
