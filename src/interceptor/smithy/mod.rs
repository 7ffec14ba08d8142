// Adapter for the Rust AWS SDK: an orchestrator `Intercept` that runs the
// shared pipeline from its hooks, with the in-flight call kept in the
// interceptor state of the ConfigBag between hooks.

#[cfg(feature = "smithy-dynamodb")]
pub mod dynamodb;

use std::{collections::HashMap, fmt, sync::Arc};

use aws_smithy_runtime_api::{
    box_error::BoxError,
    client::{
        interceptors::{
            Intercept,
            context::{
                BeforeDeserializationInterceptorContextRef,
                BeforeSerializationInterceptorContextRef, Error as OperationError,
                FinalizerInterceptorContextRef, Input,
            },
        },
        orchestrator::{HttpResponse, OrchestratorError},
        runtime_components::RuntimeComponents,
    },
};
use aws_smithy_types::config_bag::ConfigBag;
use aws_types::{region::Region, request_id::RequestId};
use serde_json::Value;

use super::{
    ActiveCall, InterceptedCall, RequestInterceptor,
    utils::{StorableOption, extract_service_operation},
};
use crate::{
    error::ErrorMetadata,
    model::{OperationInput, ResponseMetadata, SdkResponse, normalize_request},
};

/// Turns a typed operation input into the JSON shape resource extensions read.
pub type Snapshotter = fn(operation: &str, input: &Input) -> Option<OperationInput>;

pub struct SmithyInterceptor {
    interceptor: Arc<RequestInterceptor>,
    snapshotters: HashMap<&'static str, Snapshotter>,
}

impl fmt::Debug for SmithyInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut services: Vec<_> = self.snapshotters.keys().collect();
        services.sort();
        f.debug_struct("SmithyInterceptor")
            .field("interceptor", &self.interceptor)
            .field("snapshotters", &services)
            .finish()
    }
}

impl SmithyInterceptor {
    pub fn new(interceptor: Arc<RequestInterceptor>) -> Self {
        #[allow(unused_mut)]
        let mut snapshotters = HashMap::new();
        #[cfg(feature = "smithy-dynamodb")]
        snapshotters.insert("DynamoDB", dynamodb::snapshot as Snapshotter);
        Self {
            interceptor,
            snapshotters,
        }
    }

    /// Registers `snapshotter` for `service`, replacing any previous one.
    pub fn with_snapshotter(mut self, service: &'static str, snapshotter: Snapshotter) -> Self {
        self.snapshotters.insert(service, snapshotter);
        self
    }

    fn snapshot(&self, service: &str, operation: &str, input: &Input) -> OperationInput {
        self.snapshotters
            .get(service)
            .and_then(|snapshotter| snapshotter(operation, input))
            .unwrap_or_default()
    }
}

fn active_call(cfg: &mut ConfigBag) -> Option<&mut ActiveCall> {
    cfg.get_mut_from_interceptor_state::<StorableOption<ActiveCall>>()?
        .as_mut()
}

fn response_metadata(response: &HttpResponse) -> ResponseMetadata {
    ResponseMetadata {
        request_id: response.request_id().map(str::to_owned),
        extended_request_id: response.headers().get("x-amz-id-2").map(str::to_owned),
        http_status_code: Some(response.status().as_u16()),
    }
}

/// A failed orchestration, as recorded on the span.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct OrchestrationFailure {
    pub message: String,
}

impl OrchestrationFailure {
    fn new(err: &OrchestratorError<OperationError>) -> Self {
        let message = match err.as_operation_error() {
            Some(operation_error) => operation_error.to_string(),
            None => err.to_string(),
        };
        Self { message }
    }
}

impl ErrorMetadata for OrchestrationFailure {}

impl Intercept for SmithyInterceptor {
    fn name(&self) -> &'static str {
        "SmithyInterceptor"
    }

    fn read_before_execution(
        &self,
        context: &BeforeSerializationInterceptorContextRef<'_>,
        cfg: &mut ConfigBag,
    ) -> Result<(), BoxError> {
        if !self.interceptor.should_intercept() {
            return Ok(());
        }
        let Some((service, operation)) = extract_service_operation(cfg) else {
            log::debug!("aws-sdk instrumentation: no operation metadata in config bag");
            return Ok(());
        };
        let input = self.snapshot(service, operation, context.input());
        let region = cfg.load::<Region>().map(ToString::to_string);
        let request = normalize_request(service, operation, input, region);

        // The span is not attached as the current context: the orchestrator
        // polls the request outside these hooks, so HTTP client spans do not
        // nest under it.
        let mut active = self.interceptor.start(InterceptedCall::new(request));
        active.run_pre_request_hook();
        // The typed input is already built; rewrites of the snapshot stay local.
        active.prepare();
        cfg.interceptor_state().store_put(StorableOption::new(active));
        Ok(())
    }

    fn read_before_deserialization(
        &self,
        context: &BeforeDeserializationInterceptorContextRef<'_>,
        _runtime_components: &RuntimeComponents,
        cfg: &mut ConfigBag,
    ) -> Result<(), BoxError> {
        if let Some(active) = active_call(cfg) {
            active.record_pending_metadata(response_metadata(context.response()));
        }
        Ok(())
    }

    fn read_after_execution(
        &self,
        context: &FinalizerInterceptorContextRef<'_>,
        _runtime_components: &RuntimeComponents,
        cfg: &mut ConfigBag,
    ) -> Result<(), BoxError> {
        let Some(active) = cfg
            .get_mut_from_interceptor_state::<StorableOption<ActiveCall>>()
            .and_then(|slot| slot.take())
        else {
            return Ok(());
        };

        let settled = match context.output_or_error() {
            Some(Ok(_)) => active.settle(Ok::<_, OrchestrationFailure>(SdkResponse::new(Value::Null))),
            Some(Err(err)) => active.settle(Err(OrchestrationFailure::new(err))),
            None => return Ok(()),
        };
        if let Err(err) = settled {
            log::debug!("aws-sdk instrumentation: orchestrated call settled with an error: {err}");
        }
        Ok(())
    }
}
