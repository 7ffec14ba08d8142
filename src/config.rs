// Instrumentation configuration: user hooks, statement serializers, per-resource
// toggles and semantic-convention stability selection.

use std::{env, error::Error, fmt, sync::Arc};

use opentelemetry::trace::SpanRef;
use serde_json::Value;

use crate::{
    error::BoxError,
    model::{NormalizedRequest, NormalizedResponse, OperationInput},
};

pub const SEMCONV_STABILITY_OPT_IN: &str = "OTEL_SEMCONV_STABILITY_OPT_IN";

// Number of chained continuations that keep an incoming call's span as ambient context.
pub const DEFAULT_REBIND_DEPTH: usize = 2;

/// Which attribute naming scheme(s) to emit for a semantic-convention namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemconvStability {
    old: bool,
    stable: bool,
}

impl SemconvStability {
    pub const OLD: Self = Self {
        old: true,
        stable: false,
    };
    pub const STABLE: Self = Self {
        old: false,
        stable: true,
    };
    pub const DUPLICATE: Self = Self {
        old: true,
        stable: true,
    };

    /// Parses a comma separated opt-in list such as `"http/dup,database"`.
    pub fn from_opt_in(namespace: &str, opt_in: Option<&str>) -> Self {
        let dup = format!("{namespace}/dup");
        let mut stability = Self::OLD;
        for entry in opt_in
            .unwrap_or_default()
            .split(',')
            .map(|entry| entry.trim().to_ascii_lowercase())
        {
            if entry == dup {
                return Self::DUPLICATE;
            }
            if entry == namespace {
                stability = Self::STABLE;
            }
        }
        stability
    }

    pub fn from_env(namespace: &str) -> Self {
        Self::from_opt_in(namespace, env::var(SEMCONV_STABILITY_OPT_IN).ok().as_deref())
    }

    pub fn emit_old(self) -> bool {
        self.old
    }

    pub fn emit_stable(self) -> bool {
        self.stable
    }
}

pub struct RequestHookInformation<'a> {
    pub module_version: Option<&'a str>,
    pub request: &'a NormalizedRequest,
}

pub struct ResponseHookInformation<'a> {
    pub response: &'a NormalizedResponse,
}

pub struct SqsProcessHookInformation<'a> {
    pub message: &'a Value,
}

pub type PreRequestHook =
    Arc<dyn Fn(&SpanRef<'_>, &RequestHookInformation<'_>) -> Result<(), BoxError> + Send + Sync>;
pub type ResponseHook =
    Arc<dyn Fn(&SpanRef<'_>, &ResponseHookInformation<'_>) -> Result<(), BoxError> + Send + Sync>;
pub type ExceptionHook = Arc<
    dyn Fn(&SpanRef<'_>, &RequestHookInformation<'_>, &(dyn Error + 'static)) -> Result<(), BoxError>
        + Send
        + Sync,
>;
pub type SqsProcessHook = Arc<
    dyn Fn(&SpanRef<'_>, &SqsProcessHookInformation<'_>) -> Result<(), BoxError> + Send + Sync,
>;
// (operation name, operation input) -> statement
pub type DynamoDbStatementSerializer =
    Arc<dyn Fn(&str, &OperationInput) -> Result<String, BoxError> + Send + Sync>;
pub type DbStatementSerializer =
    Arc<dyn Fn(&OperationInput) -> Result<String, BoxError> + Send + Sync>;

#[derive(Clone)]
pub struct InstrumentationConfig {
    pub pre_request_hook: Option<PreRequestHook>,
    pub response_hook: Option<ResponseHook>,
    pub exception_hook: Option<ExceptionHook>,
    /// Poll the wrapped call with nested instrumentation suppressed.
    pub suppress_internal_instrumentation: bool,
    pub dynamodb_statement_serializer: Option<DynamoDbStatementSerializer>,
    pub sqs_extract_context_propagation_from_payload: bool,
    pub sqs_process_hook: Option<SqsProcessHook>,
    pub db_statement_serializer: Option<DbStatementSerializer>,
    /// Report full command documents instead of their redacted shape.
    pub enhanced_database_reporting: bool,
    /// Only trace driver commands issued under an active span.
    pub require_parent_span: bool,
    pub rebind_depth: usize,
    pub http_semconv: SemconvStability,
    pub db_semconv: SemconvStability,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            pre_request_hook: None,
            response_hook: None,
            exception_hook: None,
            suppress_internal_instrumentation: false,
            dynamodb_statement_serializer: None,
            sqs_extract_context_propagation_from_payload: false,
            sqs_process_hook: None,
            db_statement_serializer: None,
            enhanced_database_reporting: false,
            require_parent_span: true,
            rebind_depth: DEFAULT_REBIND_DEPTH,
            http_semconv: SemconvStability::from_env("http"),
            db_semconv: SemconvStability::from_env("database"),
        }
    }
}

impl fmt::Debug for InstrumentationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentationConfig")
            .field("pre_request_hook", &self.pre_request_hook.is_some())
            .field("response_hook", &self.response_hook.is_some())
            .field("exception_hook", &self.exception_hook.is_some())
            .field(
                "suppress_internal_instrumentation",
                &self.suppress_internal_instrumentation,
            )
            .field(
                "sqs_extract_context_propagation_from_payload",
                &self.sqs_extract_context_propagation_from_payload,
            )
            .field("enhanced_database_reporting", &self.enhanced_database_reporting)
            .field("require_parent_span", &self.require_parent_span)
            .field("rebind_depth", &self.rebind_depth)
            .field("http_semconv", &self.http_semconv)
            .field("db_semconv", &self.db_semconv)
            .finish_non_exhaustive()
    }
}

impl InstrumentationConfig {
    pub fn with_pre_request_hook<H>(mut self, hook: H) -> Self
    where
        H: Fn(&SpanRef<'_>, &RequestHookInformation<'_>) -> Result<(), BoxError>,
        H: Send + Sync + 'static,
    {
        self.pre_request_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_response_hook<H>(mut self, hook: H) -> Self
    where
        H: Fn(&SpanRef<'_>, &ResponseHookInformation<'_>) -> Result<(), BoxError>,
        H: Send + Sync + 'static,
    {
        self.response_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_exception_hook<H>(mut self, hook: H) -> Self
    where
        H: Fn(&SpanRef<'_>, &RequestHookInformation<'_>, &(dyn Error + 'static)) -> Result<(), BoxError>,
        H: Send + Sync + 'static,
    {
        self.exception_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_sqs_process_hook<H>(mut self, hook: H) -> Self
    where
        H: Fn(&SpanRef<'_>, &SqsProcessHookInformation<'_>) -> Result<(), BoxError>,
        H: Send + Sync + 'static,
    {
        self.sqs_process_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_dynamodb_statement_serializer<S>(mut self, serializer: S) -> Self
    where
        S: Fn(&str, &OperationInput) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.dynamodb_statement_serializer = Some(Arc::new(serializer));
        self
    }

    pub fn with_db_statement_serializer<S>(mut self, serializer: S) -> Self
    where
        S: Fn(&OperationInput) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.db_statement_serializer = Some(Arc::new(serializer));
        self
    }

    pub fn with_suppress_internal_instrumentation(self, suppress: bool) -> Self {
        Self {
            suppress_internal_instrumentation: suppress,
            ..self
        }
    }

    pub fn with_sqs_extract_context_propagation_from_payload(self, enabled: bool) -> Self {
        Self {
            sqs_extract_context_propagation_from_payload: enabled,
            ..self
        }
    }

    pub fn with_enhanced_database_reporting(self, enabled: bool) -> Self {
        Self {
            enhanced_database_reporting: enabled,
            ..self
        }
    }

    pub fn with_require_parent_span(self, required: bool) -> Self {
        Self {
            require_parent_span: required,
            ..self
        }
    }

    pub fn with_rebind_depth(self, rebind_depth: usize) -> Self {
        Self {
            rebind_depth,
            ..self
        }
    }

    pub fn with_http_semconv(self, http_semconv: SemconvStability) -> Self {
        Self {
            http_semconv,
            ..self
        }
    }

    pub fn with_db_semconv(self, db_semconv: SemconvStability) -> Self {
        Self { db_semconv, ..self }
    }
}
