// Normalized request/response model: decouples the interceptor and the resource
// extensions from the shapes exposed by each client generation.

use std::{fmt, sync::Arc};

use futures::stream::BoxStream;
use opentelemetry::{KeyValue, trace::SpanKind};
use serde_json::{Map, Value};

use crate::error::BoxError;

pub type OperationInput = Map<String, Value>;

// Sequence of partial results for streaming operations.
pub type EventStream = BoxStream<'static, Result<Value, BoxError>>;

/// One outbound call, normalized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRequest {
    pub resource_name: String,
    pub operation_name: String,
    pub operation_input: OperationInput,
    pub region: Option<String>,
}

impl NormalizedRequest {
    pub fn input(&self, key: &str) -> Option<&Value> {
        self.operation_input.get(key)
    }

    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input(key).and_then(Value::as_str)
    }
}

/// Builds the request for the modern client generation, where commands are
/// named `{Operation}Command`.
pub fn normalize_request(
    resource_name: &str,
    command_name: &str,
    operation_input: OperationInput,
    region: Option<String>,
) -> NormalizedRequest {
    NormalizedRequest {
        resource_name: strip_whitespace(resource_name),
        operation_name: remove_suffix(command_name, "Command").to_owned(),
        operation_input,
        region,
    }
}

/// Builds the request for the legacy client generation, where operations are
/// camel-cased (`sendMessage`) and the service is identified by its api id.
pub fn normalize_legacy_request(
    service_id: Option<&str>,
    operation: &str,
    params: OperationInput,
    region: Option<String>,
) -> NormalizedRequest {
    NormalizedRequest {
        resource_name: strip_whitespace(service_id.unwrap_or_default()),
        operation_name: to_pascal_case(operation),
        operation_input: params,
        region,
    }
}

pub fn remove_suffix<'a>(value: &'a str, suffix: &str) -> &'a str {
    value.strip_suffix(suffix).unwrap_or(value)
}

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

fn to_pascal_case(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// What a resource extension decided about a request before its span starts.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    // The span becomes ambient context for the caller's continuations.
    pub is_incoming: bool,
    // The span outlives the response until its event stream is drained.
    pub is_stream: bool,
    pub span_attributes: Vec<KeyValue>,
    pub span_kind: Option<SpanKind>,
    pub span_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub request_id: Option<String>,
    pub extended_request_id: Option<String>,
    pub http_status_code: Option<u16>,
}

/// Successful output of a wrapped call.
pub struct SdkResponse {
    pub output: Value,
    pub metadata: ResponseMetadata,
    pub stream: Option<EventStream>,
}

impl SdkResponse {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            metadata: ResponseMetadata::default(),
            stream: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.metadata.request_id = Some(request_id.into());
        self
    }

    pub fn with_extended_request_id(mut self, extended_request_id: impl Into<String>) -> Self {
        self.metadata.extended_request_id = Some(extended_request_id.into());
        self
    }

    pub fn with_http_status_code(mut self, status: u16) -> Self {
        self.metadata.http_status_code = Some(status);
        self
    }

    pub fn with_stream(mut self, stream: EventStream) -> Self {
        self.stream = Some(stream);
        self
    }
}

impl fmt::Debug for SdkResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdkResponse")
            .field("output", &self.output)
            .field("metadata", &self.metadata)
            .field("stream", &self.stream.is_some())
            .finish()
    }
}

/// Response view handed to the resource extensions and the user response hook.
pub struct NormalizedResponse {
    pub data: Value,
    pub stream: Option<EventStream>,
    pub request: Arc<NormalizedRequest>,
    pub request_id: Option<String>,
}

impl NormalizedResponse {
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

impl fmt::Debug for NormalizedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedResponse")
            .field("data", &self.data)
            .field("stream", &self.stream.is_some())
            .field("request", &self.request)
            .field("request_id", &self.request_id)
            .finish()
    }
}
