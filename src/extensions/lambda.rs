// Lambda: client spans for Invoke, with trace context carried in the base64
// JSON `ClientContext.Custom` map.

use std::{collections::HashMap, time::SystemTime};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use opentelemetry::{
    Context, KeyValue, global, global::BoxedTracer, trace::SpanKind, trace::TraceContextExt,
};
use serde_json::{Map, Value};

use super::ResourceExtension;
use crate::{
    config::InstrumentationConfig,
    error::BoxError,
    model::{NormalizedRequest, NormalizedResponse, RequestMetadata},
    semconv::{FAAS_EXECUTION, FAAS_INVOKED_NAME, FAAS_INVOKED_PROVIDER, FAAS_INVOKED_REGION},
};

// Lambda rejects a ClientContext longer than this once encoded.
pub const MAX_CLIENT_CONTEXT_LENGTH: usize = 3583;

#[derive(Debug, Default, Clone, Copy)]
pub struct LambdaExtension;

impl ResourceExtension for LambdaExtension {
    fn pre_span_hook(
        &self,
        request: &NormalizedRequest,
        _config: &InstrumentationConfig,
    ) -> RequestMetadata {
        let mut metadata = RequestMetadata {
            span_kind: Some(SpanKind::Client),
            ..Default::default()
        };
        if request.operation_name == "Invoke" {
            let function_name = request.input_str("FunctionName");
            if let Some(function_name) = function_name {
                metadata
                    .span_attributes
                    .push(KeyValue::new(FAAS_INVOKED_NAME, function_name.to_owned()));
            }
            metadata
                .span_attributes
                .push(KeyValue::new(FAAS_INVOKED_PROVIDER, "aws"));
            if let Some(region) = &request.region {
                metadata
                    .span_attributes
                    .push(KeyValue::new(FAAS_INVOKED_REGION, region.clone()));
            }
            metadata.span_name = Some(format!("{} Invoke", function_name.unwrap_or("undefined")));
        }
        metadata
    }

    fn post_span_hook(&self, request: &mut NormalizedRequest) {
        if request.operation_name != "Invoke" {
            return;
        }
        let input = &mut request.operation_input;
        let client_context = input.get("ClientContext").and_then(Value::as_str);
        if let Some(updated) = inject_client_context(client_context) {
            input.insert("ClientContext".to_owned(), Value::String(updated));
        }
    }

    fn response_hook(
        &self,
        response: &mut NormalizedResponse,
        context: &Context,
        _tracer: &BoxedTracer,
        _config: &InstrumentationConfig,
        _start_time: SystemTime,
    ) {
        if response.request.operation_name == "Invoke" {
            if let Some(request_id) = &response.request_id {
                context
                    .span()
                    .set_attribute(KeyValue::new(FAAS_EXECUTION, request_id.clone()));
            }
        }
    }
}

/// Merges the current context into a `ClientContext`; `None` leaves it as it was.
pub fn inject_client_context(client_context: Option<&str>) -> Option<String> {
    match merge_client_context(client_context) {
        Ok(encoded) if encoded.len() > MAX_CLIENT_CONTEXT_LENGTH => {
            log::warn!(
                "aws-sdk instrumentation: cannot set context propagation on lambda invoke parameters due to ClientContext length limitations"
            );
            None
        }
        Ok(encoded) => Some(encoded),
        Err(err) => {
            log::debug!(
                "aws-sdk instrumentation: failed to set context propagation on ClientContext: {err}"
            );
            None
        }
    }
}

fn merge_client_context(client_context: Option<&str>) -> Result<String, BoxError> {
    let mut propagated: HashMap<String, String> = HashMap::new();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&Context::current(), &mut propagated);
    });

    let mut parsed = match client_context {
        Some(encoded) => match serde_json::from_slice::<Value>(&STANDARD.decode(encoded)?)? {
            Value::Object(map) => map,
            _ => return Err("ClientContext is not a JSON object".into()),
        },
        None => Map::new(),
    };
    let mut custom = match parsed.remove("Custom") {
        Some(Value::Object(custom)) => custom,
        _ => Map::new(),
    };
    custom.extend(
        propagated
            .into_iter()
            .map(|(key, value)| (key, Value::String(value))),
    );
    parsed.insert("Custom".to_owned(), Value::Object(custom));
    Ok(STANDARD.encode(serde_json::to_vec(&parsed)?))
}
