// SQS: producer spans for sends, incoming consumer spans for receives, trace
// context carried in message attributes, and per-message process spans.

use std::time::SystemTime;

use opentelemetry::{
    Context, KeyValue,
    global::BoxedTracer,
    trace::{Link, SpanBuilder, SpanKind, TraceContextExt, Tracer},
};
use opentelemetry_semantic_conventions::attribute as semco;
use serde_json::Value;

use super::ResourceExtension;
use crate::{
    config::{InstrumentationConfig, SqsProcessHookInformation},
    interceptor::utils::safe_execute,
    model::{NormalizedRequest, NormalizedResponse, RequestMetadata},
    propagation::{
        add_propagation_fields_to_attribute_names, extract_context,
        extract_propagation_context, inject_message_attributes, propagation_fields,
    },
    semconv::{
        MESSAGING_BATCH_MESSAGE_COUNT, MESSAGING_DESTINATION_NAME, MESSAGING_MESSAGE_ID,
        MESSAGING_OPERATION_TYPE, MESSAGING_SYSTEM, MESSAGING_SYSTEM_VALUE_AWS_SQS,
    },
};

#[derive(Debug, Default, Clone, Copy)]
pub struct SqsExtension;

/// Last path segment of a queue URL.
pub fn queue_name_from_url(queue_url: &str) -> Option<&str> {
    queue_url.rsplit('/').next()
}

impl ResourceExtension for SqsExtension {
    fn pre_span_hook(
        &self,
        request: &NormalizedRequest,
        _config: &InstrumentationConfig,
    ) -> RequestMetadata {
        let queue_url = request.input_str("QueueUrl");
        let queue_name = queue_url.and_then(queue_name_from_url);

        let mut metadata = RequestMetadata {
            span_kind: Some(SpanKind::Client),
            ..Default::default()
        };
        metadata
            .span_attributes
            .push(KeyValue::new(MESSAGING_SYSTEM, MESSAGING_SYSTEM_VALUE_AWS_SQS));
        if let Some(queue_name) = queue_name {
            metadata
                .span_attributes
                .push(KeyValue::new(MESSAGING_DESTINATION_NAME, queue_name.to_owned()));
        }
        if let Some(queue_url) = queue_url {
            metadata
                .span_attributes
                .push(KeyValue::new(semco::URL_FULL, queue_url.to_owned()));
        }

        let queue = queue_name.unwrap_or("undefined");
        match request.operation_name.as_str() {
            "ReceiveMessage" => {
                metadata.is_incoming = true;
                metadata.span_kind = Some(SpanKind::Consumer);
                metadata.span_name = Some(format!("{queue} receive"));
                metadata
                    .span_attributes
                    .push(KeyValue::new(MESSAGING_OPERATION_TYPE, "receive"));
            }
            "SendMessage" | "SendMessageBatch" => {
                metadata.span_kind = Some(SpanKind::Producer);
                metadata.span_name = Some(format!("{queue} send"));
            }
            _ => {}
        }
        metadata
    }

    fn post_span_hook(&self, request: &mut NormalizedRequest) {
        let input = &mut request.operation_input;
        match request.operation_name.as_str() {
            "ReceiveMessage" => {
                let requested: Vec<String> = input
                    .get("MessageAttributeNames")
                    .and_then(Value::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default();
                let names =
                    add_propagation_fields_to_attribute_names(&requested, &propagation_fields());
                input.insert(
                    "MessageAttributeNames".to_owned(),
                    Value::Array(names.into_iter().map(Value::String).collect()),
                );
            }
            "SendMessage" => inject_message_attributes(input),
            "SendMessageBatch" => {
                if let Some(entries) = input.get_mut("Entries").and_then(Value::as_array_mut) {
                    for entry in entries.iter_mut().filter_map(Value::as_object_mut) {
                        inject_message_attributes(entry);
                    }
                }
            }
            _ => {}
        }
    }

    fn response_hook(
        &self,
        response: &mut NormalizedResponse,
        context: &Context,
        _tracer: &BoxedTracer,
        config: &InstrumentationConfig,
        _start_time: SystemTime,
    ) {
        let span = context.span();
        match response.request.operation_name.as_str() {
            "SendMessage" => {
                if let Some(message_id) = response.data_str("MessageId") {
                    span.set_attribute(KeyValue::new(MESSAGING_MESSAGE_ID, message_id.to_owned()));
                }
            }
            "ReceiveMessage" => {
                let messages = response
                    .data
                    .get("Messages")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                for message in messages {
                    if let Some(link) = message_link(message, config) {
                        span.add_link(link.span_context, link.attributes);
                    }
                }
                span.set_attribute(KeyValue::new(
                    MESSAGING_BATCH_MESSAGE_COUNT,
                    messages.len() as i64,
                ));
            }
            _ => {}
        }
    }
}

/// Link to the producer context a received message carries, tagged with its id.
fn message_link(message: &Value, config: &InstrumentationConfig) -> Option<Link> {
    let carrier = extract_propagation_context(
        message,
        config.sqs_extract_context_propagation_from_payload,
    )?;
    let propagated = extract_context(&carrier);
    let remote = propagated.span().span_context().clone();
    if !remote.is_valid() {
        return None;
    }
    let attributes = message
        .get("MessageId")
        .and_then(Value::as_str)
        .map(|id| vec![KeyValue::new(MESSAGING_MESSAGE_ID, id.to_owned())])
        .unwrap_or_default();
    Some(Link::new(remote, attributes, 0))
}

/// Starts a `"{queue} process"` consumer span for one received message, as a
/// child of the current context linked to the context the producer propagated.
///
/// The returned context carries the span; end it once the message is handled.
pub fn start_process_span(
    tracer: &BoxedTracer,
    config: &InstrumentationConfig,
    queue_url: Option<&str>,
    message: &Value,
) -> Context {
    let queue_name = queue_url.and_then(queue_name_from_url);
    let message_id = message.get("MessageId").and_then(Value::as_str);

    let mut attributes = vec![
        KeyValue::new(MESSAGING_SYSTEM, MESSAGING_SYSTEM_VALUE_AWS_SQS),
        KeyValue::new(MESSAGING_OPERATION_TYPE, "process"),
    ];
    if let Some(queue_name) = queue_name {
        attributes.push(KeyValue::new(MESSAGING_DESTINATION_NAME, queue_name.to_owned()));
    }
    if let Some(queue_url) = queue_url {
        attributes.push(KeyValue::new(semco::URL_FULL, queue_url.to_owned()));
    }
    if let Some(message_id) = message_id {
        attributes.push(KeyValue::new(MESSAGING_MESSAGE_ID, message_id.to_owned()));
    }

    let mut builder = SpanBuilder::from_name(format!("{} process", queue_name.unwrap_or("undefined")))
        .with_kind(SpanKind::Consumer)
        .with_attributes(attributes);
    if let Some(link) = message_link(message, config) {
        builder = builder.with_links(vec![link]);
    }

    let parent = Context::current();
    let span = tracer.build_with_context(builder, &parent);
    let context = parent.with_span(span);

    if let Some(hook) = &config.sqs_process_hook {
        let span = context.span();
        let info = SqsProcessHookInformation { message };
        safe_execute("sqsProcessHook", || hook(&span, &info));
    }
    context
}
