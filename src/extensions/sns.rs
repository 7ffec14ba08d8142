// SNS: producer spans for publishes, with trace context carried in message attributes.

use opentelemetry::{KeyValue, trace::SpanKind};
use serde_json::Value;

use super::ResourceExtension;
use crate::{
    config::InstrumentationConfig,
    model::{NormalizedRequest, RequestMetadata},
    propagation::inject_message_attributes,
    semconv::{
        AWS_SNS_TOPIC_ARN, MESSAGING_DESTINATION_NAME, MESSAGING_SYSTEM,
        MESSAGING_SYSTEM_VALUE_AWS_SNS,
    },
};

#[derive(Debug, Default, Clone, Copy)]
pub struct SnsExtension;

// Topic name is the last ARN segment; direct SMS publishes have no topic.
fn destination_name(request: &NormalizedRequest) -> String {
    let arn = request
        .input_str("TopicArn")
        .or_else(|| request.input_str("TargetArn"));
    match (arn, request.input_str("PhoneNumber")) {
        (Some(arn), _) => arn.rsplit(':').next().unwrap_or(arn).to_owned(),
        (None, Some(_)) => "phone_number".to_owned(),
        (None, None) => "unknown".to_owned(),
    }
}

impl ResourceExtension for SnsExtension {
    fn pre_span_hook(
        &self,
        request: &NormalizedRequest,
        _config: &InstrumentationConfig,
    ) -> RequestMetadata {
        let mut metadata = RequestMetadata::default();
        metadata
            .span_attributes
            .push(KeyValue::new(MESSAGING_SYSTEM, MESSAGING_SYSTEM_VALUE_AWS_SNS));

        if matches!(request.operation_name.as_str(), "Publish" | "PublishBatch") {
            metadata.span_kind = Some(SpanKind::Producer);
            let destination = request
                .input_str("TopicArn")
                .or_else(|| request.input_str("TargetArn"))
                .or_else(|| request.input_str("PhoneNumber"))
                .unwrap_or("unknown");
            metadata
                .span_attributes
                .push(KeyValue::new(MESSAGING_DESTINATION_NAME, destination.to_owned()));
            metadata.span_name = Some(format!("{} send", destination_name(request)));
        }
        if let Some(topic_arn) = request.input_str("TopicArn") {
            metadata
                .span_attributes
                .push(KeyValue::new(AWS_SNS_TOPIC_ARN, topic_arn.to_owned()));
        }
        metadata
    }

    fn post_span_hook(&self, request: &mut NormalizedRequest) {
        let input = &mut request.operation_input;
        match request.operation_name.as_str() {
            "Publish" => inject_message_attributes(input),
            "PublishBatch" => {
                if let Some(entries) = input
                    .get_mut("PublishBatchRequestEntries")
                    .and_then(Value::as_array_mut)
                {
                    for entry in entries.iter_mut().filter_map(Value::as_object_mut) {
                        inject_message_attributes(entry);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::{
        error::ServiceError,
        interceptor::InterceptedCall,
        model::{SdkResponse, normalize_request},
        test_support::{Harness, input, string_attribute},
    };

    const TOPIC_ARN: &str = "arn:aws:sns:us-east-1:123456789012:orders";

    #[tokio::test]
    async fn publish_is_a_producer_span_with_context() {
        let harness = Harness::new();
        let interceptor = harness.interceptor(InstrumentationConfig::default());
        let request = normalize_request(
            "SNS",
            "PublishCommand",
            input(json!({"TopicArn": TOPIC_ARN, "Message": "hi"})),
            None,
        );
        let sent = Arc::new(Mutex::new(None));
        let observed = Arc::clone(&sent);
        interceptor
            .intercept(InterceptedCall::new(request), None, move |input| {
                *observed.lock().unwrap() = Some(input);
                async { Ok::<_, ServiceError>(SdkResponse::new(json!({"MessageId": "1"}))) }
            })
            .await
            .unwrap();

        let span = harness.span("orders send");
        assert_eq!(span.span_kind, SpanKind::Producer);
        assert_eq!(string_attribute(&span, AWS_SNS_TOPIC_ARN).as_deref(), Some(TOPIC_ARN));
        assert_eq!(string_attribute(&span, MESSAGING_DESTINATION_NAME).as_deref(), Some(TOPIC_ARN));
        assert_eq!(string_attribute(&span, MESSAGING_SYSTEM).as_deref(), Some("aws.sns"));
        let sent = sent.lock().unwrap().take().unwrap();
        assert!(sent["MessageAttributes"].get("traceparent").is_some());
    }

    #[test]
    fn span_names_for_each_destination() {
        let config = InstrumentationConfig::default();
        let name = |params: Value| {
            let request = normalize_request("SNS", "PublishCommand", input(params), None);
            SnsExtension.pre_span_hook(&request, &config).span_name
        };
        assert_eq!(name(json!({"TargetArn": "arn:aws:sns:r:1:t/endpoint"})).as_deref(), Some("t/endpoint send"));
        assert_eq!(name(json!({"PhoneNumber": "+15550100"})).as_deref(), Some("phone_number send"));
        assert_eq!(name(json!({})).as_deref(), Some("unknown send"));

        let request = normalize_request("SNS", "CreateTopicCommand", input(json!({"Name": "t"})), None);
        let metadata = SnsExtension.pre_span_hook(&request, &config);
        assert!(metadata.span_name.is_none());
        assert!(metadata.span_kind.is_none());
    }

    #[test]
    fn publish_batch_injects_every_entry() {
        let harness = Harness::new();
        let mut request = normalize_request(
            "SNS",
            "PublishBatchCommand",
            input(json!({
                "TopicArn": TOPIC_ARN,
                "PublishBatchRequestEntries": [{"Id": "1"}, {"Id": "2", "MessageAttributes": {}}],
            })),
            None,
        );
        let tracer = harness.tracer();
        opentelemetry::trace::Tracer::in_span(&tracer, "parent", |_| {
            SnsExtension.post_span_hook(&mut request);
        });
        let entries = request.operation_input["PublishBatchRequestEntries"].as_array().unwrap();
        assert!(entries.iter().all(|entry| entry["MessageAttributes"].get("traceparent").is_some()));
    }
}
