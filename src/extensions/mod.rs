// Per-resource attribute extraction. Each extension customizes the span of the
// calls made to one resource type; the registry dispatches by normalized
// resource name and falls back to a plain client span.

use std::{collections::HashMap, fmt, sync::Arc, time::SystemTime};

use opentelemetry::{
    Array, Context, KeyValue, StringValue, global::BoxedTracer, metrics::Meter,
};
use serde_json::Value;

use crate::{
    config::InstrumentationConfig,
    model::{NormalizedRequest, NormalizedResponse, RequestMetadata},
};

#[cfg(feature = "extract-bedrock-runtime")]
pub mod bedrock_runtime;
#[cfg(feature = "extract-dynamodb")]
pub mod dynamodb;
#[cfg(feature = "extract-lambda")]
pub mod lambda;
#[cfg(feature = "extract-mongodb")]
pub mod mongodb;
#[cfg(feature = "extract-s3")]
pub mod s3;
#[cfg(feature = "extract-secretsmanager")]
pub mod secretsmanager;
#[cfg(feature = "extract-sns")]
pub mod sns;
#[cfg(feature = "extract-sqs")]
pub mod sqs;
#[cfg(feature = "extract-stepfunctions")]
pub mod stepfunctions;

/// Span customization for one resource type.
pub trait ResourceExtension: Send + Sync {
    /// Runs before the span exists. Missing or malformed input fields only drop attributes.
    fn pre_span_hook(
        &self,
        request: &NormalizedRequest,
        config: &InstrumentationConfig,
    ) -> RequestMetadata;

    /// Runs under the new span, before the wrapped call; may rewrite the outgoing input.
    fn post_span_hook(&self, _request: &mut NormalizedRequest) {}

    /// Runs after a successful call. `context` carries the call's span; an
    /// extension may swap `response.data` or `response.stream` for wrapped values.
    fn response_hook(
        &self,
        _response: &mut NormalizedResponse,
        _context: &Context,
        _tracer: &BoxedTracer,
        _config: &InstrumentationConfig,
        _start_time: SystemTime,
    ) {
    }

    /// Called once, on first use, with the interceptor's meter.
    fn update_metric_instruments(&self, _meter: &Meter) {}
}

#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    extensions: HashMap<String, Arc<dyn ResourceExtension>>,
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.extensions.keys().collect();
        names.sort();
        f.debug_struct("ExtensionRegistry")
            .field("resources", &names)
            .finish()
    }
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every extension enabled through cargo features.
    pub fn with_default_extensions() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "extract-s3")]
        registry.register("S3", s3::S3Extension);
        #[cfg(feature = "extract-sqs")]
        registry.register("SQS", sqs::SqsExtension);
        #[cfg(feature = "extract-sns")]
        registry.register("SNS", sns::SnsExtension);
        #[cfg(feature = "extract-dynamodb")]
        registry.register("DynamoDB", dynamodb::DynamoDbExtension);
        #[cfg(feature = "extract-lambda")]
        registry.register("Lambda", lambda::LambdaExtension);
        #[cfg(feature = "extract-secretsmanager")]
        registry.register("SecretsManager", secretsmanager::SecretsManagerExtension);
        #[cfg(feature = "extract-stepfunctions")]
        registry.register("SFN", stepfunctions::StepFunctionsExtension);
        #[cfg(feature = "extract-bedrock-runtime")]
        registry.register("BedrockRuntime", bedrock_runtime::BedrockRuntimeExtension::default());
        #[cfg(feature = "extract-mongodb")]
        registry.register(mongodb::RESOURCE_NAME, mongodb::MongoDbExtension);
        registry
    }

    /// Registers `extension` for `resource_name`, replacing any previous one.
    pub fn register<E>(&mut self, resource_name: impl Into<String>, extension: E) -> &mut Self
    where
        E: ResourceExtension + 'static,
    {
        self.extensions
            .insert(resource_name.into(), Arc::new(extension));
        self
    }

    pub fn get(&self, resource_name: &str) -> Option<&Arc<dyn ResourceExtension>> {
        self.extensions.get(resource_name)
    }

    pub fn pre_span_hook(
        &self,
        request: &NormalizedRequest,
        config: &InstrumentationConfig,
    ) -> RequestMetadata {
        match self.get(&request.resource_name) {
            Some(extension) => extension.pre_span_hook(request, config),
            None => RequestMetadata::default(),
        }
    }

    pub fn post_span_hook(&self, request: &mut NormalizedRequest) {
        if let Some(extension) = self.get(&request.resource_name) {
            extension.post_span_hook(request);
        }
    }

    pub fn response_hook(
        &self,
        response: &mut NormalizedResponse,
        context: &Context,
        tracer: &BoxedTracer,
        config: &InstrumentationConfig,
        start_time: SystemTime,
    ) {
        let resource_name = response.request.resource_name.clone();
        if let Some(extension) = self.get(&resource_name) {
            extension.response_hook(response, context, tracer, config, start_time);
        }
    }

    pub fn update_metric_instruments(&self, meter: &Meter) {
        for extension in self.extensions.values() {
            extension.update_metric_instruments(meter);
        }
    }
}

// JSON scalars map to attribute values; objects and mixed arrays are skipped.
pub(crate) fn attribute_value(value: &Value) -> Option<opentelemetry::Value> {
    match value {
        Value::String(s) => Some(s.clone().into()),
        Value::Bool(b) => Some((*b).into()),
        Value::Number(n) => n
            .as_i64()
            .map(opentelemetry::Value::from)
            .or_else(|| n.as_f64().map(opentelemetry::Value::from)),
        Value::Array(items) => {
            let strings: Option<Vec<StringValue>> = items
                .iter()
                .map(|item| item.as_str().map(|s| StringValue::from(s.to_owned())))
                .collect();
            strings.map(|strings| opentelemetry::Value::Array(Array::String(strings)))
        }
        Value::Null | Value::Object(_) => None,
    }
}

pub(crate) fn string_array<I, S>(values: I) -> opentelemetry::Value
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    opentelemetry::Value::Array(Array::String(
        values
            .into_iter()
            .map(|value| StringValue::from(value.into()))
            .collect(),
    ))
}

// Null, false, zero and the empty string count as unset.
pub(crate) fn truthy(value: Option<&Value>) -> Option<&Value> {
    value.filter(|value| match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    })
}

pub(crate) fn push_attribute(attributes: &mut Vec<KeyValue>, key: &'static str, value: Option<&Value>) {
    if let Some(value) = value.and_then(attribute_value) {
        attributes.push(KeyValue::new(key, value));
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::trace::SpanKind;
    use serde_json::json;

    use super::*;
    use crate::test_support::input;

    struct Fixed(&'static str);

    impl ResourceExtension for Fixed {
        fn pre_span_hook(&self, _: &NormalizedRequest, _: &InstrumentationConfig) -> RequestMetadata {
            RequestMetadata {
                span_name: Some(self.0.to_owned()),
                span_kind: Some(SpanKind::Producer),
                ..Default::default()
            }
        }
    }

    fn request(resource_name: &str) -> NormalizedRequest {
        NormalizedRequest {
            resource_name: resource_name.to_owned(),
            operation_name: "Op".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn unregistered_resource_gets_default_metadata() {
        let registry = ExtensionRegistry::new();
        let mut request = request("Unknown");
        let metadata = registry.pre_span_hook(&request, &InstrumentationConfig::default());
        assert!(!metadata.is_incoming);
        assert!(!metadata.is_stream);
        assert!(metadata.span_kind.is_none());
        assert!(metadata.span_name.is_none());
        assert!(metadata.span_attributes.is_empty());

        registry.post_span_hook(&mut request);
        assert_eq!(request, self::request("Unknown"));
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = ExtensionRegistry::new();
        registry.register("Thing", Fixed("first")).register("Thing", Fixed("second"));
        let metadata = registry.pre_span_hook(&request("Thing"), &InstrumentationConfig::default());
        assert_eq!(metadata.span_name.as_deref(), Some("second"));
        assert_eq!(metadata.span_kind, Some(SpanKind::Producer));
    }

    #[test]
    fn json_values_map_to_attributes() {
        let values = input(json!({
            "s": "x", "b": true, "i": 10, "f": 1.5, "a": ["p", "q"], "mixed": ["p", 1], "o": {}
        }));
        assert_eq!(attribute_value(&values["s"]), Some("x".into()));
        assert_eq!(attribute_value(&values["b"]), Some(true.into()));
        assert_eq!(attribute_value(&values["i"]), Some(10_i64.into()));
        assert_eq!(attribute_value(&values["f"]), Some(1.5_f64.into()));
        assert_eq!(attribute_value(&values["a"]), Some(string_array(["p", "q"])));
        assert_eq!(attribute_value(&values["mixed"]), None);
        assert_eq!(attribute_value(&values["o"]), None);
    }
}
