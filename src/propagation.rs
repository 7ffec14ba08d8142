// Trace-context carriers over message attribute maps (`{"DataType": "String",
// "StringValue": ..}`), with the broker-side attribute count limit applied.

use opentelemetry::{
    Context, global,
    propagation::{Extractor, Injector, TextMapPropagator},
};
use serde_json::{Map, Value, json};

// SQS and SNS both reject messages with more than ten attributes.
pub const MAX_MESSAGE_ATTRIBUTES: usize = 10;

/// Writes propagation fields as string message attributes.
pub struct ContextSetter<'a>(pub &'a mut Map<String, Value>);

impl Injector for ContextSetter<'_> {
    fn set(&mut self, key: &str, value: String) {
        // brokers reject attributes with empty values, e.g. a blank `tracestate`
        if value.is_empty() {
            return;
        }
        self.0.insert(
            key.to_owned(),
            json!({ "DataType": "String", "StringValue": value }),
        );
    }
}

/// Reads propagation fields back; SNS-to-SQS deliveries use `Value` instead of `StringValue`.
pub struct ContextGetter<'a>(pub &'a Map<String, Value>);

impl Extractor for ContextGetter<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        let attribute = self.0.get(key)?.as_object()?;
        attribute
            .get("StringValue")
            .or_else(|| attribute.get("Value"))?
            .as_str()
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Propagation field names of the global propagator.
pub fn propagation_fields() -> Vec<String> {
    global::get_text_map_propagator(|propagator| {
        propagator.fields().map(str::to_owned).collect()
    })
}

/// Injects the current context into `carrier` unless doing so could exceed the
/// attribute limit.
pub fn inject_propagation_context(carrier: &mut Map<String, Value>) -> &mut Map<String, Value> {
    let context = Context::current();
    global::get_text_map_propagator(|propagator| {
        inject_with(propagator, &context, carrier);
    });
    carrier
}

/// Injects into a message's `MessageAttributes`, creating the map when absent.
pub fn inject_message_attributes(message: &mut Map<String, Value>) {
    let mut attributes = match message.remove("MessageAttributes") {
        Some(Value::Object(attributes)) => attributes,
        _ => Map::new(),
    };
    inject_propagation_context(&mut attributes);
    message.insert("MessageAttributes".to_owned(), Value::Object(attributes));
}

/// Returns whether the context was injected.
pub fn inject_with(
    propagator: &dyn TextMapPropagator,
    context: &Context,
    carrier: &mut Map<String, Value>,
) -> bool {
    let mut fields = Map::new();
    propagator.inject_context(context, &mut ContextSetter(&mut fields));
    let added = fields.keys().filter(|key| !carrier.contains_key(*key)).count();
    if carrier.len() + added > MAX_MESSAGE_ATTRIBUTES {
        log::warn!(
            "aws-sdk instrumentation: cannot set context propagation on message attributes: \
             {} attributes already present, limit is {MAX_MESSAGE_ATTRIBUTES}",
            carrier.len()
        );
        return false;
    }
    carrier.extend(fields);
    true
}

/// Selects the attribute map to extract a message's context from.
///
/// With `extract_from_payload`, a message whose own attributes carry no
/// propagation field is read from the `MessageAttributes` of its JSON body
/// instead; `None` when the body has none.
pub fn extract_propagation_context(
    message: &Value,
    extract_from_payload: bool,
) -> Option<Map<String, Value>> {
    let attributes = message.get("MessageAttributes").and_then(Value::as_object);

    if !extract_from_payload {
        return attributes.cloned();
    }
    let fields = propagation_fields();
    let carries_context = |attributes: &&Map<String, Value>| {
        attributes.keys().any(|key| fields.contains(key))
    };
    if let Some(attributes) = attributes.filter(carries_context) {
        return Some(attributes.clone());
    }
    let Some(body) = message.get("Body").and_then(Value::as_str) else {
        return attributes.cloned();
    };
    match serde_json::from_str::<Value>(body) {
        Ok(payload) => payload
            .get("MessageAttributes")
            .and_then(Value::as_object)
            .cloned(),
        Err(err) => {
            log::debug!(
                "aws-sdk instrumentation: failed to parse message payload to extract context propagation, trace might be incomplete: {err}"
            );
            attributes.cloned()
        }
    }
}

/// Extracts a context from a message attribute map with the global propagator.
pub fn extract_context(carrier: &Map<String, Value>) -> Context {
    global::get_text_map_propagator(|propagator| {
        propagator.extract_with_context(&Context::new(), &ContextGetter(carrier))
    })
}

/// Merges requested attribute names with the propagation fields, keeping
/// first-seen order and dropping duplicates.
pub fn add_propagation_fields_to_attribute_names(
    requested: &[String],
    propagation_fields: &[String],
) -> Vec<String> {
    if requested.is_empty() {
        return propagation_fields.to_vec();
    }
    let mut names: Vec<String> = Vec::with_capacity(requested.len() + propagation_fields.len());
    for name in requested.iter().chain(propagation_fields) {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    names
}
