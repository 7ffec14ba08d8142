// MongoDB command attributes. The driver interceptor supplies the connection
// half (namespace, peer, connection string); this extension covers what the
// command document itself says.

use std::borrow::Cow;

use opentelemetry::{KeyValue, trace::SpanKind};
use opentelemetry_semantic_conventions::attribute as semco;
use serde_json::{Map, Value};

use super::ResourceExtension;
use crate::{
    config::InstrumentationConfig,
    error::BoxError,
    interceptor::utils::safe_execute,
    model::{NormalizedRequest, OperationInput, RequestMetadata},
    semconv::{self, DB_SYSTEM_VALUE_MONGODB},
};

/// Resource name driver commands are normalized under.
pub const RESOURCE_NAME: &str = DB_SYSTEM_VALUE_MONGODB;

#[derive(Debug, Default, Clone, Copy)]
pub struct MongoDbExtension;

// Commands name their collection as the value of the command key: `{"find": "users", ..}`.
// getMore carries a cursor id there and the collection in its own field.
fn collection_name(request: &NormalizedRequest) -> Option<&str> {
    request
        .input_str(&request.operation_name)
        .or_else(|| request.input_str("collection"))
        .filter(|name| !name.is_empty())
}

// Inserts report their first document and getMore its cursors, rather than the envelope.
fn statement_source(command: &OperationInput) -> Cow<'_, OperationInput> {
    let first_document = command
        .get("documents")
        .and_then(Value::as_array)
        .and_then(|documents| documents.first())
        .and_then(Value::as_object);
    if let Some(document) = first_document {
        return Cow::Borrowed(document);
    }
    match command.get("cursors") {
        Some(Value::Object(cursors)) => Cow::Borrowed(cursors),
        Some(cursors @ Value::Array(_)) => {
            let mut wrapped = Map::new();
            wrapped.insert("cursors".to_owned(), cursors.clone());
            Cow::Owned(wrapped)
        }
        _ => Cow::Borrowed(command),
    }
}

// Keeps the document's shape and replaces every scalar with "?".
fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), redact(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        _ => Value::String("?".to_owned()),
    }
}

/// Statement text for a command when no serializer is configured.
pub fn default_statement(
    command: &OperationInput,
    enhanced_database_reporting: bool,
) -> Result<String, BoxError> {
    if enhanced_database_reporting {
        return Ok(serde_json::to_string(command)?);
    }
    let redacted: Map<String, Value> = command
        .iter()
        .map(|(key, value)| (key.clone(), redact(value)))
        .collect();
    Ok(serde_json::to_string(&redacted)?)
}

fn span_name(config: &InstrumentationConfig, operation: Option<&str>, collection: Option<&str>) -> String {
    if config.db_semconv.emit_stable() {
        let parts: Vec<&str> = operation.into_iter().chain(collection).collect();
        if parts.is_empty() {
            DB_SYSTEM_VALUE_MONGODB.to_owned()
        } else {
            parts.join(" ")
        }
    } else {
        format!("mongodb.{}", operation.unwrap_or("command"))
    }
}

impl ResourceExtension for MongoDbExtension {
    fn pre_span_hook(
        &self,
        request: &NormalizedRequest,
        config: &InstrumentationConfig,
    ) -> RequestMetadata {
        let operation = Some(request.operation_name.as_str()).filter(|op| !op.is_empty());
        let collection = collection_name(request);
        let mut attributes = Vec::new();

        if config.db_semconv.emit_old() {
            attributes.push(KeyValue::new(semconv::DB_SYSTEM, DB_SYSTEM_VALUE_MONGODB));
            if let Some(collection) = collection {
                attributes.push(KeyValue::new(semconv::DB_MONGODB_COLLECTION, collection.to_owned()));
            }
            if let Some(operation) = operation {
                attributes.push(KeyValue::new(semconv::DB_OPERATION, operation.to_owned()));
            }
        }
        if config.db_semconv.emit_stable() {
            attributes.push(KeyValue::new(semco::DB_SYSTEM_NAME, DB_SYSTEM_VALUE_MONGODB));
            if let Some(operation) = operation {
                attributes.push(KeyValue::new(semconv::DB_OPERATION_NAME, operation.to_owned()));
            }
            if let Some(collection) = collection {
                attributes.push(KeyValue::new(semconv::DB_COLLECTION_NAME, collection.to_owned()));
            }
        }

        if !request.operation_input.is_empty() {
            let source = statement_source(&request.operation_input);
            let statement = safe_execute("dbStatementSerializer", || match &config.db_statement_serializer {
                Some(serializer) => serializer(&*source),
                None => default_statement(&*source, config.enhanced_database_reporting),
            });
            if let Some(statement) = statement {
                if config.db_semconv.emit_old() {
                    attributes.push(KeyValue::new(semconv::DB_STATEMENT, statement.clone()));
                }
                if config.db_semconv.emit_stable() {
                    attributes.push(KeyValue::new(semconv::DB_QUERY_TEXT, statement));
                }
            }
        }

        RequestMetadata {
            span_kind: Some(SpanKind::Client),
            span_name: Some(span_name(config, operation, collection)),
            span_attributes: attributes,
            ..Default::default()
        }
    }
}
