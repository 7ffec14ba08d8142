// DynamoDB attribute extraction: table names, per-operation request
// parameters and the capacity/count figures returned by the service.

use std::time::SystemTime;

use opentelemetry::{Context, KeyValue, global::BoxedTracer, trace::{SpanKind, TraceContextExt}};
use opentelemetry_semantic_conventions::attribute as semco;
use serde_json::Value;

use super::{ResourceExtension, push_attribute, string_array, truthy};
use crate::{
    config::InstrumentationConfig,
    interceptor::utils::safe_execute,
    model::{NormalizedRequest, NormalizedResponse, RequestMetadata},
    semconv::{self, DB_SYSTEM_VALUE_DYNAMODB},
};

const DB_SYSTEM_NAME_VALUE_AWS_DYNAMODB: &str = "aws.dynamodb";

#[derive(Debug, Default, Clone, Copy)]
pub struct DynamoDbExtension;

// Single values are treated as one-element lists, each element serialized as JSON.
fn json_strings(value: &Value) -> opentelemetry::Value {
    match value {
        Value::Array(items) => string_array(items.iter().map(Value::to_string)),
        other => string_array([other.to_string()]),
    }
}

impl ResourceExtension for DynamoDbExtension {
    fn pre_span_hook(
        &self,
        request: &NormalizedRequest,
        config: &InstrumentationConfig,
    ) -> RequestMetadata {
        let operation = request.operation_name.as_str();
        let table_name = request.input_str("TableName");
        let mut attributes = Vec::new();

        if config.db_semconv.emit_old() {
            attributes.push(KeyValue::new(semconv::DB_SYSTEM, DB_SYSTEM_VALUE_DYNAMODB));
            attributes.push(KeyValue::new(semconv::DB_OPERATION, operation.to_owned()));
            if let Some(table_name) = table_name {
                attributes.push(KeyValue::new(semconv::DB_NAME, table_name.to_owned()));
            }
        }
        if config.db_semconv.emit_stable() {
            attributes.push(KeyValue::new(
                semco::DB_SYSTEM_NAME,
                DB_SYSTEM_NAME_VALUE_AWS_DYNAMODB,
            ));
            attributes.push(KeyValue::new(semconv::DB_OPERATION_NAME, operation.to_owned()));
            if let Some(table_name) = table_name {
                attributes.push(KeyValue::new(semconv::DB_NAMESPACE, table_name.to_owned()));
            }
        }

        if let Some(serializer) = &config.dynamodb_statement_serializer {
            let statement = safe_execute("dynamoDBStatementSerializer", || {
                serializer(operation, &request.operation_input)
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

        // Single-table operations name the table; batch operations key their items by table.
        if let Some(table_name) = table_name.filter(|name| !name.is_empty()) {
            attributes.push(KeyValue::new(
                semco::AWS_DYNAMODB_TABLE_NAMES,
                string_array([table_name]),
            ));
        } else if let Some(items) = request.input("RequestItems").and_then(Value::as_object) {
            attributes.push(KeyValue::new(
                semco::AWS_DYNAMODB_TABLE_NAMES,
                string_array(items.keys().cloned()),
            ));
        }

        let input = |key: &str| truthy(request.input(key));

        if matches!(operation, "CreateTable" | "UpdateTable") {
            if let Some(throughput) = input("ProvisionedThroughput") {
                push_attribute(
                    &mut attributes,
                    semconv::AWS_DYNAMODB_PROVISIONED_READ_CAPACITY,
                    throughput.get("ReadCapacityUnits"),
                );
                push_attribute(
                    &mut attributes,
                    semconv::AWS_DYNAMODB_PROVISIONED_WRITE_CAPACITY,
                    throughput.get("WriteCapacityUnits"),
                );
            }
        }

        if matches!(operation, "GetItem" | "Scan" | "Query") {
            push_attribute(&mut attributes, semconv::AWS_DYNAMODB_CONSISTENT_READ, input("ConsistentRead"));
        }

        if matches!(operation, "Query" | "Scan") {
            push_attribute(&mut attributes, semconv::AWS_DYNAMODB_PROJECTION, input("ProjectionExpression"));
        }

        if operation == "CreateTable" {
            if let Some(indexes) = input("GlobalSecondaryIndexes") {
                attributes.push(KeyValue::new(
                    semconv::AWS_DYNAMODB_GLOBAL_SECONDARY_INDEXES,
                    json_strings(indexes),
                ));
            }
            if let Some(indexes) = input("LocalSecondaryIndexes") {
                attributes.push(KeyValue::new(
                    semconv::AWS_DYNAMODB_LOCAL_SECONDARY_INDEXES,
                    json_strings(indexes),
                ));
            }
        }

        if matches!(operation, "ListTables" | "Query" | "Scan") {
            push_attribute(&mut attributes, semconv::AWS_DYNAMODB_LIMIT, input("Limit"));
        }

        if operation == "ListTables" {
            push_attribute(
                &mut attributes,
                semconv::AWS_DYNAMODB_EXCLUSIVE_START_TABLE,
                input("ExclusiveStartTableName"),
            );
        }

        if operation == "Query" {
            push_attribute(&mut attributes, semconv::AWS_DYNAMODB_SCAN_FORWARD, input("ScanIndexForward"));
        }

        if operation == "Scan" {
            push_attribute(&mut attributes, semconv::AWS_DYNAMODB_SEGMENT, input("Segment"));
            push_attribute(&mut attributes, semconv::AWS_DYNAMODB_TOTAL_SEGMENTS, input("TotalSegments"));
        }

        if matches!(operation, "Query" | "Scan") {
            push_attribute(&mut attributes, semconv::AWS_DYNAMODB_INDEX_NAME, input("IndexName"));
            push_attribute(&mut attributes, semconv::AWS_DYNAMODB_SELECT, input("Select"));
        }

        if operation == "UpdateTable" {
            if let Some(definitions) = input("AttributeDefinitions") {
                attributes.push(KeyValue::new(
                    semconv::AWS_DYNAMODB_ATTRIBUTE_DEFINITIONS,
                    json_strings(definitions),
                ));
            }
            if let Some(updates) = input("GlobalSecondaryIndexUpdates") {
                attributes.push(KeyValue::new(
                    semconv::AWS_DYNAMODB_GLOBAL_SECONDARY_INDEX_UPDATES,
                    json_strings(updates),
                ));
            }
        }

        RequestMetadata {
            span_attributes: attributes,
            span_kind: Some(SpanKind::Client),
            ..Default::default()
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
        let span = context.span();
        let data = |key: &str| truthy(response.data.get(key));

        if let Some(capacity) = data("ConsumedCapacity") {
            span.set_attribute(KeyValue::new(
                semconv::AWS_DYNAMODB_CONSUMED_CAPACITY,
                json_strings(capacity),
            ));
        }
        if let Some(metrics) = data("ItemCollectionMetrics") {
            span.set_attribute(KeyValue::new(
                semconv::AWS_DYNAMODB_ITEM_COLLECTION_METRICS,
                json_strings(metrics),
            ));
        }
        if let Some(tables) = data("TableNames").and_then(Value::as_array) {
            span.set_attribute(KeyValue::new(
                semconv::AWS_DYNAMODB_TABLE_COUNT,
                tables.len() as i64,
            ));
        }
        if let Some(count) = data("Count").and_then(Value::as_i64) {
            span.set_attribute(KeyValue::new(semconv::AWS_DYNAMODB_COUNT, count));
        }
        if let Some(count) = data("ScannedCount").and_then(Value::as_i64) {
            span.set_attribute(KeyValue::new(semconv::AWS_DYNAMODB_SCANNED_COUNT, count));
        }
    }
}
