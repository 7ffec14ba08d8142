// DynamoDB snapshots: downcasts the typed input of each supported operation
// and copies out the fields the DynamoDB extension reads.

use aws_sdk_dynamodb::{
    operation::{
        batch_get_item::BatchGetItemInput, batch_write_item::BatchWriteItemInput,
        create_table::CreateTableInput, delete_item::DeleteItemInput,
        delete_table::DeleteTableInput, describe_table::DescribeTableInput,
        get_item::GetItemInput, list_tables::ListTablesInput, put_item::PutItemInput,
        query::QueryInput, scan::ScanInput, update_item::UpdateItemInput,
        update_table::UpdateTableInput,
    },
    types::ProvisionedThroughput,
};
use aws_smithy_runtime_api::client::interceptors::context::Input;
use serde_json::{Map, Value, json};

use crate::model::OperationInput;

fn put(snapshot: &mut OperationInput, key: &str, value: Option<impl Into<Value>>) {
    if let Some(value) = value {
        snapshot.insert(key.to_owned(), value.into());
    }
}

fn throughput(throughput: &ProvisionedThroughput) -> Value {
    json!({
        "ReadCapacityUnits": throughput.read_capacity_units(),
        "WriteCapacityUnits": throughput.write_capacity_units(),
    })
}

// Batch operations only expose their table names through `RequestItems` keys.
fn request_items<'a>(tables: impl Iterator<Item = &'a String>) -> Value {
    Value::Object(
        tables
            .map(|table| (table.clone(), Value::Object(Map::new())))
            .collect(),
    )
}

pub fn snapshot(operation: &str, input: &Input) -> Option<OperationInput> {
    let mut snapshot = OperationInput::new();
    let s = &mut snapshot;
    match operation {
        "GetItem" => {
            let input = input.downcast_ref::<GetItemInput>()?;
            put(s, "TableName", input.table_name());
            put(s, "ConsistentRead", input.consistent_read());
            put(s, "ProjectionExpression", input.projection_expression());
        }
        "PutItem" => put(s, "TableName", input.downcast_ref::<PutItemInput>()?.table_name()),
        "UpdateItem" => put(s, "TableName", input.downcast_ref::<UpdateItemInput>()?.table_name()),
        "DeleteItem" => put(s, "TableName", input.downcast_ref::<DeleteItemInput>()?.table_name()),
        "DeleteTable" => put(s, "TableName", input.downcast_ref::<DeleteTableInput>()?.table_name()),
        "DescribeTable" => {
            put(s, "TableName", input.downcast_ref::<DescribeTableInput>()?.table_name())
        }
        "Query" => {
            let input = input.downcast_ref::<QueryInput>()?;
            put(s, "TableName", input.table_name());
            put(s, "IndexName", input.index_name());
            put(s, "Limit", input.limit());
            put(s, "ScanIndexForward", input.scan_index_forward());
            put(s, "ConsistentRead", input.consistent_read());
            put(s, "ProjectionExpression", input.projection_expression());
            put(s, "Select", input.select().map(|select| select.as_str()));
        }
        "Scan" => {
            let input = input.downcast_ref::<ScanInput>()?;
            put(s, "TableName", input.table_name());
            put(s, "IndexName", input.index_name());
            put(s, "Limit", input.limit());
            put(s, "Segment", input.segment());
            put(s, "TotalSegments", input.total_segments());
            put(s, "ConsistentRead", input.consistent_read());
            put(s, "ProjectionExpression", input.projection_expression());
            put(s, "Select", input.select().map(|select| select.as_str()));
        }
        "CreateTable" => {
            let input = input.downcast_ref::<CreateTableInput>()?;
            put(s, "TableName", input.table_name());
            put(s, "ProvisionedThroughput", input.provisioned_throughput().map(throughput));
        }
        "UpdateTable" => {
            let input = input.downcast_ref::<UpdateTableInput>()?;
            put(s, "TableName", input.table_name());
            put(s, "ProvisionedThroughput", input.provisioned_throughput().map(throughput));
        }
        "BatchGetItem" => {
            let input = input.downcast_ref::<BatchGetItemInput>()?;
            put(s, "RequestItems", input.request_items().map(|items| request_items(items.keys())));
        }
        "BatchWriteItem" => {
            let input = input.downcast_ref::<BatchWriteItemInput>()?;
            put(s, "RequestItems", input.request_items().map(|items| request_items(items.keys())));
        }
        "ListTables" => {
            let input = input.downcast_ref::<ListTablesInput>()?;
            put(s, "ExclusiveStartTableName", input.exclusive_start_table_name());
            put(s, "Limit", input.limit());
        }
        _ => return None,
    }
    Some(snapshot)
}
