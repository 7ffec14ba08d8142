// Attribute keys and values that are either unstable or deprecated upstream and
// therefore pinned here. Stable keys come from `opentelemetry_semantic_conventions`.

// Legacy client request descriptor.
pub const AWS_OPERATION: &str = "aws.operation";
pub const AWS_SIGNATURE_VERSION: &str = "aws.signature.version";
pub const AWS_SERVICE_API: &str = "aws.service.api";
pub const AWS_SERVICE_IDENTIFIER: &str = "aws.service.identifier";
pub const AWS_SERVICE_NAME: &str = "aws.service.name";
pub const AWS_REQUEST_ID: &str = "aws.request.id";
pub const AWS_REQUEST_EXTENDED_ID: &str = "aws.request.extended_id";

pub const AWS_S3_BUCKET: &str = "aws.s3.bucket";
pub const AWS_SNS_TOPIC_ARN: &str = "aws.sns.topic.arn";
pub const AWS_SECRETSMANAGER_SECRET_ARN: &str = "aws.secretsmanager.secret.arn";
pub const AWS_STEP_FUNCTIONS_ACTIVITY_ARN: &str = "aws.step_functions.activity.arn";
pub const AWS_STEP_FUNCTIONS_STATE_MACHINE_ARN: &str = "aws.step_functions.state_machine.arn";

// HTTP, old scheme.
pub const HTTP_STATUS_CODE: &str = "http.status_code";

// Messaging.
pub const MESSAGING_SYSTEM: &str = "messaging.system";
pub const MESSAGING_DESTINATION_NAME: &str = "messaging.destination.name";
pub const MESSAGING_MESSAGE_ID: &str = "messaging.message.id";
pub const MESSAGING_OPERATION_TYPE: &str = "messaging.operation.type";
pub const MESSAGING_BATCH_MESSAGE_COUNT: &str = "messaging.batch.message_count";
pub const MESSAGING_SYSTEM_VALUE_AWS_SQS: &str = "aws_sqs";
pub const MESSAGING_SYSTEM_VALUE_AWS_SNS: &str = "aws.sns";

// Database, old scheme.
pub const DB_SYSTEM: &str = "db.system";
pub const DB_NAME: &str = "db.name";
pub const DB_OPERATION: &str = "db.operation";
pub const DB_STATEMENT: &str = "db.statement";
pub const DB_CONNECTION_STRING: &str = "db.connection_string";
pub const DB_MONGODB_COLLECTION: &str = "db.mongodb.collection";
pub const NET_PEER_NAME: &str = "net.peer.name";
pub const NET_PEER_PORT: &str = "net.peer.port";

// Database, stable scheme.
pub const DB_NAMESPACE: &str = "db.namespace";
pub const DB_OPERATION_NAME: &str = "db.operation.name";
pub const DB_COLLECTION_NAME: &str = "db.collection.name";
pub const DB_QUERY_TEXT: &str = "db.query.text";

pub const DB_SYSTEM_VALUE_DYNAMODB: &str = "dynamodb";
pub const DB_SYSTEM_VALUE_MONGODB: &str = "mongodb";

// DynamoDB.
pub const AWS_DYNAMODB_ATTRIBUTE_DEFINITIONS: &str = "aws.dynamodb.attribute_definitions";
pub const AWS_DYNAMODB_CONSISTENT_READ: &str = "aws.dynamodb.consistent_read";
pub const AWS_DYNAMODB_CONSUMED_CAPACITY: &str = "aws.dynamodb.consumed_capacity";
pub const AWS_DYNAMODB_COUNT: &str = "aws.dynamodb.count";
pub const AWS_DYNAMODB_EXCLUSIVE_START_TABLE: &str = "aws.dynamodb.exclusive_start_table";
pub const AWS_DYNAMODB_GLOBAL_SECONDARY_INDEX_UPDATES: &str =
    "aws.dynamodb.global_secondary_index_updates";
pub const AWS_DYNAMODB_GLOBAL_SECONDARY_INDEXES: &str = "aws.dynamodb.global_secondary_indexes";
pub const AWS_DYNAMODB_INDEX_NAME: &str = "aws.dynamodb.index_name";
pub const AWS_DYNAMODB_ITEM_COLLECTION_METRICS: &str = "aws.dynamodb.item_collection_metrics";
pub const AWS_DYNAMODB_LIMIT: &str = "aws.dynamodb.limit";
pub const AWS_DYNAMODB_LOCAL_SECONDARY_INDEXES: &str = "aws.dynamodb.local_secondary_indexes";
pub const AWS_DYNAMODB_PROJECTION: &str = "aws.dynamodb.projection";
pub const AWS_DYNAMODB_PROVISIONED_READ_CAPACITY: &str = "aws.dynamodb.provisioned_read_capacity";
pub const AWS_DYNAMODB_PROVISIONED_WRITE_CAPACITY: &str =
    "aws.dynamodb.provisioned_write_capacity";
pub const AWS_DYNAMODB_SCAN_FORWARD: &str = "aws.dynamodb.scan_forward";
pub const AWS_DYNAMODB_SCANNED_COUNT: &str = "aws.dynamodb.scanned_count";
pub const AWS_DYNAMODB_SEGMENT: &str = "aws.dynamodb.segment";
pub const AWS_DYNAMODB_SELECT: &str = "aws.dynamodb.select";
pub const AWS_DYNAMODB_TABLE_COUNT: &str = "aws.dynamodb.table_count";
pub const AWS_DYNAMODB_TOTAL_SEGMENTS: &str = "aws.dynamodb.total_segments";

// FaaS client side.
pub const FAAS_INVOKED_NAME: &str = "faas.invoked_name";
pub const FAAS_INVOKED_PROVIDER: &str = "faas.invoked_provider";
pub const FAAS_INVOKED_REGION: &str = "faas.invoked_region";
pub const FAAS_EXECUTION: &str = "faas.execution";

// Generative AI.
pub const GEN_AI_OPERATION_NAME: &str = "gen_ai.operation.name";
pub const GEN_AI_REQUEST_MAX_TOKENS: &str = "gen_ai.request.max_tokens";
pub const GEN_AI_REQUEST_MODEL: &str = "gen_ai.request.model";
pub const GEN_AI_REQUEST_STOP_SEQUENCES: &str = "gen_ai.request.stop_sequences";
pub const GEN_AI_REQUEST_TEMPERATURE: &str = "gen_ai.request.temperature";
pub const GEN_AI_REQUEST_TOP_P: &str = "gen_ai.request.top_p";
pub const GEN_AI_RESPONSE_FINISH_REASONS: &str = "gen_ai.response.finish_reasons";
pub const GEN_AI_SYSTEM: &str = "gen_ai.system";
pub const GEN_AI_TOKEN_TYPE: &str = "gen_ai.token.type";
pub const GEN_AI_USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";
pub const GEN_AI_USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";

pub const GEN_AI_OPERATION_NAME_VALUE_CHAT: &str = "chat";
pub const GEN_AI_SYSTEM_VALUE_AWS_BEDROCK: &str = "aws.bedrock";
pub const GEN_AI_TOKEN_TYPE_VALUE_INPUT: &str = "input";
pub const GEN_AI_TOKEN_TYPE_VALUE_OUTPUT: &str = "output";

pub const METRIC_GEN_AI_CLIENT_OPERATION_DURATION: &str = "gen_ai.client.operation.duration";
pub const METRIC_GEN_AI_CLIENT_TOKEN_USAGE: &str = "gen_ai.client.token.usage";
pub const METRIC_DB_CLIENT_CONNECTIONS_USAGE: &str = "db.client.connections.usage";

// Attributes of `db.client.connections.usage`.
pub const POOL_NAME: &str = "pool.name";
pub const STATE: &str = "state";
