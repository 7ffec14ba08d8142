// Direct method installation for the MongoDB wire driver: the connection's
// `command` entry point is wrapped, and every command other than the
// connection handshake gets a client span. The server session pool is wrapped
// too, feeding `db.client.connections.usage`.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use futures::future::{BoxFuture, FutureExt};
use opentelemetry::{
    Context, KeyValue,
    metrics::{Meter, UpDownCounter},
    trace::TraceContextExt,
};
use opentelemetry_semantic_conventions::attribute as semco;
use serde_json::Value;

use super::{InterceptedCall, RequestInterceptor};
use crate::{
    config::InstrumentationConfig,
    error::{ErrorMetadata, PatchError},
    model::{NormalizedRequest, OperationInput, SdkResponse},
    semconv::{
        DB_CONNECTION_STRING, DB_NAME, DB_NAMESPACE, DB_SYSTEM_VALUE_MONGODB,
        METRIC_DB_CLIENT_CONNECTIONS_USAGE, NET_PEER_NAME, NET_PEER_PORT, POOL_NAME, STATE,
    },
    shim::Wrappable,
};

/// The server a connection talks to, as `host:port`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub address: Option<String>,
}

impl ConnectionInfo {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
        }
    }

    fn host_and_port(&self) -> Option<(&str, &str)> {
        let mut parts = self.address.as_deref()?.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), None) if !host.is_empty() && !port.is_empty() => {
                Some((host, port))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace {
    pub db: String,
    pub collection: Option<String>,
}

impl Namespace {
    pub fn new(db: impl Into<String>, collection: Option<String>) -> Self {
        Self {
            db: db.into(),
            collection,
        }
    }

    /// Splits `"db.collection"`; anything after the first dot is the collection.
    pub fn parse(namespace: &str) -> Self {
        match namespace.split_once('.') {
            Some((db, collection)) => Self::new(db, Some(collection.to_owned())),
            None => Self::new(namespace, None),
        }
    }
}

/// A command document. Key order is significant: the first key names the command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document(Vec<(String, Value)>);

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Sets `key`, keeping its position when it already exists.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn command_name(&self) -> Option<&str> {
        self.0.first().map(|(key, _)| key.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // Handshakes are sent on every new connection and never traced.
    fn is_handshake(&self) -> bool {
        ["ismaster", "hello"].iter().any(|key| {
            self.get(key)
                .is_some_and(|value| !matches!(value, Value::Null | Value::Bool(false)))
        })
    }

    pub fn to_map(&self) -> OperationInput {
        self.0.iter().cloned().collect()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut document = Self::new();
        for (key, value) in iter {
            document.insert(key, value);
        }
        document
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DriverError {
    #[error("{message}")]
    Server {
        code: i32,
        code_name: Option<String>,
        message: String,
    },
    #[error("connection to {address} failed: {message}")]
    Network { address: String, message: String },
}

impl ErrorMetadata for DriverError {}

pub type CommandFuture = BoxFuture<'static, Result<Value, DriverError>>;
pub type CommandFn = dyn Fn(&ConnectionInfo, &Namespace, Document) -> CommandFuture + Send + Sync;

#[derive(Debug)]
pub struct ConnectionModule {
    pub command: Wrappable<CommandFn>,
}

impl ConnectionModule {
    pub fn new(command: Arc<CommandFn>) -> Self {
        Self {
            command: Wrappable::new("Connection.command", command),
        }
    }
}

/// A server session handed out by the session pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSession {
    pub id: u64,
}

pub type AcquireFn = dyn Fn() -> ServerSession + Send + Sync;
pub type ReleaseFn = dyn Fn(ServerSession) + Send + Sync;
pub type IdleCountFn = dyn Fn() -> usize + Send + Sync;

/// The client's server session pool. `idle` reports how many sessions sit in
/// the pool, which tells a reused session from a freshly created one.
pub struct SessionPoolModule {
    pub acquire: Wrappable<AcquireFn>,
    pub release: Wrappable<ReleaseFn>,
    idle: Arc<IdleCountFn>,
}

impl fmt::Debug for SessionPoolModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPoolModule")
            .field("acquire", &self.acquire)
            .field("release", &self.release)
            .finish_non_exhaustive()
    }
}

impl SessionPoolModule {
    pub fn new(acquire: Arc<AcquireFn>, release: Arc<ReleaseFn>, idle: Arc<IdleCountFn>) -> Self {
        Self {
            acquire: Wrappable::new("ServerSessionPool.acquire", acquire),
            release: Wrappable::new("ServerSessionPool.release", release),
            idle,
        }
    }

    pub fn idle(&self) -> usize {
        (self.idle)()
    }
}

/// `db.client.connections.usage`, keyed by the pool of the last connection seen.
#[derive(Clone)]
struct ConnectionUsage {
    counter: UpDownCounter<i64>,
    pool_name: Arc<Mutex<Option<String>>>,
}

impl ConnectionUsage {
    fn new(meter: &Meter) -> Self {
        Self {
            counter: meter
                .i64_up_down_counter(METRIC_DB_CLIENT_CONNECTIONS_USAGE)
                .with_description(
                    "The number of connections that are currently in state described by the state attribute.",
                )
                .with_unit("{connection}")
                .build(),
            pool_name: Arc::default(),
        }
    }

    fn set_pool_name(&self, connection: &ConnectionInfo, namespace: &Namespace) {
        let Some((host, port)) = connection.host_and_port() else {
            return;
        };
        let name = format!("mongodb://{host}:{port}/{}", namespace.db);
        *self.pool_name.lock().unwrap_or_else(PoisonError::into_inner) = Some(name);
    }

    fn add(&self, delta: i64, state: &'static str) {
        let pool_name = self
            .pool_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut attributes = vec![KeyValue::new(STATE, state)];
        if let Some(pool_name) = pool_name {
            attributes.push(KeyValue::new(POOL_NAME, pool_name));
        }
        self.counter.add(delta, &attributes);
    }
}

#[derive(Clone)]
pub struct DriverInstrumentation {
    interceptor: Arc<RequestInterceptor>,
    module_version: Option<String>,
    connections: ConnectionUsage,
}

impl fmt::Debug for DriverInstrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverInstrumentation")
            .field("module_version", &self.module_version)
            .finish_non_exhaustive()
    }
}

impl DriverInstrumentation {
    /// `interceptor` should carry no RPC system; driver spans are database spans.
    pub fn new(interceptor: Arc<RequestInterceptor>) -> Self {
        let connections = ConnectionUsage::new(interceptor.meter());
        Self {
            interceptor,
            module_version: None,
            connections,
        }
    }

    pub fn with_module_version(mut self, module_version: Option<String>) -> Self {
        self.module_version = module_version;
        self
    }

    pub fn patch(&self, module: &ConnectionModule) -> Result<(), PatchError> {
        let instrumentation = self.clone();
        module.command.wrap(move |original| {
            let command: Arc<CommandFn> = Arc::new(
                move |connection: &ConnectionInfo, namespace: &Namespace, document: Document| {
                    instrumentation.command(&original, connection, namespace, document)
                },
            );
            command
        })
    }

    pub fn unpatch(module: &ConnectionModule) -> Result<(), PatchError> {
        module.command.unwrap()
    }

    /// Counts sessions moving between the `idle` and `used` states.
    pub fn patch_sessions(&self, module: &Arc<SessionPoolModule>) -> Result<(), PatchError> {
        let connections = self.connections.clone();
        let pool = Arc::downgrade(module);
        module.acquire.wrap(move |original| {
            let acquire: Arc<AcquireFn> = Arc::new(move || {
                let Some(pool) = pool.upgrade() else {
                    return original();
                };
                let before = pool.idle();
                let session = original();
                let after = pool.idle();
                if before == after {
                    connections.add(1, "used");
                } else if before == after + 1 {
                    connections.add(-1, "idle");
                    connections.add(1, "used");
                }
                session
            });
            acquire
        })?;

        let connections = self.connections.clone();
        let patched = module.release.wrap(move |original| {
            let release: Arc<ReleaseFn> = Arc::new(move |session: ServerSession| {
                original(session);
                connections.add(-1, "used");
                connections.add(1, "idle");
            });
            release
        });
        if let Err(err) = patched {
            module.acquire.unwrap()?;
            return Err(err);
        }
        Ok(())
    }

    pub fn unpatch_sessions(module: &SessionPoolModule) -> Result<(), PatchError> {
        let acquire = module.acquire.unwrap();
        let release = module.release.unwrap();
        acquire.and(release)
    }

    fn should_trace(&self, document: &Document) -> bool {
        if document.is_handshake() || !self.interceptor.should_intercept() {
            return false;
        }
        !self.interceptor.config().require_parent_span || Context::current().has_active_span()
    }

    fn command(
        &self,
        original: &Arc<CommandFn>,
        connection: &ConnectionInfo,
        namespace: &Namespace,
        document: Document,
    ) -> CommandFuture {
        let ends_sessions = document.command_name() == Some("endSessions");
        self.connections.set_pool_name(connection, namespace);
        let pending = if self.should_trace(&document) {
            self.traced_command(original, connection, namespace, document)
        } else {
            original(connection, namespace, document)
        };
        if !ends_sessions {
            return pending;
        }
        let connections = self.connections.clone();
        async move {
            let result = pending.await;
            connections.add(-1, "idle");
            result
        }
        .boxed()
    }

    fn traced_command(
        &self,
        original: &Arc<CommandFn>,
        connection: &ConnectionInfo,
        namespace: &Namespace,
        document: Document,
    ) -> CommandFuture {
        let request = NormalizedRequest {
            resource_name: DB_SYSTEM_VALUE_MONGODB.to_owned(),
            operation_name: document.command_name().unwrap_or_default().to_owned(),
            operation_input: document.to_map(),
            region: None,
        };
        let call = InterceptedCall::new(request)
            .with_module_version(self.module_version.clone())
            .with_attributes(connection_attributes(
                self.interceptor.config(),
                connection,
                namespace,
            ));

        let original = Arc::clone(original);
        let connection = connection.clone();
        let namespace = namespace.clone();
        let pending = self.interceptor.intercept(call, None, move |_| {
            original(&connection, &namespace, document)
                .map(|result| result.map(SdkResponse::new))
        });
        async move { pending.await.map(|response| response.output) }.boxed()
    }
}

fn connection_attributes(
    config: &InstrumentationConfig,
    connection: &ConnectionInfo,
    namespace: &Namespace,
) -> Vec<KeyValue> {
    let mut attributes = Vec::new();
    let host_and_port = connection.host_and_port();

    if config.db_semconv.emit_old() {
        attributes.push(KeyValue::new(DB_NAME, namespace.db.clone()));
        if let Some((host, port)) = host_and_port {
            attributes.push(KeyValue::new(
                DB_CONNECTION_STRING,
                format!("mongodb://{host}:{port}/{}", namespace.db),
            ));
        }
    }
    if config.db_semconv.emit_stable() {
        attributes.push(KeyValue::new(DB_NAMESPACE, namespace.db.clone()));
    }

    if let Some((host, port)) = host_and_port {
        let port = port.parse::<i64>().ok();
        if config.http_semconv.emit_old() {
            attributes.push(KeyValue::new(NET_PEER_NAME, host.to_owned()));
            if let Some(port) = port {
                attributes.push(KeyValue::new(NET_PEER_PORT, port));
            }
        }
        if config.http_semconv.emit_stable() {
            attributes.push(KeyValue::new(semco::SERVER_ADDRESS, host.to_owned()));
            if let Some(port) = port {
                attributes.push(KeyValue::new(semco::SERVER_PORT, port));
            }
        }
    }
    attributes
}
