// Instrumentation entry point: owns the tracer, meter, config and extension
// registry, and describes every hook point it can install as a module
// definition for the module-loading glue to apply and remove.

use std::{
    any::Any,
    fmt,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use opentelemetry::{
    InstrumentationScope, global,
    global::BoxedTracer,
    metrics::{Meter, MeterProvider},
    trace::{Tracer, TracerProvider},
};
use semver::{Version, VersionReq};

use crate::{
    config::InstrumentationConfig,
    error::PatchError,
    extensions::{ExtensionRegistry, ResourceExtension},
    interceptor::{
        RequestInterceptor,
        driver::{ConnectionModule, DriverInstrumentation, SessionPoolModule},
        legacy::{LegacyInstrumentation, LegacySdkModule},
        stack::{MiddlewareStackModule, SmithyClientModule, StackInstrumentation},
    },
};

pub const INSTRUMENTATION_NAME: &str = env!("CARGO_PKG_NAME");
pub const INSTRUMENTATION_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const MODULE_SMITHY_MIDDLEWARE_STACK: &str = "smithy-middleware-stack";
pub const MODULE_SMITHY_CLIENT: &str = "smithy-client";
pub const MODULE_AWS_SDK_V2: &str = "aws-sdk-v2";
pub const MODULE_MONGODB: &str = "mongodb";
pub const MODULE_MONGODB_SESSIONS: &str = "mongodb-sessions";

/// What the host hands a patch function: the loaded module's exports.
pub type ModuleExports = dyn Any + Send + Sync;
pub type PatchFn =
    Box<dyn Fn(&ModuleExports, Option<&Version>) -> Result<(), PatchError> + Send + Sync>;
pub type UnpatchFn = Box<dyn Fn(&ModuleExports) -> Result<(), PatchError> + Send + Sync>;

/// One installable hook point and the library versions it applies to.
pub struct InstrumentationModuleDefinition {
    pub name: &'static str,
    pub supported_versions: VersionReq,
    pub patch: PatchFn,
    pub unpatch: UnpatchFn,
}

impl fmt::Debug for InstrumentationModuleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentationModuleDefinition")
            .field("name", &self.name)
            .field("supported_versions", &self.supported_versions.to_string())
            .finish_non_exhaustive()
    }
}

impl InstrumentationModuleDefinition {
    pub fn supports(&self, version: &Version) -> bool {
        self.supported_versions.matches(version)
    }

    /// Patches `exports` when `version` is supported; returns whether it did.
    pub fn apply(&self, exports: &ModuleExports, version: &Version) -> Result<bool, PatchError> {
        if !self.supports(version) {
            log::debug!(
                "aws-sdk instrumentation: {} {version} is outside {}, not patching",
                self.name,
                self.supported_versions
            );
            return Ok(false);
        }
        (self.patch)(exports, Some(version))?;
        Ok(true)
    }

    pub fn remove(&self, exports: &ModuleExports) -> Result<(), PatchError> {
        (self.unpatch)(exports)
    }
}

fn exports<'a, T: 'static>(
    exports: &'a ModuleExports,
    module: &'static str,
) -> Result<&'a T, PatchError> {
    exports
        .downcast_ref::<T>()
        .ok_or(PatchError::UnexpectedExports { module })
}

fn version_req(requirement: &str) -> VersionReq {
    VersionReq::parse(requirement).unwrap_or(VersionReq::STAR)
}

fn scope() -> InstrumentationScope {
    InstrumentationScope::builder(INSTRUMENTATION_NAME)
        .with_version(INSTRUMENTATION_VERSION)
        .build()
}

// The AWS client interceptor and the database driver interceptor share
// everything but their RPC attributes.
struct Interceptors {
    aws: Arc<RequestInterceptor>,
    driver: Arc<RequestInterceptor>,
}

pub struct AwsInstrumentation {
    config: InstrumentationConfig,
    registry: ExtensionRegistry,
    tracer: Option<Arc<BoxedTracer>>,
    meter: Option<Meter>,
    enabled: Arc<AtomicBool>,
    interceptors: OnceLock<Interceptors>,
}

impl fmt::Debug for AwsInstrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsInstrumentation")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Default for AwsInstrumentation {
    fn default() -> Self {
        Self::new()
    }
}

impl AwsInstrumentation {
    pub fn new() -> Self {
        Self {
            config: InstrumentationConfig::default(),
            registry: ExtensionRegistry::with_default_extensions(),
            tracer: None,
            meter: None,
            enabled: Arc::new(AtomicBool::new(true)),
            interceptors: OnceLock::new(),
        }
    }

    pub fn with_config(mut self, config: InstrumentationConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers `extension` for `resource_name`, replacing the default one if any.
    pub fn with_extension<E>(mut self, resource_name: impl Into<String>, extension: E) -> Self
    where
        E: ResourceExtension + 'static,
    {
        self.registry.register(resource_name, extension);
        self
    }

    pub fn with_tracer_provider<P>(mut self, provider: &P) -> Self
    where
        P: TracerProvider,
        P::Tracer: Send + Sync + 'static,
        <P::Tracer as Tracer>::Span: Send + Sync + 'static,
    {
        let tracer = provider.tracer_with_scope(scope());
        self.tracer = Some(Arc::new(BoxedTracer::new(Box::new(tracer))));
        self
    }

    pub fn with_meter_provider<M: MeterProvider>(mut self, provider: &M) -> Self {
        self.meter = Some(provider.meter_with_scope(scope()));
        self
    }

    pub fn config(&self) -> &InstrumentationConfig {
        &self.config
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Patched entry points stay installed but pass calls straight through.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn interceptors(&self) -> &Interceptors {
        self.interceptors.get_or_init(|| {
            let config = Arc::new(self.config.clone());
            let registry = Arc::new(self.registry.clone());
            let tracer = self
                .tracer
                .clone()
                .unwrap_or_else(|| Arc::new(global::tracer_with_scope(scope())));
            let meter = self
                .meter
                .clone()
                .unwrap_or_else(|| global::meter_with_scope(scope()));
            let aws = RequestInterceptor::new(
                Arc::clone(&config),
                Arc::clone(&registry),
                Arc::clone(&tracer),
                meter.clone(),
            )
            .with_enabled_flag(Arc::clone(&self.enabled));
            let driver = RequestInterceptor::new(config, registry, tracer, meter)
                .with_rpc_system(None)
                .with_enabled_flag(Arc::clone(&self.enabled));
            Interceptors {
                aws: Arc::new(aws),
                driver: Arc::new(driver),
            }
        })
    }

    /// Every hook point this instrumentation can install.
    pub fn init(&self) -> Vec<InstrumentationModuleDefinition> {
        let interceptors = self.interceptors();
        let stack = StackInstrumentation::new(Arc::clone(&interceptors.aws));
        let legacy = LegacyInstrumentation::new(Arc::clone(&interceptors.aws));
        let driver = DriverInstrumentation::new(Arc::clone(&interceptors.driver));
        let sessions = driver.clone();
        let client = stack.clone();

        vec![
            InstrumentationModuleDefinition {
                name: MODULE_SMITHY_MIDDLEWARE_STACK,
                supported_versions: version_req(">=2.0.0"),
                patch: Box::new(move |module: &ModuleExports, version: Option<&Version>| {
                    let module = exports::<MiddlewareStackModule>(module, MODULE_SMITHY_MIDDLEWARE_STACK)?;
                    stack
                        .clone()
                        .with_module_version(version.map(ToString::to_string))
                        .patch_stack_module(module)
                }),
                unpatch: Box::new(|module: &ModuleExports| {
                    let module = exports::<MiddlewareStackModule>(module, MODULE_SMITHY_MIDDLEWARE_STACK)?;
                    StackInstrumentation::unpatch_stack_module(module)
                }),
            },
            InstrumentationModuleDefinition {
                name: MODULE_SMITHY_CLIENT,
                supported_versions: version_req(">=1.0.3"),
                patch: Box::new(move |module: &ModuleExports, _version: Option<&Version>| {
                    let module = exports::<SmithyClientModule>(module, MODULE_SMITHY_CLIENT)?;
                    client.patch_client_module(module)
                }),
                unpatch: Box::new(|module: &ModuleExports| {
                    let module = exports::<SmithyClientModule>(module, MODULE_SMITHY_CLIENT)?;
                    StackInstrumentation::unpatch_client_module(module)
                }),
            },
            InstrumentationModuleDefinition {
                name: MODULE_AWS_SDK_V2,
                supported_versions: version_req(">=2.308.0, <3"),
                patch: Box::new(move |module: &ModuleExports, version: Option<&Version>| {
                    let module = exports::<LegacySdkModule>(module, MODULE_AWS_SDK_V2)?;
                    legacy
                        .clone()
                        .with_module_version(version.map(ToString::to_string))
                        .patch(module)
                }),
                unpatch: Box::new(|module: &ModuleExports| {
                    let module = exports::<LegacySdkModule>(module, MODULE_AWS_SDK_V2)?;
                    LegacyInstrumentation::unpatch(module)
                }),
            },
            InstrumentationModuleDefinition {
                name: MODULE_MONGODB,
                supported_versions: version_req(">=4.0.0, <7"),
                patch: Box::new(move |module: &ModuleExports, version: Option<&Version>| {
                    let module = exports::<ConnectionModule>(module, MODULE_MONGODB)?;
                    driver
                        .clone()
                        .with_module_version(version.map(ToString::to_string))
                        .patch(module)
                }),
                unpatch: Box::new(|module: &ModuleExports| {
                    let module = exports::<ConnectionModule>(module, MODULE_MONGODB)?;
                    DriverInstrumentation::unpatch(module)
                }),
            },
            InstrumentationModuleDefinition {
                name: MODULE_MONGODB_SESSIONS,
                supported_versions: version_req(">=4.0.0, <7"),
                patch: Box::new(move |module: &ModuleExports, _version: Option<&Version>| {
                    let module = exports::<Arc<SessionPoolModule>>(module, MODULE_MONGODB_SESSIONS)?;
                    sessions.patch_sessions(module)
                }),
                unpatch: Box::new(|module: &ModuleExports| {
                    let module = exports::<Arc<SessionPoolModule>>(module, MODULE_MONGODB_SESSIONS)?;
                    DriverInstrumentation::unpatch_sessions(module)
                }),
            },
        ]
    }

    /// Interceptor to register on a Rust AWS SDK client config.
    #[cfg(feature = "smithy")]
    pub fn smithy_interceptor(&self) -> crate::interceptor::smithy::SmithyInterceptor {
        crate::interceptor::smithy::SmithyInterceptor::new(Arc::clone(&self.interceptors().aws))
    }

    /// Starts the consumer span for processing one received SQS message.
    ///
    /// The returned context carries the span; end it once the message is handled.
    #[cfg(feature = "extract-sqs")]
    pub fn start_sqs_process_span(
        &self,
        queue_url: Option<&str>,
        message: &serde_json::Value,
    ) -> opentelemetry::Context {
        let interceptor = &self.interceptors().aws;
        crate::extensions::sqs::start_process_span(
            interceptor.tracer(),
            interceptor.config(),
            queue_url,
            message,
        )
    }
}
