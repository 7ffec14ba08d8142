// Crate root: re-exports and feature-gated module declarations.

pub mod config;
pub mod error;
pub mod extensions;
pub mod instrumentation;
pub mod interceptor;
pub mod model;
pub mod propagation;
pub mod semconv;
pub mod shim;

#[cfg(feature = "telemetry-init")]
pub mod init;

#[cfg(test)]
mod test_support;

pub use config::{InstrumentationConfig, SemconvStability};
pub use error::{ErrorMetadata, PatchError, ServiceError};
pub use extensions::{ExtensionRegistry, ResourceExtension};
pub use instrumentation::{AwsInstrumentation, InstrumentationModuleDefinition};
pub use interceptor::RequestInterceptor;
pub use model::{NormalizedRequest, NormalizedResponse, SdkResponse};
