// Process-level telemetry bootstrap: a tracer provider with sensible defaults,
// a resource describing the AWS compute platform, the W3C propagator and a
// tracing subscriber bridged into OpenTelemetry.

use std::env;

use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_sdk::{
    Resource,
    propagation::TraceContextPropagator,
    trace::{Sampler, SdkTracer, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::attribute as semco;
use tracing::Subscriber;
use tracing_subscriber::{Layer, registry::LookupSpan, util::TryInitError};

use crate::instrumentation::{INSTRUMENTATION_NAME, INSTRUMENTATION_VERSION};

/// AWS compute platform the process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Lambda,
    Ecs,
    Eks,
    Ec2,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Lambda => "aws_lambda",
            Platform::Ecs => "aws_ecs",
            Platform::Eks => "aws_eks",
            Platform::Ec2 => "aws_ec2",
        }
    }
}

fn region(lookup: &impl Fn(&str) -> Option<String>) -> Option<String> {
    lookup("AWS_REGION").or_else(|| lookup("AWS_DEFAULT_REGION"))
}

/// Most specific platform first; EC2 is assumed for any other process with an AWS region.
pub fn detect_platform(lookup: impl Fn(&str) -> Option<String>) -> Option<Platform> {
    if lookup("AWS_LAMBDA_FUNCTION_NAME").is_some() {
        Some(Platform::Lambda)
    } else if lookup("ECS_CONTAINER_METADATA_URI_V4").is_some()
        || lookup("ECS_CONTAINER_METADATA_URI").is_some()
    {
        Some(Platform::Ecs)
    } else if lookup("KUBERNETES_SERVICE_HOST").is_some() {
        Some(Platform::Eks)
    } else if region(&lookup).is_some() {
        Some(Platform::Ec2)
    } else {
        None
    }
}

fn resource_from(lookup: impl Fn(&str) -> Option<String>) -> Resource {
    let platform = detect_platform(&lookup);
    let mut attributes = vec![
        Some(KeyValue::new(semco::CLOUD_PROVIDER, "aws")),
        platform.map(|platform| KeyValue::new(semco::CLOUD_PLATFORM, platform.as_str())),
        region(&lookup).map(|region| KeyValue::new(semco::CLOUD_REGION, region)),
    ];

    if platform == Some(Platform::Lambda) {
        let function_name = lookup("AWS_LAMBDA_FUNCTION_NAME");
        attributes.extend([
            function_name
                .clone()
                .map(|name| KeyValue::new(semco::FAAS_NAME, name)),
            function_name.map(|name| KeyValue::new(semco::SERVICE_NAME, name)),
            lookup("AWS_LAMBDA_FUNCTION_VERSION")
                .map(|version| KeyValue::new(semco::FAAS_VERSION, version)),
            lookup("AWS_LAMBDA_FUNCTION_MEMORY_SIZE")
                .and_then(|size| size.parse::<i64>().ok())
                .map(|megabytes| KeyValue::new(semco::FAAS_MAX_MEMORY, megabytes * 1024 * 1024)),
            lookup("AWS_LAMBDA_LOG_STREAM_NAME")
                .map(|stream| KeyValue::new(semco::FAAS_INSTANCE, stream)),
        ]);
    }

    Resource::builder()
        .with_attributes(attributes.into_iter().flatten())
        .build()
}

/// Resource describing the detected AWS platform, from environment variables only.
pub fn default_resource() -> Resource {
    resource_from(|name| env::var(name).ok())
}

pub fn default_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
        .with_resource(default_resource())
        .build()
}

/// Installs the default tracer provider and W3C propagator globally, then a
/// tracing subscriber bridging `tracing` spans into that provider.
pub fn default_telemetry_init() -> Result<SdkTracerProvider, TryInitError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let tracer_provider = default_tracer_provider();
    global::set_tracer_provider(tracer_provider.clone());
    global::set_text_map_propagator(TraceContextPropagator::new());

    let tracer = tracer_provider.tracer_with_scope(
        opentelemetry::InstrumentationScope::builder(INSTRUMENTATION_NAME)
            .with_version(INSTRUMENTATION_VERSION)
            .build(),
    );
    tracing_subscriber::registry()
        .with(default_tracing_otel_layer(tracer))
        .with(default_tracing_console_layer())
        .try_init()?;

    Ok(tracer_provider)
}

pub fn default_tracing_otel_layer<S>(tracer: SdkTracer) -> impl Layer<S>
where
    S: Subscriber + for<'any> LookupSpan<'any>,
{
    use tracing::Level;
    use tracing_subscriber::filter::filter_fn;

    tracing_opentelemetry::layer()
        .with_tracer(tracer)
        .with_threads(false)
        .with_filter(filter_fn(|metadata| *metadata.level() <= Level::INFO))
}

pub fn default_tracing_console_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'any> LookupSpan<'any>,
{
    use tracing_subscriber::{filter::EnvFilter, fmt};

    fmt::layer()
        .json()
        .with_target(false)
        .with_ansi(false)
        .with_filter(EnvFilter::from_default_env())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use opentelemetry::{Key, Value};

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn platform_precedence() {
        assert_eq!(detect_platform(lookup(&[])), None);
        assert_eq!(detect_platform(lookup(&[("AWS_REGION", "eu-west-1")])), Some(Platform::Ec2));
        assert_eq!(
            detect_platform(lookup(&[("KUBERNETES_SERVICE_HOST", "10.0.0.1"), ("AWS_REGION", "eu-west-1")])),
            Some(Platform::Eks)
        );
        assert_eq!(
            detect_platform(lookup(&[("ECS_CONTAINER_METADATA_URI", "http://169.254.170.2/v3")])),
            Some(Platform::Ecs)
        );
        assert_eq!(
            detect_platform(lookup(&[
                ("AWS_LAMBDA_FUNCTION_NAME", "resize"),
                ("ECS_CONTAINER_METADATA_URI_V4", "http://169.254.170.2/v4"),
            ])),
            Some(Platform::Lambda)
        );
    }

    #[test]
    fn lambda_resource_attributes() {
        let resource = resource_from(lookup(&[
            ("AWS_LAMBDA_FUNCTION_NAME", "resize"),
            ("AWS_LAMBDA_FUNCTION_VERSION", "$LATEST"),
            ("AWS_LAMBDA_FUNCTION_MEMORY_SIZE", "128"),
            ("AWS_REGION", "us-east-1"),
        ]));
        let get = |key: &'static str| resource.get(&Key::from_static_str(key));
        assert_eq!(get(semco::CLOUD_PLATFORM), Some(Value::from("aws_lambda")));
        assert_eq!(get(semco::CLOUD_REGION), Some(Value::from("us-east-1")));
        assert_eq!(get(semco::FAAS_NAME), Some(Value::from("resize")));
        assert_eq!(get(semco::FAAS_MAX_MEMORY), Some(Value::from(128_i64 * 1024 * 1024)));
        assert_eq!(get(semco::FAAS_INSTANCE), None);
    }

    #[test]
    fn malformed_memory_size_is_skipped() {
        let resource = resource_from(lookup(&[
            ("AWS_LAMBDA_FUNCTION_NAME", "resize"),
            ("AWS_LAMBDA_FUNCTION_MEMORY_SIZE", "lots"),
        ]));
        assert_eq!(resource.get(&Key::from_static_str(semco::FAAS_MAX_MEMORY)), None);
        assert_eq!(
            resource.get(&Key::from_static_str(semco::CLOUD_PROVIDER)),
            Some(Value::from("aws"))
        );
    }
}
