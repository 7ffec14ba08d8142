// Secrets Manager attribute extraction: the secret ARN, from the request when
// the secret is addressed by ARN, else from the response.

use std::time::SystemTime;

use opentelemetry::{Context, KeyValue, global::BoxedTracer, trace::TraceContextExt};

use super::ResourceExtension;
use crate::{
    config::InstrumentationConfig,
    model::{NormalizedRequest, NormalizedResponse, RequestMetadata},
    semconv::AWS_SECRETSMANAGER_SECRET_ARN,
};

const SECRET_ARN_PREFIX: &str = "arn:aws:secretsmanager:";

#[derive(Debug, Default, Clone, Copy)]
pub struct SecretsManagerExtension;

impl ResourceExtension for SecretsManagerExtension {
    fn pre_span_hook(
        &self,
        request: &NormalizedRequest,
        _config: &InstrumentationConfig,
    ) -> RequestMetadata {
        let span_attributes = request
            .input_str("SecretId")
            .filter(|id| id.starts_with(SECRET_ARN_PREFIX))
            .map(|arn| vec![KeyValue::new(AWS_SECRETSMANAGER_SECRET_ARN, arn.to_owned())])
            .unwrap_or_default();
        RequestMetadata {
            span_attributes,
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
        if let Some(arn) = response.data_str("ARN") {
            context
                .span()
                .set_attribute(KeyValue::new(AWS_SECRETSMANAGER_SECRET_ARN, arn.to_owned()));
        }
    }
}
