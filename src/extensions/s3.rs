// S3 attribute extraction: the bucket the call targets.

use opentelemetry::{KeyValue, trace::SpanKind};

use super::ResourceExtension;
use crate::{
    config::InstrumentationConfig,
    model::{NormalizedRequest, RequestMetadata},
    semconv::AWS_S3_BUCKET,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct S3Extension;

impl ResourceExtension for S3Extension {
    fn pre_span_hook(
        &self,
        request: &NormalizedRequest,
        _config: &InstrumentationConfig,
    ) -> RequestMetadata {
        let span_attributes = request
            .input_str("Bucket")
            .map(|bucket| vec![KeyValue::new(AWS_S3_BUCKET, bucket.to_owned())])
            .unwrap_or_default();
        RequestMetadata {
            span_attributes,
            span_kind: Some(SpanKind::Client),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{model::normalize_request, test_support::input};

    #[test]
    fn bucket_attribute() {
        let request = normalize_request(
            "S3",
            "PutObjectCommand",
            input(json!({"Bucket": "photos", "Key": "a.png"})),
            None,
        );
        let metadata = S3Extension.pre_span_hook(&request, &InstrumentationConfig::default());
        assert_eq!(metadata.span_attributes, vec![KeyValue::new(AWS_S3_BUCKET, "photos")]);
        assert_eq!(metadata.span_kind, Some(SpanKind::Client));
        assert!(metadata.span_name.is_none());
    }

    #[test]
    fn missing_bucket_adds_nothing() {
        let request = normalize_request("S3", "ListBucketsCommand", input(json!({})), None);
        let metadata = S3Extension.pre_span_hook(&request, &InstrumentationConfig::default());
        assert!(metadata.span_attributes.is_empty());
    }
}
