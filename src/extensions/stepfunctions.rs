// Step Functions attribute extraction.

use opentelemetry::KeyValue;

use super::ResourceExtension;
use crate::{
    config::InstrumentationConfig,
    model::{NormalizedRequest, RequestMetadata},
    semconv::{AWS_STEP_FUNCTIONS_ACTIVITY_ARN, AWS_STEP_FUNCTIONS_STATE_MACHINE_ARN},
};

#[derive(Debug, Default, Clone, Copy)]
pub struct StepFunctionsExtension;

impl ResourceExtension for StepFunctionsExtension {
    fn pre_span_hook(
        &self,
        request: &NormalizedRequest,
        _config: &InstrumentationConfig,
    ) -> RequestMetadata {
        let mut span_attributes = Vec::new();
        if let Some(arn) = request.input_str("stateMachineArn") {
            span_attributes.push(KeyValue::new(AWS_STEP_FUNCTIONS_STATE_MACHINE_ARN, arn.to_owned()));
        }
        if let Some(arn) = request.input_str("activityArn") {
            span_attributes.push(KeyValue::new(AWS_STEP_FUNCTIONS_ACTIVITY_ARN, arn.to_owned()));
        }
        RequestMetadata {
            span_attributes,
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
    fn arns_are_recorded() {
        let request = normalize_request(
            "SFN",
            "StartExecutionCommand",
            input(json!({"stateMachineArn": "arn:sm", "activityArn": "arn:act", "input": "{}"})),
            None,
        );
        let metadata = StepFunctionsExtension.pre_span_hook(&request, &InstrumentationConfig::default());
        assert_eq!(
            metadata.span_attributes,
            vec![
                KeyValue::new(AWS_STEP_FUNCTIONS_STATE_MACHINE_ARN, "arn:sm"),
                KeyValue::new(AWS_STEP_FUNCTIONS_ACTIVITY_ARN, "arn:act"),
            ]
        );
    }
}
