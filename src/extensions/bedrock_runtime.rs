// Bedrock Runtime: generative-AI client spans for Converse, ConverseStream and
// InvokeModel, plus the token usage and operation duration histograms.

use std::{
    pin::Pin,
    sync::OnceLock,
    task::{self, Poll},
    time::SystemTime,
};

use futures::{Stream, ready, stream::StreamExt};
use opentelemetry::{
    Context, KeyValue,
    global::BoxedTracer,
    metrics::{Histogram, Meter},
    trace::{SpanRef, TraceContextExt},
};
use serde_json::Value;

use super::{ResourceExtension, attribute_value, push_attribute, string_array};
use crate::{
    config::InstrumentationConfig,
    error::BoxError,
    model::{EventStream, NormalizedRequest, NormalizedResponse, RequestMetadata},
    semconv::{
        GEN_AI_OPERATION_NAME, GEN_AI_OPERATION_NAME_VALUE_CHAT, GEN_AI_REQUEST_MAX_TOKENS,
        GEN_AI_REQUEST_MODEL, GEN_AI_REQUEST_STOP_SEQUENCES, GEN_AI_REQUEST_TEMPERATURE,
        GEN_AI_REQUEST_TOP_P, GEN_AI_RESPONSE_FINISH_REASONS, GEN_AI_SYSTEM,
        GEN_AI_SYSTEM_VALUE_AWS_BEDROCK, GEN_AI_TOKEN_TYPE, GEN_AI_TOKEN_TYPE_VALUE_INPUT,
        GEN_AI_TOKEN_TYPE_VALUE_OUTPUT, GEN_AI_USAGE_INPUT_TOKENS, GEN_AI_USAGE_OUTPUT_TOKENS,
        METRIC_GEN_AI_CLIENT_OPERATION_DURATION, METRIC_GEN_AI_CLIENT_TOKEN_USAGE,
    },
};

const TOKEN_USAGE_BOUNDARIES: [f64; 14] = [
    1.0, 4.0, 16.0, 64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0,
    4194304.0, 16777216.0, 67108864.0,
];

const OPERATION_DURATION_BOUNDARIES: [f64; 14] = [
    0.01, 0.02, 0.04, 0.08, 0.16, 0.32, 0.64, 1.28, 2.56, 5.12, 10.24, 20.48, 40.96, 81.92,
];

// Bedrock prices by approximating one token per six characters.
const CHARS_PER_TOKEN: usize = 6;

#[derive(Clone)]
struct Instruments {
    token_usage: Histogram<u64>,
    operation_duration: Histogram<f64>,
}

#[derive(Default)]
pub struct BedrockRuntimeExtension {
    instruments: OnceLock<Instruments>,
}

impl std::fmt::Debug for BedrockRuntimeExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BedrockRuntimeExtension")
            .field("instruments", &self.instruments.get().is_some())
            .finish()
    }
}

/// How one model family lays out its InvokeModel bodies. Fields are JSON pointers.
#[derive(Debug)]
struct VendorSchema {
    family: &'static str,
    request: &'static [(&'static str, &'static str)],
    // Input whose length approximates the input token count.
    request_text: Option<&'static str>,
    response: &'static [(&'static str, &'static str)],
    // Output whose length approximates the output token count.
    response_text: Option<&'static str>,
    finish_reason: &'static str,
}

// Checked in order; the first family contained in the model id wins.
const VENDORS: &[VendorSchema] = &[
    VendorSchema {
        family: "amazon.titan",
        request: &[
            (GEN_AI_REQUEST_TEMPERATURE, "/textGenerationConfig/temperature"),
            (GEN_AI_REQUEST_TOP_P, "/textGenerationConfig/topP"),
            (GEN_AI_REQUEST_MAX_TOKENS, "/textGenerationConfig/maxTokenCount"),
            (GEN_AI_REQUEST_STOP_SEQUENCES, "/textGenerationConfig/stopSequences"),
        ],
        request_text: None,
        response: &[
            (GEN_AI_USAGE_INPUT_TOKENS, "/inputTextTokenCount"),
            (GEN_AI_USAGE_OUTPUT_TOKENS, "/results/0/tokenCount"),
        ],
        response_text: None,
        finish_reason: "/results/0/completionReason",
    },
    VendorSchema {
        family: "amazon.nova",
        request: &[
            (GEN_AI_REQUEST_TEMPERATURE, "/inferenceConfig/temperature"),
            (GEN_AI_REQUEST_TOP_P, "/inferenceConfig/top_p"),
            (GEN_AI_REQUEST_MAX_TOKENS, "/inferenceConfig/max_new_tokens"),
            (GEN_AI_REQUEST_STOP_SEQUENCES, "/inferenceConfig/stopSequences"),
        ],
        request_text: None,
        response: &[
            (GEN_AI_USAGE_INPUT_TOKENS, "/usage/inputTokens"),
            (GEN_AI_USAGE_OUTPUT_TOKENS, "/usage/outputTokens"),
        ],
        response_text: None,
        finish_reason: "/stopReason",
    },
    VendorSchema {
        family: "anthropic.claude",
        request: &[
            (GEN_AI_REQUEST_MAX_TOKENS, "/max_tokens"),
            (GEN_AI_REQUEST_TEMPERATURE, "/temperature"),
            (GEN_AI_REQUEST_TOP_P, "/top_p"),
            (GEN_AI_REQUEST_STOP_SEQUENCES, "/stop_sequences"),
        ],
        request_text: None,
        response: &[
            (GEN_AI_USAGE_INPUT_TOKENS, "/usage/input_tokens"),
            (GEN_AI_USAGE_OUTPUT_TOKENS, "/usage/output_tokens"),
        ],
        response_text: None,
        finish_reason: "/stop_reason",
    },
    VendorSchema {
        family: "meta.llama",
        request: &[
            (GEN_AI_REQUEST_MAX_TOKENS, "/max_gen_len"),
            (GEN_AI_REQUEST_TEMPERATURE, "/temperature"),
            (GEN_AI_REQUEST_TOP_P, "/top_p"),
        ],
        request_text: None,
        response: &[
            (GEN_AI_USAGE_INPUT_TOKENS, "/prompt_token_count"),
            (GEN_AI_USAGE_OUTPUT_TOKENS, "/generation_token_count"),
        ],
        response_text: None,
        finish_reason: "/stop_reason",
    },
    VendorSchema {
        family: "cohere.command-r",
        request: &[
            (GEN_AI_REQUEST_MAX_TOKENS, "/max_tokens"),
            (GEN_AI_REQUEST_TEMPERATURE, "/temperature"),
            (GEN_AI_REQUEST_TOP_P, "/p"),
            (GEN_AI_REQUEST_STOP_SEQUENCES, "/stop_sequences"),
        ],
        request_text: Some("/message"),
        response: &[],
        response_text: Some("/text"),
        finish_reason: "/finish_reason",
    },
    VendorSchema {
        family: "cohere.command",
        request: &[
            (GEN_AI_REQUEST_MAX_TOKENS, "/max_tokens"),
            (GEN_AI_REQUEST_TEMPERATURE, "/temperature"),
            (GEN_AI_REQUEST_TOP_P, "/p"),
            (GEN_AI_REQUEST_STOP_SEQUENCES, "/stop_sequences"),
        ],
        request_text: Some("/prompt"),
        response: &[],
        response_text: Some("/generations/0/text"),
        finish_reason: "/generations/0/finish_reason",
    },
    VendorSchema {
        family: "mistral",
        request: &[
            (GEN_AI_REQUEST_MAX_TOKENS, "/max_tokens"),
            (GEN_AI_REQUEST_TEMPERATURE, "/temperature"),
            (GEN_AI_REQUEST_TOP_P, "/top_p"),
            (GEN_AI_REQUEST_STOP_SEQUENCES, "/stop"),
        ],
        request_text: Some("/prompt"),
        response: &[],
        response_text: Some("/outputs/0/text"),
        finish_reason: "/outputs/0/stop_reason",
    },
];

fn vendor_schema(model_id: &str) -> Option<&'static VendorSchema> {
    VENDORS.iter().find(|vendor| model_id.contains(vendor.family))
}

/// Token count approximation for bodies that carry only text.
pub fn approximate_tokens(text: &str) -> i64 {
    let chars = text.encode_utf16().count();
    i64::try_from(chars.div_ceil(CHARS_PER_TOKEN)).unwrap_or(i64::MAX)
}

// InvokeModel bodies travel either as JSON text or as raw bytes.
fn json_body(body: &Value) -> Option<Value> {
    let parsed = match body {
        Value::String(text) => serde_json::from_str(text),
        Value::Array(items) => {
            let bytes: Option<Vec<u8>> = items
                .iter()
                .map(|item| item.as_u64().and_then(|byte| u8::try_from(byte).ok()))
                .collect();
            serde_json::from_slice(&bytes?)
        }
        _ => return None,
    };
    parsed
        .map_err(|err| log::debug!("aws-sdk instrumentation: unparseable InvokeModel body: {err}"))
        .ok()
}

fn set_finish_reason(span: &SpanRef<'_>, reason: Option<&Value>) {
    if let Some(reason) = reason.and_then(Value::as_str) {
        span.set_attribute(KeyValue::new(
            GEN_AI_RESPONSE_FINISH_REASONS,
            string_array([reason]),
        ));
    }
}

impl BedrockRuntimeExtension {
    fn converse_metadata(request: &NormalizedRequest, is_stream: bool) -> RequestMetadata {
        let mut span_name = GEN_AI_OPERATION_NAME_VALUE_CHAT.to_owned();
        let mut span_attributes = vec![
            KeyValue::new(GEN_AI_SYSTEM, GEN_AI_SYSTEM_VALUE_AWS_BEDROCK),
            KeyValue::new(GEN_AI_OPERATION_NAME, GEN_AI_OPERATION_NAME_VALUE_CHAT),
        ];
        if let Some(model_id) = request.input_str("modelId").filter(|id| !id.is_empty()) {
            span_attributes.push(KeyValue::new(GEN_AI_REQUEST_MODEL, model_id.to_owned()));
            span_name = format!("{span_name} {model_id}");
        }
        if let Some(inference) = request.input("inferenceConfig") {
            push_attribute(&mut span_attributes, GEN_AI_REQUEST_MAX_TOKENS, inference.get("maxTokens"));
            push_attribute(&mut span_attributes, GEN_AI_REQUEST_TEMPERATURE, inference.get("temperature"));
            push_attribute(&mut span_attributes, GEN_AI_REQUEST_TOP_P, inference.get("topP"));
            push_attribute(&mut span_attributes, GEN_AI_REQUEST_STOP_SEQUENCES, inference.get("stopSequences"));
        }
        RequestMetadata {
            is_stream,
            span_attributes,
            span_name: Some(span_name),
            ..Default::default()
        }
    }

    fn invoke_model_metadata(request: &NormalizedRequest) -> RequestMetadata {
        let mut span_attributes = vec![KeyValue::new(GEN_AI_SYSTEM, GEN_AI_SYSTEM_VALUE_AWS_BEDROCK)];
        let model_id = request.input_str("modelId").filter(|id| !id.is_empty());
        if let Some(model_id) = model_id {
            span_attributes.push(KeyValue::new(GEN_AI_REQUEST_MODEL, model_id.to_owned()));
        }

        let vendor = model_id.and_then(vendor_schema);
        let body = request.input("body").and_then(json_body);
        if let (Some(vendor), Some(body)) = (vendor, body) {
            for (key, pointer) in vendor.request {
                push_attribute(&mut span_attributes, *key, body.pointer(pointer));
            }
            if let Some(text) = vendor.request_text.and_then(|p| body.pointer(p)).and_then(Value::as_str) {
                span_attributes.push(KeyValue::new(GEN_AI_USAGE_INPUT_TOKENS, approximate_tokens(text)));
            }
        }
        RequestMetadata {
            span_attributes,
            ..Default::default()
        }
    }

    fn invoke_model_response(response: &NormalizedResponse, span: &SpanRef<'_>) {
        let Some(vendor) = response
            .request
            .input_str("modelId")
            .and_then(vendor_schema)
        else {
            return;
        };
        let Some(body) = response.data.get("body").and_then(json_body) else {
            return;
        };
        for (key, pointer) in vendor.response {
            if let Some(value) = body.pointer(pointer).and_then(attribute_value) {
                span.set_attribute(KeyValue::new(*key, value));
            }
        }
        if let Some(text) = vendor.response_text.and_then(|p| body.pointer(p)).and_then(Value::as_str) {
            span.set_attribute(KeyValue::new(GEN_AI_USAGE_OUTPUT_TOKENS, approximate_tokens(text)));
        }
        set_finish_reason(span, body.pointer(vendor.finish_reason));
    }
}

impl ResourceExtension for BedrockRuntimeExtension {
    fn pre_span_hook(
        &self,
        request: &NormalizedRequest,
        _config: &InstrumentationConfig,
    ) -> RequestMetadata {
        match request.operation_name.as_str() {
            "Converse" => Self::converse_metadata(request, false),
            "ConverseStream" => Self::converse_metadata(request, true),
            "InvokeModel" => Self::invoke_model_metadata(request),
            _ => RequestMetadata::default(),
        }
    }

    fn response_hook(
        &self,
        response: &mut NormalizedResponse,
        context: &Context,
        _tracer: &BoxedTracer,
        _config: &InstrumentationConfig,
        start_time: SystemTime,
    ) {
        let span = context.span();
        if !span.is_recording() {
            return;
        }
        let usage = UsageRecorder {
            instruments: self.instruments.get().cloned(),
            model_id: response.request.input_str("modelId").map(str::to_owned),
            start_time,
        };
        match response.request.operation_name.as_str() {
            "Converse" => {
                set_finish_reason(&span, response.data.get("stopReason"));
                usage.record(&span, response.data.get("usage"));
            }
            "ConverseStream" => {
                if let Some(inner) = response.stream.take() {
                    response.stream = Some(
                        UsageTrackingStream {
                            inner,
                            context: context.clone(),
                            recorder: Some(usage),
                            usage: None,
                        }
                        .boxed(),
                    );
                }
            }
            "InvokeModel" => Self::invoke_model_response(response, &span),
            _ => {}
        }
    }

    fn update_metric_instruments(&self, meter: &Meter) {
        self.instruments.get_or_init(|| Instruments {
            token_usage: meter
                .u64_histogram(METRIC_GEN_AI_CLIENT_TOKEN_USAGE)
                .with_unit("{token}")
                .with_description("Measures number of input and output tokens used")
                .with_boundaries(TOKEN_USAGE_BOUNDARIES.to_vec())
                .build(),
            operation_duration: meter
                .f64_histogram(METRIC_GEN_AI_CLIENT_OPERATION_DURATION)
                .with_unit("s")
                .with_description("GenAI operation duration")
                .with_boundaries(OPERATION_DURATION_BOUNDARIES.to_vec())
                .build(),
        });
    }
}

// Records the duration and token usage of one chat operation.
struct UsageRecorder {
    instruments: Option<Instruments>,
    model_id: Option<String>,
    start_time: SystemTime,
}

impl UsageRecorder {
    fn record(&self, span: &SpanRef<'_>, usage: Option<&Value>) {
        let mut shared = vec![
            KeyValue::new(GEN_AI_SYSTEM, GEN_AI_SYSTEM_VALUE_AWS_BEDROCK),
            KeyValue::new(GEN_AI_OPERATION_NAME, GEN_AI_OPERATION_NAME_VALUE_CHAT),
        ];
        if let Some(model_id) = &self.model_id {
            shared.push(KeyValue::new(GEN_AI_REQUEST_MODEL, model_id.clone()));
        }
        if let Some(instruments) = &self.instruments {
            let elapsed = self.start_time.elapsed().unwrap_or_default();
            instruments
                .operation_duration
                .record(elapsed.as_secs_f64(), &shared);
        }

        let Some(usage) = usage else {
            return;
        };
        let tokens = [
            ("inputTokens", GEN_AI_USAGE_INPUT_TOKENS, GEN_AI_TOKEN_TYPE_VALUE_INPUT),
            ("outputTokens", GEN_AI_USAGE_OUTPUT_TOKENS, GEN_AI_TOKEN_TYPE_VALUE_OUTPUT),
        ];
        for (field, attribute, token_type) in tokens {
            let Some(count) = usage.get(field).and_then(Value::as_u64) else {
                continue;
            };
            span.set_attribute(KeyValue::new(
                attribute,
                i64::try_from(count).unwrap_or(i64::MAX),
            ));
            if let Some(instruments) = &self.instruments {
                let mut attributes = shared.clone();
                attributes.push(KeyValue::new(GEN_AI_TOKEN_TYPE, token_type));
                instruments.token_usage.record(count, &attributes);
            }
        }
    }
}

// Watches ConverseStream events; usage is recorded once the stream is drained.
struct UsageTrackingStream {
    inner: EventStream,
    context: Context,
    recorder: Option<UsageRecorder>,
    usage: Option<Value>,
}

impl Stream for UsageTrackingStream {
    type Item = Result<Value, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = ready!(this.inner.poll_next_unpin(cx));
        match &item {
            Some(Ok(event)) => {
                set_finish_reason(&this.context.span(), event.pointer("/messageStop/stopReason"));
                if let Some(usage) = event.pointer("/metadata/usage") {
                    this.usage = Some(usage.clone());
                }
            }
            Some(Err(_)) => {}
            None => {
                if let Some(recorder) = this.recorder.take() {
                    recorder.record(&this.context.span(), this.usage.as_ref());
                }
            }
        }
        Poll::Ready(item)
    }
}
