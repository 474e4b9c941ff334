use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use remix_contracts::{Descriptor, ResponseFragment};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::client::{ClientError, FragmentStream, GenerationClient};
use crate::config::GeminiSettings;

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Streams `streamGenerateContent` replies as server-sent events.
pub struct GeminiClient {
    settings: GeminiSettings,
    http: HttpClient,
}

impl GeminiClient {
    pub fn new(settings: GeminiSettings) -> Self {
        Self {
            settings,
            http: HttpClient::new(),
        }
    }

    pub fn endpoint(&self) -> String {
        let trimmed = self.settings.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!(
            "{}/{}:streamGenerateContent",
            self.settings.api_base.trim_end_matches('/'),
            model_path
        )
    }

    pub fn build_payload(descriptor: &Descriptor) -> Value {
        let mut parts: Vec<Value> = descriptor
            .reference_assets
            .iter()
            .map(|asset| {
                json!({
                    "inlineData": {
                        "mimeType": asset.mime_type,
                        "data": asset.to_base64(),
                    }
                })
            })
            .collect();
        parts.push(json!({ "text": descriptor.instruction_text }));
        json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE", "TEXT"],
            },
        })
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<HttpResponse, ClientError> {
        let max_retries = self.settings.transport_retries;
        let mut attempt = 0usize;
        loop {
            let response = self
                .http
                .post(endpoint)
                .query(&[("alt", "sse")])
                .header(API_KEY_HEADER, api_key)
                .timeout(Duration::from_secs_f64(self.settings.request_timeout_s))
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(err) => {
                    let err = err.without_url();
                    let retryable = err.is_timeout() || err.is_connect();
                    if !retryable || attempt >= max_retries {
                        return Err(ClientError::transport(format!(
                            "Gemini request failed ({endpoint}): {err}"
                        )));
                    }
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries,
                        error = %err,
                        "Gemini transport retry after transient request failure"
                    );
                    thread::sleep(Duration::from_secs_f64(
                        self.settings.retry_backoff_s * attempt as f64,
                    ));
                }
            }
        }
    }
}

impl GenerationClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn call<'a>(&'a self, descriptor: &'a Descriptor) -> Result<FragmentStream<'a>, ClientError> {
        let Some(api_key) = self.settings.api_key.as_deref() else {
            return Err(ClientError::invalid_request(
                "GEMINI_API_KEY or GOOGLE_API_KEY not set",
            ));
        };
        let endpoint = self.endpoint();
        let payload = Self::build_payload(descriptor);
        debug!(
            descriptor_id = %descriptor.id,
            endpoint = %endpoint,
            references = descriptor.reference_assets.len(),
            "sending Gemini generation request"
        );

        let response = self.post_with_transport_retries(&endpoint, api_key, &payload)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after_s = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok());
            let body = error_body(response.text().map_err(reqwest::Error::without_url));
            return Err(ClientError::from_status(status.as_u16(), &body, retry_after_s));
        }
        Ok(Box::new(SseFragments::new(BufReader::new(response))))
    }
}

fn error_body<E: std::fmt::Display>(body: Result<String, E>) -> String {
    body.unwrap_or_else(|err| format!("<body unreadable: {err}>"))
}

/// Lazily turns an SSE body into fragments, one event at a time.
pub struct SseFragments<R> {
    reader: R,
    line: String,
    data: String,
    pending: VecDeque<ResponseFragment>,
    finished: bool,
}

impl<R: BufRead> SseFragments<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            data: String::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    fn dispatch(&mut self) -> Result<(), ClientError> {
        let data = std::mem::take(&mut self.data);
        let trimmed = data.trim();
        if trimmed.is_empty() || trimmed == "[DONE]" {
            return Ok(());
        }
        let fragments = parse_stream_event(trimmed)?;
        if fragments.is_empty() {
            self.pending.push_back(ResponseFragment::Empty);
        } else {
            self.pending.extend(fragments);
        }
        Ok(())
    }
}

impl<R: BufRead> Iterator for SseFragments<R> {
    type Item = Result<ResponseFragment, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(fragment) = self.pending.pop_front() {
                return Some(Ok(fragment));
            }
            if self.finished {
                return None;
            }

            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => {
                    self.finished = true;
                    if let Err(err) = self.dispatch() {
                        return Some(Err(err));
                    }
                }
                Ok(_) => {
                    let line = self.line.trim_end_matches(['\r', '\n']).to_string();
                    if line.is_empty() {
                        if let Err(err) = self.dispatch() {
                            self.finished = true;
                            return Some(Err(err));
                        }
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        if !self.data.is_empty() {
                            self.data.push('\n');
                        }
                        self.data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
                    }
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(ClientError::transport(format!(
                        "Gemini stream read failed: {err}"
                    ))));
                }
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, alias = "prompt_feedback")]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default, alias = "finish_reason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "inline_data")]
    inline_data: Option<InlineData>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default, alias = "mime_type")]
    mime_type: Option<String>,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default, alias = "block_reason")]
    block_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

/// Parses one SSE `data:` payload into fragments in part order.
pub fn parse_stream_event(data: &str) -> Result<Vec<ResponseFragment>, ClientError> {
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|err| ClientError::transport(format!("Gemini stream event is not valid JSON: {err}")))?;

    if let Some(error) = chunk.error {
        return Err(ClientError::from_status(
            error.code.unwrap_or(500),
            &error.message,
            None,
        ));
    }

    let mut fragments = Vec::new();
    if let Some(reason) = chunk
        .prompt_feedback
        .and_then(|feedback| feedback.block_reason)
    {
        fragments.push(ResponseFragment::text(format!("blocked: {reason}")));
    }

    for candidate in chunk.candidates {
        for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
            if part.thought {
                continue;
            }
            if let Some(inline) = part.inline_data {
                if inline.data.is_empty() {
                    fragments.push(ResponseFragment::Empty);
                    continue;
                }
                let bytes = BASE64
                    .decode(inline.data.as_bytes())
                    .map_err(|err| ClientError::transport(format!("Gemini image base64 decode failed: {err}")))?;
                let mime_type = inline
                    .mime_type
                    .filter(|value| !value.trim().is_empty())
                    .unwrap_or_else(|| "image/png".to_string());
                fragments.push(ResponseFragment::image(bytes, mime_type));
            } else if let Some(text) = part.text {
                fragments.push(ResponseFragment::text(text));
            } else {
                fragments.push(ResponseFragment::Empty);
            }
        }
        if let Some(reason) = candidate
            .finish_reason
            .filter(|reason| !reason.eq_ignore_ascii_case("STOP"))
        {
            fragments.push(ResponseFragment::text(format!(" [finish reason: {reason}]")));
        }
    }
    Ok(fragments)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use remix_contracts::{BinaryAsset, Descriptor, ErrorKind, GenerationOutcome, ResponseFragment};
    use serde_json::json;

    use super::{error_body, parse_stream_event, GeminiClient, SseFragments};
    use crate::assembler::ResponseAssembler;
    use crate::client::{ClientError, GenerationClient};
    use crate::config::GeminiSettings;

    fn collect(body: &str) -> Vec<Result<ResponseFragment, ClientError>> {
        SseFragments::new(Cursor::new(body.as_bytes().to_vec())).collect()
    }

    #[test]
    fn sse_events_become_fragments_in_order() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Here you go\"}]}}]}\n",
            "\n",
            ": keep-alive comment\n",
            "\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"inlineData\":{\"mimeType\":\"image/jpeg\",\"data\":\"AAEC\"}}]}}]}\r\n",
            "\r\n",
            "data: {\"usageMetadata\":{\"totalTokenCount\":12}}\n",
            "\n",
        );
        let fragments: Vec<ResponseFragment> = collect(body).into_iter().flatten().collect();
        assert_eq!(
            fragments,
            vec![
                ResponseFragment::text("Here you go"),
                ResponseFragment::image(vec![0, 1, 2], "image/jpeg"),
                ResponseFragment::Empty,
            ]
        );
    }

    #[test]
    fn trailing_event_without_blank_line_is_flushed() {
        let body = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"x\"}]}}]}";
        let fragments: Vec<ResponseFragment> = collect(body).into_iter().flatten().collect();
        assert_eq!(fragments, vec![ResponseFragment::text("x")]);
    }

    #[test]
    fn multi_line_data_is_joined() {
        let body = "data: {\"candidates\":[{\"content\":\ndata: {\"parts\":[{\"text\":\"joined\"}]}}]}\n\n";
        let fragments: Vec<ResponseFragment> = collect(body).into_iter().flatten().collect();
        assert_eq!(fragments, vec![ResponseFragment::text("joined")]);
    }

    #[test]
    fn malformed_event_ends_stream_with_transport_error() {
        let body = "data: {oops\n\ndata: {\"candidates\":[]}\n\n";
        let items = collect(body);
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ClientError::Transport { .. })));
    }

    #[test]
    fn in_stream_error_maps_status() -> anyhow::Result<()> {
        let err = parse_stream_event(r#"{"error":{"code":429,"message":"quota"}}"#).err();
        assert_eq!(err.map(|err| err.kind()), Some(ErrorKind::RateLimited));
        Ok(())
    }

    #[test]
    fn blocked_prompt_and_finish_reason_surface_as_text() -> anyhow::Result<()> {
        let fragments = parse_stream_event(
            r#"{"promptFeedback":{"blockReason":"SAFETY"},"candidates":[{"finishReason":"IMAGE_SAFETY"}]}"#,
        )?;
        let outcome = ResponseAssembler::default().reduce("v01", fragments.into_iter().map(Ok));
        assert_eq!(
            outcome.failure_reason(),
            Some(ErrorKind::NoImageProduced)
        );
        let GenerationOutcome::Failure { detail, .. } = outcome else {
            panic!("expected failure");
        };
        assert!(detail.contains("blocked: SAFETY"));
        assert!(detail.contains("IMAGE_SAFETY"));
        Ok(())
    }

    #[test]
    fn snake_case_inline_data_and_thoughts() -> anyhow::Result<()> {
        let fragments = parse_stream_event(
            r#"{"candidates":[{"content":{"parts":[{"text":"plan","thought":true},{"inline_data":{"mime_type":"image/webp","data":"AQ=="}}]},"finishReason":"STOP"}]}"#,
        )?;
        assert_eq!(fragments, vec![ResponseFragment::image(vec![1], "image/webp")]);
        Ok(())
    }

    #[test]
    fn payload_puts_references_before_instruction() {
        let descriptor = Descriptor::new(
            "v01",
            "make it night",
            vec![BinaryAsset::new(vec![0, 1, 2], "image/png")],
        );
        let payload = GeminiClient::build_payload(&descriptor);
        let parts = &payload["contents"][0]["parts"];
        assert_eq!(parts[0]["inlineData"]["mimeType"], json!("image/png"));
        assert_eq!(parts[0]["inlineData"]["data"], json!("AAEC"));
        assert_eq!(parts[1]["text"], json!("make it night"));
        assert_eq!(
            payload["generationConfig"]["responseModalities"],
            json!(["IMAGE", "TEXT"])
        );
    }

    #[test]
    fn endpoint_accepts_prefixed_model_names() {
        let mut settings = GeminiSettings {
            api_base: "http://localhost:1/v1beta/".to_string(),
            ..GeminiSettings::default()
        };
        settings.model = "models/custom-image".to_string();
        let client = GeminiClient::new(settings);
        assert_eq!(
            client.endpoint(),
            "http://localhost:1/v1beta/models/custom-image:streamGenerateContent"
        );
    }

    #[test]
    fn unreadable_error_body_is_reported_in_status_error() {
        let body = error_body::<&str>(Err("connection reset"));
        let err = ClientError::from_status(503, &body, None);
        assert_eq!(err.kind(), ErrorKind::TransportError);
        assert!(err.to_string().contains("<body unreadable: connection reset>"));
        assert_eq!(error_body::<&str>(Ok("overloaded".to_string())), "overloaded");
    }

    #[test]
    fn transport_failure_detail_never_contains_api_key() {
        let client = GeminiClient::new(GeminiSettings {
            api_base: "http://127.0.0.1:9".to_string(),
            api_key: Some("SECRET-KEY-123".to_string()),
            transport_retries: 0,
            ..GeminiSettings::default()
        });
        let descriptor = Descriptor::new("v01", "pose", Vec::new());
        let outcome = match client.call(&descriptor) {
            Ok(stream) => ResponseAssembler::default().reduce("v01", stream),
            Err(err) => GenerationOutcome::failure("v01", err.kind(), err.to_string()),
        };

        let GenerationOutcome::Failure { reason, detail, .. } = outcome else {
            panic!("expected failure against a closed port");
        };
        assert_eq!(reason, ErrorKind::TransportError);
        assert!(!detail.contains("SECRET-KEY-123"), "{detail}");
    }

    #[test]
    fn missing_api_key_is_invalid_request_without_network() {
        let client = GeminiClient::new(GeminiSettings {
            api_base: "http://127.0.0.1:9".to_string(),
            api_key: None,
            ..GeminiSettings::default()
        });
        let descriptor = Descriptor::new("v01", "pose", Vec::new());
        let err = client.call(&descriptor).err();
        assert_eq!(err.map(|err| err.kind()), Some(ErrorKind::InvalidRequest));
    }
}
