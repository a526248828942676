//! Blocking HTTP/SSE model transport.

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::io::BufRead;
use std::time::Duration;
use tether_core::{
    CancelToken, ChatRequest, ContentPart, LlmConfig, MessageBody, TransportChunk, TransportError,
    UserContent,
};

/// One network exchange with the model. Chunks are pushed to `sink` as they
/// arrive off the wire; the cancel token is observed between chunks and ends
/// the read early without error.
pub trait ModelTransport {
    fn open(
        &self,
        req: &ChatRequest,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(TransportChunk),
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    cfg: LlmConfig,
    client: Client,
}

impl HttpTransport {
    pub fn new(cfg: LlmConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .map_err(|e| TransportError::Configuration(format!("http client: {e}")))?;
        Ok(Self { cfg, client })
    }

    fn resolve_api_key(&self) -> Option<String> {
        std::env::var(&self.cfg.api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                self.cfg
                    .api_key
                    .as_ref()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
    }

    fn build_payload(&self, req: &ChatRequest) -> Value {
        let mut messages = vec![json!({"role": "system", "content": req.system})];
        for msg in &req.messages {
            messages.push(match &msg.body {
                MessageBody::User { content } => match content {
                    UserContent::Text(text) => json!({"role": "user", "content": text}),
                    UserContent::Parts(parts) => {
                        let wire_parts: Vec<Value> = parts
                            .iter()
                            .map(|part| match part {
                                ContentPart::Text { text } => {
                                    json!({"type": "text", "text": text})
                                }
                                ContentPart::Image { mime, base64_data } => json!({
                                    "type": "image_url",
                                    "image_url": {
                                        "url": format!("data:{mime};base64,{base64_data}")
                                    }
                                }),
                            })
                            .collect();
                        json!({"role": "user", "content": wire_parts})
                    }
                },
                MessageBody::Assistant {
                    content,
                    tool_calls,
                    ..
                } => {
                    // Prior-turn reasoning is never replayed.
                    let mut wire = json!({"role": "assistant"});
                    if let Some(text) = content {
                        wire["content"] = json!(text);
                    }
                    if !tool_calls.is_empty() {
                        let calls: Vec<Value> = tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {"name": tc.name, "arguments": tc.arguments}
                                })
                            })
                            .collect();
                        wire["tool_calls"] = json!(calls);
                    }
                    wire
                }
                MessageBody::Tool {
                    tool_call_id,
                    content,
                } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
            });
        }

        let mut payload = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": true
        });
        if let Some(temp) = req.temperature {
            payload["temperature"] = json!(temp);
        }
        if !req.tools.is_empty() {
            payload["tools"] = serde_json::to_value(&req.tools).unwrap_or(json!([]));
            payload["tool_choice"] =
                serde_json::to_value(&req.tool_choice).unwrap_or(json!("auto"));
        }
        payload
    }
}

impl ModelTransport for HttpTransport {
    fn open(
        &self,
        req: &ChatRequest,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(TransportChunk),
    ) -> Result<(), TransportError> {
        let api_key = self.resolve_api_key().ok_or_else(|| {
            TransportError::Configuration(format!(
                "no API key: set {} or configure llm.api_key",
                self.cfg.api_key_env
            ))
        })?;

        let payload = self.build_payload(req);
        let response = self
            .client
            .post(&self.cfg.endpoint)
            .bearer_auth(&api_key)
            .json(&payload)
            .send()
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after_seconds(response.headers().get(RETRY_AFTER));
            let body = response.text().unwrap_or_default();
            return Err(status_error(status, &body, retry_after));
        }

        let mut finish_reason: Option<String> = None;
        let reader = std::io::BufReader::new(response);
        for line_result in reader.lines() {
            if cancel.is_triggered() {
                return Ok(());
            }
            let line = line_result
                .map_err(|e| TransportError::transient(format!("stream read error: {e}")))?;
            let trimmed = line.trim();
            if !trimmed.starts_with("data:") {
                continue;
            }
            let data = trimmed.trim_start_matches("data:").trim();
            if data == "[DONE]" {
                break;
            }
            let value: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let choice = value
                .get("choices")
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.first());
            let Some(choice) = choice else {
                continue;
            };
            if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                finish_reason = Some(reason.to_string());
            }
            let Some(delta) = choice.get("delta") else {
                continue;
            };
            if let Some(reasoning) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                sink(TransportChunk::Reasoning(reasoning.to_string()));
            }
            if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                sink(TransportChunk::Content(content.to_string()));
            }
            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for item in tool_calls {
                    let id = item
                        .get("id")
                        .and_then(|v| v.as_str())
                        .filter(|id| !id.trim().is_empty())
                        .map(ToString::to_string);
                    let name = item
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .filter(|name| !name.trim().is_empty())
                        .map(ToString::to_string);
                    let arguments = item
                        .get("function")
                        .and_then(|f| f.get("arguments"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    sink(TransportChunk::ToolCallFragment {
                        id,
                        name,
                        arguments,
                    });
                }
            }
        }

        if !cancel.is_triggered() {
            sink(TransportChunk::Done { finish_reason });
        }
        Ok(())
    }
}

fn classify_request_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        TransportError::transient(format!("network error: {err}"))
    } else {
        TransportError::Terminal(format!("request failed: {err}"))
    }
}

/// Map an HTTP error status onto the retry taxonomy.
fn status_error(status: StatusCode, body: &str, retry_after: Option<u64>) -> TransportError {
    let detail = extract_error_detail(body);
    match status {
        StatusCode::UNAUTHORIZED => TransportError::Terminal(
            "invalid or missing API key (HTTP 401): check the configured api_key_env variable"
                .to_string(),
        ),
        StatusCode::PAYMENT_REQUIRED => {
            TransportError::Terminal("insufficient account balance (HTTP 402)".to_string())
        }
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::SERVICE_UNAVAILABLE => TransportError::Transient {
            message: format!("HTTP {}: {detail}", status.as_u16()),
            retry_after: retry_after.map(Duration::from_secs),
        },
        _ => TransportError::Terminal(format!("HTTP {}: {detail}", status.as_u16())),
    }
}

fn extract_error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}
