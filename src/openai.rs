use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::Value;

use crate::error::PipelineError;
use crate::model::{ModelClient, ModelReply, ModelRequest, Pricing};
use crate::usage::Usage;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub fn responses_endpoint(base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    format!("{base_url}/responses")
}

/// Structured-output client for the OpenAI Responses API.
pub struct OpenAiModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    pricing: Option<Pricing>,
}

impl OpenAiModel {
    pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build OpenAI HTTP client")?;
        Ok(Self {
            client,
            endpoint: responses_endpoint(base_url),
            api_key: api_key.into(),
            pricing: None,
        })
    }

    /// Override the built-in price table, e.g. for models it does not know.
    pub fn with_pricing(mut self, pricing: Option<Pricing>) -> Self {
        self.pricing = pricing;
        self
    }

    fn pricing_for(&self, model: &str) -> Pricing {
        if let Some(pricing) = self.pricing {
            return pricing;
        }
        Pricing::for_model(model).unwrap_or_else(|| {
            tracing::warn!(model, "no pricing known for model; reporting zero cost");
            Pricing::FREE
        })
    }
}

#[async_trait]
impl ModelClient for OpenAiModel {
    async fn generate(&self, request: &ModelRequest<'_>) -> Result<ModelReply, PipelineError> {
        let body = serde_json::json!({
            "model": request.model,
            "instructions": request.instructions,
            "input": request.input,
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": request.schema_name,
                    "schema": request.schema,
                    "strict": true,
                }
            },
            "store": false,
        });

        let endpoint = &self.endpoint;
        let response = self
            .client
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| PipelineError::ModelCall(format!("POST {endpoint}: {err}")))?;

        let status = response.status();
        let raw = response.text().await.map_err(|err| {
            PipelineError::ModelCall(format!("read OpenAI response body: {err}"))
        })?;
        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or_else(|| raw.clone());
            return Err(PipelineError::ModelCall(format!(
                "OpenAI API error ({status}): {message}"
            )));
        }

        parse_reply(&raw, self.pricing_for(request.model))
    }
}

/// Decode a successful Responses API body. Once the usage block is read,
/// every later failure carries it.
fn parse_reply(raw: &str, pricing: Pricing) -> Result<ModelReply, PipelineError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| PipelineError::parse(format!("parse OpenAI response: {err}")))?;
    let (input_tokens, output_tokens) = parse_usage(&value);
    let cost = pricing.cost(input_tokens, output_tokens);
    let usage = Usage::new(input_tokens, output_tokens, cost);

    let text = extract_output_text(&value).map_err(|err| err.with_usage(usage))?;
    let value = serde_json::from_str(&text).map_err(|err| {
        PipelineError::parse(format!("structured output is not valid JSON: {err}")).with_usage(usage)
    })?;
    Ok(ModelReply { value, usage })
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw_json).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?.to_owned();
    Some(message)
}

fn parse_usage(value: &Value) -> (u64, u64) {
    let Some(usage) = value.get("usage") else {
        return (0, 0);
    };
    let count = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    (count("input_tokens"), count("output_tokens"))
}

fn extract_output_text(value: &Value) -> Result<String, PipelineError> {
    let output = value
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| PipelineError::parse("missing `output` array in response".to_owned()))?;

    let mut text = String::new();
    let mut refusal = String::new();
    for item in output {
        if item.get("type").and_then(|v| v.as_str()) != Some("message") {
            continue;
        }
        let Some(content) = item.get("content").and_then(|v| v.as_array()) else {
            continue;
        };
        for part in content {
            match part.get("type").and_then(|v| v.as_str()) {
                Some("output_text") => {
                    if let Some(part_text) = part.get("text").and_then(|v| v.as_str()) {
                        text.push_str(part_text);
                    }
                }
                Some("refusal") => {
                    if let Some(reason) = part.get("refusal").and_then(|v| v.as_str()) {
                        refusal.push_str(reason);
                    }
                }
                _ => {}
            }
        }
    }

    if text.trim().is_empty() {
        if !refusal.is_empty() {
            return Err(PipelineError::parse(format!("model refused: {refusal}")));
        }
        return Err(PipelineError::parse("OpenAI output text is empty".to_owned()));
    }
    Ok(text)
}
