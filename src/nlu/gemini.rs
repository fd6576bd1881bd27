//! Gemini-backed NLU provider.
//!
//! Speaks the `generateContent` HTTP API. The prompt carries the capability
//! catalog and asks for a JSON array of `{capability, params, confidence}`
//! objects; replies wrapped in markdown code fences are tolerated. The API
//! key comes from the environment at construction and never appears in logs
//! or traces.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::{NluProvider, NluRequest, NluResponse, ProviderInfo, CONTRACT_VERSION};
use crate::errors::ParseFailure;
use crate::types::Intent;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub timeout: Duration,
}

pub struct GeminiProvider {
    config: GeminiConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

/// Shape the model is asked to emit, one element per intent.
#[derive(Debug, Deserialize)]
struct WireIntent {
    capability: String,
    #[serde(default)]
    params: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, ParseFailure> {
        if config.api_key.is_empty() {
            return Err(ParseFailure::Unavailable(
                "no API key configured for Gemini provider".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ParseFailure::Unavailable(format!("http client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/'),
            self.config.model
        )
    }

    fn build_prompt(request: &NluRequest) -> String {
        let mut catalog = String::new();
        for cap in &request.capabilities {
            catalog.push_str(&format!(
                "- {} ({}): params [{}]\n",
                cap.name,
                cap.description,
                cap.params.join(", ")
            ));
        }
        let mut history = String::new();
        for summary in &request.recent {
            history.push_str(&format!(
                "- \"{}\" -> {:?} ({:?})\n",
                summary.instruction_text, summary.capabilities, summary.status
            ));
        }
        format!(
            "You translate a user instruction into executable intents.\n\
             Available capabilities:\n{catalog}\n\
             Recent runs:\n{history}\n\
             Instruction: \"{instruction}\"\n\n\
             Respond with ONLY a JSON array; each element is an object with\n\
             \"capability\" (one of the names above), \"params\" (object of\n\
             parameter name to value) and \"confidence\" (0.0-1.0). Use the\n\
             literal string \"it\" for a parameter whose value is the output\n\
             of the previous intent. Return [] if nothing applies.",
            catalog = catalog,
            history = history,
            instruction = request.instruction.text,
        )
    }

    async fn complete(&self, prompt: &str) -> Result<String, ParseFailure> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": 0.0 }
        });

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.config.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ParseFailure::Timeout
                } else {
                    ParseFailure::Unavailable(format!("request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            return Err(ParseFailure::Unavailable(format!(
                "provider returned HTTP {}",
                response.status()
            )));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ParseFailure::Malformed(format!("response body: {}", e)))?;

        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| ParseFailure::Malformed("empty completion".to_string()))
    }
}

/// Pull the first JSON array out of a completion, tolerating markdown fences
/// and surrounding prose.
fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[async_trait]
impl NluProvider for GeminiProvider {
    async fn parse(&self, request: &NluRequest) -> Result<NluResponse, ParseFailure> {
        let prompt = Self::build_prompt(request);
        let completion = self.complete(&prompt).await?;
        debug!(chars = completion.len(), "gemini completion received");

        let raw = extract_json_array(&completion)
            .ok_or_else(|| ParseFailure::Malformed("no JSON array in completion".to_string()))?;
        let wire: Vec<WireIntent> = serde_json::from_str(raw)
            .map_err(|e| ParseFailure::Malformed(format!("intent array: {}", e)))?;

        if wire.is_empty() {
            return Err(ParseFailure::Ambiguous(
                "provider found no applicable capability".to_string(),
            ));
        }

        let intents = wire
            .into_iter()
            .map(|w| Intent {
                capability: w.capability,
                params: w.params,
                confidence: w.confidence.clamp(0.0, 1.0),
                instruction_id: request.instruction.id.clone(),
            })
            .collect();

        Ok(NluResponse {
            version: CONTRACT_VERSION,
            intents,
        })
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "gemini".to_string(),
            model: self.config.model.clone(),
        }
    }
}
