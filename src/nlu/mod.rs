//! NLU provider boundary.
//!
//! The language-model backend is swappable behind a narrow, versioned
//! request/response contract: the orchestrator hands the provider the raw
//! instruction, a catalog of registered capabilities, and summaries of recent
//! traces; the provider returns structured intents or a parse failure. The
//! provider owns any network traffic; nothing here is observable to the core
//! beyond the response.
//!
//! The orchestrator bounds every call with a timeout and maps expiry to
//! `ParseFailure::Timeout`.

pub mod gemini;
pub mod rules;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capabilities::CapabilitySpec;
use crate::errors::ParseFailure;
use crate::types::{Instruction, Intent, RunStatus};

/// Version of the request/response contract. Bump on incompatible change.
pub const CONTRACT_VERSION: u32 = 1;

/// Compact capability description shipped to the provider so it only emits
/// capabilities the registry can execute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilitySummary {
    pub name: String,
    pub description: String,
    pub params: Vec<String>,
}

impl CapabilitySummary {
    pub fn from_spec(spec: &CapabilitySpec) -> Self {
        Self {
            name: spec.name.clone(),
            description: spec.description.clone(),
            params: spec.params.iter().map(|p| p.name.clone()).collect(),
        }
    }
}

/// Fragment of a prior run offered to the provider as context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceSummary {
    pub instruction_text: String,
    pub capabilities: Vec<String>,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NluRequest {
    pub version: u32,
    pub instruction: Instruction,
    pub capabilities: Vec<CapabilitySummary>,
    pub recent: Vec<TraceSummary>,
}

impl NluRequest {
    pub fn new(instruction: Instruction, capabilities: Vec<CapabilitySummary>) -> Self {
        Self {
            version: CONTRACT_VERSION,
            instruction,
            capabilities,
            recent: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NluResponse {
    pub version: u32,
    pub intents: Vec<Intent>,
}

/// Provider metadata for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderInfo {
    pub name: String,
    pub model: String,
}

/// Converts free text into structured intents.
#[async_trait]
pub trait NluProvider: Send + Sync {
    async fn parse(&self, request: &NluRequest) -> Result<NluResponse, ParseFailure>;

    fn info(&self) -> ProviderInfo;
}
