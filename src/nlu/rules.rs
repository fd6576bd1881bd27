//! Deterministic keyword-rule provider.
//!
//! Covers the common phrasings without any network round trip: file lookups
//! ("do we have report.pdf in documents"), directory listings, disk and
//! process queries, git reads, browser navigation, logins, and deletions.
//! Used as the offline default and as the test provider; the same instruction
//! always yields the same intents.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use super::{NluProvider, NluRequest, NluResponse, ProviderInfo, CONTRACT_VERSION};
use crate::errors::ParseFailure;
use crate::types::Intent;

static FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\w][\w.-]*\.[A-Za-z0-9]+)").expect("filename regex"));
static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(https?://[^\s'\x22]+)").expect("url regex"));

/// Well-known location words → sandbox-relative roots.
fn location_root(text: &str) -> Option<&'static str> {
    if text.contains("desktop") {
        Some("~/Desktop")
    } else if text.contains("documents") {
        Some("~/Documents")
    } else if text.contains("downloads") {
        Some("~/Downloads")
    } else {
        None
    }
}

/// Well-known site words → URLs.
fn site_url(text: &str) -> Option<&'static str> {
    if text.contains("gmail") {
        Some("https://gmail.com")
    } else {
        None
    }
}

#[derive(Debug, Default)]
pub struct RuleProvider;

impl RuleProvider {
    pub fn new() -> Self {
        Self
    }

    fn intents_for(&self, request: &NluRequest) -> Vec<Intent> {
        let instruction = &request.instruction;
        let text = instruction.text.to_lowercase();
        let mut intents = Vec::new();

        let filename = FILENAME.find(&text).map(|m| m.as_str().to_string());
        let wants_delete = text.contains("delete") || text.contains("remove");
        let wants_search = text.contains("find")
            || text.contains("have")
            || text.contains("exist")
            || text.contains("search");

        if wants_search {
            if let Some(name) = filename.as_ref() {
                let mut intent = Intent::new("file-search", &instruction.id)
                    .with_confidence(0.8)
                    .with_param("name", json!(name));
                if let Some(root) = location_root(&text) {
                    intent = intent.with_param("root", json!(root));
                }
                intents.push(intent);
            }
        }

        if wants_delete {
            let mut intent = Intent::new("file-delete", &instruction.id).with_confidence(0.8);
            // A deletion trailing a search refers to the search's output.
            let name = if !intents.is_empty() {
                "it".to_string()
            } else if let Some(name) = filename.clone() {
                name
            } else if text.contains("log") {
                ".log".to_string()
            } else {
                "it".to_string()
            };
            intent = intent.with_param("name", json!(name));
            if let Some(root) = location_root(&text) {
                intent = intent.with_param("root", json!(root));
            }
            intents.push(intent);
        } else if !intents.is_empty() {
            // search already matched; skip the remaining system phrasings
        } else if text.contains("disk") && text.contains("space") || text.contains("disk usage") {
            intents.push(Intent::new("disk-usage", &instruction.id).with_confidence(0.9));
        } else if text.contains("process") || text.contains("running") {
            intents.push(Intent::new("process-list", &instruction.id).with_confidence(0.9));
        } else if text.contains("git log") || (text.contains("git") && text.contains("history")) {
            intents.push(Intent::new("git-log", &instruction.id).with_confidence(0.9));
        } else if text.contains("git") && text.contains("status") {
            intents.push(Intent::new("git-status", &instruction.id).with_confidence(0.9));
        } else if text.contains("list") && (text.contains("file") || text.contains("directory")) {
            let mut intent = Intent::new("dir-list", &instruction.id).with_confidence(0.9);
            if let Some(root) = location_root(&text) {
                intent = intent.with_param("path", json!(root));
            }
            intents.push(intent);
        } else if text.contains("find") && text.contains("python") {
            intents.push(
                Intent::new("file-search", &instruction.id)
                    .with_confidence(0.8)
                    .with_param("name", json!(".py")),
            );
        }

        // Browser phrasings can combine with the above ("find … then open …").
        if text.contains("login") || text.contains("log in") || text.contains("sign in") {
            let url = URL
                .find(&text)
                .map(|m| m.as_str().to_string())
                .or_else(|| site_url(&text).map(String::from));
            if let Some(url) = url {
                intents.push(
                    Intent::new("browser-login", &instruction.id)
                        .with_confidence(0.7)
                        .with_param("url", json!(url))
                        .with_param("credential_handle", json!("default")),
                );
            }
        } else if text.contains("navigate")
            || text.contains("go to")
            || text.contains("open chrome")
            || text.contains("open firefox")
            || text.contains("browser")
        {
            let url = URL
                .find(&text)
                .map(|m| m.as_str().to_string())
                .or_else(|| site_url(&text).map(String::from));
            if let Some(url) = url {
                intents.push(
                    Intent::new("browser-navigate", &instruction.id)
                        .with_confidence(0.8)
                        .with_param("url", json!(url)),
                );
            }
        }
        if text.contains("first email") || text.contains("first mail") {
            intents.push(
                Intent::new("browser-click", &instruction.id)
                    .with_confidence(0.7)
                    .with_param("selector", json!("[role=main] tr:first-child")),
            );
        }

        intents
    }
}

#[async_trait]
impl NluProvider for RuleProvider {
    async fn parse(&self, request: &NluRequest) -> Result<NluResponse, ParseFailure> {
        let intents = self.intents_for(request);
        if intents.is_empty() {
            return Err(ParseFailure::Ambiguous(format!(
                "no capability matched instruction: {}",
                request.instruction.text
            )));
        }
        Ok(NluResponse {
            version: CONTRACT_VERSION,
            intents,
        })
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "rules".to_string(),
            model: "keyword-v1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Instruction;

    fn parse(text: &str) -> Result<NluResponse, ParseFailure> {
        let provider = RuleProvider::new();
        let request = NluRequest::new(Instruction::new(text), vec![]);
        futures::executor::block_on(provider.parse(&request))
    }

    #[test]
    fn file_lookup_in_documents() {
        let response = parse("do we have report.pdf in documents").unwrap();
        assert_eq!(response.intents.len(), 1);
        let intent = &response.intents[0];
        assert_eq!(intent.capability, "file-search");
        assert_eq!(intent.params["name"], "report.pdf");
        assert_eq!(intent.params["root"], "~/Documents");
    }

    #[test]
    fn disk_space_query() {
        let response = parse("show disk space").unwrap();
        assert_eq!(response.intents[0].capability, "disk-usage");
    }

    #[test]
    fn browser_navigation_to_known_site() {
        let response = parse("open chrome and go to gmail").unwrap();
        assert_eq!(response.intents[0].capability, "browser-navigate");
        assert_eq!(response.intents[0].params["url"], "https://gmail.com");
    }

    #[test]
    fn find_then_delete_emits_search_and_referencing_delete() {
        let response = parse("find report.pdf in documents and then delete it").unwrap();
        assert_eq!(response.intents.len(), 2);
        assert_eq!(response.intents[0].capability, "file-search");
        assert_eq!(response.intents[1].capability, "file-delete");
        assert_eq!(response.intents[1].params["name"], "it");
    }

    #[test]
    fn bare_delete_extracts_target_from_text() {
        let response = parse("delete all logs in downloads").unwrap();
        assert_eq!(response.intents.len(), 1);
        assert_eq!(response.intents[0].capability, "file-delete");
        assert_eq!(response.intents[0].params["name"], ".log");
        assert_eq!(response.intents[0].params["root"], "~/Downloads");
    }

    #[test]
    fn unmatched_instruction_is_a_parse_failure() {
        let err = parse("compose a symphony").unwrap_err();
        assert!(matches!(err, ParseFailure::Ambiguous(_)));
    }

    #[test]
    fn parsing_is_deterministic() {
        let a = parse("list files in downloads").unwrap();
        let b = parse("list files in downloads").unwrap();
        assert_eq!(a.intents[0].capability, b.intents[0].capability);
        assert_eq!(a.intents[0].params, b.intents[0].params);
    }
}
