//! Browser executor: W3C WebDriver over HTTP.
//!
//! Talks to an externally managed driver endpoint (chromedriver/geckodriver);
//! driver bootstrap is not this system's concern. Each orchestrator run owns
//! at most one logical browser session, created lazily on the first browser
//! step and torn down at run end regardless of outcome — the orchestrator
//! calls `teardown` from its aggregation path.
//!
//! Credential submission only ever sees opaque handles; the resolved secret
//! is forwarded to the driver and never logged or placed in a trace.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::executor::{BoundInputs, CapabilityExecutor, ExecutionContext};
use crate::config::{BrowserConfig, BrowserKind};
use crate::errors::ExecutionFailure;
use crate::types::{RunId, Step, StepOutput};

/// W3C element id key in find-element responses.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Username/secret pair resolved from an opaque handle. The secret is kept
/// out of Debug output.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub secret: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// External credential store boundary. The executor never persists plaintext
/// credentials; it resolves a handle just-in-time and forwards the values.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, handle: &str) -> Result<Credential, ExecutionFailure>;
}

/// Environment-backed resolver: handle `h` reads `ADJUTANT_CRED_H_USERNAME`
/// and `ADJUTANT_CRED_H_PASSWORD`.
#[derive(Debug, Default)]
pub struct EnvCredentialResolver;

impl CredentialResolver for EnvCredentialResolver {
    fn resolve(&self, handle: &str) -> Result<Credential, ExecutionFailure> {
        let tag = handle.to_uppercase().replace('-', "_");
        let username = std::env::var(format!("ADJUTANT_CRED_{}_USERNAME", tag));
        let secret = std::env::var(format!("ADJUTANT_CRED_{}_PASSWORD", tag));
        match (username, secret) {
            (Ok(username), Ok(secret)) => Ok(Credential { username, secret }),
            _ => Err(ExecutionFailure::ResourceUnavailable(format!(
                "credential handle '{}' not present in environment",
                handle
            ))),
        }
    }
}

pub struct BrowserExecutor {
    config: BrowserConfig,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialResolver>,
    /// run id → WebDriver session id. A run owns its session exclusively.
    sessions: Mutex<HashMap<RunId, String>>,
}

impl BrowserExecutor {
    pub fn new(config: BrowserConfig, credentials: Arc<dyn CredentialResolver>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            credentials,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn driver(&self) -> &str {
        self.config.webdriver_url.trim_end_matches('/')
    }

    fn new_session_payload(&self) -> Value {
        match self.config.default_browser {
            BrowserKind::Chrome => {
                let mut args = vec!["--no-sandbox".to_string(), "--disable-dev-shm-usage".into()];
                if self.config.headless {
                    args.push("--headless=new".into());
                }
                json!({
                    "capabilities": {
                        "alwaysMatch": {
                            "browserName": "chrome",
                            "goog:chromeOptions": { "args": args }
                        }
                    }
                })
            }
            BrowserKind::Firefox => {
                let mut args: Vec<String> = Vec::new();
                if self.config.headless {
                    args.push("-headless".into());
                }
                json!({
                    "capabilities": {
                        "alwaysMatch": {
                            "browserName": "firefox",
                            "moz:firefoxOptions": { "args": args }
                        }
                    }
                })
            }
        }
    }

    /// Lazily create (or reuse) the run's session. One bounded retry on a
    /// connection error, since drivers briefly refuse connections at startup.
    async fn session_for(&self, run_id: &str) -> Result<String, ExecutionFailure> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(run_id) {
            return Ok(session.clone());
        }

        let url = format!("{}/session", self.driver());
        let payload = self.new_session_payload();
        let mut last_err = None;
        for attempt in 0..2 {
            match self.client.post(&url).json(&payload).send().await {
                Ok(response) => {
                    let value = unwrap_webdriver(response).await?;
                    let session_id = value
                        .get("sessionId")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            ExecutionFailure::Internal("driver returned no session id".into())
                        })?
                        .to_string();
                    debug!(run = run_id, session = %session_id, "browser session created");
                    sessions.insert(run_id.to_string(), session_id.clone());
                    return Ok(session_id);
                }
                Err(e) if e.is_connect() && attempt == 0 => {
                    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                    last_err = Some(e);
                }
                Err(e) => {
                    return Err(ExecutionFailure::ResourceUnavailable(format!(
                        "webdriver endpoint {}: {}",
                        self.driver(),
                        e
                    )))
                }
            }
        }
        Err(ExecutionFailure::ResourceUnavailable(format!(
            "webdriver endpoint {}: {}",
            self.driver(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Tear down the run's session, if one was ever created. Called by the
    /// orchestrator at run end on every path, including aborts.
    pub async fn teardown(&self, run_id: &str) {
        let session = self.sessions.lock().await.remove(run_id);
        if let Some(session) = session {
            let url = format!("{}/session/{}", self.driver(), session);
            if let Err(e) = self.client.delete(&url).send().await {
                warn!(run = run_id, error = %e, "browser session teardown failed");
            } else {
                debug!(run = run_id, "browser session closed");
            }
        }
    }

    async fn navigate(&self, session: &str, target: &str) -> Result<StepOutput, ExecutionFailure> {
        let url = format!("{}/session/{}/url", self.driver(), session);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "url": target }))
            .send()
            .await
            .map_err(wire_error)?;
        unwrap_webdriver(response).await?;
        Ok(StepOutput::Record(json!({ "navigated": target })))
    }

    async fn find_element(&self, session: &str, selector: &str) -> Result<String, ExecutionFailure> {
        let url = format!("{}/session/{}/element", self.driver(), session);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "using": "css selector", "value": selector }))
            .send()
            .await
            .map_err(wire_error)?;
        let value = unwrap_webdriver(response).await?;
        value
            .get(ELEMENT_KEY)
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| {
                ExecutionFailure::Internal(format!("no element matches selector '{}'", selector))
            })
    }

    async fn click(&self, session: &str, selector: &str) -> Result<StepOutput, ExecutionFailure> {
        let element = self.find_element(session, selector).await?;
        let url = format!(
            "{}/session/{}/element/{}/click",
            self.driver(),
            session,
            element
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({}))
            .send()
            .await
            .map_err(wire_error)?;
        unwrap_webdriver(response).await?;
        Ok(StepOutput::Record(json!({ "clicked": selector })))
    }

    async fn type_into(
        &self,
        session: &str,
        selector: &str,
        text: &str,
    ) -> Result<(), ExecutionFailure> {
        let element = self.find_element(session, selector).await?;
        let url = format!(
            "{}/session/{}/element/{}/value",
            self.driver(),
            session,
            element
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(wire_error)?;
        unwrap_webdriver(response).await?;
        Ok(())
    }

    async fn login(&self, session: &str, step: &Step) -> Result<StepOutput, ExecutionFailure> {
        let target = required_str(step, "url")?;
        let handle = required_str(step, "credential_handle")?;
        let username_selector = required_str(step, "username_selector")?;
        let password_selector = required_str(step, "password_selector")?;
        let submit_selector = required_str(step, "submit_selector")?;

        let credential = self.credentials.resolve(handle)?;

        self.navigate(session, target).await?;
        self.type_into(session, username_selector, &credential.username)
            .await?;
        self.type_into(session, password_selector, &credential.secret)
            .await?;
        self.click(session, submit_selector).await?;

        // The trace records only the handle, never the resolved values.
        Ok(StepOutput::Record(json!({
            "logged_in": target,
            "credential_handle": handle,
        })))
    }
}

#[async_trait]
impl CapabilityExecutor for BrowserExecutor {
    #[instrument(skip_all, fields(capability = %step.capability, step = %step.id))]
    async fn execute(
        &self,
        step: &Step,
        _inputs: &BoundInputs,
        cx: &ExecutionContext,
    ) -> Result<StepOutput, ExecutionFailure> {
        let work = async {
            let session = self.session_for(&cx.run_id).await?;
            match step.capability.as_str() {
                "browser-navigate" => self.navigate(&session, required_str(step, "url")?).await,
                "browser-click" => self.click(&session, required_str(step, "selector")?).await,
                "browser-login" => self.login(&session, step).await,
                other => Err(ExecutionFailure::Internal(format!(
                    "browser executor cannot serve capability '{}'",
                    other
                ))),
            }
        };

        tokio::select! {
            _ = cx.cancellation.cancelled() => Err(ExecutionFailure::Cancelled),
            result = tokio::time::timeout(cx.timeout, work) => {
                result.map_err(|_| ExecutionFailure::Timeout)?
            }
        }
    }
}

fn required_str<'a>(step: &'a Step, key: &str) -> Result<&'a str, ExecutionFailure> {
    step.param_str(key)
        .ok_or_else(|| ExecutionFailure::Internal(format!("parameter '{}' missing or not a string", key)))
}

fn wire_error(e: reqwest::Error) -> ExecutionFailure {
    if e.is_connect() {
        ExecutionFailure::ResourceUnavailable(format!("webdriver unreachable: {}", e))
    } else {
        ExecutionFailure::Internal(format!("webdriver request: {}", e))
    }
}

/// Unwrap the `{"value": ...}` envelope, mapping driver errors.
async fn unwrap_webdriver(response: reqwest::Response) -> Result<Value, ExecutionFailure> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| ExecutionFailure::Internal(format!("webdriver response: {}", e)))?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);
    if !status.is_success() {
        let message = value
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown driver error");
        return Err(ExecutionFailure::Internal(format!(
            "webdriver {}: {}",
            status, message
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_resolver_reads_handle_pair() {
        std::env::set_var("ADJUTANT_CRED_TEST_MAIL_USERNAME", "user@example.com");
        std::env::set_var("ADJUTANT_CRED_TEST_MAIL_PASSWORD", "hunter2");
        let credential = EnvCredentialResolver.resolve("test-mail").unwrap();
        assert_eq!(credential.username, "user@example.com");
        assert_eq!(credential.secret, "hunter2");
    }

    #[test]
    fn env_resolver_rejects_unknown_handle() {
        let err = EnvCredentialResolver.resolve("no-such-handle").unwrap_err();
        assert!(matches!(err, ExecutionFailure::ResourceUnavailable(_)));
    }

    #[test]
    fn credential_debug_redacts_secret() {
        let credential = Credential {
            username: "u".into(),
            secret: "p".into(),
        };
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains('p') || rendered.contains("<redacted>"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn chrome_payload_carries_headless_flag() {
        let executor = BrowserExecutor::new(
            BrowserConfig {
                default_browser: BrowserKind::Chrome,
                headless: true,
                webdriver_url: "http://localhost:9515".into(),
            },
            Arc::new(EnvCredentialResolver),
        );
        let payload = executor.new_session_payload();
        let args = payload["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap();
        assert!(args.iter().any(|a| a == "--headless=new"));
    }

    #[tokio::test]
    async fn teardown_without_session_is_a_no_op() {
        let executor = BrowserExecutor::new(
            BrowserConfig::default(),
            Arc::new(EnvCredentialResolver),
        );
        executor.teardown("never-ran").await;
    }
}
