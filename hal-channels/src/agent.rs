//! Agent framework client.
//!
//! The bot never talks to an LLM directly. Memory, recall and copy generation
//! live in an external teachable-agent service; this module defines the
//! contract the rest of the crate relies on ([`AgentFramework`]) and an HTTP
//! implementation of it ([`HttpAgentFramework`]).

use async_trait::async_trait;
use hal_common::config::AgentConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

/// Opaque reference to a teachable agent held by the agent service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentHandle(pub String);

/// Opaque reference to the user-side proxy that talks to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyHandle(pub String);

impl fmt::Display for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent service request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Agent service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Agent service error: {0}")]
    Service(String),

    #[error("Unexpected agent service response: {0}")]
    InvalidResponse(String),

    #[error("Agent call timed out after {0:?}")]
    Timeout(Duration),
}

/// Operations the bot needs from a teachable-agent framework.
#[async_trait]
pub trait AgentFramework: Send + Sync {
    /// Create a teachable agent with long-term memory.
    async fn create_agent(&self, name: &str, config: &AgentConfig) -> AgentResult<AgentHandle>;

    /// Create a proxy that relays user text and never asks for human input.
    async fn create_proxy(&self, name: &str) -> AgentResult<ProxyHandle>;

    /// Start a chat, optionally wiping prior history first.
    async fn initiate(
        &self,
        proxy: &ProxyHandle,
        agent: &AgentHandle,
        message: &str,
        clear_history: bool,
    ) -> AgentResult<()>;

    /// Continue an existing chat.
    async fn send(&self, proxy: &ProxyHandle, agent: &AgentHandle, message: &str)
        -> AgentResult<()>;

    /// The agent's most recent reply to `proxy`.
    async fn last_reply(&self, agent: &AgentHandle, proxy: &ProxyHandle) -> AgentResult<String>;

    /// Commit what the agent learned in this conversation to memory.
    async fn learn_from_feedback(&self, agent: &AgentHandle) -> AgentResult<()>;

    async fn clear_history(&self, proxy: &ProxyHandle, agent: &AgentHandle) -> AgentResult<()>;

    /// Release the agent and its memory store.
    async fn close(&self, agent: &AgentHandle) -> AgentResult<()>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Response envelope used by every agent service endpoint.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedResource {
    id: String,
}

#[derive(Debug, Deserialize)]
struct LastMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// [`AgentFramework`] backed by the agent service's REST API.
pub struct HttpAgentFramework {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAgentFramework {
    /// `request_timeout` bounds each HTTP request; generation can take minutes.
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.endpoint.clone(), config.call_timeout())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.endpoint, path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> AgentResult<Option<T>> {
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&error_text)
                .map(|e| e.error)
                .unwrap_or(error_text);
            return Err(AgentError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| AgentError::InvalidResponse(e.to_string()))?;

        if !envelope.success {
            return Err(AgentError::Service(
                envelope.error.unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }

        Ok(envelope.data)
    }

    async fn call_required<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> AgentResult<T> {
        self.call(request).await?.ok_or_else(|| {
            AgentError::InvalidResponse("success response without data".to_string())
        })
    }

    async fn call_unit(&self, request: reqwest::RequestBuilder) -> AgentResult<()> {
        self.call::<Value>(request).await.map(|_| ())
    }
}

#[async_trait]
impl AgentFramework for HttpAgentFramework {
    async fn create_agent(&self, name: &str, config: &AgentConfig) -> AgentResult<AgentHandle> {
        let body = json!({
            "name": name,
            "config": {
                "system_message": config.system_message,
                "llm": config.llm,
                "teach": {
                    "verbosity": config.teach.verbosity,
                    "reset_db": config.teach.reset_db,
                    "path_to_db_dir": config.teach.resolved_db_dir(),
                    "recall_threshold": config.teach.recall_threshold,
                },
            },
        });

        tracing::debug!(endpoint = %self.endpoint, agent_name = %name, "Creating agent");
        let created: CreatedResource = self
            .call_required(self.client.post(self.url("agents")).json(&body))
            .await?;
        Ok(AgentHandle(created.id))
    }

    async fn create_proxy(&self, name: &str) -> AgentResult<ProxyHandle> {
        let body = json!({
            "name": name,
            "human_input_mode": "NEVER",
            "max_consecutive_auto_reply": 0,
        });

        let created: CreatedResource = self
            .call_required(self.client.post(self.url("proxies")).json(&body))
            .await?;
        Ok(ProxyHandle(created.id))
    }

    async fn initiate(
        &self,
        proxy: &ProxyHandle,
        agent: &AgentHandle,
        message: &str,
        clear_history: bool,
    ) -> AgentResult<()> {
        let body = json!({
            "proxy": proxy,
            "message": message,
            "clear_history": clear_history,
        });
        let url = self.url(&format!("agents/{agent}/initiate"));
        self.call_unit(self.client.post(url).json(&body)).await
    }

    async fn send(
        &self,
        proxy: &ProxyHandle,
        agent: &AgentHandle,
        message: &str,
    ) -> AgentResult<()> {
        let body = json!({ "proxy": proxy, "message": message });
        let url = self.url(&format!("agents/{agent}/messages"));
        self.call_unit(self.client.post(url).json(&body)).await
    }

    async fn last_reply(&self, agent: &AgentHandle, proxy: &ProxyHandle) -> AgentResult<String> {
        let url = self.url(&format!("agents/{agent}/last-message"));
        let last: LastMessage = self
            .call_required(self.client.get(url).query(&[("proxy", &proxy.0)]))
            .await?;
        Ok(last.content)
    }

    async fn learn_from_feedback(&self, agent: &AgentHandle) -> AgentResult<()> {
        let url = self.url(&format!("agents/{agent}/learn"));
        self.call_unit(self.client.post(url)).await
    }

    async fn clear_history(&self, proxy: &ProxyHandle, agent: &AgentHandle) -> AgentResult<()> {
        let url = self.url(&format!("agents/{agent}/clear-history"));
        self.call_unit(self.client.post(url).json(&json!({ "proxy": proxy })))
            .await
    }

    async fn close(&self, agent: &AgentHandle) -> AgentResult<()> {
        let url = self.url(&format!("agents/{agent}"));
        self.call_unit(self.client.delete(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpAgentFramework {
        HttpAgentFramework::new(format!("{}/", server.uri()), Duration::from_secs(5))
    }

    fn ok(data: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "success": true, "data": data }))
    }

    #[test]
    fn endpoint_trailing_slash_trimmed() {
        let agent = HttpAgentFramework::new("http://localhost:4400/", Duration::from_secs(1));
        assert_eq!(agent.endpoint(), "http://localhost:4400");
        assert_eq!(agent.url("agents"), "http://localhost:4400/api/v1/agents");
    }

    #[tokio::test]
    async fn create_agent_sends_teach_settings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agents"))
            .and(body_partial_json(json!({
                "name": "hal",
                "config": {
                    "llm": { "temperature": 0.5 },
                    "teach": { "verbosity": 0, "reset_db": false, "recall_threshold": 1.5 },
                },
            })))
            .respond_with(ok(json!({ "id": "agent-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let handle = client(&server)
            .create_agent("hal", &AgentConfig::default())
            .await
            .unwrap();
        assert_eq!(handle, AgentHandle("agent-1".into()));
    }

    #[tokio::test]
    async fn create_proxy_never_asks_for_input() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/proxies"))
            .and(body_partial_json(json!({
                "name": "U123",
                "human_input_mode": "NEVER",
                "max_consecutive_auto_reply": 0,
            })))
            .respond_with(ok(json!({ "id": "proxy-1" })))
            .mount(&server)
            .await;

        let handle = client(&server).create_proxy("U123").await.unwrap();
        assert_eq!(handle.0, "proxy-1");
    }

    #[tokio::test]
    async fn initiate_and_last_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/a1/initiate"))
            .and(body_partial_json(json!({
                "proxy": "p1",
                "message": "Write a Headline",
                "clear_history": true,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/agents/a1/last-message"))
            .and(query_param("proxy", "p1"))
            .respond_with(ok(json!({ "content": "Stop guessing. Start selling." })))
            .mount(&server)
            .await;

        let agent = client(&server);
        let a = AgentHandle("a1".into());
        let p = ProxyHandle("p1".into());
        agent.initiate(&p, &a, "Write a Headline", true).await.unwrap();
        assert_eq!(
            agent.last_reply(&a, &p).await.unwrap(),
            "Stop guessing. Start selling."
        );
    }

    #[tokio::test]
    async fn lifecycle_endpoints() {
        let server = MockServer::start().await;
        for (verb, route) in [
            ("POST", "/api/v1/agents/a1/messages"),
            ("POST", "/api/v1/agents/a1/learn"),
            ("POST", "/api/v1/agents/a1/clear-history"),
            ("DELETE", "/api/v1/agents/a1"),
        ] {
            Mock::given(method(verb))
                .and(path(route))
                .respond_with(ok(Value::Null))
                .expect(1)
                .mount(&server)
                .await;
        }

        let agent = client(&server);
        let a = AgentHandle("a1".into());
        let p = ProxyHandle("p1".into());
        agent.send(&p, &a, "shorter please").await.unwrap();
        agent.learn_from_feedback(&a).await.unwrap();
        agent.clear_history(&p, &a).await.unwrap();
        agent.close(&a).await.unwrap();
    }

    #[tokio::test]
    async fn service_failure_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/a1/learn"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "success": false, "error": "memory store locked" })),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .learn_from_feedback(&AgentHandle("a1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Service(ref m) if m == "memory store locked"));
    }

    #[tokio::test]
    async fn http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/agents/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "error": "no such agent" })))
            .mount(&server)
            .await;

        let err = client(&server)
            .close(&AgentHandle("gone".into()))
            .await
            .unwrap_err();
        match err {
            AgentError::Status { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "no such agent");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_data_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/proxies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .mount(&server)
            .await;

        let err = client(&server).create_proxy("U1").await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidResponse(_)));
    }
}
