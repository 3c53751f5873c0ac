//! In-memory collaborators for unit tests.

use crate::agent::{AgentError, AgentFramework, AgentHandle, AgentResult, ProxyHandle};
use crate::message::OutgoingMessage;
use crate::traits::{Channel, ChannelResult};
use async_trait::async_trait;
use hal_common::config::AgentConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Agent framework double that records every call.
#[derive(Default)]
pub(crate) struct MockAgent {
    calls: Mutex<Vec<String>>,
    last_message: Mutex<HashMap<String, String>>,
    next_id: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_send: AtomicBool,
    pub fail_learn: AtomicBool,
    pub fail_close: AtomicBool,
    pub send_delay: Mutex<Option<Duration>>,
}

impl MockAgent {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn chat(&self, agent: &AgentHandle, message: &str) -> AgentResult<()> {
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(AgentError::Service("model unavailable".into()));
        }
        self.last_message
            .lock()
            .unwrap()
            .insert(agent.0.clone(), message.to_string());
        Ok(())
    }
}

#[async_trait]
impl AgentFramework for MockAgent {
    async fn create_agent(&self, name: &str, _config: &AgentConfig) -> AgentResult<AgentHandle> {
        tokio::task::yield_now().await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(AgentError::Service("agent service down".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(format!("create_agent:{name}"));
        Ok(AgentHandle(format!("agent-{id}")))
    }

    async fn create_proxy(&self, name: &str) -> AgentResult<ProxyHandle> {
        self.record(format!("create_proxy:{name}"));
        Ok(ProxyHandle(format!("proxy-{name}")))
    }

    async fn initiate(
        &self,
        _proxy: &ProxyHandle,
        agent: &AgentHandle,
        message: &str,
        clear_history: bool,
    ) -> AgentResult<()> {
        self.record(format!("initiate:{agent}:{message}:{clear_history}"));
        self.chat(agent, message).await
    }

    async fn send(
        &self,
        _proxy: &ProxyHandle,
        agent: &AgentHandle,
        message: &str,
    ) -> AgentResult<()> {
        self.record(format!("send:{agent}:{message}"));
        self.chat(agent, message).await
    }

    async fn last_reply(&self, agent: &AgentHandle, _proxy: &ProxyHandle) -> AgentResult<String> {
        self.record(format!("last_reply:{agent}"));
        let last = self.last_message.lock().unwrap().get(&agent.0).cloned();
        Ok(format!("echo: {}", last.unwrap_or_default()))
    }

    async fn learn_from_feedback(&self, agent: &AgentHandle) -> AgentResult<()> {
        self.record(format!("learn:{agent}"));
        if self.fail_learn.load(Ordering::SeqCst) {
            return Err(AgentError::Service("memory store locked".into()));
        }
        Ok(())
    }

    async fn clear_history(&self, _proxy: &ProxyHandle, agent: &AgentHandle) -> AgentResult<()> {
        self.record(format!("clear_history:{agent}"));
        Ok(())
    }

    async fn close(&self, agent: &AgentHandle) -> AgentResult<()> {
        self.record(format!("close:{agent}"));
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(AgentError::Service("memory store busy".into()));
        }
        Ok(())
    }
}

/// Channel double that keeps every posted message.
#[derive(Default)]
pub(crate) struct RecordingChannel {
    sent: Mutex<Vec<OutgoingMessage>>,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent().iter().map(|m| m.text().to_string()).collect()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, message: OutgoingMessage) -> ChannelResult<String> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(message);
        Ok(format!("{}.000", sent.len()))
    }
}
