// =============================================================================
// LLM Gateway contract (C3)
// =============================================================================
//
// Single method: send a system+user message pair, get raw text back.
// Blocking, callable from any worker. Failure is a single error variant; no
// retries happen inside the gateway.
// =============================================================================

pub mod http_gateway;

use async_trait::async_trait;

#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn chat(&self, system_text: &str, user_text: &str, temperature: f64) -> anyhow::Result<String>;
}
