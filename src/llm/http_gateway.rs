// =============================================================================
// HttpLlmGateway — OpenAI-compatible chat-completions client
// =============================================================================
//
// Targets any OpenAI-compatible `/chat/completions` endpoint (DeepSeek and
// similar providers all speak this shape). Configuration is environment-
// driven: LLM_BASE_URL, LLM_MODEL, LLM_API_KEY.
// =============================================================================

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::LlmGateway;

pub struct HttpLlmGateway {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl HttpLlmGateway {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[async_trait]
impl LlmGateway for HttpLlmGateway {
    #[instrument(skip(self, system_text, user_text), name = "llm::chat")]
    async fn chat(&self, system_text: &str, user_text: &str, temperature: f64) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system_text },
                ChatMessage { role: "user", content: user_text },
            ],
            temperature,
            stream: false,
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("llm chat request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("llm gateway returned {status}: {text}");
        }

        let parsed: ChatResponse = resp.json().await.context("failed to parse llm response")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("llm response had no choices")?;

        debug!(chars = content.len(), "llm reply received");
        Ok(content)
    }
}
