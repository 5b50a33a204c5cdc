use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{LlmConfig, LlmProvider};
use crate::error::{CoreError, Result};

// -- Prompts --

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant that creates concise summaries of documents.
Your task is to summarize the provided document content clearly and accurately.
Focus on the main points, key information, and important details.
Keep the summary informative but concise.";

/// Build the user message asking for a summary of `text`.
///
/// `text` is cut to `max_input_chars` characters before it is embedded.
pub fn build_user_prompt(text: &str, summary_words: u32, max_input_chars: usize) -> String {
    let excerpt = truncate_chars(text, max_input_chars);
    format!(
        "Please summarize the following document content in approximately {summary_words} words or less:\n\n---\n{excerpt}\n---\n\nProvide a clear, structured summary that captures the essential information."
    )
}

/// Join page texts as `Page N:` blocks separated by blank lines.
pub fn combine_pages(pages: &[(u32, String)]) -> String {
    pages
        .iter()
        .map(|(page, text)| format!("Page {page}:\n{text}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Strip reasoning blocks and surrounding whitespace from a model answer.
pub fn clean_response(content: &str) -> Result<String> {
    // Reasoning models (deepseek-r1, qwq) prepend <think>...</think>
    let clean = match regex_lite::Regex::new(r"(?s)<think>.*?</think>") {
        Ok(re) => re.replace_all(content, "").trim().to_string(),
        Err(_) => content.trim().to_string(),
    };
    if clean.is_empty() {
        return Err(CoreError::Llm("model returned an empty summary".to_string()));
    }
    Ok(clean)
}

// -- Provider trait --

#[derive(Debug, Clone, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

fn messages<'a>(system: &'a str, user: &'a str) -> Vec<ChatMessage<'a>> {
    vec![
        ChatMessage {
            role: "system",
            content: system,
        },
        ChatMessage {
            role: "user",
            content: user,
        },
    ]
}

/// A chat-completion backend able to produce summaries.
#[async_trait]
pub trait SummaryProvider: Send + Sync + 'static {
    /// Provider name as reported by the status endpoint.
    fn name(&self) -> &'static str;

    fn model(&self) -> &str;

    /// Base URL requests are sent to.
    fn endpoint(&self) -> &str;

    /// Whether the backend answers at all. Never errors.
    async fn health_check(&self) -> bool;

    /// Send one system + user exchange and return the cleaned answer.
    async fn summarize(&self, system: &str, user: &str) -> Result<String>;
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

async fn error_for_status(provider: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(CoreError::Llm(format!("{provider} returned {status}: {body}")))
}

// -- Ollama --

pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: http_client(Duration::from_secs(config.timeout_seconds)),
            base_url: config.ollama.url.trim_end_matches('/').to_string(),
            model: config.ollama.model.clone(),
            temperature: config.temperature,
        }
    }
}

#[async_trait]
impl SummaryProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        matches!(self.client.get(&url).send().await, Ok(r) if r.status().is_success())
    }

    async fn summarize(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = OllamaChatRequest {
            model: &self.model,
            messages: messages(system, user),
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Llm(format!("ollama request failed: {e}")))?;
        let response = error_for_status("ollama", response).await?;

        let parsed: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Llm(format!("parse ollama response: {e}")))?;

        clean_response(&parsed.message.content)
    }
}

// -- OpenRouter --

pub struct OpenRouterProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    site_url: String,
    site_name: String,
    temperature: f32,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenRouterProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let openrouter = &config.openrouter;
        if openrouter.api_key.trim().is_empty() {
            return Err(CoreError::Config(
                "OPENROUTER_API_KEY is required when using the openrouter provider".to_string(),
            ));
        }
        Ok(Self {
            client: http_client(Duration::from_secs(config.timeout_seconds)),
            base_url: openrouter.base_url.trim_end_matches('/').to_string(),
            api_key: openrouter.api_key.clone(),
            model: openrouter.model.clone(),
            site_url: openrouter.site_url.clone(),
            site_name: openrouter.site_name.clone(),
            temperature: config.temperature,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder.bearer_auth(&self.api_key);
        if !self.site_url.is_empty() {
            builder = builder.header("HTTP-Referer", &self.site_url);
        }
        if !self.site_name.is_empty() {
            builder = builder.header("X-Title", &self.site_name);
        }
        builder
    }
}

#[async_trait]
impl SummaryProvider for OpenRouterProvider {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        matches!(self.request(self.client.get(&url)).send().await, Ok(r) if r.status().is_success())
    }

    async fn summarize(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionRequest {
            model: &self.model,
            messages: messages(system, user),
            temperature: self.temperature,
        };

        let response = self
            .request(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Llm(format!("openrouter request failed: {e}")))?;
        let response = error_for_status("openrouter", response).await?;

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Llm(format!("parse openrouter response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CoreError::Llm("openrouter response has no choices".to_string()))?;

        clean_response(&content)
    }
}

// -- Summarizer --

/// Status snapshot reported by `GET /llm/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmStatus {
    pub available: bool,
    pub provider: String,
    pub model: Option<String>,
    pub host: Option<String>,
}

/// Turns page texts into a summary with the configured provider.
pub struct Summarizer {
    provider: Arc<dyn SummaryProvider>,
    summary_words: u32,
    max_input_chars: usize,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn SummaryProvider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            summary_words: config.summary_words,
            max_input_chars: config.max_input_chars,
        }
    }

    /// Build the summarizer for the configured provider; `None` when disabled.
    pub fn from_config(config: &LlmConfig) -> Result<Option<Self>> {
        let provider: Arc<dyn SummaryProvider> = match config.provider {
            LlmProvider::Disabled => {
                info!("LLM summarization disabled");
                return Ok(None);
            }
            LlmProvider::Ollama => Arc::new(OllamaProvider::new(config)),
            LlmProvider::OpenRouter => Arc::new(OpenRouterProvider::new(config)?),
        };
        info!(
            provider = provider.name(),
            model = provider.model(),
            endpoint = provider.endpoint(),
            "LLM summarization enabled"
        );
        Ok(Some(Self::new(provider, config)))
    }

    pub fn provider(&self) -> &dyn SummaryProvider {
        self.provider.as_ref()
    }

    /// Summarize free text. Returns `Ok(None)` without contacting the
    /// provider when there is nothing to summarize.
    pub async fn summarize_text(&self, text: &str) -> Result<Option<String>> {
        if text.trim().is_empty() {
            warn!("empty text provided for summarization");
            return Ok(None);
        }

        let user = build_user_prompt(text, self.summary_words, self.max_input_chars);
        let summary = self.provider.summarize(SYSTEM_PROMPT, &user).await?;
        debug!(chars = summary.len(), "summary generated");
        Ok(Some(summary))
    }

    pub async fn summarize_pages(&self, pages: &[(u32, String)]) -> Result<Option<String>> {
        if pages.iter().all(|(_, text)| text.trim().is_empty()) {
            warn!("document has no text to summarize");
            return Ok(None);
        }
        self.summarize_text(&combine_pages(pages)).await
    }

    pub async fn status(&self) -> LlmStatus {
        LlmStatus {
            available: self.provider.health_check().await,
            provider: self.provider.name().to_string(),
            model: Some(self.provider.model().to_string()),
            host: Some(self.provider.endpoint().to_string()),
        }
    }

    /// Status reported when summarization is switched off.
    pub fn disabled_status() -> LlmStatus {
        LlmStatus {
            available: false,
            provider: LlmProvider::Disabled.as_str().to_string(),
            model: None,
            host: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Captured {
        body: Arc<Mutex<Option<Value>>>,
        headers: Arc<Mutex<Option<HeaderMap>>>,
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// A URL nothing listens on.
    async fn closed_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    fn ollama_config(url: &str) -> LlmConfig {
        let mut config = LlmConfig::default();
        config.provider = LlmProvider::Ollama;
        config.ollama.url = url.to_string();
        config.ollama.model = "tiny".to_string();
        config.timeout_seconds = 5;
        config
    }

    fn openrouter_config(url: &str) -> LlmConfig {
        let mut config = LlmConfig::default();
        config.provider = LlmProvider::OpenRouter;
        config.openrouter.base_url = url.to_string();
        config.openrouter.api_key = "sk-test".to_string();
        config.openrouter.model = "some/model".to_string();
        config.openrouter.site_url = "https://example.org".to_string();
        config.openrouter.site_name = "Extractor".to_string();
        config.timeout_seconds = 5;
        config
    }

    async fn ollama_stub(captured: Captured, answer: &'static str) -> String {
        let app = Router::new()
            .route("/api/tags", get(|| async { Json(json!({"models": []})) }))
            .route(
                "/api/chat",
                post(move |State(c): State<Captured>, Json(body): Json<Value>| async move {
                    *c.body.lock().unwrap() = Some(body);
                    Json(json!({"message": {"role": "assistant", "content": answer}, "done": true}))
                }),
            )
            .with_state(captured);
        serve(app).await
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn test_combine_pages() {
        let pages = vec![(1, "one".to_string()), (2, "two".to_string())];
        assert_eq!(combine_pages(&pages), "Page 1:\none\n\nPage 2:\ntwo");
    }

    #[test]
    fn test_user_prompt_shape() {
        let prompt = build_user_prompt("abcdef", 120, 3);
        assert!(prompt.starts_with("Please summarize the following document content in approximately 120 words or less:"));
        assert!(prompt.contains("---\nabc\n---"));
        assert!(!prompt.contains("abcd"));
    }

    #[test]
    fn test_clean_response() {
        assert_eq!(
            clean_response("<think>\nhmm\n</think>\n  The summary. ").unwrap(),
            "The summary."
        );
        assert!(clean_response("  <think>only thoughts</think> ").is_err());
    }

    #[test]
    fn test_from_config() {
        let mut config = LlmConfig::default();
        config.provider = LlmProvider::Disabled;
        assert!(Summarizer::from_config(&config).unwrap().is_none());

        config.provider = LlmProvider::OpenRouter;
        config.openrouter.api_key = String::new();
        assert!(matches!(
            Summarizer::from_config(&config),
            Err(CoreError::Config(_))
        ));

        config.provider = LlmProvider::Ollama;
        let summarizer = Summarizer::from_config(&config).unwrap().unwrap();
        assert_eq!(summarizer.provider().name(), "ollama");
    }

    #[tokio::test]
    async fn test_ollama_summarize() {
        let captured = Captured::default();
        let url = ollama_stub(captured.clone(), "<think>plan</think>A short summary.").await;
        let summarizer = Summarizer::from_config(&ollama_config(&url)).unwrap().unwrap();

        let pages = vec![(1, "Alpha".to_string()), (2, "Beta".to_string())];
        let summary = summarizer.summarize_pages(&pages).await.unwrap();
        assert_eq!(summary.as_deref(), Some("A short summary."));

        let body = captured.body.lock().unwrap().clone().unwrap();
        assert_eq!(body["model"], "tiny");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], SYSTEM_PROMPT);
        let user = body["messages"][1]["content"].as_str().unwrap();
        assert!(user.contains("Page 1:\nAlpha\n\nPage 2:\nBeta"));
    }

    #[tokio::test]
    async fn test_ollama_health_and_status() {
        let url = ollama_stub(Captured::default(), "x").await;
        let summarizer = Summarizer::from_config(&ollama_config(&url)).unwrap().unwrap();
        let status = summarizer.status().await;
        assert!(status.available);
        assert_eq!(status.provider, "ollama");
        assert_eq!(status.model.as_deref(), Some("tiny"));
        assert_eq!(status.host.as_deref(), Some(url.as_str()));

        let down = Summarizer::from_config(&ollama_config(&closed_url().await))
            .unwrap()
            .unwrap();
        assert!(!down.status().await.available);
    }

    #[tokio::test]
    async fn test_ollama_error_status() {
        let app = Router::new().route(
            "/api/chat",
            post(|| async { (axum::http::StatusCode::NOT_FOUND, "model not found") }),
        );
        let url = serve(app).await;
        let summarizer = Summarizer::from_config(&ollama_config(&url)).unwrap().unwrap();
        let err = summarizer.summarize_text("some text").await.unwrap_err();
        match err {
            CoreError::Llm(msg) => assert!(msg.contains("404"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_an_error() {
        let summarizer = Summarizer::from_config(&ollama_config(&closed_url().await))
            .unwrap()
            .unwrap();
        assert!(matches!(
            summarizer.summarize_text("text").await,
            Err(CoreError::Llm(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_text_skips_request() {
        // Would fail with a connection error if a request were made.
        let summarizer = Summarizer::from_config(&ollama_config(&closed_url().await))
            .unwrap()
            .unwrap();
        assert_eq!(summarizer.summarize_text("   \n").await.unwrap(), None);
        let pages = vec![(1, String::new()), (2, " ".to_string())];
        assert_eq!(summarizer.summarize_pages(&pages).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_openrouter_summarize() {
        let captured = Captured::default();
        let app = Router::new()
            .route(
                "/chat/completions",
                post(
                    |State(c): State<Captured>, headers: HeaderMap, Json(body): Json<Value>| async move {
                        *c.body.lock().unwrap() = Some(body);
                        *c.headers.lock().unwrap() = Some(headers);
                        Json(json!({
                            "choices": [{"message": {"role": "assistant", "content": " Routed summary "}}]
                        }))
                    },
                ),
            )
            .route("/models", get(|| async { Json(json!({"data": []})) }))
            .with_state(captured.clone());
        let url = serve(app).await;

        let summarizer = Summarizer::from_config(&openrouter_config(&url)).unwrap().unwrap();
        let summary = summarizer.summarize_text("document text").await.unwrap();
        assert_eq!(summary.as_deref(), Some("Routed summary"));
        assert!(summarizer.status().await.available);

        let headers = captured.headers.lock().unwrap().clone().unwrap();
        assert_eq!(headers["authorization"], "Bearer sk-test");
        assert_eq!(headers["http-referer"], "https://example.org");
        assert_eq!(headers["x-title"], "Extractor");

        let body = captured.body.lock().unwrap().clone().unwrap();
        assert_eq!(body["model"], "some/model");
        assert_eq!(body["messages"][1]["role"], "user");
    }

    #[tokio::test]
    async fn test_openrouter_without_choices() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async { Json(json!({"choices": []})) }),
        );
        let url = serve(app).await;
        let summarizer = Summarizer::from_config(&openrouter_config(&url)).unwrap().unwrap();
        assert!(matches!(
            summarizer.summarize_text("text").await,
            Err(CoreError::Llm(_))
        ));
    }
}
