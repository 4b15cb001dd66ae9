use std::fmt;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "glm-4.7";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings used when the client opens its connection.
#[derive(Clone)]
pub struct LlmConfig {
    /// Sent as a bearer token when present. A missing key is reported by the provider.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Transport-level deadline applied to every request.
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl LlmConfig {
    /// Applies `OPENAI_API_KEY`, `OPENAI_BASE_URL` and `SCA_MODEL`; blank values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_blank("OPENAI_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = non_blank("OPENAI_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = non_blank("SCA_MODEL") {
            self.model = v;
        }
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}
