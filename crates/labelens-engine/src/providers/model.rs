use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::providers::{response_json_or_status_error, HttpStatusError};

/// Inline image for a vision call, already encoded as a data URL.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub data_url: String,
}

impl ImageAttachment {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let format = image::guess_format(bytes).context("unrecognized image format")?;
        let mime = match format {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::WebP => "image/webp",
            other => bail!("unsupported image format: {other:?}"),
        };
        Ok(Self {
            data_url: format!("data:{mime};base64,{}", BASE64.encode(bytes)),
        })
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim().as_bytes())
            .context("image base64 decode failed")?;
        Self::from_bytes(&bytes)
    }
}

/// One chat-completion-style request against the shared model backend.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub user: String,
    pub image: Option<ImageAttachment>,
    pub max_tokens: Option<u32>,
    pub temperature: f64,
    pub json_mode: bool,
}

impl ModelRequest {
    pub fn json(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            image: None,
            max_tokens: None,
            temperature: 0.2,
            json_mode: true,
        }
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    fn name(&self) -> &str;
    /// Returns the assistant message text. Transport failures and refused
    /// statuses surface as errors; content problems are the caller's job.
    async fn complete(&self, request: &ModelRequest) -> Result<String>;
}

/// OpenAI-compatible chat-completions client.
pub struct ChatModelClient {
    api_base: String,
    api_key: String,
    model: String,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl ChatModelClient {
    pub fn new(config: &EngineConfig, model: &str) -> Result<Self> {
        let Some(api_key) = config.model_api_key.clone() else {
            bail!("model API key not configured");
        };
        Ok(Self {
            api_base: config.model_api_base.clone(),
            api_key,
            model: model.to_string(),
            request_timeout: config.model_call_timeout,
            http: reqwest::Client::new(),
        })
    }

    fn build_payload(&self, request: &ModelRequest) -> Value {
        let user_content = match &request.image {
            Some(image) => json!([
                { "type": "text", "text": request.user },
                { "type": "image_url", "image_url": { "url": image.data_url } },
            ]),
            None => Value::String(request.user.clone()),
        };
        let mut payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": user_content },
            ],
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if request.json_mode {
            payload["response_format"] = json!({ "type": "json_object" });
        }
        payload
    }
}

#[async_trait]
impl ModelClient for ChatModelClient {
    fn name(&self) -> &str {
        "chat-completions"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        let endpoint = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(&self.build_payload(request))
            .send()
            .await
            .with_context(|| format!("model request failed ({endpoint})"))?;
        let payload = response_json_or_status_error("model", response).await?;

        let content = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty());
        match content {
            Some(text) => Ok(text.to_string()),
            None => bail!("model response carried no assistant content"),
        }
    }
}

/// Canned replies for offline runs and tests, popped in call order.
#[derive(Debug)]
pub enum ScriptedReply {
    Text(String),
    /// Sleeps first, then answers. Lets tests race the global deadline.
    Slow(Duration, String),
    /// Fails with the given HTTP status (429 carries a retry-after hint).
    Status(u16),
}

#[derive(Default)]
pub struct ScriptedModelClient {
    replies: Mutex<VecDeque<ScriptedReply>>,
}

impl ScriptedModelClient {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
        }
    }

    pub fn with_texts(texts: Vec<&str>) -> Self {
        Self::new(texts.into_iter().map(|t| ScriptedReply::Text(t.to_string())).collect())
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|queue| queue.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: &ModelRequest) -> Result<String> {
        let reply = {
            let mut queue = self
                .replies
                .lock()
                .map_err(|_| anyhow::anyhow!("scripted reply queue poisoned"))?;
            queue.pop_front()
        };
        match reply {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Slow(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            Some(ScriptedReply::Status(status)) => Err(HttpStatusError {
                provider: "scripted".to_string(),
                status,
                retry_after: (status == 429).then_some(Duration::from_secs(2)),
                body: "scripted failure".to_string(),
            }
            .into()),
            None => bail!("scripted reply queue exhausted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_shapes_follow_the_chat_completions_contract() {
        let config = EngineConfig {
            model_api_key: Some("k".to_string()),
            ..EngineConfig::offline()
        };
        let client = ChatModelClient::new(&config, "gpt-4o-mini").expect("client");

        let mut request = ModelRequest::json("sys", "usr");
        request.max_tokens = Some(200);
        let payload = client.build_payload(&request);
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "usr");
        assert_eq!(payload["max_tokens"], 200);
        assert_eq!(payload["response_format"]["type"], "json_object");

        request.image = Some(ImageAttachment {
            data_url: "data:image/png;base64,AAAA".to_string(),
        });
        let payload = client.build_payload(&request);
        assert_eq!(payload["messages"][1]["content"][1]["type"], "image_url");
    }

    #[test]
    fn client_requires_an_api_key() {
        assert!(ChatModelClient::new(&EngineConfig::offline(), "m").is_err());
    }

    #[test]
    fn attachment_sniffs_png_mime() {
        let png_magic = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        let attachment = ImageAttachment::from_bytes(&png_magic).expect("attachment");
        assert!(attachment.data_url.starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn scripted_client_pops_in_order_and_exhausts() {
        let client = ScriptedModelClient::with_texts(vec!["one", "two"]);
        let request = ModelRequest::json("s", "u");
        assert_eq!(client.complete(&request).await.unwrap(), "one");
        assert_eq!(client.complete(&request).await.unwrap(), "two");
        assert!(client.complete(&request).await.is_err());
    }
}
