//! Gemini API 連携
//!
//! generateContent へプロンプトとインライン画像を送り、最初の候補のテキストを返す。

use super::{VisionCallError, VisionModel, VisionRequest};
use crate::fetcher::{HttpRequest, Method, Transport, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Gemini APIリクエスト
#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

/// Gemini APIレスポンス
#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: ResponseContent,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

pub struct GeminiModel {
    transport: Arc<dyn Transport>,
    endpoint: String,
    model: String,
    api_key: String,
}

impl GeminiModel {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    /// APIキーはヘッダで送る（URLはエラー文言に含まれるため）
    fn url(&self) -> String {
        format!("{}/{}:generateContent", self.endpoint.trim_end_matches('/'), self.model)
    }

    fn build_body(request: &VisionRequest<'_>) -> GeminiRequest {
        let mut parts = vec![Part::Text {
            text: request.prompt.to_string(),
        }];
        for image in &request.images {
            parts.push(Part::InlineData {
                inline_data: InlineData {
                    mime_type: image.mime_type.clone(),
                    data: image.to_base64(),
                },
            });
        }

        GeminiRequest {
            contents: vec![Content { parts }],
            generation_config: GenerationConfig {
                temperature: 0.1,
                response_mime_type: request.expect_json.then(|| "application/json".to_string()),
            },
        }
    }
}

/// 候補の全テキストを連結
fn response_text(body: &[u8]) -> Result<String, VisionCallError> {
    let response: GeminiResponse =
        serde_json::from_slice(body).map_err(|e| VisionCallError::Malformed(e.to_string()))?;
    let text = response
        .candidates
        .first()
        .map(|c| {
            c.content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        Err(VisionCallError::EmptyResponse)
    } else {
        Ok(text)
    }
}

#[async_trait]
impl VisionModel for GeminiModel {
    async fn generate(&self, request: &VisionRequest<'_>) -> Result<String, VisionCallError> {
        let body = serde_json::to_string(&Self::build_body(request))
            .map_err(|e| VisionCallError::Malformed(e.to_string()))?;

        let reply = self
            .transport
            .send(HttpRequest {
                method: Method::Post,
                url: self.url(),
                headers: vec![
                    ("Content-Type".into(), "application/json".into()),
                    ("x-goog-api-key".into(), self.api_key.clone()),
                ],
                body: Some(body),
                timeout: request.timeout,
                proxy: None,
            })
            .await
            .map_err(|e| match e {
                TransportError::Timeout(msg) => VisionCallError::Timeout(msg),
                other => VisionCallError::Transport(other.to_string()),
            })?;

        match reply.status {
            200 => response_text(&reply.body),
            429 => Err(VisionCallError::RateLimited),
            status => Err(VisionCallError::Status(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockReply, MockTransport};
    use crate::vision::images::PreparedImage;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_request_body_shape() {
        let image = PreparedImage::from_jpeg(vec![1, 2, 3]);
        let request = VisionRequest {
            prompt: "describe",
            images: vec![&image],
            timeout: Duration::from_secs(1),
            expect_json: true,
        };
        let body = serde_json::to_value(GeminiModel::build_body(&request)).unwrap();

        assert_eq!(body["contents"][0]["parts"][0]["text"], "describe");
        assert_eq!(body["contents"][0]["parts"][1]["inline_data"]["mime_type"], "image/jpeg");
        assert_eq!(body["contents"][0]["parts"][1]["inline_data"]["data"], "AQID");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
    }

    #[tokio::test]
    async fn test_generate_status_mapping() {
        let transport = Arc::new(MockTransport::new());
        let model = GeminiModel::new(transport.clone(), "http://gemini.test/models/", "m", "k");
        let url = "http://gemini.test/models/m:generateContent";
        let request = VisionRequest {
            prompt: "hi",
            images: vec![],
            timeout: Duration::from_secs(1),
            expect_json: false,
        };

        transport.on(url, MockReply::status(429));
        assert_eq!(model.generate(&request).await, Err(VisionCallError::RateLimited));

        transport.reset(url, MockReply::json(&json!({
            "candidates": [{"content": {"parts": [{"text": "[{\"image_index\": 0}]"}]}}]
        })));
        assert_eq!(model.generate(&request).await.unwrap(), "[{\"image_index\": 0}]");

        transport.reset(url, MockReply::json(&json!({"candidates": []})));
        assert_eq!(model.generate(&request).await, Err(VisionCallError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_api_key_sent_in_header_not_url() {
        let transport = Arc::new(MockTransport::new());
        let model = GeminiModel::new(transport.clone(), "http://gemini.test/models", "m", "secret-key");
        let request = VisionRequest {
            prompt: "hi",
            images: vec![],
            timeout: Duration::from_secs(1),
            expect_json: false,
        };
        let _ = model.generate(&request).await;

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].url.contains("secret-key"));
        assert!(calls[0]
            .headers
            .iter()
            .any(|(name, value)| name == "x-goog-api-key" && value == "secret-key"));
    }
}
