use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse};
use crate::providers::{Provider, ProviderConfig, StreamResult};
use async_stream::stream;

use super::http_client::{map_error_response, parse_sse_line, AuthStrategy, HttpProviderClient};

/// OpenRouter provider (OpenAI-compatible API, the default aggregator).
pub struct OpenRouterProvider {
    client: HttpProviderClient,
    config: ProviderConfig,
}

impl OpenRouterProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        // Custom headers like HTTP-Referer / X-Title pass through config.headers
        let client = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "https://openrouter.ai/api/v1",
            &config.headers,
            AuthStrategy::Bearer {
                token: config.api_key.clone(),
            },
        )?;

        Ok(Self { client, config })
    }

    fn map_model(&self, model: &str) -> String {
        self.config
            .model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }
}

#[async_trait::async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn list_models(&self) -> Result<serde_json::Value, ProviderError> {
        self.client.get_json("/models").await
    }

    async fn chat_completion(
        &self,
        mut request: ChatRequest,
    ) -> Result<ChatResponse, ProviderError> {
        request.model = self.map_model(&request.model);
        request.stream = None;
        self.client.post_json("/chat/completions", &request).await
    }

    async fn chat_completion_stream(
        &self,
        mut request: ChatRequest,
    ) -> Result<StreamResult, ProviderError> {
        request.model = self.map_model(&request.model);
        request.stream = Some(true);

        let response = self
            .client
            .post_json_raw("/chat/completions", &request)
            .await?;
        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let stream = Box::pin(stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = futures::StreamExt::next(&mut bytes_stream).await {
                match chunk_result {
                    Ok(chunk) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));

                        while let Some(line_end) = buffer.find('\n') {
                            let line = buffer[..line_end].trim().to_string();
                            buffer = buffer[line_end + 1..].to_string();

                            if line.trim() == "data: [DONE]" {
                                return;
                            }
                            match parse_sse_line(&line) {
                                Ok(Some(stream_chunk)) => yield Ok(stream_chunk),
                                Ok(None) => {}
                                Err(e) => yield Err(e),
                            }
                        }
                    }
                    Err(e) => yield Err(ProviderError::Http(e)),
                }
            }
        });

        Ok(stream)
    }
}
