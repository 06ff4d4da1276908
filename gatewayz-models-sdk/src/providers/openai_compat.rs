use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse};
use crate::providers::{Provider, ProviderConfig, StreamResult};
use async_stream::stream;

use super::http_client::{map_error_response, parse_sse_line, AuthStrategy, HttpProviderClient};

/// Generic client for OpenAI-compatible gateways.
///
/// Covers the long tail of brokered catalogs (DeepInfra, Together, Groq,
/// Fireworks, Cerebras, …) that expose `/chat/completions` with bearer auth
/// and SSE streaming. The provider slug comes from configuration so one
/// implementation serves every such gateway.
pub struct OpenAiCompatProvider {
    name: String,
    client: HttpProviderClient,
    config: ProviderConfig,
}

impl OpenAiCompatProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| ProviderError::Configuration {
                message: format!("provider {} requires a base_url", config.name),
            })?;

        let client = HttpProviderClient::new(
            config.timeout,
            Some(base_url),
            "",
            &config.headers,
            AuthStrategy::Bearer {
                token: config.api_key.clone(),
            },
        )?;

        Ok(Self {
            name: config.name.clone(),
            client,
            config,
        })
    }

    fn map_model(&self, model: &str) -> String {
        if let Some(mapped) = self.config.model_mapping.get(model) {
            return mapped.clone();
        }
        // Strip a `<provider>/` prefix when the gateway expects bare ids
        match model.split_once('/') {
            Some((prefix, rest)) if prefix == self.name => rest.to_string(),
            _ => model.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_model_strips_own_prefix() {
        let provider = OpenAiCompatProvider::new(
            ProviderConfig::new("groq", "key").with_base_url("https://api.groq.com/openai/v1"),
        )
        .unwrap();

        assert_eq!(
            provider.map_model("groq/llama-3.3-70b-versatile"),
            "llama-3.3-70b-versatile"
        );
        // Foreign prefixes pass through untouched
        assert_eq!(provider.map_model("openai/gpt-4o"), "openai/gpt-4o");
    }
}
