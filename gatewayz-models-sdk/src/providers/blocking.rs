//! Bridge for providers whose SDKs only expose synchronous iteration.
//!
//! The blocking HTTP call and its chunk iterator run on a `spawn_blocking`
//! worker; chunks cross into async land over a bounded mpsc channel. The
//! iterator's exhaustion never crosses the boundary as a value at all - the
//! worker simply drops the sender, and the closed channel is the async
//! side's end-of-stream signal. This is what keeps the sync iterator's
//! "end" sentinel from surfacing as an error in the async consumer.

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, StreamChunk};
use crate::providers::{Provider, ProviderConfig, StreamResult};
use async_stream::stream;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::time::Duration;

/// Provider client backed by `reqwest::blocking`.
///
/// Stands in for upstream SDKs that only offer synchronous streaming
/// (OneRouter/Cerebras-style clients in the fleet).
pub struct BlockingSseProvider {
    name: String,
    base_url: String,
    api_key: String,
    timeout: Duration,
    model_mapping: HashMap<String, String>,
}

impl BlockingSseProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let base_url = config
            .base_url
            .ok_or_else(|| ProviderError::Configuration {
                message: format!("provider {} requires a base_url", config.name),
            })?;
        Ok(Self {
            name: config.name,
            base_url,
            api_key: config.api_key,
            timeout: config.timeout,
            model_mapping: config.model_mapping,
        })
    }

    fn map_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    fn build_client(timeout: Duration) -> Result<reqwest::blocking::Client, ProviderError> {
        reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Configuration {
                message: format!("failed to create blocking HTTP client: {e}"),
            })
    }
}

fn map_blocking_error(resp: reqwest::blocking::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(Duration::from_secs_f64);
    let message = resp.text().unwrap_or_default();

    match status {
        401 | 403 => ProviderError::InvalidApiKey,
        404 => ProviderError::ModelNotFound {
            model: "unknown".to_string(),
        },
        429 => ProviderError::RateLimited { retry_after },
        code => ProviderError::Api { code, message },
    }
}

/// Drive a blocking chunk iterator from a worker thread into an async
/// stream. Exhaustion closes the channel; no sentinel value is emitted.
pub(crate) fn bridge_blocking_iter<I>(iter_factory: impl FnOnce() -> I + Send + 'static) -> StreamResult
where
    I: Iterator<Item = Result<StreamChunk, ProviderError>>,
{
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<StreamChunk, ProviderError>>(32);

    tokio::task::spawn_blocking(move || {
        for item in iter_factory() {
            // Receiver gone means the client disconnected; stop reading.
            if tx.blocking_send(item).is_err() {
                break;
            }
        }
    });

    Box::pin(stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    })
}

/// Iterator over SSE data lines of a blocking response.
struct SseChunkIter<R: BufRead> {
    reader: R,
    done: bool,
}

impl<R: BufRead> Iterator for SseChunkIter<R> {
    type Item = Result<StreamChunk, ProviderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {
                    let trimmed = line.trim();
                    let Some(payload) = trimmed.strip_prefix("data: ") else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        self.done = true;
                        return None;
                    }
                    return Some(
                        serde_json::from_str::<StreamChunk>(payload)
                            .map_err(ProviderError::Serialization),
                    );
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(ProviderError::Api {
                        code: 0,
                        message: format!("stream read error: {e}"),
                    }));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Provider for BlockingSseProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_models(&self) -> Result<serde_json::Value, ProviderError> {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let api_key = self.api_key.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let client = Self::build_client(timeout)?;
            let resp = client.get(url).bearer_auth(api_key).send()?;
            if !resp.status().is_success() {
                return Err(map_blocking_error(resp));
            }
            Ok(resp.json::<serde_json::Value>()?)
        })
        .await
        .map_err(|e| ProviderError::Api {
            code: 0,
            message: format!("blocking task failed: {e}"),
        })?
    }

    async fn chat_completion(
        &self,
        mut request: ChatRequest,
    ) -> Result<ChatResponse, ProviderError> {
        request.model = self.map_model(&request.model);
        request.stream = None;

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let api_key = self.api_key.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let client = Self::build_client(timeout)?;
            let resp = client.post(url).bearer_auth(api_key).json(&request).send()?;
            if !resp.status().is_success() {
                return Err(map_blocking_error(resp));
            }
            Ok(resp.json::<ChatResponse>()?)
        })
        .await
        .map_err(|e| ProviderError::Api {
            code: 0,
            message: format!("blocking task failed: {e}"),
        })?
    }

    async fn chat_completion_stream(
        &self,
        mut request: ChatRequest,
    ) -> Result<StreamResult, ProviderError> {
        request.model = self.map_model(&request.model);
        request.stream = Some(true);

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let api_key = self.api_key.clone();
        let timeout = self.timeout;

        // The request itself must run on the worker thread; connection
        // failures surface as the first stream item.
        Ok(bridge_blocking_iter(move || {
            let start = || -> Result<SseChunkIter<BufReader<reqwest::blocking::Response>>, ProviderError> {
                let client = Self::build_client(timeout)?;
                let resp = client.post(url).bearer_auth(api_key).json(&request).send()?;
                if !resp.status().is_success() {
                    return Err(map_blocking_error(resp));
                }
                Ok(SseChunkIter {
                    reader: BufReader::new(resp),
                    done: false,
                })
            };
            match start() {
                Ok(iter) => Box::new(iter)
                    as Box<dyn Iterator<Item = Result<StreamChunk, ProviderError>>>,
                Err(e) => Box::new(std::iter::once(Err(e))),
            }
        }))
    }
}
