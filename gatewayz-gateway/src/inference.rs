//! # Inference Handler
//!
//! The single entry point every chat endpoint uses after protocol
//! adaptation. Non-streaming and streaming share the same front half:
//!
//! 1. authorize the API key (trial vs paid decided here);
//! 2. convert internal messages to the common upstream wire shape;
//! 3. run the pre-flight credit check for non-trial users - rejections
//!    happen before any provider call and leave no request record;
//! 4. resolve the provider through the registry router.
//!
//! Non-streaming requests then execute with failover, extract usage
//! (missing usage is an error), compute input/output/total cost, charge the
//! user, and persist a request record - in the background when possible.
//!
//! Streaming uses the primary provider only (a stream cannot fail over
//! mid-flight), forwards chunks in upstream order, captures usage from the
//! terminal chunk, and falls back to a chars/4 estimate for both sides when
//! the provider reported nothing. A drop guard persists a `partial` record
//! and best-effort charges already-emitted tokens when the client
//! disconnects mid-stream.

use crate::auth::{AuthContext, AuthService};
use crate::gateway_error::GatewayError;
use crate::pricing::PricingService;
use crate::storage::{retry_transient, ChatRequestRecord, RequestStatus, Storage, UsageRecord};
use crate::timing::timing_tracker;
use async_stream::stream;
use chrono::Utc;
use futures::{Stream, StreamExt};
use gatewayz_models_sdk::models::{
    ChatRequest, Delta, DeltaToolCall, Message, Role, Tool, ToolCall, ToolChoice, Usage,
};
use gatewayz_models_sdk::ProviderRouter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Gateway-neutral chat request accepted from endpoint adapters.
#[derive(Debug, Clone, Deserialize)]
pub struct InternalChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub tools: Option<Vec<Tool>>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub response_format: Option<serde_json::Value>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

/// Gateway-neutral chat response.
#[derive(Debug, Clone, Serialize)]
pub struct InternalChatResponse {
    pub id: String,
    pub model: String,
    pub content: String,
    pub finish_reason: String,
    pub usage: Usage,
    pub cost_usd: f64,
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub provider_used: String,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Gateway-neutral streaming chunk.
#[derive(Debug, Clone, Serialize)]
pub struct InternalStreamChunk {
    pub id: String,
    pub model: String,
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<DeltaToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

pub struct InferenceHandler {
    auth: Arc<AuthService>,
    pricing: Arc<PricingService>,
    router: Arc<ProviderRouter>,
    storage: Arc<dyn Storage>,
    /// Persist request records in a background task; tests run inline
    background_persist: bool,
}

impl InferenceHandler {
    pub fn new(
        auth: Arc<AuthService>,
        pricing: Arc<PricingService>,
        router: Arc<ProviderRouter>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            auth,
            pricing,
            router,
            storage,
            background_persist: true,
        }
    }

    pub fn with_inline_persistence(mut self) -> Self {
        self.background_persist = false;
        self
    }

    fn build_wire_request(request: &InternalChatRequest) -> ChatRequest {
        ChatRequest {
            model: request.model.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: None,
            top_p: request.top_p,
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
            stop: request.stop.clone(),
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
            response_format: request.response_format.clone(),
            user: request.user.clone(),
        }
    }

    /// Authorization plus the pre-flight credit check. Failures here leave
    /// no request record by design.
    async fn admit_request(
        &self,
        api_key: &str,
        request: &InternalChatRequest,
    ) -> Result<AuthContext, GatewayError> {
        let ctx = self.auth.authorize(api_key).await?;

        if !ctx.is_trial() {
            let content_chars: usize =
                request.messages.iter().map(|m| m.content.char_len()).sum();
            self.pricing.precheck(
                &ctx.user,
                &request.model,
                content_chars,
                request.max_tokens,
            )?;
        }
        Ok(ctx)
    }

    /// Total, input-only, and output-only cost for the charged usage.
    fn costs(&self, ctx: &AuthContext, model: &str, prompt: u32, completion: u32) -> (f64, f64, f64) {
        match self.pricing.model_pricing(model) {
            Some(pricing) => (
                prompt as f64 * pricing.prompt + completion as f64 * pricing.completion,
                prompt as f64 * pricing.prompt,
                completion as f64 * pricing.completion,
            ),
            None if ctx.is_trial() => {
                let total = self.pricing.trial_cost(model, prompt, completion);
                let prompt_share = prompt as f64 / (prompt + completion).max(1) as f64;
                (total, total * prompt_share, total * (1.0 - prompt_share))
            }
            // The pre-check guarantees pricing for paid users
            None => (0.0, 0.0, 0.0),
        }
    }

    /// Charge the user: trial usage tracking or exact credit deduction.
    async fn charge_user(
        &self,
        ctx: &AuthContext,
        cost: f64,
        model: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        elapsed_ms: u64,
    ) -> Result<(), GatewayError> {
        let total_tokens = (prompt_tokens + completion_tokens) as u64;

        if ctx.is_trial() {
            let storage = &self.storage;
            let api_key = ctx.api_key.clone();
            let result = retry_transient("track_trial_usage", || {
                storage.track_trial_usage(&api_key, total_tokens, 1, cost)
            })
            .await;
            match result {
                Ok(()) => self.auth.invalidate_trial(&ctx.api_key),
                Err(e) => {
                    // Tolerated: delivered tokens are not refunded
                    tracing::warn!(error = %e, "failed to track trial usage");
                }
            }
            return Ok(());
        }

        let storage = &self.storage;
        let api_key = ctx.api_key.clone();
        let description = format!("Chat completion - {model}");
        retry_transient("deduct_credits", || {
            storage.deduct_credits(&api_key, cost, &description)
        })
        .await
        .map_err(|e| {
            tracing::error!(user_id = ctx.user.id, error = %e, "credit deduction failed");
            GatewayError::internal("credit_deduction", e.to_string())
        })?;

        let usage = UsageRecord {
            user_id: ctx.user.id,
            api_key_id: ctx.user.api_key_id,
            model: model.to_string(),
            total_tokens,
            cost_usd: cost,
            latency_ms: elapsed_ms,
            timestamp: Utc::now(),
        };
        if let Err(e) = retry_transient("record_usage", || {
            storage.record_usage(usage.clone())
        })
        .await
        {
            tracing::error!(error = %e, "usage record write failed");
        }

        tracing::debug!(
            user_id = ctx.user.id,
            cost_usd = cost,
            total_tokens,
            "charged user"
        );
        Ok(())
    }

    async fn persist_record(&self, record: ChatRequestRecord) {
        if self.background_persist {
            let storage = Arc::clone(&self.storage);
            tokio::spawn(async move {
                if let Err(e) = retry_transient("save_chat_request", || {
                    storage.save_chat_request(record.clone())
                })
                .await
                {
                    tracing::error!(
                        request_id = %record.request_id,
                        error = %e,
                        "chat request record write failed"
                    );
                }
            });
        } else if let Err(e) = retry_transient("save_chat_request", || {
            self.storage.save_chat_request(record.clone())
        })
        .await
        {
            tracing::error!(
                request_id = %record.request_id,
                error = %e,
                "chat request record write failed"
            );
        }
    }

    fn record(
        ctx: &AuthContext,
        request_id: &str,
        model: &str,
        provider: &str,
        input_tokens: u32,
        output_tokens: u32,
        elapsed_ms: u64,
        status: RequestStatus,
        error_message: Option<String>,
    ) -> ChatRequestRecord {
        ChatRequestRecord {
            request_id: request_id.to_string(),
            user_id: Some(ctx.user.id),
            api_key_id: Some(ctx.user.api_key_id),
            model: model.to_string(),
            provider: provider.to_string(),
            input_tokens,
            output_tokens,
            processing_time_ms: elapsed_ms,
            status,
            error_message,
            created_at: Utc::now(),
        }
    }

    /// Process a non-streaming chat completion.
    pub async fn process(
        &self,
        api_key: &str,
        request: InternalChatRequest,
    ) -> Result<InternalChatResponse, GatewayError> {
        let start = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let ctx = self.admit_request(api_key, &request).await?;
        tracing::info!(
            request_id = %request_id,
            model = %request.model,
            messages = request.messages.len(),
            user_id = ctx.user.id,
            "processing chat completion"
        );

        let wire = Self::build_wire_request(&request);
        let call_start = Instant::now();
        let outcome = self
            .router
            .execute_with_failover(&request.model, &wire, None)
            .await;
        let call_elapsed = call_start.elapsed();

        let outcome = match outcome {
            Ok(outcome) => {
                timing_tracker().record(&outcome.provider, call_elapsed);
                outcome
            }
            Err(e) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                self.persist_record(Self::record(
                    &ctx,
                    &request_id,
                    &request.model,
                    "unknown",
                    0,
                    0,
                    elapsed_ms,
                    RequestStatus::Failed,
                    Some(e.to_string()),
                ))
                .await;
                return Err(GatewayError::from(e));
            }
        };

        let Some(usage) = outcome.response.usage else {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            self.persist_record(Self::record(
                &ctx,
                &request_id,
                &request.model,
                &outcome.provider,
                0,
                0,
                elapsed_ms,
                RequestStatus::Failed,
                Some("provider response missing usage data".to_string()),
            ))
            .await;
            return Err(GatewayError::internal(
                "usage_extraction",
                "provider response missing usage data",
            ));
        };

        let Some(choice) = outcome.response.choices.into_iter().next() else {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            self.persist_record(Self::record(
                &ctx,
                &request_id,
                &request.model,
                &outcome.provider,
                usage.prompt_tokens,
                usage.completion_tokens,
                elapsed_ms,
                RequestStatus::Failed,
                Some("provider response missing choices".to_string()),
            ))
            .await;
            return Err(GatewayError::internal(
                "response_extraction",
                "provider response missing choices",
            ));
        };
        let content = choice.message.content.to_text();
        let finish_reason = choice.finish_reason.unwrap_or_else(|| "stop".to_string());
        let tool_calls = choice.message.tool_calls;

        let (cost, input_cost, output_cost) = self.costs(
            &ctx,
            &request.model,
            usage.prompt_tokens,
            usage.completion_tokens,
        );

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let charge = self
            .charge_user(
                &ctx,
                cost,
                &request.model,
                usage.prompt_tokens,
                usage.completion_tokens,
                elapsed_ms,
            )
            .await;

        if let Err(e) = charge {
            // Provider succeeded but billing failed: record it and surface
            // the accounting error
            self.persist_record(Self::record(
                &ctx,
                &request_id,
                &request.model,
                &outcome.provider,
                usage.prompt_tokens,
                usage.completion_tokens,
                elapsed_ms,
                RequestStatus::Failed,
                Some(e.to_string()),
            ))
            .await;
            return Err(e);
        }

        self.persist_record(Self::record(
            &ctx,
            &request_id,
            &request.model,
            &outcome.provider,
            usage.prompt_tokens,
            usage.completion_tokens,
            elapsed_ms,
            RequestStatus::Completed,
            None,
        ))
        .await;

        tracing::info!(
            request_id = %request_id,
            provider = %outcome.provider,
            total_tokens = usage.total_tokens,
            cost_usd = cost,
            elapsed_ms,
            "chat completion succeeded"
        );

        Ok(InternalChatResponse {
            id: request_id,
            model: request.model,
            content,
            finish_reason,
            usage,
            cost_usd: cost,
            input_cost_usd: input_cost,
            output_cost_usd: output_cost,
            provider_used: outcome.provider,
            processing_time_ms: elapsed_ms,
            tool_calls,
        })
    }

    /// Process a streaming chat completion.
    ///
    /// The returned stream yields normalized chunks in upstream order and
    /// performs accounting after the upstream stream terminates.
    pub async fn process_stream(
        self: Arc<Self>,
        api_key: &str,
        request: InternalChatRequest,
    ) -> Result<impl Stream<Item = Result<InternalStreamChunk, GatewayError>>, GatewayError> {
        let start = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let ctx = self.admit_request(api_key, &request).await?;

        let primary = self.router.select_primary(&request.model, None);
        let provider_client =
            self.router
                .provider(&primary.provider)
                .ok_or_else(|| GatewayError::ProviderUnavailable {
                    provider: primary.provider.clone(),
                })?;

        tracing::info!(
            request_id = %request_id,
            model = %request.model,
            provider = %primary.provider,
            "starting streaming chat completion"
        );

        let mut wire = Self::build_wire_request(&request);
        wire.model = primary.provider_model_id.clone();

        let prompt_chars: usize = request.messages.iter().map(|m| m.content.char_len()).sum();

        let upstream = match provider_client.chat_completion_stream(wire).await {
            Ok(stream) => stream,
            Err(e) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                self.persist_record(Self::record(
                    &ctx,
                    &request_id,
                    &request.model,
                    &primary.provider,
                    0,
                    0,
                    elapsed_ms,
                    RequestStatus::Failed,
                    Some(e.to_string()),
                ))
                .await;
                return Err(GatewayError::from(e));
            }
        };

        let handler = Arc::clone(&self);
        let model = request.model.clone();
        let provider = primary.provider.clone();

        Ok(stream! {
            let mut upstream = upstream;
            let mut prompt_tokens = 0u32;
            let mut completion_tokens = 0u32;
            let mut accumulated_chars = 0usize;
            let mut saw_terminal = false;

            // Best-effort accounting if the consumer drops us mid-stream
            let mut guard = PartialStreamGuard::arm(
                Arc::clone(&handler),
                ctx.clone(),
                request_id.clone(),
                model.clone(),
                provider.clone(),
                start,
            );

            while let Some(item) = upstream.next().await {
                match item {
                    Ok(chunk) => {
                        if let Some(usage) = chunk.usage {
                            prompt_tokens = usage.prompt_tokens;
                            completion_tokens = usage.completion_tokens;
                            guard.update(prompt_tokens, completion_tokens, accumulated_chars);
                        }

                        let choice = chunk.choices.into_iter().next();
                        let (delta, chunk_finish) = match choice {
                            Some(c) => (c.delta, c.finish_reason),
                            // Usage-only trailing chunk
                            None => (Delta::default(), None),
                        };

                        if let Some(content) = &delta.content {
                            accumulated_chars += content.chars().count();
                            guard.update(prompt_tokens, completion_tokens, accumulated_chars);
                        }
                        if chunk_finish.is_some() {
                            saw_terminal = true;
                        }

                        let usage_snapshot = (prompt_tokens > 0 || completion_tokens > 0)
                            .then(|| Usage::new(prompt_tokens, completion_tokens));

                        yield Ok(InternalStreamChunk {
                            id: request_id.clone(),
                            model: model.clone(),
                            created: Utc::now().timestamp(),
                            content: delta.content,
                            role: delta.role,
                            finish_reason: chunk_finish,
                            tool_calls: delta.tool_calls,
                            usage: usage_snapshot,
                        });

                        if saw_terminal && prompt_tokens > 0 {
                            // Terminal chunk carried (or followed) usage:
                            // nothing more can arrive
                            break;
                        }
                    }
                    Err(e) => {
                        guard.disarm();
                        let elapsed_ms = start.elapsed().as_millis() as u64;
                        handler.persist_record(InferenceHandler::record(
                            &ctx,
                            &request_id,
                            &model,
                            &provider,
                            prompt_tokens,
                            completion_tokens,
                            elapsed_ms,
                            RequestStatus::Failed,
                            Some(e.to_string()),
                        ))
                        .await;
                        yield Err(GatewayError::from(e));
                        return;
                    }
                }
            }
            guard.disarm();

            // Fallback estimation when the provider reported no usage
            if prompt_tokens == 0 && completion_tokens == 0 {
                completion_tokens = (accumulated_chars / 4).max(1) as u32;
                prompt_tokens = (prompt_chars / 4).max(1) as u32;
                tracing::info!(
                    request_id = %request_id,
                    prompt_tokens,
                    completion_tokens,
                    "no usage from provider, estimated from content length"
                );
            }

            let (cost, _, _) =
                handler.costs(&ctx, &model, prompt_tokens, completion_tokens);
            let elapsed_ms = start.elapsed().as_millis() as u64;
            timing_tracker().record(&provider, start.elapsed());

            let charge = handler
                .charge_user(&ctx, cost, &model, prompt_tokens, completion_tokens, elapsed_ms)
                .await;

            match charge {
                Ok(()) => {
                    handler.persist_record(InferenceHandler::record(
                        &ctx,
                        &request_id,
                        &model,
                        &provider,
                        prompt_tokens,
                        completion_tokens,
                        elapsed_ms,
                        RequestStatus::Completed,
                        None,
                    ))
                    .await;
                    tracing::info!(
                        request_id = %request_id,
                        total_tokens = prompt_tokens + completion_tokens,
                        cost_usd = cost,
                        "streaming chat completion finished"
                    );
                }
                Err(e) => {
                    handler.persist_record(InferenceHandler::record(
                        &ctx,
                        &request_id,
                        &model,
                        &provider,
                        prompt_tokens,
                        completion_tokens,
                        elapsed_ms,
                        RequestStatus::Failed,
                        Some(e.to_string()),
                    ))
                    .await;
                    yield Err(e);
                }
            }
        })
    }
}

/// Accounting guard for cancelled streams.
///
/// If the consumer drops the stream before completion, the guard persists a
/// `partial` record and best-effort charges the tokens emitted so far.
/// Upstream generation is not guaranteed to stop.
struct PartialStreamGuard {
    handler: Option<Arc<InferenceHandler>>,
    ctx: AuthContext,
    request_id: String,
    model: String,
    provider: String,
    start: Instant,
    prompt_tokens: u32,
    completion_tokens: u32,
    accumulated_chars: usize,
}

impl PartialStreamGuard {
    fn arm(
        handler: Arc<InferenceHandler>,
        ctx: AuthContext,
        request_id: String,
        model: String,
        provider: String,
        start: Instant,
    ) -> Self {
        Self {
            handler: Some(handler),
            ctx,
            request_id,
            model,
            provider,
            start,
            prompt_tokens: 0,
            completion_tokens: 0,
            accumulated_chars: 0,
        }
    }

    fn update(&mut self, prompt_tokens: u32, completion_tokens: u32, chars: usize) {
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
        self.accumulated_chars = chars;
    }

    fn disarm(&mut self) {
        self.handler = None;
    }
}

impl Drop for PartialStreamGuard {
    fn drop(&mut self) {
        let Some(handler) = self.handler.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                request_id = %self.request_id,
                "stream cancelled outside a runtime, partial record dropped"
            );
            return;
        };

        let ctx = self.ctx.clone();
        let request_id = self.request_id.clone();
        let model = self.model.clone();
        let provider = self.provider.clone();
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        let completion_tokens = if self.completion_tokens > 0 {
            self.completion_tokens
        } else {
            (self.accumulated_chars / 4).max(1) as u32
        };
        let prompt_tokens = self.prompt_tokens;

        tracing::warn!(
            request_id = %request_id,
            completion_tokens,
            "stream cancelled by client, persisting partial record"
        );

        runtime.spawn(async move {
            let (cost, _, _) = handler.costs(&ctx, &model, prompt_tokens, completion_tokens);
            if let Err(e) = handler
                .charge_user(&ctx, cost, &model, prompt_tokens, completion_tokens, elapsed_ms)
                .await
            {
                tracing::error!(error = %e, "partial-stream charge failed");
            }
            handler
                .persist_record(InferenceHandler::record(
                    &ctx,
                    &request_id,
                    &model,
                    &provider,
                    prompt_tokens,
                    completion_tokens,
                    elapsed_ms,
                    RequestStatus::Partial,
                    Some("client disconnected mid-stream".to_string()),
                ))
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pricing::PricingService;
    use crate::storage::{MemoryStorage, TrialRecord, User};
    use gatewayz_models_sdk::catalog::{
        Architecture, ModelRecord, ModelRegistry, Pricing, SelectionPolicy,
    };
    use gatewayz_models_sdk::error::ProviderError;
    use gatewayz_models_sdk::models::{ChatResponse, Choice, StreamChoice, StreamChunk};
    use gatewayz_models_sdk::providers::{Provider, StreamResult};
    use gatewayz_models_sdk::{ProviderCircuitBreaker, RetryAfterMap};

    struct StubProvider {
        name: String,
        usage: Option<Usage>,
        stream_chunks: Vec<StreamChunk>,
    }

    #[async_trait::async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn list_models(&self) -> Result<serde_json::Value, ProviderError> {
            Ok(serde_json::json!([]))
        }

        async fn chat_completion(
            &self,
            request: ChatRequest,
        ) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                id: "upstream-1".to_string(),
                object: "chat.completion".to_string(),
                created: 0,
                model: request.model,
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant("the answer"),
                    finish_reason: Some("stop".to_string()),
                }],
                usage: self.usage,
            })
        }

        async fn chat_completion_stream(
            &self,
            _request: ChatRequest,
        ) -> Result<StreamResult, ProviderError> {
            let chunks = self.stream_chunks.clone();
            Ok(Box::pin(futures::stream::iter(
                chunks.into_iter().map(Ok),
            )))
        }
    }

    fn content_chunk(content: &str, finish: Option<&str>, usage: Option<Usage>) -> StreamChunk {
        StreamChunk {
            id: "c".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 0,
            model: "m".to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: Delta {
                    content: Some(content.to_string()),
                    ..Default::default()
                },
                finish_reason: finish.map(String::from),
            }],
            usage,
        }
    }

    fn gpt4o_record() -> ModelRecord {
        ModelRecord {
            id: "openai/gpt-4o".to_string(),
            slug: "openai/gpt-4o".to_string(),
            canonical_slug: "openai/gpt-4o".to_string(),
            name: "GPT-4o".to_string(),
            description: String::new(),
            context_length: 128000,
            architecture: Architecture::default(),
            pricing: Some(Pricing::per_token(2.5e-6, 1.0e-5)),
            supported_parameters: Vec::new(),
            default_parameters: serde_json::Value::Null,
            provider_slug: "openai".to_string(),
            provider_site_url: None,
            model_logo_url: None,
            source_gateway: "openrouter".to_string(),
            is_free: false,
            created: None,
        }
    }

    struct Fixture {
        handler: Arc<InferenceHandler>,
        storage: Arc<MemoryStorage>,
    }

    fn fixture(provider: StubProvider) -> Fixture {
        let registry = Arc::new(ModelRegistry::new());
        // Registered under the same slug the stub provider reports
        registry.register_canonical_records("openai", &[gpt4o_record()]);

        let router = Arc::new(ProviderRouter::new(
            Arc::clone(&registry),
            Arc::new(ProviderCircuitBreaker::default()),
            Arc::new(RetryAfterMap::new()),
            "openrouter",
            SelectionPolicy::Cost,
        ));
        router.register_provider(Arc::new(provider));

        let storage = Arc::new(MemoryStorage::new());
        storage.insert_user(
            "gw-paid-key",
            User {
                id: 1,
                api_key_id: 10,
                credits: 10.0,
                tier: "free".to_string(),
                stripe_subscription_id: None,
                subscription_status: None,
            },
        );

        let config = Config::default();
        let auth = Arc::new(AuthService::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            &config,
        ));
        let pricing = Arc::new(PricingService::new(registry, config.pricing.clone()));

        let handler = Arc::new(
            InferenceHandler::new(
                auth,
                pricing,
                router,
                Arc::clone(&storage) as Arc<dyn Storage>,
            )
            .with_inline_persistence(),
        );
        Fixture { handler, storage }
    }

    fn request(max_tokens: Option<u32>) -> InternalChatRequest {
        InternalChatRequest {
            model: "openai/gpt-4o".to_string(),
            // 40 characters of content: 10 estimated prompt tokens
            messages: vec![Message::user("0123456789012345678901234567890123456789")],
            temperature: None,
            max_tokens,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            user: None,
            stream: false,
        }
    }

    #[tokio::test]
    async fn test_happy_path_paid_user() {
        let fx = fixture(StubProvider {
            name: "openai".to_string(),
            usage: Some(Usage::new(10, 40)),
            stream_chunks: Vec::new(),
        });

        let response = fx
            .handler
            .process("gw-paid-key", request(Some(100)))
            .await
            .unwrap();

        assert_eq!(response.usage.prompt_tokens, 10);
        assert_eq!(response.usage.completion_tokens, 40);
        assert!((response.cost_usd - 0.000425).abs() < 1e-12);
        assert_eq!(response.provider_used, "openai");

        // Credits: 10.0 - 0.000425 = 9.999575
        let credits = fx.storage.credits("gw-paid-key").unwrap();
        assert!((credits - 9.999575).abs() < 1e-9);

        // One completed record with the right token counts
        let record = fx.storage.chat_request(&response.id).unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert_eq!(record.input_tokens, 10);
        assert_eq!(record.output_tokens, 40);
        assert_eq!(record.provider, "openai");
    }

    #[tokio::test]
    async fn test_insufficient_credits_no_record_no_charge() {
        let fx = fixture(StubProvider {
            name: "openai".to_string(),
            usage: Some(Usage::new(10, 40)),
            stream_chunks: Vec::new(),
        });
        fx.storage.insert_user(
            "gw-poor-key",
            User {
                id: 2,
                api_key_id: 20,
                credits: 0.0005,
                tier: "free".to_string(),
                stripe_subscription_id: None,
                subscription_status: None,
            },
        );

        let err = fx
            .handler
            .process("gw-poor-key", request(Some(100)))
            .await
            .unwrap_err();

        match err {
            GatewayError::InsufficientCredits {
                max_cost,
                max_output_tokens,
                input_tokens,
            } => {
                assert!((max_cost - 0.001025).abs() < 1e-12);
                assert_eq!(max_output_tokens, 100);
                assert_eq!(input_tokens, 10);
            }
            other => panic!("expected InsufficientCredits, got {other:?}"),
        }

        // No provider call, no record, no charge
        assert_eq!(fx.storage.chat_request_count(), 0);
        assert_eq!(fx.storage.credits("gw-poor-key").unwrap(), 0.0005);
    }

    #[tokio::test]
    async fn test_missing_usage_is_an_error() {
        let fx = fixture(StubProvider {
            name: "openai".to_string(),
            usage: None,
            stream_chunks: Vec::new(),
        });

        let err = fx
            .handler
            .process("gw-paid-key", request(Some(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Internal { .. }));
        // A failed record exists
        assert_eq!(fx.storage.chat_request_count(), 1);
    }

    #[tokio::test]
    async fn test_trial_user_charged_via_trial_tracking() {
        let fx = fixture(StubProvider {
            name: "openai".to_string(),
            usage: Some(Usage::new(10, 40)),
            stream_chunks: Vec::new(),
        });
        fx.storage.insert_user(
            "gw-trial-key",
            User {
                id: 3,
                api_key_id: 30,
                credits: 0.0,
                tier: "free".to_string(),
                stripe_subscription_id: None,
                subscription_status: None,
            },
        );
        fx.storage.insert_trial(
            "gw-trial-key",
            TrialRecord {
                is_trial: true,
                trial_end_date: Some(Utc::now() + chrono::Duration::days(1)),
                used_tokens: 0,
                used_requests: 0,
                used_credits: 0.0,
                max_tokens: 100_000,
                max_requests: 1_000,
                credit_cap: 5.0,
            },
        );

        let response = fx
            .handler
            .process("gw-trial-key", request(Some(100)))
            .await
            .unwrap();
        assert!((response.cost_usd - 0.000425).abs() < 1e-12);

        // Trial counters advanced; credits untouched
        let trial = fx.storage.trial_record("gw-trial-key").await.unwrap().unwrap();
        assert_eq!(trial.used_tokens, 50);
        assert_eq!(trial.used_requests, 1);
        assert!((trial.used_credits - 0.000425).abs() < 1e-12);
        assert_eq!(fx.storage.credits("gw-trial-key").unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_stream_with_usage_on_terminal_chunk() {
        let fx = fixture(StubProvider {
            name: "openai".to_string(),
            usage: None,
            stream_chunks: vec![
                content_chunk("Hello ", None, None),
                content_chunk("world", Some("stop"), Some(Usage::new(10, 40))),
            ],
        });

        let stream = Arc::clone(&fx.handler)
            .process_stream("gw-paid-key", request(Some(100)))
            .await
            .unwrap();
        let chunks: Vec<_> = stream.collect::<Vec<_>>().await;

        let contents: Vec<String> = chunks
            .iter()
            .filter_map(|c| c.as_ref().ok())
            .filter_map(|c| c.content.clone())
            .collect();
        assert_eq!(contents, vec!["Hello ", "world"]);

        // Usage snapshot rode the terminal chunk
        let last = chunks.last().unwrap().as_ref().unwrap();
        assert_eq!(last.finish_reason.as_deref(), Some("stop"));
        assert_eq!(last.usage.unwrap().total_tokens, 50);

        // Charged on the reported usage
        let credits = fx.storage.credits("gw-paid-key").unwrap();
        assert!((credits - 9.999575).abs() < 1e-9);
        assert_eq!(fx.storage.chat_request_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_missing_usage_estimates_chars_over_four() {
        // 800 characters of streamed content, 400 characters of prompt:
        // estimates (100, 200)
        let body = "x".repeat(800);
        let fx = fixture(StubProvider {
            name: "openai".to_string(),
            usage: None,
            stream_chunks: vec![content_chunk(&body, Some("stop"), None)],
        });

        let mut req = request(None);
        req.messages = vec![Message::user("y".repeat(400))];

        let stream = Arc::clone(&fx.handler)
            .process_stream("gw-paid-key", req)
            .await
            .unwrap();
        let _chunks: Vec<_> = stream.collect::<Vec<_>>().await;

        let usage = fx.storage.usage_records();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].total_tokens, 300);

        // Charge = 100·2.5e-6 + 200·1e-5 = 0.00225
        let credits = fx.storage.credits("gw-paid-key").unwrap();
        assert!((credits - (10.0 - 0.00225)).abs() < 1e-9);
    }
}
