//! # Persistence Interface
//!
//! The gateway reads and writes a handful of logical tables - users, API
//! keys, plans, trial usage, usage records, chat request records, catalog
//! snapshots, pricing overrides - through the opaque [`Storage`] trait. The
//! relational backend lives behind this seam; [`MemoryStorage`] backs tests
//! and local development.
//!
//! Writes that fail transiently are retried synchronously once via
//! [`retry_transient`]; a final failure is logged and surfaced to the
//! caller, never silently swallowed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gatewayz_models_sdk::catalog::{ModelRecord, Pricing};
use gatewayz_models_sdk::CatalogSnapshotSource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Connection-shaped failures worth one synchronous retry
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// A gateway user resolved from an API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub api_key_id: i64,
    pub credits: f64,
    pub tier: String,
    pub stripe_subscription_id: Option<String>,
    pub subscription_status: Option<String>,
}

impl User {
    /// Active paid subscription or a paid tier.
    pub fn has_active_subscription(&self) -> bool {
        (self.stripe_subscription_id.is_some()
            && self.subscription_status.as_deref() == Some("active"))
            || matches!(self.tier.as_str(), "pro" | "max" | "admin")
    }
}

/// Trial state for one API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub is_trial: bool,
    pub trial_end_date: Option<DateTime<Utc>>,
    pub used_tokens: u64,
    pub used_requests: u64,
    pub used_credits: f64,
    pub max_tokens: u64,
    pub max_requests: u64,
    pub credit_cap: f64,
}

impl TrialRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.trial_end_date.map(|end| end <= now).unwrap_or(false)
    }

    pub fn limits_exceeded(&self) -> bool {
        self.used_tokens >= self.max_tokens
            || self.used_requests >= self.max_requests
            || self.used_credits >= self.credit_cap
    }
}

/// Per-tier entitlements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub tier: String,
    pub daily_request_cap: u64,
    pub monthly_request_cap: u64,
    pub daily_token_cap: u64,
    pub monthly_token_cap: u64,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: i64,
    pub api_key_id: i64,
    pub model: String,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Completed,
    Failed,
    Partial,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Partial => "partial",
        }
    }
}

/// One row of `chat_completion_requests`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequestRecord {
    pub request_id: String,
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub model: String,
    pub provider: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub processing_time_ms: u64,
    pub status: RequestStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Opaque data-access layer over the gateway's logical tables.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn user_by_api_key(&self, api_key: &str) -> Result<Option<User>, StorageError>;
    async fn api_key_id(&self, api_key: &str) -> Result<Option<i64>, StorageError>;
    async fn trial_record(&self, api_key: &str) -> Result<Option<TrialRecord>, StorageError>;
    async fn plan_for_user(&self, user_id: i64) -> Result<Option<Plan>, StorageError>;

    /// Deduct an exact charge from the user's balance.
    async fn deduct_credits(
        &self,
        api_key: &str,
        amount: f64,
        description: &str,
    ) -> Result<(), StorageError>;

    async fn record_usage(&self, record: UsageRecord) -> Result<(), StorageError>;

    /// Accumulate trial usage counters for an API key.
    async fn track_trial_usage(
        &self,
        api_key: &str,
        tokens: u64,
        requests: u64,
        credits: f64,
    ) -> Result<(), StorageError>;

    async fn save_chat_request(&self, record: ChatRequestRecord) -> Result<(), StorageError>;

    /// Most recent successful catalog snapshot for a gateway.
    async fn catalog_snapshot(
        &self,
        gateway: &str,
    ) -> Result<Option<Vec<ModelRecord>>, StorageError>;

    async fn save_catalog_snapshot(
        &self,
        gateway: &str,
        records: &[ModelRecord],
    ) -> Result<(), StorageError>;

    /// Manual pricing overlay rows.
    async fn pricing_overrides(&self) -> Result<HashMap<String, Pricing>, StorageError>;
}

/// Retry a storage write once on a transient failure.
pub async fn retry_transient<T, F, Fut>(operation: &str, f: F) -> Result<T, StorageError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, StorageError>>,
{
    match f().await {
        Ok(value) => Ok(value),
        Err(e) if e.is_transient() => {
            tracing::warn!(operation, error = %e, "transient storage failure, retrying once");
            f().await
        }
        Err(e) => Err(e),
    }
}

/// Adapter exposing a [`Storage`] as the SDK's catalog snapshot source.
pub struct StorageSnapshotSource(pub Arc<dyn Storage>);

#[async_trait]
impl CatalogSnapshotSource for StorageSnapshotSource {
    async fn snapshot(&self, gateway: &str) -> Option<Vec<ModelRecord>> {
        match self.0.catalog_snapshot(gateway).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(gateway, error = %e, "catalog snapshot read failed");
                None
            }
        }
    }
}

/// In-memory store for tests and local development.
#[derive(Default)]
pub struct MemoryStorage {
    users: DashMap<String, User>,
    trials: DashMap<String, TrialRecord>,
    plans: DashMap<i64, Plan>,
    usage: Mutex<Vec<UsageRecord>>,
    chat_requests: DashMap<String, ChatRequestRecord>,
    snapshots: DashMap<String, Vec<ModelRecord>>,
    pricing: Mutex<HashMap<String, Pricing>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, api_key: impl Into<String>, user: User) {
        self.users.insert(api_key.into(), user);
    }

    pub fn insert_trial(&self, api_key: impl Into<String>, trial: TrialRecord) {
        self.trials.insert(api_key.into(), trial);
    }

    pub fn insert_plan(&self, user_id: i64, plan: Plan) {
        self.plans.insert(user_id, plan);
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.lock().unwrap().clone()
    }

    pub fn chat_request(&self, request_id: &str) -> Option<ChatRequestRecord> {
        self.chat_requests.get(request_id).map(|r| r.clone())
    }

    pub fn chat_request_count(&self) -> usize {
        self.chat_requests.len()
    }

    pub fn credits(&self, api_key: &str) -> Option<f64> {
        self.users.get(api_key).map(|u| u.credits)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn user_by_api_key(&self, api_key: &str) -> Result<Option<User>, StorageError> {
        Ok(self.users.get(api_key).map(|u| u.clone()))
    }

    async fn api_key_id(&self, api_key: &str) -> Result<Option<i64>, StorageError> {
        Ok(self.users.get(api_key).map(|u| u.api_key_id))
    }

    async fn trial_record(&self, api_key: &str) -> Result<Option<TrialRecord>, StorageError> {
        Ok(self.trials.get(api_key).map(|t| t.clone()))
    }

    async fn plan_for_user(&self, user_id: i64) -> Result<Option<Plan>, StorageError> {
        Ok(self.plans.get(&user_id).map(|p| p.clone()))
    }

    async fn deduct_credits(
        &self,
        api_key: &str,
        amount: f64,
        _description: &str,
    ) -> Result<(), StorageError> {
        let mut user = self
            .users
            .get_mut(api_key)
            .ok_or_else(|| StorageError::Other(format!("no user for key {api_key}")))?;
        user.credits -= amount;
        Ok(())
    }

    async fn record_usage(&self, record: UsageRecord) -> Result<(), StorageError> {
        self.usage.lock().unwrap().push(record);
        Ok(())
    }

    async fn track_trial_usage(
        &self,
        api_key: &str,
        tokens: u64,
        requests: u64,
        credits: f64,
    ) -> Result<(), StorageError> {
        let mut trial = self
            .trials
            .get_mut(api_key)
            .ok_or_else(|| StorageError::Other(format!("no trial for key {api_key}")))?;
        trial.used_tokens += tokens;
        trial.used_requests += requests;
        trial.used_credits += credits;
        Ok(())
    }

    async fn save_chat_request(&self, record: ChatRequestRecord) -> Result<(), StorageError> {
        self.chat_requests
            .insert(record.request_id.clone(), record);
        Ok(())
    }

    async fn catalog_snapshot(
        &self,
        gateway: &str,
    ) -> Result<Option<Vec<ModelRecord>>, StorageError> {
        Ok(self.snapshots.get(gateway).map(|s| s.clone()))
    }

    async fn save_catalog_snapshot(
        &self,
        gateway: &str,
        records: &[ModelRecord],
    ) -> Result<(), StorageError> {
        self.snapshots.insert(gateway.to_string(), records.to_vec());
        Ok(())
    }

    async fn pricing_overrides(&self) -> Result<HashMap<String, Pricing>, StorageError> {
        Ok(self.pricing.lock().unwrap().clone())
    }
}
