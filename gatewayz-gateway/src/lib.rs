//! # Gatewayz Gateway
//!
//! LLM API gateway: a single unified chat-completions API (streaming and
//! non-streaming) in front of ~30 heterogeneous upstream providers, with
//! gateway-issued API keys, trial and credit accounting, and a
//! multi-provider model catalog.
//!
//! The request pipeline, outermost in:
//!
//! 1. **Admission gate** - global concurrency limit with a bounded
//!    overflow queue ([`middleware::admission`]).
//! 2. **Behavioral rate limiter** - tiered IP and fingerprint limits with
//!    a velocity-mode error shield ([`middleware::security`]).
//! 3. **Authorization** - API-key resolution, trial validation, plan
//!    entitlements ([`auth`]).
//! 4. **Credit pre-check** - reservation against the maximum possible cost
//!    before any provider call ([`pricing`]).
//! 5. **Provider routing** - canonical model resolution with failover via
//!    the models SDK, primary-only for streams ([`inference`]).
//! 6. **Accounting** - usage extraction, cost computation, credit
//!    deduction or trial tracking, request persistence ([`storage`]).
//!
//! The multi-gateway model catalog, circuit breakers, and provider clients
//! live in the `gatewayz-models-sdk` crate.

pub mod auth;
pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod inference;
pub mod metrics;
pub mod middleware;
pub mod pricing;
pub mod routers;
pub mod server;
pub mod storage;
pub mod timing;

pub use config::Config;
pub use gateway_error::GatewayError;
pub use inference::{InferenceHandler, InternalChatRequest, InternalChatResponse};
pub use server::{create_server, AppState};
