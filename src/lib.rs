//! Turnstile - In-process Admission Control Engine
//!
//! This crate decides, for every inbound request, whether it may proceed.
//! Requests are counted per (rule, identifier) pair over a sliding time
//! window; an identifier that exceeds its rule's limit is blocked for a
//! fixed period, and blocks raise alerts that can be forwarded to external
//! sinks. Allow and deny lists override rule evaluation, and a janitor task
//! bounds the engine's memory by pruning stale state.
//!
//! # Fail-open
//!
//! A request that no active rule matches is **admitted**, and so is a request
//! whose evaluation fails internally. The engine never rejects traffic it
//! cannot account for; such decisions are tagged
//! [`ratelimit::DecisionReason::NoMatchingRule`] or
//! [`ratelimit::DecisionReason::FailOpen`] so callers can tell them apart.
//!
//! ```no_run
//! use std::time::Duration;
//! use turnstile::config::TurnstileConfig;
//! use turnstile::ratelimit::{AdmissionController, AdmissionRequest, RuleDraft, Scope};
//!
//! # fn main() -> turnstile::error::Result<()> {
//! let controller = AdmissionController::new(TurnstileConfig::default())?;
//! controller.create_rule(
//!     RuleDraft::new("auth", Scope::Endpoint, "/api/auth/*")
//!         .limit(5)
//!         .window(Duration::from_secs(60)),
//! )?;
//!
//! let request = AdmissionRequest::new("203.0.113.9", Scope::Endpoint)
//!     .with_endpoint("/api/auth/login")
//!     .with_ip("203.0.113.9");
//! let decision = controller.check_request(&request);
//! assert!(decision.allowed);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod janitor;
pub mod monitor;
pub mod ratelimit;
