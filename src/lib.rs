//! Runlimit - invocation rate limiting for programs and program groups
//!
//! This crate bounds how many times a named program (or a group of programs
//! sharing a name) may run within a sliding time window. State lives in a
//! single ledger file guarded by a file lock, so independent processes on the
//! same machine share one limit without any coordinating service.
//!
//! ```no_run
//! use runlimit::{LimiterConfig, RateLimiter};
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new(LimiterConfig::with_store_path("/var/tmp/runlimit.json"));
//! let decision = limiter.attempt("nightly-backup", 3, Duration::from_secs(900))?;
//! if !decision.allowed {
//!     eprintln!("try again in {:?}", decision.retry_after);
//! }
//! # Ok::<(), runlimit::LimiterError>(())
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;

pub use crate::config::{LimiterConfig, StoreConfig};
pub use crate::error::{LimiterError, Result};
pub use crate::ratelimit::{Decision, RateLimiter, Usage};
