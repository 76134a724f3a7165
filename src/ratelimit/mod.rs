//! Rate limiting logic and durable state.

mod audit;
mod clock;
mod identifier;
mod ledger;
mod limiter;
mod window;

pub use audit::AuditLog;
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use identifier::IdentifierKey;
pub use ledger::{FileLedger, LedgerUpdate};
pub use limiter::RateLimiter;
pub use window::{evaluate, prune, window_span, Decision, Evaluation, Policy, Usage};
