//! Token rotation for upstream API credentials
//!
//! Spreads calls across several user-supplied tokens per provider and falls
//! back to anonymous access where the provider allows it. The tracker keeps a
//! per-provider set of tokens that hit a quota or rate limit today; selection
//! always returns the first token in list order that is not flagged, so tokens
//! are used as sequential fallbacks rather than load-balanced.
//!
//! Token lifecycle:
//! 1. Operator configures a comma-separated token list (`parse_tokens`)
//! 2. `run_with_token_rotation` picks the first available token and calls upstream
//! 3. Upstream reports a quota/rate-limit error → token flagged exhausted, next token tried
//! 4. Any other error → returned immediately, no rotation
//! 5. Every token flagged → anonymous call if allowed, otherwise `AllTokensExhausted`
//! 6. First read on a new UTC day sees an empty exhaustion map (lazy daily reset)

pub mod clock;
pub mod error;
pub mod quota;
pub mod rotation;
pub mod store;
pub mod tokens;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result, RotationError};
pub use quota::{classify, is_quota_error};
pub use rotation::{MAX_ROTATION_ATTEMPTS, Rotated, run_with_token_rotation};
pub use store::{FileBackend, MemoryBackend, StatusBackend, TokenStatusStore};
pub use tokens::parse_tokens;
pub use tracker::{TokenStats, TokenTracker};
