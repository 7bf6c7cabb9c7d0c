//! Rate limiting logic: key derivation, sliding window decisions and named limiters.

mod key;
mod limiter;
mod rules;
mod window;

pub use key::{KeyError, KeyInputs, KeyStrategy, RateLimitKey};
pub use limiter::{LimiterRegistry, RateLimiter};
pub use rules::{LimiterConfig, LimiterRules};
pub use window::{decide, Attempt, Decision, SlidingWindow, Verdict};
