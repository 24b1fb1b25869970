//! Rate limiting and bounded-time invocation

mod rate;
mod time;

pub use rate::RateLimiter;
pub use time::TimeLimiter;
