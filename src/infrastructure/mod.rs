//! Infrastructure Layer
//!
//! Cross-cutting concerns: rate limiting, background scheduling and shutdown.

pub mod rate_limiter;
pub mod scheduler;
pub mod shutdown;

pub use rate_limiter::{RateLimitConfig, RateLimitResult, RateLimiter};
pub use scheduler::spawn_periodic;
pub use shutdown::{shutdown_signal, ShutdownController, TaskGuard};
