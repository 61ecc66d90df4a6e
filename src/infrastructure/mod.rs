//! Infrastructure Layer
//!
//! Cross-cutting concerns and infrastructure components.

pub mod cancellation;
pub mod retry;
pub mod shutdown;
pub mod write_locks;

pub use cancellation::CancelHandle;
pub use retry::{retry, RetryConfig};
pub use shutdown::shutdown_signal;
pub use write_locks::{KeyGuard, WriteLocks};
