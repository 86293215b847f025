//! Payment gateway adapters implementing [`crate::domain::ports::PaymentProcessor`].

pub mod paystack;
pub mod resilient;
pub mod sandbox;

pub use paystack::PaystackProcessor;
pub use resilient::{ResilientProcessor, RetryConfig};
pub use sandbox::{SandboxCall, SandboxOp, SandboxProcessor};
