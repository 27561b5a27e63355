//! External service clients
//!
//! Only the client seam lives here; transports are supplied by the caller.

pub mod llm;

pub use llm::{Generation, GuardedLlmClient, LlmClient};
