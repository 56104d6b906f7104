//! Request-scoped values passed between the HTTP layer, the gateway and the
//! storage backends.
//!
//! Nothing here is persisted by the gateway itself; objects live in whatever
//! backend the process was started with.

pub mod envelope;
pub mod object;
