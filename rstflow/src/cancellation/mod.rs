//! Cooperative cancellation for batches.

mod token;

pub use token::CancellationToken;
