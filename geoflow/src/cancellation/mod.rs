//! Cooperative cancellation shared by every long-running operation.

mod token;

pub use token::CancellationToken;
