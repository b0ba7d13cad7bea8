//! Cooperative cancellation of a running build.

mod token;

pub use token::CancellationToken;
