//! The `utils` module collects the ambient pieces shared by the rest of
//! `popsub-consumer`: error types, logging setup and OS signal handling.

pub mod error;
pub mod logging;
pub mod signal;

#[cfg(test)]
mod tests;
