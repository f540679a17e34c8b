//! Convo - streaming chat session engine
//!
//! This library provides connection resolution, stream decoding, context
//! budgeting and compression, and a tool-calling loop for chat sessions.

pub mod config;
pub mod error;
pub mod memory;
pub mod session;
pub mod store;
pub mod tools;
pub mod ui;

#[cfg(test)]
mod testsupport;

pub use error::{Error, Result};
