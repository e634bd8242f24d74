//! Shared domain types for the flightdeck worker fleet.
//!
//! Everything that crosses a crate boundary lives here: the error type,
//! the worker configuration, the message/tool-call model, LLM stream
//! events, client-facing output events, and the user-visible error-code
//! catalog.

pub mod config;
pub mod errmap;
pub mod error;
pub mod events;
pub mod message;
pub mod run;
pub mod stream;

pub use error::{Error, Result};
