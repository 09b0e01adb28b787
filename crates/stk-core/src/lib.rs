//! Core domain + application logic for the sticker/emoji pack generator bot.
//!
//! This crate is intentionally framework-agnostic. Telegram, ffmpeg and storage
//! live behind ports (traits) implemented in adapter crates or in the small
//! built-in implementations below (`store`, `security`).

pub mod cancel;
pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod media;
pub mod messaging;
pub mod pack;
pub mod pipeline;
pub mod ports;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod request;
pub mod security;
pub mod store;
pub mod uploader;

#[cfg(test)]
pub(crate) mod fakes;

pub use errors::{Error, PipelineError, Result};
