//! # cmod Common Library
//!
//! Shared code for the comment moderation tools including:
//! - Error type
//! - Configuration loading and resolution
//! - Classification service wire protocol
//! - Moderation events and the EventBus

pub mod config;
pub mod error;
pub mod events;
pub mod protocol;

pub use error::{Error, Result};
