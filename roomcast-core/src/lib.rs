//! Shared plumbing for the roomcast server: configuration, logging and
//! bootstrap errors.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{Error, Result};
