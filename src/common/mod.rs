//! Shared building blocks: errors, metadata, latency history, interrupt
//! registry, pause gate, base64 and HTTP helpers, cache file.

pub mod base64;
pub mod cachefile;
pub mod error;
pub mod history;
pub mod http;
pub mod interrupt;
pub mod metadata;
pub mod pause;
pub mod urltest;

pub use error::{Error, Result};
pub use metadata::{Destination, FlowMetadata, Host, Network};
