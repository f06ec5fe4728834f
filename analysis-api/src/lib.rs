//! HTTP client for the external multimodal Analysis Service.
//!
//! The service exposes three surfaces: a resumable file-intake endpoint,
//! a file-status endpoint, and a content-generation endpoint. Credentials
//! are opaque API keys passed per call, so one `Client` serves any number
//! of credentials concurrently.

pub mod api;
pub mod client;
pub mod error;
pub mod models;

pub use client::Client;
pub use error::{ApiError, ApiResult};
