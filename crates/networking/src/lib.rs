//! Networking for Tidybook
//!
//! This crate provides the HTTP client that delivers queued mutations to
//! the booking API and fetches JSON for cache fills.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;

pub use client::{HttpClient, HttpClientConfig, HttpError, UpdateMethod};
