//! convertkit - Self-hosted document and media conversion service
//!
//! This library provides the job orchestrator, the converters wrapping the
//! external tools, artifact storage and the HTTP API.

pub mod api;
pub mod config;
pub mod convert;
pub mod jobs;
pub mod storage;
pub mod tools;
