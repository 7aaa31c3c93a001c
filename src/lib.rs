//! Mosaic Server Library
//!
//! Resumable, content-addressed chunked uploads. The server binary is in
//! main.rs; the library is exposed for integration with other front ends.
//!
//! # Modules
//!
//! - `upload`: fragment store, dedup index, assembly coordinator, intake
//! - `routes`: axum handlers for the intake boundary
//! - `config`: environment-driven configuration

pub mod config;
pub mod routes;
pub mod state;
pub mod upload;
