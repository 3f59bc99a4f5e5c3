//! Common utilities and types shared across Telecare components.

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for common data types
pub mod types;

/// Module for common configuration
pub mod config;

/// Module for local and remote media primitives
pub mod media;

/// Module for the signaling gateway contract
pub mod gateway;

/// Module for videoroom request and event payloads
pub mod videoroom;
