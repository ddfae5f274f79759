//! Lazyproxy - A TCP proxy that starts its backend on demand
//!
//! This library provides a transparent TCP proxy that:
//! - Launches the backend command on the first client connection
//! - Retries connecting to the backend until its listener is up
//! - Relays bytes in both directions without looking at them
//! - Stops the backend's whole process group after a period of inactivity
//! - Starts it again when the next client arrives

pub mod cli;
pub mod config;
pub mod error;
pub mod forward;
pub mod process;
pub mod proxy;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
