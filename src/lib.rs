//! paper-narrator library crate
//!
//! This module exposes internal types for integration testing.
//! The main binary is in main.rs.

#[macro_use]
extern crate log;

pub mod audio;
pub mod clock;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod document;
pub mod error;
pub mod event;
pub mod lock;
pub mod mixer;
pub mod narration;
pub mod net;
pub mod normalize;
pub mod pipeline;
pub mod prefetch;
pub mod scheduler;
pub mod session;
pub mod sources;
pub mod stdin;
pub mod transport;
