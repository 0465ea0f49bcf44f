#![doc = include_str!("../README.md")]

pub mod auth;
pub mod config;
pub mod remote;
pub mod telemetry;
pub mod util;

pub use firestore_remote_core::{Error, Result};
