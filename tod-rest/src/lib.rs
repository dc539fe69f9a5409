//! REST collaborator for the TOD Markets API
//!
//! Provides the environment-backed configuration and an authenticated
//! client exposing the plain GET/POST helpers the realtime client builds on.

pub mod client;
pub mod config;

pub use client::TodClient;
pub use config::TodConfig;
