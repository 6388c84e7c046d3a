//! Appgate - an application gateway for locally supervised web apps
//!
//! This library provides a gateway that:
//! - Discovers application configs on disk and assigns each a free port
//! - Launches every application through a process supervisor
//! - Routes requests by path prefix, optionally to a requested version
//! - Redirects traffic away from backends that are not online
//! - Accepts runtime registrations, rejecting port and path conflicts
//! - Uses connection pooling for efficient backend communication

pub mod admin;
pub mod app;
pub mod config;
pub mod conflict;
pub mod discovery;
pub mod error;
pub mod pool;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod registration;
pub mod registry;
pub mod router;
pub mod supervisor;
