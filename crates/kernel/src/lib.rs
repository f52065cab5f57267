//! Hostdesk Kernel Library
//!
//! This library exposes kernel internals for integration testing.
//! The main entry point is the `hostdesk` binary.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod plugin;
pub mod routes;
pub mod state;
