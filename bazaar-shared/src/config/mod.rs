//! # Configuration
//!
//! This module contains the server configuration structures and the layered
//! loader (defaults, file, environment, command line).

pub mod server;
