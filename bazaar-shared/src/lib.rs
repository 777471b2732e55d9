#![cfg_attr(not(test), forbid(unsafe_code))]

//! Types shared by the Bazaar server and its clients: wire models, realtime
//! channel naming and capabilities, presence tracking and configuration.

pub mod config;
pub mod models;
pub mod realtime;
