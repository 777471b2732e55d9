#![cfg_attr(not(test), forbid(unsafe_code))]

//! Bazaar backend: buyer/vendor chat with realtime delivery, per-user
//! notifications and bKash payment reconciliation.

pub mod app_state;
pub mod auth;
pub mod db;
mod handlers;
pub mod http;
pub mod middleware;
pub mod openapi;
pub mod realtime;
mod routes;
pub mod server;
pub mod services;
mod tracer;

#[cfg(test)]
mod test_support;
