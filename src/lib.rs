//! Slidegate - Distributed Sliding-Window Rate Limiting
//!
//! This crate implements per-endpoint request rate limiting over a shared
//! window store. Every attempt is recorded as a timestamped event in a Redis
//! sorted set, so all service instances observe one consistent window per key.
//! Requests are admitted or rejected by an axum middleware; operators inspect
//! and clear limits through the admin API.

pub mod admin;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
