//! Tollgate - Admission Control for Multi-Tenant Services
//!
//! This crate implements per-request admission control with fixed-window
//! rate limiting. Counters are shared across service instances through a
//! remote store spoken to over its RESP wire protocol, and fall back to an
//! in-process limiter whenever that store is unreachable.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod resp;
pub mod store;
