//! Meshguard - Rate limit decision engine for service mesh proxies
//!
//! For every request a proxy forwards, the engine matches the request against
//! a layered policy (vhost defaults and per-route overrides), checks local
//! descriptors against in-process token buckets and global descriptors
//! against a shared counting service, and merges the verdicts into a single
//! admit or deny decision.

pub mod config;
pub mod counting;
pub mod engine;
pub mod error;
pub mod grpc;
pub mod policy;
pub mod ratelimit;

pub use engine::RateLimitEngine;
