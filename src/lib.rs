//! Bulk annotation generation
//!
//! This library provides the batch core of the annotation service: job
//! submission, a bounded worker pool per job, a shared sliding-window rate
//! limiter, retry with backoff, cooperative cancellation and pull-based
//! progress reporting, plus the HTTP routes exposing them.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
