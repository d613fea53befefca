//! Tollgate - Per-key request admission control
//!
//! This crate decides, per caller-defined key, whether a request may proceed
//! using a token bucket with a configurable fill rate and capacity. Rejected
//! requests are collected in an in-process rejection sink for later
//! inspection or replay.

pub mod config;
pub mod error;
pub mod ratelimit;
