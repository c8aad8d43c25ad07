//! Orderguard - Per-Client Order Rate Limiting
//!
//! This crate caps how many orders a single client address may place within
//! a recurring calendar window (minutes, hourly, daily, weekly or monthly) in
//! the store's timezone. Once the cap is reached, checkout is refused with a
//! templated message until the window rolls over.

pub mod config;
pub mod error;
pub mod identity;
pub mod ratelimit;
