//! Authguard - abuse-control rate limiting for authentication endpoints
//!
//! This crate throttles sensitive actions such as login, signup, password
//! changes and email verification per caller identity. Each named policy
//! keeps an independent token bucket for every identity it sees, refilled
//! in fixed windows. Decisions are plain in-process arithmetic: no I/O,
//! no blocking beyond a per-bucket lock.

pub mod config;
pub mod error;
pub mod ratelimit;
