//! Tollgate - Client-Side Admission Control
//!
//! This crate throttles outgoing requests before they reach a transport:
//! hierarchical token buckets gate requests per method or URL pattern while
//! drawing from a shared root ceiling, and a slow-start controller ramps
//! temporarily reduced limits back to their previous values over timed
//! steps. The transport itself is an external collaborator behind the
//! [`transport::Transport`] trait; the limiter wraps it in a
//! [`transport::Gated`] decorator and forwards outcomes unchanged.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod request;
pub mod transport;
