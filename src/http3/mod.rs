//! HTTP/3 client implementation (feature-gated)
//!
//! Enable with: cargo build --features http3
//!
//! HTTP/3 runs over QUIC, so it needs its own client stack (quinn + h3)
//! rather than the reqwest clients used for HTTP/1.1 and HTTP/2.

mod client;

pub use client::{Http3Client, execute_http3_request};
