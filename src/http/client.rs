use crate::types::Protocol;
use reqwest::Client;
use reqwest::redirect::Policy;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub pool_size: usize,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub insecure: bool,
}

/// Build a client pinned to one HTTP version.
///
/// HTTP/1.1 clients never pipeline and keep one idle keep-alive connection per
/// worker; HTTP/2 clients multiplex over prior-knowledge connections.
pub fn create_client(
    protocol: Protocol,
    options: &ClientOptions,
) -> Result<Client, Box<dyn std::error::Error + Send + Sync>> {
    let mut builder = Client::builder()
        .connect_timeout(options.connect_timeout)
        .timeout(options.timeout)
        .tcp_nodelay(true)
        .gzip(true)
        .brotli(true)
        .danger_accept_invalid_certs(options.insecure)
        .redirect(Policy::none())
        .pool_max_idle_per_host(options.pool_size)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60));

    builder = match protocol {
        Protocol::Http1 => builder.http1_only(),
        Protocol::Http2 => builder
            .http2_prior_knowledge()
            .http2_keep_alive_interval(Duration::from_secs(20)),
        Protocol::Http3 => {
            return Err("HTTP/3 is served by the QUIC client, not reqwest".into());
        }
    };

    Ok(builder.build()?)
}

/// One-shot client for the startup probe: ALPN negotiation, no idle pooling,
/// so the probe connection closes as soon as the client is dropped.
pub fn create_probe_client(
    timeout: Duration,
    insecure: bool,
) -> Result<Client, Box<dyn std::error::Error + Send + Sync>> {
    let client = Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .danger_accept_invalid_certs(insecure)
        .redirect(Policy::none())
        .pool_max_idle_per_host(0)
        .pool_idle_timeout(Duration::ZERO)
        .build()?;
    Ok(client)
}
