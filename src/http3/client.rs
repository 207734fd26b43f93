//! HTTP/3 client using h3 + quinn

use bytes::Buf;
use h3::client::SendRequest;
use h3_quinn::OpenStreams;
use quinn::{ClientConfig, Endpoint};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::http::RequestProfile;
use crate::types::{AttemptError, AttemptOutcome, ErrorKind, Protocol, Target};

/// HTTP/3 client wrapper around a single QUIC endpoint
pub struct Http3Client {
    endpoint: Endpoint,
}

impl Http3Client {
    pub fn new(insecure: bool) -> Result<Self, String> {
        let crypto = crate::tls::client_config(&[b"h3"], insecure)?;

        let client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| format!("Failed to create QUIC config: {}", e))?,
        ));

        let bind: SocketAddr = "[::]:0".parse().map_err(|e| format!("{}", e))?;
        let mut endpoint = Endpoint::client(bind)
            .or_else(|_| Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0))))
            .map_err(|e| format!("Failed to create endpoint: {}", e))?;
        endpoint.set_default_client_config(client_config);

        Ok(Self { endpoint })
    }

    /// Connect to a server and return a send request handle.
    /// The connection driver runs on its own task and ends when the handle is dropped.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> Result<SendRequest<OpenStreams, bytes::Bytes>, AttemptError> {
        let connection = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| AttemptError::new(ErrorKind::Connect, None, format!("Failed to connect: {}", e)))?
            .await
            .map_err(|e| AttemptError::new(ErrorKind::Connect, None, format!("Connection failed: {}", e)))?;

        let (mut driver, send_request) = h3::client::new(h3_quinn::Connection::new(connection))
            .await
            .map_err(|e| AttemptError::protocol(None, format!("H3 handshake failed: {}", e)))?;

        tokio::spawn(async move {
            let err = futures_util::future::poll_fn(|cx| driver.poll_close(cx)).await;
            tracing::debug!("H3 connection closed: {:?}", err);
        });

        Ok(send_request)
    }
}

async fn resolve(target: &Target) -> Result<SocketAddr, AttemptError> {
    tokio::net::lookup_host((target.bare_host(), target.port))
        .await
        .map_err(|e| AttemptError::new(ErrorKind::Connect, Some("ENOTFOUND"), e.to_string()))?
        .next()
        .ok_or_else(|| AttemptError::new(ErrorKind::Connect, Some("ENOTFOUND"), "no address for host"))
}

/// Execute one HTTP/3 request, draining the full response body
pub async fn execute_http3_request(
    client: &Http3Client,
    target: &Target,
    profile: &RequestProfile,
    body: Option<&str>,
    timeout: Duration,
) -> Result<AttemptOutcome, AttemptError> {
    let start = Instant::now();

    let result = tokio::time::timeout(timeout, async {
        let addr = resolve(target).await?;
        let mut send_request = client.connect(addr, target.bare_host()).await?;

        let mut req = http::Request::builder()
            .method(profile.method.as_str())
            .uri(target.base_url.as_str());
        for (name, value) in profile.headers.iter() {
            req = req.header(name.as_str(), value.as_bytes());
        }
        let req = req
            .body(())
            .map_err(|e| AttemptError::protocol(None, format!("Failed to build request: {}", e)))?;

        let mut stream = send_request
            .send_request(req)
            .await
            .map_err(|e| AttemptError::protocol(None, format!("Failed to send request: {}", e)))?;

        if let Some(body_data) = body {
            stream
                .send_data(bytes::Bytes::from(body_data.to_string()))
                .await
                .map_err(|e| AttemptError::protocol(None, format!("Failed to send body: {}", e)))?;
        }

        stream
            .finish()
            .await
            .map_err(|e| AttemptError::protocol(None, format!("Failed to finish stream: {}", e)))?;

        let response = stream
            .recv_response()
            .await
            .map_err(|e| AttemptError::protocol(None, format!("Failed to receive response: {}", e)))?;
        let status = response.status().as_u16();

        let mut bytes_received = 0u64;
        while let Some(chunk) = stream
            .recv_data()
            .await
            .map_err(|e| AttemptError::protocol(None, format!("Failed to receive data: {}", e)))?
        {
            bytes_received += chunk.remaining() as u64;
        }

        Ok::<_, AttemptError>((status, bytes_received))
    })
    .await;

    let latency_us = start.elapsed().as_micros() as u64;

    match result {
        Ok(Ok((status, bytes_received))) => Ok(AttemptOutcome::new(
            Protocol::Http3,
            status,
            latency_us,
            bytes_received,
        )),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(AttemptError::timeout("HTTP/3 request timed out")),
    }
}
