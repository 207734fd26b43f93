use crate::engine::Executor;
use crate::http::client::{ClientOptions, create_client};
use crate::types::{AttemptError, AttemptOutcome, LoadConfig, Protocol, Target};
use rand::Rng;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, HeaderMap, HeaderName, HeaderValue, USER_AGENT,
};
use reqwest::{Client, Method};
use std::time::{Duration, Instant};

#[cfg(feature = "http3")]
use crate::http3::Http3Client;

const METHODS: [Method; 5] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::OPTIONS,
];

const USER_AGENTS: [&str; 6] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/127.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148",
    "curl/8.8.0",
    concat!("surge/", env!("CARGO_PKG_VERSION"), " (load-testing-tool)"),
];

const ACCEPTS: [&str; 4] = [
    "*/*",
    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
    "application/json",
    "application/json, text/plain, */*",
];

const LANGUAGES: [&str; 4] = ["en-US,en;q=0.9", "en-GB,en;q=0.8", "de-DE,de;q=0.7", "fr-FR,fr;q=0.6"];

const CACHE_CONTROLS: [&str; 3] = ["no-cache", "max-age=0", "no-store"];

/// Method and header mix for a single request.
#[derive(Debug, Clone)]
pub struct RequestProfile {
    pub method: Method,
    pub headers: HeaderMap,
}

impl RequestProfile {
    /// Randomize the method (unless fixed) and the client headers, then apply
    /// user headers on top so they always win.
    pub fn generate(fixed_method: Option<&Method>, user_headers: &[(HeaderName, HeaderValue)]) -> Self {
        let mut rng = rand::rng();
        let method = match fixed_method {
            Some(m) => m.clone(),
            None => METHODS[rng.random_range(0..METHODS.len())].clone(),
        };

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, pick(&mut rng, &USER_AGENTS));
        headers.insert(ACCEPT, pick(&mut rng, &ACCEPTS));
        headers.insert(ACCEPT_LANGUAGE, pick(&mut rng, &LANGUAGES));
        if rng.random_bool(0.5) {
            headers.insert(CACHE_CONTROL, pick(&mut rng, &CACHE_CONTROLS));
        }

        for (name, value) in user_headers {
            headers.insert(name.clone(), value.clone());
        }

        Self { method, headers }
    }

    pub fn has_body(&self) -> bool {
        self.method == Method::POST || self.method == Method::PUT
    }
}

fn pick(rng: &mut impl Rng, values: &[&'static str]) -> HeaderValue {
    HeaderValue::from_static(values[rng.random_range(0..values.len())])
}

pub fn parse_headers(headers: &[(String, String)]) -> Result<Vec<(HeaderName, HeaderValue)>, String> {
    headers
        .iter()
        .map(|(k, v)| {
            let name = HeaderName::try_from(k.as_str())
                .map_err(|_| format!("Invalid header name: {}", k))?;
            let value = HeaderValue::from_str(v)
                .map_err(|_| format!("Invalid value for header '{}'", k))?;
            Ok((name, value))
        })
        .collect()
}

/// Executes single request attempts over HTTP/1.1, HTTP/2 and (with the
/// `http3` feature) HTTP/3.
pub struct HttpExecutor {
    target: Target,
    http1: Client,
    http2: Client,
    #[cfg(feature = "http3")]
    http3: Option<Http3Client>,
    method: Option<Method>,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Option<String>,
    #[cfg_attr(not(feature = "http3"), allow(dead_code))]
    timeout: Duration,
}

impl HttpExecutor {
    pub fn new(target: Target, config: &LoadConfig) -> Result<Self, String> {
        let options = ClientOptions {
            pool_size: config.concurrency as usize,
            timeout: config.timeout,
            connect_timeout: config.connect_timeout,
            insecure: config.insecure,
        };

        let http1 = create_client(Protocol::Http1, &options)
            .map_err(|e| format!("Failed to create HTTP/1.1 client: {}", e))?;
        let http2 = create_client(Protocol::Http2, &options)
            .map_err(|e| format!("Failed to create HTTP/2 client: {}", e))?;

        #[cfg(feature = "http3")]
        let http3 = match Http3Client::new(config.insecure) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("HTTP/3 client unavailable: {}", e);
                None
            }
        };

        Ok(Self {
            target,
            http1,
            http2,
            #[cfg(feature = "http3")]
            http3,
            method: config.method.clone(),
            headers: parse_headers(&config.headers)?,
            body: config.body.clone(),
            timeout: config.timeout,
        })
    }

    async fn send(&self, client: &Client, protocol: Protocol) -> Result<AttemptOutcome, AttemptError> {
        let profile = RequestProfile::generate(self.method.as_ref(), &self.headers);
        let start = Instant::now();

        let mut request = client
            .request(profile.method.clone(), self.target.base_url.as_str())
            .headers(profile.headers.clone());
        if profile.has_body() {
            request = request.body(self.body.clone().unwrap_or_default());
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| AttemptError::from_reqwest_error(&e))?;
        let status = response.status().as_u16();

        // Latency covers the full body, and draining lets the connection be reused
        let mut bytes_received = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AttemptError::from_reqwest_error(&e))?
        {
            bytes_received += chunk.len() as u64;
        }

        let latency_us = start.elapsed().as_micros() as u64;
        Ok(AttemptOutcome::new(protocol, status, latency_us, bytes_received))
    }

    #[cfg(feature = "http3")]
    async fn send_http3(&self) -> Result<AttemptOutcome, AttemptError> {
        let client = self.http3.as_ref().ok_or_else(|| {
            AttemptError::protocol(Some("H3_UNAVAILABLE"), "HTTP/3 client failed to initialize")
        })?;
        let profile = RequestProfile::generate(self.method.as_ref(), &self.headers);
        let body = profile.has_body().then(|| self.body.clone().unwrap_or_default());
        crate::http3::execute_http3_request(client, &self.target, &profile, body.as_deref(), self.timeout)
            .await
    }

    #[cfg(not(feature = "http3"))]
    async fn send_http3(&self) -> Result<AttemptOutcome, AttemptError> {
        Err(AttemptError::protocol(
            Some("H3_UNSUPPORTED"),
            "built without the http3 feature",
        ))
    }
}

impl Executor for HttpExecutor {
    async fn attempt(&self, protocol: Protocol) -> Result<AttemptOutcome, AttemptError> {
        match protocol {
            Protocol::Http1 => self.send(&self.http1, protocol).await,
            Protocol::Http2 => self.send(&self.http2, protocol).await,
            Protocol::Http3 => self.send_http3().await,
        }
    }
}
