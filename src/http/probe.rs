use crate::http::client::create_probe_client;
use crate::types::{Protocol, ProtocolList, Target};
use reqwest::header::ALT_SVC;
use std::time::Duration;

/// One-shot capability check against the target.
///
/// Never fails: any error (timeout, refused connection, TLS failure) degrades
/// to HTTP/1.1 only.
pub async fn probe(target: &Target, timeout: Duration, insecure: bool) -> ProtocolList {
    match try_probe(target, timeout, insecure).await {
        Ok(protocols) => {
            tracing::info!(%protocols, "Protocol probe succeeded");
            protocols
        }
        Err(e) => {
            tracing::warn!("Protocol probe failed ({}), falling back to HTTP/1.1", e);
            ProtocolList::http1_only()
        }
    }
}

async fn try_probe(target: &Target, timeout: Duration, insecure: bool) -> Result<ProtocolList, String> {
    let client = create_probe_client(timeout, insecure).map_err(|e| e.to_string())?;

    let response = tokio::time::timeout(timeout, client.head(target.base_url.as_str()).send())
        .await
        .map_err(|_| format!("no response within {:?}", timeout))?
        .map_err(|e| e.to_string())?;

    let negotiated_h2 = response.version() == reqwest::Version::HTTP_2;
    let h3_advertised = response
        .headers()
        .get_all(ALT_SVC)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(advertises_h3);

    if h3_advertised && !cfg!(feature = "http3") {
        tracing::info!("Target advertises HTTP/3, but this build lacks the http3 feature");
    }

    Ok(order_protocols(
        negotiated_h2,
        h3_advertised && cfg!(feature = "http3"),
    ))
}

/// True when an `Alt-Svc` value lists an h3 alternative (`h3`, `h3-29`, ...)
pub fn advertises_h3(alt_svc: &str) -> bool {
    alt_svc
        .split(',')
        .filter_map(|entry| entry.split('=').next())
        .map(|proto| proto.trim().trim_matches('"').to_lowercase())
        .any(|proto| proto == "h3" || proto.starts_with("h3-"))
}

/// H3 first when usable, then whichever of H2/H1.1 the handshake negotiated, then the other.
pub fn order_protocols(negotiated_h2: bool, h3: bool) -> ProtocolList {
    let mut protocols = Vec::with_capacity(3);
    if h3 {
        protocols.push(Protocol::Http3);
    }
    if negotiated_h2 {
        protocols.extend([Protocol::Http2, Protocol::Http1]);
    } else {
        protocols.extend([Protocol::Http1, Protocol::Http2]);
    }
    ProtocolList::new(protocols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_advertises_h3() {
        assert!(advertises_h3(r#"h3=":443"; ma=86400"#));
        assert!(advertises_h3(r#"h2=":443", h3-29=":443"; ma=3600"#));
        assert!(!advertises_h3(r#"h2=":443"; ma=86400"#));
        assert!(!advertises_h3("clear"));
    }

    #[test]
    fn test_order_protocols() {
        assert_eq!(
            order_protocols(true, true).as_slice(),
            &[Protocol::Http3, Protocol::Http2, Protocol::Http1]
        );
        assert_eq!(
            order_protocols(false, false).as_slice(),
            &[Protocol::Http1, Protocol::Http2]
        );
    }

    #[tokio::test]
    async fn test_probe_reachable_target_includes_h1_and_h2() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("alt-svc", r#"h3=":443""#))
            .mount(&server)
            .await;

        let target = Target::parse(&server.uri()).unwrap();
        let protocols = probe(&target, Duration::from_secs(3), false).await;

        assert!(protocols.as_slice().contains(&Protocol::Http1));
        assert!(protocols.as_slice().contains(&Protocol::Http2));
        assert_eq!(
            protocols.as_slice().contains(&Protocol::Http3),
            cfg!(feature = "http3")
        );
    }

    #[tokio::test]
    async fn test_probe_unreachable_target_falls_back() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = Target::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
        let protocols = probe(&target, Duration::from_millis(500), false).await;

        assert_eq!(protocols.as_slice(), &[Protocol::Http1]);
    }
}
