#![allow(missing_docs)]

use std::convert::Infallible;
use std::future::pending;

use http::{header, HeaderMap, HeaderValue, StatusCode, Uri, Version};
use hyperpipe::dial::ROUTING_CLAIM;
use hyperpipe::stream::StreamState;
use hyperpipe::transport::{Handshake, UpgradeRequest};
use hyperpipe::{Body, Dialer, Error, Protocol, TunnelRequest, UpgradeError};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::mpsc;

type Seen = mpsc::UnboundedSender<(&'static str, http::request::Parts)>;

/// A carrier which reports each request it is handed and never answers.
fn silent(
    name: &'static str,
    seen: Seen,
) -> impl tower::Service<
    http::Request<Body>,
    Response = http::Response<Body>,
    Error = Infallible,
    Future = impl Send + 'static,
> + Clone
+ Send
+ Sync
+ 'static {
    tower::service_fn(move |request: http::Request<Body>| {
        let seen = seen.clone();
        async move {
            let (parts, _body) = request.into_parts();
            seen.send((name, parts)).ok();
            pending::<Result<http::Response<Body>, Infallible>>().await
        }
    })
}

fn dialer(seen: Seen) -> Dialer {
    Dialer::builder()
        .with_http1(silent("h1", seen.clone()))
        .with_http2(silent("h2", seen.clone()))
        .with_http3(silent("h3", seen))
        .build()
}

#[tokio::test]
async fn dispatches_by_protocol() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dialer = dialer(tx);

    for (protocol, name, version) in [
        ("h1", "h1", Version::HTTP_11),
        ("http2", "h2", Version::HTTP_2),
        ("h3", "h3", Version::HTTP_3),
    ] {
        let stream = dialer
            .dial_with(protocol, "https://relay.example/p/5001", HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(stream.state(), StreamState::RequestSent);

        let (carrier, parts) = rx.recv().await.unwrap();
        assert_eq!(carrier, name);
        assert_eq!(parts.version, version);
        assert_eq!(parts.method, http::Method::PUT);
        assert!(!parts.headers.contains_key(header::CONTENT_LENGTH));
        assert!(!parts.headers.contains_key(header::CONNECTION));
        assert_eq!(
            parts.headers[&ROUTING_CLAIM],
            "https://relay.example/p/5001"
        );
    }
}

#[tokio::test]
async fn unknown_protocol_never_reaches_a_carrier() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dialer = dialer(tx);

    let err = dialer
        .dial_with("gopher", "https://relay.example/", HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedProtocol(_)));

    drop(dialer);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn missing_carrier() {
    let dialer = Dialer::default();
    for protocol in Protocol::ALL {
        let err = dialer
            .dial(TunnelRequest::new(
                protocol,
                Uri::from_static("https://relay.example/"),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportUnavailable(p) if p == protocol));
    }
}

#[tokio::test]
async fn caller_routing_claim_is_kept() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dialer = dialer(tx);

    let request = TunnelRequest::new(Protocol::Http2, Uri::from_static("https://relay.example/"))
        .with_header(ROUTING_CLAIM, HeaderValue::from_static("custom"))
        .with_header(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token"),
        );
    let _stream = dialer.dial(request).await.unwrap();

    let (_, parts) = rx.recv().await.unwrap();
    assert_eq!(parts.headers[&ROUTING_CLAIM], "custom");
    assert_eq!(parts.headers[header::AUTHORIZATION], "Bearer token");
}

fn upgrade_answering(status: StatusCode) -> Dialer {
    Dialer::builder()
        .with_websocket(tower::service_fn(move |request: UpgradeRequest| async move {
            assert!(request.headers().contains_key(&ROUTING_CLAIM));
            if status == StatusCode::SWITCHING_PROTOCOLS {
                let (io, mut peer) = tokio::io::duplex(64);
                tokio::spawn(async move {
                    let mut buf = [0u8; 5];
                    peer.read_exact(&mut buf).await.unwrap();
                    peer.write_all(&buf).await.unwrap();
                });
                Ok::<_, Infallible>(Handshake::switched(io))
            } else {
                Ok(Handshake::rejected(status))
            }
        }))
        .build()
}

#[tokio::test]
async fn upgrade_requires_switching_protocols() {
    for status in [StatusCode::OK, StatusCode::FORBIDDEN, StatusCode::BAD_GATEWAY] {
        let err = upgrade_answering(status)
            .dial_with("ws", "wss://relay.example/ws/5001", HeaderMap::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::UpgradeFailed(UpgradeError::Status(s)) if s == status),
            "{status}: {err}"
        );
    }
}

#[tokio::test]
async fn upgrade_starts_ready() {
    let mut stream = upgrade_answering(StatusCode::SWITCHING_PROTOCOLS)
        .dial_with("websocket", "wss://relay.example/ws/5001", HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(stream.state(), StreamState::Ready);
    assert_eq!(stream.info().protocol(), Protocol::WebSocket);

    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn upgrade_transport_error() {
    let dialer = Dialer::builder()
        .with_websocket(tower::service_fn(|_: UpgradeRequest| async {
            Err::<Handshake, _>(std::io::Error::other("connection refused"))
        }))
        .build();

    let err = dialer
        .dial_with("ws", "ws://relay.example/", HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UpgradeFailed(UpgradeError::Transport(_))
    ));
}

#[tokio::test]
async fn readiness_failure_is_dial_error() {
    #[derive(Clone)]
    struct Broken;

    impl tower::Service<http::Request<Body>> for Broken {
        type Response = http::Response<Body>;
        type Error = std::io::Error;
        type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Err(std::io::Error::other("pool closed")))
        }

        fn call(&mut self, _request: http::Request<Body>) -> Self::Future {
            std::future::ready(Err(std::io::Error::other("unreachable")))
        }
    }

    let dialer = Dialer::builder().with_http1(Broken).build();
    let err = dialer
        .dial_with("h1", "http://relay.example/", HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Dial(_)));
}
