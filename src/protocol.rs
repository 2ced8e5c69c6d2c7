use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The carrier a tunnel is dialed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.1 with a chunked request body
    Http1,

    /// HTTP/2 with a streaming request body
    Http2,

    /// HTTP/3 with a streaming request body
    Http3,

    /// WebSocket upgrade, used as a native duplex stream
    WebSocket,
}

impl Protocol {
    /// All protocols a [`Dialer`](crate::Dialer) can route to.
    pub const ALL: [Protocol; 4] = [
        Protocol::Http1,
        Protocol::Http2,
        Protocol::Http3,
        Protocol::WebSocket,
    ];

    /// The canonical identifier for this protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http1",
            Protocol::Http2 => "http2",
            Protocol::Http3 => "http3",
            Protocol::WebSocket => "websocket",
        }
    }

    /// The HTTP version used for request/response carriers.
    ///
    /// Returns `None` for WebSocket, which never sends a streamed request.
    pub fn version(&self) -> Option<http::Version> {
        match self {
            Protocol::Http1 => Some(http::Version::HTTP_11),
            Protocol::Http2 => Some(http::Version::HTTP_2),
            Protocol::Http3 => Some(http::Version::HTTP_3),
            Protocol::WebSocket => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http1" | "h1" | "http/1.1" => Ok(Protocol::Http1),
            "http2" | "h2" => Ok(Protocol::Http2),
            "http3" | "h3" => Ok(Protocol::Http3),
            "websocket" | "ws" => Ok(Protocol::WebSocket),
            _ => Err(Error::UnsupportedProtocol(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_identifiers() {
        assert_eq!("h2".parse::<Protocol>().unwrap(), Protocol::Http2);
        assert_eq!("HTTP1".parse::<Protocol>().unwrap(), Protocol::Http1);
        assert_eq!("ws".parse::<Protocol>().unwrap(), Protocol::WebSocket);

        for protocol in Protocol::ALL {
            assert_eq!(protocol.as_str().parse::<Protocol>().unwrap(), protocol);
        }
    }

    #[test]
    fn parse_unknown() {
        let err = "gopher".parse::<Protocol>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocol(ref id) if id == "gopher"));
    }

    #[test]
    fn versions() {
        assert_eq!(Protocol::Http3.version(), Some(http::Version::HTTP_3));
        assert_eq!(Protocol::WebSocket.version(), None);
    }
}
