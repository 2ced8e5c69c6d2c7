//! Open a tunnel to a relay and talk to whatever is on the other end.
//!
//! Writes `GET ADDR`, then the start of an HTTP request one line per second, and
//! copies everything the tunnel returns to stdout. Use `--help` to see the options.
//!
//! ```sh
//! cargo run --example tunnel -- --protocol h2 http://127.0.0.1:8080/h2/nosig/midway.example/5001
//! ```
//!
//! `https` and `wss` relays need TLS:
//!
//! ```sh
//! cargo run --example tunnel --features tls-ring -- --protocol ws wss://relay.example/ws/nosig/midway.example/5001
//! ```

use std::time::Duration;

use http::HeaderMap;
use hyperpipe::stream::StreamState;
use hyperpipe::{Dialer, Error, TunnelConfig};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hyperpipe=debug")),
        )
        .init();

    let args = clap::Command::new("tunnel")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Duplex tunnel over HTTP")
        .arg(
            clap::Arg::new("url")
                .help("The relay URL to dial")
                .required(true),
        )
        .arg(
            clap::Arg::new("protocol")
                .short('p')
                .long("protocol")
                .default_value("h2")
                .help("One of h1, h2, h3, ws"),
        )
        .arg(
            clap::Arg::new("host")
                .long("host")
                .default_value("midway.example")
                .help("Host header sent through the tunnel"),
        )
        .arg(
            clap::Arg::new("backoff")
                .long("backoff-ms")
                .value_parser(clap::value_parser!(u64))
                .default_value("300")
                .help("Delay between reads while the response is pending"),
        )
        .get_matches();

    let url = args.get_one::<String>("url").ok_or("url is required")?;
    let protocol = args
        .get_one::<String>("protocol")
        .map(String::as_str)
        .unwrap_or("h2");
    let host = args
        .get_one::<String>("host")
        .map(String::as_str)
        .unwrap_or("midway.example");
    let backoff = args.get_one::<u64>("backoff").copied().unwrap_or(300);

    let config = TunnelConfig::default().with_backoff(Duration::from_millis(backoff));
    let dialer = Dialer::builder()
        .with_default_transports()
        .with_config(config)
        .build();

    let mut tunnel = dialer.dial_with(protocol, url, HeaderMap::new()).await?;
    tracing::info!(?tunnel, "dialed");

    let lines = [
        "GET ADDR\r\n".to_owned(),
        "GET / HTTP/1.1\r\n".to_owned(),
        format!("Host: {host}\r\n\r\n"),
    ];
    let mut lines = lines.into_iter();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut pending = true;

    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            _ = tick.tick(), if pending => {
                match lines.next() {
                    Some(line) => tunnel.write_all(line.as_bytes()).await?,
                    None => pending = false,
                }
            }
            read = tunnel.read(&mut buf) => {
                let n = match read {
                    Ok(n) => n,
                    Err(error) if Error::from_io(&error).is_some_and(Error::is_no_progress) => {
                        eprintln!("relay never answered");
                        break;
                    }
                    Err(error) => return Err(error.into()),
                };

                if n == 0 {
                    if tunnel.state() == StreamState::RequestSent {
                        continue;
                    }
                    break;
                }

                stdout.write_all(&buf[..n]).await?;
                stdout.flush().await?;
            }
        }
    }

    tunnel.close().await?;
    Ok(())
}
