//! Background capture of the response side of an exchange.

use http::Uri;
use tokio::task::AbortHandle;
use tower::ServiceExt as _;
use tracing::Instrument as _;

use crate::body::{Body, Request};
use crate::handoff;
use crate::protocol::Protocol;
use crate::transport::HttpTransport;

/// Start the exchange on a background task.
///
/// The response body is delivered through the returned handoff as soon as the
/// response headers arrive. A failed exchange delivers absence. The task holds the
/// transport until it finishes or is aborted through the returned handle.
pub(crate) fn spawn(
    transport: HttpTransport,
    request: Request,
    protocol: Protocol,
    target: &Uri,
) -> (AbortHandle, handoff::Receiver<Body>) {
    let (mut tx, rx) = handoff::channel();
    let span = tracing::debug_span!("exchange", %protocol, %target);

    let task = tokio::spawn(
        async move {
            let delivery = match transport.oneshot(request).await {
                Ok(response) => {
                    tracing::debug!(status = %response.status(), "response arrived");
                    Some(response.into_body())
                }
                Err(error) => {
                    tracing::warn!(%error, "exchange failed");
                    None
                }
            };

            if let Err(error) = tx.resolve(delivery) {
                tracing::debug!(%error, "response already delivered");
            }
        }
        .instrument(span),
    );

    (task.abort_handle(), rx)
}
