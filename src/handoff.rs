//! Single-use handoff of a value from a background task.
//!
//! The sender resolves the slot exactly once, either with a value or with
//! absence. A second resolution is rejected rather than replacing the first.

use thiserror::Error;
use tokio::sync::oneshot;

/// The slot was already resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("handoff already resolved")]
pub(crate) struct AlreadyResolved;

/// What the receiving side observed.
#[derive(Debug)]
pub(crate) enum Delivery<T> {
    /// Nothing has been delivered yet.
    Pending,

    /// The value, handed over exactly once.
    Value(T),

    /// The sender resolved with nothing, or went away without resolving.
    Absent,
}

#[derive(Debug)]
pub(crate) struct Sender<T> {
    tx: Option<oneshot::Sender<Option<T>>>,
}

impl<T> Sender<T> {
    /// Resolve the slot. The receiver may already be gone, which is not an error.
    pub(crate) fn resolve(&mut self, value: Option<T>) -> Result<(), AlreadyResolved> {
        let tx = self.tx.take().ok_or(AlreadyResolved)?;
        if tx.send(value).is_err() {
            tracing::trace!("handoff receiver dropped before delivery");
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct Receiver<T> {
    rx: Option<oneshot::Receiver<Option<T>>>,
}

impl<T> Receiver<T> {
    /// Check the slot without waiting.
    pub(crate) fn try_take(&mut self) -> Delivery<T> {
        let Some(rx) = self.rx.as_mut() else {
            return Delivery::Absent;
        };

        match rx.try_recv() {
            Ok(value) => {
                self.rx = None;
                value.map_or(Delivery::Absent, Delivery::Value)
            }
            Err(oneshot::error::TryRecvError::Empty) => Delivery::Pending,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.rx = None;
                Delivery::Absent
            }
        }
    }

    /// Wait for the slot to resolve. Cancel safe.
    pub(crate) async fn take(&mut self) -> Option<T> {
        let rx = self.rx.as_mut()?;
        let value = rx.await.ok().flatten();
        self.rx = None;
        value
    }
}

pub(crate) fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = oneshot::channel();
    (Sender { tx: Some(tx) }, Receiver { rx: Some(rx) })
}
