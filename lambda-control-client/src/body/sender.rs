//! Body::channel utilities. Extracted from Hyper under MIT license.
//! https://github.com/hyperium/hyper/blob/master/LICENSE

use crate::Error;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_channel::mpsc;

use super::watch;

type BodySender = mpsc::Sender<Result<Bytes, Error>>;

pub(crate) const WANT_PENDING: usize = 1;
pub(crate) const WANT_READY: usize = 2;

/// A sender half created through [`Body::channel()`].
///
/// The sender is demand driven: `send_data` suspends until the connection
/// has asked for the next frame, so a caller that writes fragment by
/// fragment is naturally paced by the peer.
///
/// Dropping the sender terminates the body normally (the empty terminating
/// chunk is written). Call [`Sender::abort()`] instead to tear the request
/// down mid-body.
///
/// [`Body::channel()`]: crate::body::Body::channel
#[must_use = "Sender does nothing unless sent on"]
pub struct Sender {
    pub(crate) want_rx: watch::Receiver,
    pub(crate) data_tx: BodySender,
}

impl Sender {
    /// Check to see if this `Sender` can send more data.
    pub fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        // Check if the receiver end has tried polling for the body yet
        ready!(self.poll_want(cx)?);
        self.data_tx
            .poll_ready(cx)
            .map_err(|_| Error::new(SenderError::ChannelClosed))
    }

    fn poll_want(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        match self.want_rx.load(cx) {
            WANT_READY => Poll::Ready(Ok(())),
            WANT_PENDING => Poll::Pending,
            watch::CLOSED => Poll::Ready(Err(Error::new(SenderError::ChannelClosed))),
            unexpected => unreachable!("want_rx value: {}", unexpected),
        }
    }

    async fn ready(&mut self) -> Result<(), Error> {
        futures_util::future::poll_fn(|cx| self.poll_ready(cx)).await
    }

    /// Send one body frame once the connection wants it.
    pub async fn send_data(&mut self, chunk: Bytes) -> Result<(), Error> {
        self.ready().await?;
        self.data_tx
            .try_send(Ok(chunk))
            .map_err(|_| Error::new(SenderError::ChannelClosed))
    }

    /// Send a `SenderError::BodyWriteAborted` error and terminate the stream.
    pub fn abort(mut self) {
        self.send_error(Error::new(SenderError::BodyWriteAborted));
    }

    /// A detached handle that can abort the stream even after the `Sender`
    /// itself has been handed elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            data_tx: self.data_tx.clone(),
        }
    }

    /// Terminate the stream with an error.
    pub fn send_error(&mut self, err: Error) {
        let _ = self
            .data_tx
            // clone so the send works even if buffer is full
            .clone()
            .try_send(Err(err));
    }
}

/// Handle created through [`Sender::abort_handle`], able to terminate the
/// stream abnormally without owning the sender.
#[derive(Clone)]
pub struct AbortHandle {
    data_tx: BodySender,
}

impl AbortHandle {
    /// Terminate the stream with a write-aborted error. No-op when the
    /// body has already completed.
    pub fn abort(&mut self) {
        let _ = self
            .data_tx
            .clone()
            .try_send(Err(Error::new(SenderError::BodyWriteAborted)));
    }
}

#[derive(Debug)]
enum SenderError {
    ChannelClosed,
    BodyWriteAborted,
}

impl SenderError {
    fn description(&self) -> &str {
        match self {
            SenderError::BodyWriteAborted => "user body write aborted",
            SenderError::ChannelClosed => "channel closed",
        }
    }
}

impl std::fmt::Display for SenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

impl std::error::Error for SenderError {}
