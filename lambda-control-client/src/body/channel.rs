//! Body::channel utilities. Extracted from Hyper under MIT license.
//! https://github.com/hyperium/hyper/blob/master/LICENSE

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use crate::body::{
    sender::{self, Sender},
    watch,
};
use crate::Error;
use bytes::Bytes;
use futures_channel::mpsc;
use futures_util::{stream::FusedStream, Stream};
use http_body::{Body, Frame};

/// Receiver half of [`Body::channel()`]: a chunked request body fed frame
/// by frame through the associated [`Sender`].
///
/// [`Body::channel()`]: crate::body::Body::channel
pub struct ChannelBody {
    want_tx: watch::Sender,
    data_rx: mpsc::Receiver<Result<Bytes, Error>>,
}

pub fn channel() -> (Sender, ChannelBody) {
    let (data_tx, data_rx) = mpsc::channel(0);
    let (want_tx, want_rx) = watch::channel(sender::WANT_READY);

    let tx = Sender { want_rx, data_tx };
    let rx = ChannelBody { want_tx, data_rx };

    (tx, rx)
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.want_tx.send(sender::WANT_READY);

        if self.data_rx.is_terminated() {
            return Poll::Ready(None);
        }
        match ready!(Pin::new(&mut self.data_rx).poll_next(cx)?) {
            Some(chunk) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            None => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.data_rx.is_terminated()
    }
}
