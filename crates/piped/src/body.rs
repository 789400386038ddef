//! Streaming response body
//!
//! An export writes into a [`ChannelWriter`]; the HTTP layer reads the other
//! end of the channel as the response body. The channel is bounded, so a
//! slow client slows the export down instead of buffering the result.

use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use pipe_export::ExportError;

/// One chunk of response body, or the error that ended the export
pub type BodyChunk = Result<Bytes, ExportError>;

/// [`AsyncWrite`] adapter over a bounded channel of body chunks
///
/// Every `write` becomes one chunk. Once the receiving side is gone, writes
/// fail with [`io::ErrorKind::BrokenPipe`].
pub struct ChannelWriter {
    sender: PollSender<BodyChunk>,
}

impl ChannelWriter {
    /// Wrap the sending half of a body channel
    pub fn new(sender: mpsc::Sender<BodyChunk>) -> Self {
        Self {
            sender: PollSender::new(sender),
        }
    }
}

fn disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected")
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.sender.poll_reserve(cx)).map_err(|_| disconnected())?;
        self.sender
            .send_item(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| disconnected())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Chunks are handed over on write.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.sender.close();
        Poll::Ready(Ok(()))
    }
}
