//! Hashing reader wrapper for the forwarding path.
//!
//! Every byte read through a [`DigestReader`] is fed to SHA-256 and counted,
//! so the stream is hashed on its way to the remote without a second pass.

use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Reader wrapper that hashes and counts the bytes passing through it
pub struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
    bytes_transferred: Arc<AtomicU64>,
}

impl<R> DigestReader<R> {
    /// Wrap `inner`, adding every byte read to `bytes_transferred`.
    pub fn new(inner: R, bytes_transferred: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_transferred,
        }
    }

    /// Lowercase hex SHA-256 of everything read so far.
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R> AsyncRead for DigestReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;

        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let chunk = &buf.filled()[before..];
        if !chunk.is_empty() {
            this.hasher.update(chunk);
            this.bytes_transferred
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }

        Poll::Ready(Ok(()))
    }
}
