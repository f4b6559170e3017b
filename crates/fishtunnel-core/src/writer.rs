//! Serialized writes onto a shared connection.
//!
//! Every producer that writes to a connection (the outbound relay direction
//! and the keepalive emitter) holds a clone of the same [`SerializedWriter`].
//! A call to [`SerializedWriter::write`] holds the lock across the whole
//! `write_all` + `flush`, so two calls never interleave on the wire. There is
//! no ordering between callers beyond that: whoever takes the lock first
//! writes first.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Write half of a connection guarded by a mutex.
#[derive(Debug)]
pub struct SerializedWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for SerializedWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin> SerializedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Write all of `bytes` and flush, atomically with respect to other
    /// holders of this writer.
    pub async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Shut down the write side of the connection.
    pub async fn shutdown(&self) -> io::Result<()> {
        self.inner.lock().await.shutdown().await
    }
}
