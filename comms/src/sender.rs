//! The sending end of the framed key-value protocol.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, Serialize};

/// The sending end handle of the communication.
///
/// Every frame is a big endian length prefix followed by the serialized message,
/// tensor payloads are written straight from the caller's slice.
pub struct OnoSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    /// Creates a new `OnoSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(LEN_TYPE_SIZE),
        }
    }

    /// Frames and sends `msg` through the inner writer.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Returns
    /// An `io::Error` if writing to the underlying writer fails.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { buf, tx } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);

        let tail = msg.serialize(buf);
        let tail_len = tail.map(<[u8]>::len).unwrap_or_default();
        let len = (buf.len() - LEN_TYPE_SIZE + tail_len) as LenType;
        buf[..LEN_TYPE_SIZE].copy_from_slice(&len.to_be_bytes());

        tx.write_all(buf).await?;

        if let Some(tail) = tail {
            tx.write_all(tail).await?;
        }

        tx.flush().await
    }
}
