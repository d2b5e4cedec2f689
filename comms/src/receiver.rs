//! The receiving end of the framed key-value protocol.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Deserialize, LEN_TYPE_SIZE, LenType};

/// The element of a receive buffer, at least 4 bytes aligned so payloads can be
/// reinterpreted as `f32` slices.
pub trait FrameWord: bytemuck::Pod {}

impl FrameWord for u32 {}
impl FrameWord for u64 {}
impl FrameWord for f32 {}
impl FrameWord for f64 {}

/// The receiving end handle of the communication.
///
/// Keeps a 4 byte aligned scratch buffer so tensor payloads can be
/// borrowed as `f32` slices without copying them.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
    buf: Vec<u32>,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    /// Creates a new `OnoReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self {
            rx,
            buf: Vec::new(),
        }
    }

    /// Waits to receive a new message, the returned value borrows this receiver's buffer.
    ///
    /// # Returns
    /// The deserialized message or an `io::Error` on failure.
    pub async fn recv<'a, T: Deserialize<'a>>(&'a mut self) -> io::Result<T> {
        let Self { rx, buf } = self;
        let frame = read_frame(rx, buf).await?;
        T::deserialize(frame)
    }

    /// Waits to receive a new message into an external buffer.
    ///
    /// # Arguments
    /// * `buf` - The buffer to use for deserialization, the returned
    ///   `T`'s lifetimes will be tied to this buffer.
    ///
    /// # Returns
    /// The deserialized message or an `io::Error` on failure.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: FrameWord,
    {
        let frame = read_frame(&mut self.rx, buf).await?;
        T::deserialize(frame)
    }
}

/// Reads one length prefixed frame into `buf`.
///
/// # Returns
/// The frame's bytes viewed over `buf`.
async fn read_frame<'buf, R, B>(rx: &mut R, buf: &'buf mut Vec<B>) -> io::Result<&'buf [u8]>
where
    R: AsyncRead + Unpin,
    B: FrameWord,
{
    let mut size_buf = [0; LEN_TYPE_SIZE];
    rx.read_exact(&mut size_buf).await?;
    let len = LenType::from_be_bytes(size_buf) as usize;

    buf.clear();
    buf.resize(len.div_ceil(size_of::<B>()), B::zeroed());

    let view: &'buf mut [u8] = bytemuck::cast_slice_mut(buf.as_mut_slice());
    rx.read_exact(&mut view[..len]).await?;

    let view: &'buf [u8] = view;
    Ok(&view[..len])
}
