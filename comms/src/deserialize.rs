use std::io;

/// Reads a value back from a frame, possibly borrowing from it.
pub trait Deserialize<'a>: Sized {
    /// Deserializes an instance from `buf`.
    ///
    /// # Arguments
    /// * `buf` - The frame's bytes, without the length prefix.
    ///
    /// # Returns
    /// The deserialized value or an `io::Error` of kind `InvalidData`.
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
