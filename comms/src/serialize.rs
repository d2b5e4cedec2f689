/// Writes a value into a frame.
pub trait Serialize<'a> {
    /// Serializes the framed part of `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer holding the frame being built.
    ///
    /// # Returns
    /// An optional trailing slice that will be written right after `buf` without copying it.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
