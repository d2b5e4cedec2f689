use std::{borrow::Cow, io};

use crate::{
    Deserialize, Key, Serialize,
    specs::{OptimizerSpec, ServerSpec},
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();
const KEY_SIZE: usize = size_of::<Key>();

const ERR_KIND: Header = 0;
const CONTROL_KIND: Header = 1;
const INIT_KIND: Header = 2;
const PUSH_KIND: Header = 3;
const VALUE_KIND: Header = 4;

/// The tensor carrying variants of the `Data` variant of the `Msg` enum.
///
/// Every payload is tagged with the key of the parameter slot it targets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload<'a> {
    /// The initial value of a key, only sent by the coordinator rank.
    Init { key: Key, values: &'a [f32] },
    /// A contribution to be merged into a key's slot.
    Push { key: Key, values: &'a [f32] },
    /// The current value of a key, the answer to `Command::Pull`.
    Value { key: Key, values: &'a [f32] },
}

impl Payload<'_> {
    /// Returns the key this payload targets.
    pub fn key(&self) -> Key {
        match *self {
            Payload::Init { key, .. } | Payload::Push { key, .. } | Payload::Value { key, .. } => {
                key
            }
        }
    }
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First message of a worker connection, identifies its rank.
    Connect { rank: usize },
    /// Configures a fresh server node.
    CreateServer(ServerSpec),
    /// Installs the server side update rule.
    SetOptimizer(OptimizerSpec),
    /// Requests the newest applied value of a key.
    Pull { key: Key },
    /// Requests the size of a key's value.
    QueryKey { key: Key },
    /// The answer to `QueryKey`.
    KeyLen { key: Key, len: usize },
    /// Requests the name of the installed update rule.
    QueryOptimizer,
    /// The answer to `QueryOptimizer`, `None` while there's no update rule.
    OptimizerName { name: Option<String> },
    /// Blocks until every worker reached the barrier.
    Barrier,
    /// Publishes the amount of iterations a worker completed.
    ReportProgress { iteration: u64 },
    /// Requests the minimum completed iteration across workers.
    QueryProgress,
    /// The answer to `QueryProgress`.
    Progress { min_iteration: u64 },
    /// An application defined control command.
    Custom { head: i32, body: String },
    /// Acknowledges a request that has no other answer.
    Ack,
    /// Asks the server to stop once every worker disconnects.
    StopServer,
    Disconnect,
}

/// The application layer message for the entire system.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    fn buf_is_too_small<T>(size: usize, expected: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {expected} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_KIND.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_KIND.to_be_bytes());

                // SAFETY: Serialize impl for `Command` is derived and not implemented
                //         by hand. Nor has a non string-key map inside.
                serde_json::to_writer(buf, cmd).unwrap();
                None
            }
            Msg::Data(payload) => {
                let (kind, key, values) = match *payload {
                    Payload::Init { key, values } => (INIT_KIND, key, values),
                    Payload::Push { key, values } => (PUSH_KIND, key, values),
                    Payload::Value { key, values } => (VALUE_KIND, key, values),
                };

                buf.extend_from_slice(&kind.to_be_bytes());
                buf.extend_from_slice(&key.to_be_bytes());
                Some(bytemuck::cast_slice(values))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len(), HEADER_SIZE);
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);

        // SAFETY: We splitted the buffer to be of size `HEADER_SIZE` just above.
        let kind = Header::from_be_bytes(kind_buf.try_into().unwrap());

        match kind {
            ERR_KIND => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_KIND => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            INIT_KIND | PUSH_KIND | VALUE_KIND => {
                if rest.len() < KEY_SIZE {
                    return Self::buf_is_too_small(buf.len(), HEADER_SIZE + KEY_SIZE);
                }

                let (key_buf, nums) = rest.split_at(KEY_SIZE);

                // SAFETY: We splitted the buffer to be of size `KEY_SIZE` just above.
                let key = Key::from_be_bytes(key_buf.try_into().unwrap());
                let values = bytemuck::try_cast_slice(nums)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e:?}")))?;

                let payload = match kind {
                    INIT_KIND => Payload::Init { key, values },
                    PUSH_KIND => Payload::Push { key, values },
                    _ => Payload::Value { key, values },
                };

                Ok(Self::Data(payload))
            }
            other => Self::invalid_kind(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Copies a frame into a 4 byte aligned buffer, like the receiver does.
    fn frame(msg: &Msg) -> Vec<u32> {
        let mut buf = Vec::new();
        let tail = msg.serialize(&mut buf);
        buf.extend_from_slice(tail.unwrap_or_default());

        let mut aligned = vec![0u32; buf.len().div_ceil(4)];
        bytemuck::cast_slice_mut::<u32, u8>(&mut aligned)[..buf.len()].copy_from_slice(&buf);
        aligned
    }

    #[test]
    fn data_payload_keeps_key_and_values() {
        let values = [1.5, -2.0, 3.25];
        let msg = Msg::Data(Payload::Push { key: 42, values: &values });

        let mut buf = Vec::new();
        let tail = msg.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + KEY_SIZE);
        assert_eq!(tail.len(), values.len() * size_of::<f32>());

        let aligned = frame(&msg);
        let bytes = bytemuck::cast_slice::<u32, u8>(&aligned);
        let decoded = Msg::deserialize(&bytes[..buf.len() + tail.len()]).unwrap();

        assert_eq!(decoded, msg);
    }

    #[test]
    fn control_command_is_json() {
        let msg = Msg::Control(Command::Pull { key: 7 });

        let mut buf = Vec::new();
        assert!(msg.serialize(&mut buf).is_none());

        let json = std::str::from_utf8(&buf[HEADER_SIZE..]).unwrap();
        assert_eq!(json, r#"{"pull":{"key":7}}"#);

        let decoded = Msg::deserialize(&buf).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_unknown_kind() {
        let buf = 9u32.to_be_bytes();
        let err = Msg::deserialize(&buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_truncated_key() {
        let mut buf = PUSH_KIND.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0, 1, 2]);

        let err = Msg::deserialize(&buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
