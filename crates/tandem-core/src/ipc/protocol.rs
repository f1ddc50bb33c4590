//! Messages between the parent and its worker processes.
//!
//! Each message travels as one frame on the worker's stdin or stdout: a 4-byte
//! little-endian length followed by the rkyv encoding. The argument and return value
//! payloads inside are `serde_json` bytes.

use std::io::{Read, Write};

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest accepted message body.
const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// Parent to worker.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Run a registered function.
    Call {
        /// Owning module of the function.
        module: String,
        /// Function name.
        function: String,
        /// Encoded argument tuple.
        args: Vec<u8>,
    },

    /// Stop serving and exit.
    Shutdown,

    /// Liveness check, answered with `Pong`.
    Ping,
}

/// Worker to parent, one per command.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// The function returned a value.
    Return {
        /// Encoded return value.
        value: Vec<u8>,
    },

    /// The function returned an error, or its arguments or result could not be coded.
    Raised {
        /// Error message.
        message: String,
    },

    /// The function panicked.
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },

    /// Nothing is registered under the requested identifier.
    UnknownFunction {
        module: String,
        function: String,
    },

    Pong,

    /// Sent right before the worker exits.
    ShuttingDown,
}

/// Encode `message` and write it as one frame, then flush.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let body = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("cannot encode message: {}", e)))?;
    if body.len() > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("message too large: {} bytes", body.len())));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    writer
        .write_all(&frame)
        .and_then(|()| writer.flush())
        .map_err(|e| Error::Ipc(format!("cannot write message: {}", e)))
}

/// Read one frame and decode it.
///
/// End of input before a frame starts is [`Error::Disconnected`]. Decoding is
/// unchecked, so `reader` must be the other end of a worker pipe.
pub fn read_message<R: Read, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::Disconnected,
        _ => Error::Ipc(format!("cannot read frame header: {}", e)),
    })?;

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("message too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| Error::Ipc(format!("cannot read frame body: {}", e)))?;

    // SAFETY: both ends of the pipe are this program, writing with `write_message`.
    unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(&body) }
        .map_err(|e| Error::Deserialization(format!("cannot decode message: {}", e)))
}
