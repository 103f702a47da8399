//! Wire RPC adapter.
//!
//! A fixed operation set carried over length-prefixed frames: every request
//! is `u32 frame length || opcode || caller || parent lookup stat || op
//! body`, every response `u32 frame length || varint status || op body`.
//! [`message`] holds the codecs, [`client`] the pooled connections and
//! per-server [`crate::server::Filesystem`] stubs, [`server`] the accept
//! loop dispatching into an engine.

pub mod client;
pub mod message;
pub mod server;

use std::io::{Read, Write};

use crate::error::{FsError, FsResult};

/// Upper bound on a single frame; larger frames indicate a corrupt or
/// hostile peer.
pub const MAX_FRAME_LEN: usize = 8 << 20;

/// Operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Lokup = 0,
    Mkdir = 1,
    Mkfle = 2,
    Mkfls = 3,
    Bukin = 4,
    Lstat = 5,
}

impl TryFrom<u8> for OpCode {
    type Error = FsError;

    fn try_from(v: u8) -> FsResult<OpCode> {
        match v {
            0 => Ok(OpCode::Lokup),
            1 => Ok(OpCode::Mkdir),
            2 => Ok(OpCode::Mkfle),
            3 => Ok(OpCode::Mkfls),
            4 => Ok(OpCode::Bukin),
            5 => Ok(OpCode::Lstat),
            _ => Err(FsError::InvalidArgument(format!("unknown opcode {v}"))),
        }
    }
}

pub(crate) fn write_frame<W: Write>(w: &mut W, body: &[u8]) -> std::io::Result<()> {
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(body)?;
    w.flush()
}

pub(crate) fn read_frame<R: Read>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcodes_round_trip() {
        for v in 0u8..6 {
            let op = OpCode::try_from(v).unwrap();
            assert_eq!(op as u8, v);
        }
        assert!(OpCode::try_from(6).is_err());
    }

    #[test]
    fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        let mut cursor = &buf[..];
        assert_eq!(read_frame(&mut cursor).unwrap(), b"hello");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut cursor = &buf[..];
        assert!(read_frame(&mut cursor).is_err());
    }
}
