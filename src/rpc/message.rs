//! Request and response codecs for the metadata operation set.
//!
//! Requests share a common prefix (opcode, caller, parent lookup stat)
//! followed by an op-specific body; names travel varint-length-prefixed.
//! Responses open with a varint status: 0 is followed by the op result,
//! anything else by a length-prefixed detail string, plus the server's
//! directory index snapshot on `StaleDirIndex`. `Mkfls` responses always
//! carry the created count, error or not, because partial success is part
//! of the bulk-create contract.

use bytes::{Buf, BufMut};
use zerocopy::IntoBytes;

use crate::error::{FsError, FsResult};
use crate::keys::{get_length_prefixed, get_varint, put_length_prefixed, put_varint};
use crate::rpc::OpCode;
use crate::server::MkflsRet;
use crate::types::{LookupStat, Stat, User, LOOKUPSTAT_ENCODED_LEN, STAT_ENCODED_LEN};

const STATUS_OK: u64 = 0;

fn short_frame() -> FsError {
    FsError::InvalidArgument("short message frame".to_string())
}

fn get_string<B: Buf>(buf: &mut B) -> FsResult<String> {
    let raw = get_length_prefixed(buf).ok_or_else(short_frame)?;
    String::from_utf8(raw).map_err(|_| FsError::InvalidArgument("non-utf8 string".to_string()))
}

/// Op-specific request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Lokup { name: String },
    Mkdir { mode: u32, name: String },
    Mkfle { mode: u32, name: String },
    Mkfls { mode: u32, n: u32, namearr: Vec<u8> },
    Bukin { dir: String },
    Lstat { name: String },
}

/// A decoded request: common prefix plus body.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub who: User,
    pub parent: LookupStat,
    pub body: Request,
}

impl RequestFrame {
    pub fn opcode(&self) -> OpCode {
        match self.body {
            Request::Lokup { .. } => OpCode::Lokup,
            Request::Mkdir { .. } => OpCode::Mkdir,
            Request::Mkfle { .. } => OpCode::Mkfle,
            Request::Mkfls { .. } => OpCode::Mkfls,
            Request::Bukin { .. } => OpCode::Bukin,
            Request::Lstat { .. } => OpCode::Lstat,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.put_u8(self.opcode() as u8);
        buf.put_u32_le(self.who.uid);
        buf.put_u32_le(self.who.gid);
        buf.put_slice(self.parent.as_bytes());
        match &self.body {
            Request::Lokup { name } | Request::Lstat { name } => {
                put_length_prefixed(&mut buf, name.as_bytes());
            }
            Request::Mkdir { mode, name } | Request::Mkfle { mode, name } => {
                buf.put_u32_le(*mode);
                put_length_prefixed(&mut buf, name.as_bytes());
            }
            Request::Mkfls { mode, n, namearr } => {
                buf.put_u32_le(*mode);
                buf.put_u32_le(*n);
                put_length_prefixed(&mut buf, namearr);
            }
            Request::Bukin { dir } => {
                put_length_prefixed(&mut buf, dir.as_bytes());
            }
        }
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> FsResult<RequestFrame> {
        if bytes.remaining() < 1 + 8 + LOOKUPSTAT_ENCODED_LEN {
            return Err(short_frame());
        }
        let op = OpCode::try_from(bytes.get_u8())?;
        let who = User::new(bytes.get_u32_le(), bytes.get_u32_le());
        let parent = LookupStat::decode(&bytes[..LOOKUPSTAT_ENCODED_LEN])
            .ok_or_else(short_frame)?;
        bytes.advance(LOOKUPSTAT_ENCODED_LEN);
        let body = match op {
            OpCode::Lokup => Request::Lokup {
                name: get_string(&mut bytes)?,
            },
            OpCode::Lstat => Request::Lstat {
                name: get_string(&mut bytes)?,
            },
            OpCode::Mkdir | OpCode::Mkfle => {
                if bytes.remaining() < 4 {
                    return Err(short_frame());
                }
                let mode = bytes.get_u32_le();
                let name = get_string(&mut bytes)?;
                if op == OpCode::Mkdir {
                    Request::Mkdir { mode, name }
                } else {
                    Request::Mkfle { mode, name }
                }
            }
            OpCode::Mkfls => {
                if bytes.remaining() < 8 {
                    return Err(short_frame());
                }
                let mode = bytes.get_u32_le();
                let n = bytes.get_u32_le();
                let namearr = get_length_prefixed(&mut bytes).ok_or_else(short_frame)?;
                Request::Mkfls { mode, n, namearr }
            }
            OpCode::Bukin => Request::Bukin {
                dir: get_string(&mut bytes)?,
            },
        };
        Ok(RequestFrame { who, parent, body })
    }
}

fn put_error_tail(buf: &mut Vec<u8>, err: &FsError) {
    put_length_prefixed(buf, err.to_string().as_bytes());
    if let FsError::StaleDirIndex { snapshot } = err {
        put_length_prefixed(buf, snapshot.as_deref().unwrap_or(&[]));
    }
}

fn put_error(buf: &mut Vec<u8>, err: &FsError) {
    put_varint(buf, err.code());
    put_error_tail(buf, err);
}

fn get_error<B: Buf>(code: u64, buf: &mut B) -> FsError {
    let detail = get_length_prefixed(buf)
        .and_then(|raw| String::from_utf8(raw).ok())
        .unwrap_or_default();
    let mut err = FsError::from_code(code, detail);
    if let FsError::StaleDirIndex { snapshot } = &mut err {
        *snapshot = get_length_prefixed(buf).filter(|raw| !raw.is_empty());
    }
    err
}

pub fn encode_lookupstat_resp(result: &FsResult<LookupStat>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LOOKUPSTAT_ENCODED_LEN + 1);
    match result {
        Ok(stat) => {
            put_varint(&mut buf, STATUS_OK);
            buf.put_slice(stat.as_bytes());
        }
        Err(e) => put_error(&mut buf, e),
    }
    buf
}

pub fn decode_lookupstat_resp(mut bytes: &[u8]) -> FsResult<LookupStat> {
    let code = get_varint(&mut bytes).ok_or_else(short_frame)?;
    if code != STATUS_OK {
        return Err(get_error(code, &mut bytes));
    }
    if bytes.remaining() < LOOKUPSTAT_ENCODED_LEN {
        return Err(short_frame());
    }
    LookupStat::decode(&bytes[..LOOKUPSTAT_ENCODED_LEN]).ok_or_else(short_frame)
}

pub fn encode_stat_resp(result: &FsResult<Stat>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(STAT_ENCODED_LEN + 1);
    match result {
        Ok(stat) => {
            put_varint(&mut buf, STATUS_OK);
            buf.put_slice(stat.as_bytes());
        }
        Err(e) => put_error(&mut buf, e),
    }
    buf
}

pub fn decode_stat_resp(mut bytes: &[u8]) -> FsResult<Stat> {
    let code = get_varint(&mut bytes).ok_or_else(short_frame)?;
    if code != STATUS_OK {
        return Err(get_error(code, &mut bytes));
    }
    if bytes.remaining() < STAT_ENCODED_LEN {
        return Err(short_frame());
    }
    Stat::decode(&bytes[..STAT_ENCODED_LEN]).ok_or_else(short_frame)
}

/// `Mkfls` responses always carry the created count so partial success
/// survives an error status.
pub fn encode_mkfls_resp(result: &FsResult<MkflsRet>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    match result {
        Ok(MkflsRet { n, err: None }) => {
            put_varint(&mut buf, STATUS_OK);
            buf.put_u32_le(*n);
        }
        Ok(MkflsRet { n, err: Some(e) }) => {
            put_varint(&mut buf, e.code());
            buf.put_u32_le(*n);
            put_error_tail(&mut buf, e);
        }
        Err(e) => {
            put_varint(&mut buf, e.code());
            buf.put_u32_le(0);
            put_error_tail(&mut buf, e);
        }
    }
    buf
}

pub fn decode_mkfls_resp(mut bytes: &[u8]) -> FsResult<MkflsRet> {
    let code = get_varint(&mut bytes).ok_or_else(short_frame)?;
    if bytes.remaining() < 4 {
        return Err(short_frame());
    }
    let n = bytes.get_u32_le();
    if code == STATUS_OK {
        Ok(MkflsRet::ok(n))
    } else {
        Ok(MkflsRet {
            n,
            err: Some(get_error(code, &mut bytes)),
        })
    }
}

pub fn encode_unit_resp(result: &FsResult<()>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    match result {
        Ok(()) => put_varint(&mut buf, STATUS_OK),
        Err(e) => put_error(&mut buf, e),
    }
    buf
}

pub fn decode_unit_resp(mut bytes: &[u8]) -> FsResult<()> {
    let code = get_varint(&mut bytes).ok_or_else(short_frame)?;
    if code != STATUS_OK {
        return Err(get_error(code, &mut bytes));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LEASE_NEVER, S_IFDIR, S_IFREG};
    use proptest::prelude::*;

    fn parent() -> LookupStat {
        LookupStat {
            dnode: 1,
            inode: 2,
            lease_due: LEASE_NEVER,
            zeroth_server: 3,
            dir_mode: S_IFDIR | 0o755,
            uid: 4,
            gid: 5,
        }
    }

    fn round_trip(frame: RequestFrame) {
        let bytes = frame.encode();
        let back = RequestFrame::decode(&bytes).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_request_round_trips() {
        let who = User::new(7, 8);
        round_trip(RequestFrame {
            who,
            parent: parent(),
            body: Request::Lokup { name: "d".to_string() },
        });
        round_trip(RequestFrame {
            who,
            parent: parent(),
            body: Request::Mkdir { mode: 0o755, name: "d".to_string() },
        });
        round_trip(RequestFrame {
            who,
            parent: parent(),
            body: Request::Mkfle { mode: 0o660, name: "f".to_string() },
        });
        let mut namearr = Vec::new();
        put_length_prefixed(&mut namearr, b"a");
        put_length_prefixed(&mut namearr, b"bc");
        round_trip(RequestFrame {
            who,
            parent: parent(),
            body: Request::Mkfls { mode: 0o660, n: 2, namearr },
        });
        round_trip(RequestFrame {
            who,
            parent: parent(),
            body: Request::Bukin { dir: "/tmp/stage/0-0-p1".to_string() },
        });
        round_trip(RequestFrame {
            who,
            parent: parent(),
            body: Request::Lstat { name: "f".to_string() },
        });
    }

    #[test]
    fn test_truncated_request_rejected() {
        let frame = RequestFrame {
            who: User::new(1, 1),
            parent: parent(),
            body: Request::Lokup { name: "x".to_string() },
        };
        let bytes = frame.encode();
        for cut in [0, 1, 8, bytes.len() - 1] {
            assert!(RequestFrame::decode(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_stat_response_round_trip() {
        let stat = Stat::new(0, 9, 1, S_IFREG | 0o640, 2, 3, 12345);
        let ok = decode_stat_resp(&encode_stat_resp(&Ok(stat))).unwrap();
        assert_eq!(ok, stat);

        let err = decode_stat_resp(&encode_stat_resp(&Err(FsError::NotFound(
            "f".to_string(),
        ))))
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_lookupstat_response_round_trip() {
        let ls = parent();
        let ok = decode_lookupstat_resp(&encode_lookupstat_resp(&Ok(ls))).unwrap();
        assert_eq!(ok, ls);
        let err =
            decode_lookupstat_resp(&encode_lookupstat_resp(&Err(FsError::LeaseExpired)))
                .unwrap_err();
        assert_eq!(err, FsError::LeaseExpired);
    }

    #[test]
    fn test_stale_index_response_carries_snapshot() {
        let snapshot = vec![1u8, 2, 3, 4];
        let encoded = encode_stat_resp(&Err(FsError::StaleDirIndex {
            snapshot: Some(snapshot.clone()),
        }));
        match decode_stat_resp(&encoded).unwrap_err() {
            FsError::StaleDirIndex { snapshot: got } => assert_eq!(got, Some(snapshot)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_mkfls_partial_response() {
        let ret = MkflsRet {
            n: 17,
            err: Some(FsError::AlreadyExists("dup".to_string())),
        };
        let back = decode_mkfls_resp(&encode_mkfls_resp(&Ok(ret))).unwrap();
        assert_eq!(back.n, 17);
        assert!(back.err.unwrap().is_conflict());

        let ok = decode_mkfls_resp(&encode_mkfls_resp(&Ok(MkflsRet::ok(42)))).unwrap();
        assert_eq!(ok.n, 42);
        assert!(ok.err.is_none());

        let failed =
            decode_mkfls_resp(&encode_mkfls_resp(&Err(FsError::Io("boom".to_string()))))
                .unwrap();
        assert_eq!(failed.n, 0);
        assert!(matches!(failed.err, Some(FsError::Io(_))));
    }

    proptest! {
        #[test]
        fn prop_request_round_trip(
            uid in any::<u32>(),
            gid in any::<u32>(),
            mode in any::<u32>(),
            name in "[a-zA-Z0-9._-]{1,64}",
        ) {
            let frame = RequestFrame {
                who: User::new(uid, gid),
                parent: parent(),
                body: Request::Mkfle { mode, name },
            };
            let back = RequestFrame::decode(&frame.encode()).unwrap();
            prop_assert_eq!(back, frame);
        }
    }
}
