// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Wire format of the connection protocol: every ring packet carries one
// message, led by an 8-byte header. Control messages use small codes;
// application payload travels as `data` or, when it exceeds a quarter of
// the ring, as a run of `data_fragment` messages. All fields are packed
// little-endian u32.

/// Version stamped into ring headers and every message; non-matching peers
/// never get past the sync handshake.
pub const CHANNEL_VERSION: u32 = 2;

pub const MSG_SYNC_REQUEST: u32 = 0;
pub const MSG_SYNC_ANSWER: u32 = 1;
pub const MSG_CONNECT_REQUEST: u32 = 10;
pub const MSG_CONNECT_ANSWER: u32 = 11;
pub const MSG_CONNECT_TERM: u32 = 90;
pub const MSG_DATA: u32 = 0x1000_0000;
pub const MSG_DATA_FRAGMENT: u32 = 0x1000_0001;

/// `{version, kind}`
pub const MSG_HDR_SIZE: u32 = 8;
/// `{version, kind, pid}`
pub const CONNECT_HDR_SIZE: u32 = 12;
/// `{version, kind, total_length, fragment_offset}`
pub const FRAGMENT_HDR_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    SyncRequest,
    SyncAnswer,
    ConnectRequest,
    ConnectAnswer,
    ConnectTerm,
    Data,
    DataFragment,
}

impl MsgKind {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            MSG_SYNC_REQUEST => Some(Self::SyncRequest),
            MSG_SYNC_ANSWER => Some(Self::SyncAnswer),
            MSG_CONNECT_REQUEST => Some(Self::ConnectRequest),
            MSG_CONNECT_ANSWER => Some(Self::ConnectAnswer),
            MSG_CONNECT_TERM => Some(Self::ConnectTerm),
            MSG_DATA => Some(Self::Data),
            MSG_DATA_FRAGMENT => Some(Self::DataFragment),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::SyncRequest => MSG_SYNC_REQUEST,
            Self::SyncAnswer => MSG_SYNC_ANSWER,
            Self::ConnectRequest => MSG_CONNECT_REQUEST,
            Self::ConnectAnswer => MSG_CONNECT_ANSWER,
            Self::ConnectTerm => MSG_CONNECT_TERM,
            Self::Data => MSG_DATA,
            Self::DataFragment => MSG_DATA_FRAGMENT,
        }
    }
}

fn put_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

/// Write a `{version, kind}` header into the first 8 bytes of `buf`.
pub fn write_msg_hdr(buf: &mut [u8], kind: MsgKind) {
    put_u32(buf, 0, CHANNEL_VERSION);
    put_u32(buf, 4, kind.code());
}

/// A plain control message of `kind`.
pub fn control_msg(kind: MsgKind) -> [u8; MSG_HDR_SIZE as usize] {
    let mut buf = [0u8; MSG_HDR_SIZE as usize];
    write_msg_hdr(&mut buf, kind);
    buf
}

/// A connect request or answer carrying the local process identifier.
pub fn connect_msg(kind: MsgKind, pid: u32) -> [u8; CONNECT_HDR_SIZE as usize] {
    let mut buf = [0u8; CONNECT_HDR_SIZE as usize];
    write_msg_hdr(&mut buf, kind);
    put_u32(&mut buf, 8, pid);
    buf
}

/// Write a fragment header into the first 16 bytes of `buf`.
pub fn write_fragment_hdr(buf: &mut [u8], total_length: u32, fragment_offset: u32) {
    write_msg_hdr(buf, MsgKind::DataFragment);
    put_u32(buf, 8, total_length);
    put_u32(buf, 12, fragment_offset);
}

/// Decoded view of a received message's leading header.
#[derive(Debug, Clone, Copy)]
pub struct MsgHdr {
    pub version: u32,
    pub kind: MsgKind,
}

/// Decode and validate a message header.
///
/// `None` means the packet is too short for the headers its kind requires
/// or the kind code is unknown; the connection reports such packets as
/// protocol errors and drops them.
pub fn parse_msg(data: &[u8]) -> Option<MsgHdr> {
    if data.len() < MSG_HDR_SIZE as usize {
        return None;
    }
    let version = get_u32(data, 0);
    let kind = MsgKind::from_code(get_u32(data, 4))?;
    let needed = match kind {
        MsgKind::ConnectRequest | MsgKind::ConnectAnswer => CONNECT_HDR_SIZE,
        MsgKind::DataFragment => FRAGMENT_HDR_SIZE,
        _ => MSG_HDR_SIZE,
    };
    if data.len() < needed as usize {
        return None;
    }
    Some(MsgHdr { version, kind })
}

/// Peer PID of a connect request/answer. Caller must have validated `data`
/// via [`parse_msg`].
pub fn connect_pid(data: &[u8]) -> u32 {
    get_u32(data, 8)
}

/// `(total_length, fragment_offset)` of a fragment message.
pub fn fragment_info(data: &[u8]) -> (u32, u32) {
    (get_u32(data, 8), get_u32(data, 12))
}
