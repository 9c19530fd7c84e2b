//! MPTCP option codec.
//!
//! Options are carried inside TCP option space under a single option
//! kind; the first payload byte splits into `subtype:4 | version:4` (the
//! low nibble doubles as subtype-specific flags where noted). The decoder
//! walks the whole TCP option region, is tolerant of foreign options, and
//! never fails the connection on a malformed MPTCP option: those are
//! logged and skipped, per the fallback-friendly contract.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::debug;

/// TCP option kind used for every MPTCP option.
pub const OPT_KIND: u8 = 30;

/// Option subtypes.
pub const SUB_CAPABLE: u8 = 0;
pub const SUB_JOIN: u8 = 1;
pub const SUB_DSS: u8 = 2;
pub const SUB_ADD_ADDR: u8 = 3;
pub const SUB_REMOVE_ADDR: u8 = 4;
pub const SUB_FAIL: u8 = 6;

/// CAPABLE flag bits (byte after the subtype byte).
pub const CAPABLE_FLAG_CSUM: u8 = 0x80;

/// JOIN low-nibble flag bits.
pub const JOIN_FLAG_BACKUP: u8 = 0x01;

/// DSS flag bits.
pub const DSS_FLAG_ACK: u8 = 0x01;
pub const DSS_FLAG_ACK8: u8 = 0x02;
pub const DSS_FLAG_MAP: u8 = 0x04;
pub const DSS_FLAG_MAP8: u8 = 0x08;
pub const DSS_FLAG_FIN: u8 = 0x10;

/// Option lengths on the wire.
pub const LEN_CAPABLE_SYN: usize = 4;
pub const LEN_CAPABLE_SYNACK: usize = 12;
pub const LEN_CAPABLE_ACK: usize = 20;
pub const LEN_JOIN_SYN: usize = 12;
pub const LEN_JOIN_SYNACK: usize = 16;
pub const LEN_JOIN_ACK: usize = 24;
pub const LEN_FAIL: usize = 8;
pub const LEN_DSS_BASE: usize = 4;
pub const LEN_DSS_ACK: usize = 4;
pub const LEN_DSS_MAP: usize = 10;
pub const LEN_DSS_CSUM: usize = 2;

/// Option decode errors. These stay local to the codec: a bad option is
/// skipped, never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionError {
    #[error("option truncated")]
    Truncated,

    #[error("bad {subtype} option length {len}")]
    BadLength { subtype: &'static str, len: usize },

    #[error("unknown subtype {0}")]
    UnknownSubtype(u8),
}

/// A DSS mapping as carried on the wire: `sub_seq` is relative to the
/// subflow ISN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DssMapping {
    pub data_seq: u32,
    pub sub_seq: u32,
    pub data_len: u16,
    pub checksum: Option<u16>,
}

/// The Data Sequence Signal option: any subset of DATA_ACK, a mapping,
/// and DATA_FIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dss {
    pub data_ack: Option<u32>,
    pub mapping: Option<DssMapping>,
    pub data_fin: bool,
}

impl Dss {
    /// A bare DATA_ACK.
    #[must_use]
    pub const fn ack(data_ack: u32) -> Self {
        Self {
            data_ack: Some(data_ack),
            mapping: None,
            data_fin: false,
        }
    }
}

/// One parsed MPTCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MptcpOption {
    /// CAPABLE on SYN: capability probe, no key yet.
    CapableSyn { checksum: bool },

    /// CAPABLE on SYN-ACK: the responder's key.
    CapableSynAck { checksum: bool, key: u64 },

    /// CAPABLE on the final ACK: the initiator's key, then the echoed
    /// responder key.
    CapableAck {
        checksum: bool,
        key: u64,
        peer_key: u64,
    },

    /// JOIN on SYN: the receiver's token plus our nonce.
    JoinSyn {
        backup: bool,
        addr_id: u8,
        token: u32,
        nonce: u32,
    },

    /// JOIN on SYN-ACK: truncated auth word plus the responder nonce.
    JoinSynAck {
        backup: bool,
        addr_id: u8,
        auth: u64,
        nonce: u32,
    },

    /// JOIN on the final ACK: the full auth digest.
    JoinAck { auth: [u8; 20] },

    /// Data Sequence Signal.
    Dss(Dss),

    /// Advertise an additional address, optionally with a port.
    AddAddr {
        addr_id: u8,
        addr: IpAddr,
        port: Option<u16>,
    },

    /// Withdraw previously advertised addresses.
    RemoveAddr { ids: SmallVec<[u8; 4]> },

    /// Infinite-mapping fallback signal with the cutoff DSN.
    Fail { dsn: u32 },
}

impl MptcpOption {
    /// Encoded length in bytes, including kind and length octets.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::CapableSyn { .. } => LEN_CAPABLE_SYN,
            Self::CapableSynAck { .. } => LEN_CAPABLE_SYNACK,
            Self::CapableAck { .. } => LEN_CAPABLE_ACK,
            Self::JoinSyn { .. } => LEN_JOIN_SYN,
            Self::JoinSynAck { .. } => LEN_JOIN_SYNACK,
            Self::JoinAck { .. } => LEN_JOIN_ACK,
            Self::Dss(dss) => {
                let mut len = LEN_DSS_BASE;
                if dss.data_ack.is_some() {
                    len += LEN_DSS_ACK;
                }
                if let Some(map) = &dss.mapping {
                    len += LEN_DSS_MAP;
                    if map.checksum.is_some() {
                        len += LEN_DSS_CSUM;
                    }
                }
                len
            }
            Self::AddAddr { addr, port, .. } => {
                let base = match addr {
                    IpAddr::V4(_) => 8,
                    IpAddr::V6(_) => 20,
                };
                base + if port.is_some() { 2 } else { 0 }
            }
            Self::RemoveAddr { ids } => 3 + ids.len(),
            Self::Fail { .. } => LEN_FAIL,
        }
    }

    /// Encode this option into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let len = self.encoded_len() as u8;
        match self {
            Self::CapableSyn { checksum } => {
                buf.put_u8(OPT_KIND);
                buf.put_u8(len);
                buf.put_u8(SUB_CAPABLE << 4);
                buf.put_u8(if *checksum { CAPABLE_FLAG_CSUM } else { 0 });
            }
            Self::CapableSynAck { checksum, key } => {
                buf.put_u8(OPT_KIND);
                buf.put_u8(len);
                buf.put_u8(SUB_CAPABLE << 4);
                buf.put_u8(if *checksum { CAPABLE_FLAG_CSUM } else { 0 });
                buf.put_u64(*key);
            }
            Self::CapableAck {
                checksum,
                key,
                peer_key,
            } => {
                buf.put_u8(OPT_KIND);
                buf.put_u8(len);
                buf.put_u8(SUB_CAPABLE << 4);
                buf.put_u8(if *checksum { CAPABLE_FLAG_CSUM } else { 0 });
                buf.put_u64(*key);
                buf.put_u64(*peer_key);
            }
            Self::JoinSyn {
                backup,
                addr_id,
                token,
                nonce,
            } => {
                buf.put_u8(OPT_KIND);
                buf.put_u8(len);
                buf.put_u8(SUB_JOIN << 4 | if *backup { JOIN_FLAG_BACKUP } else { 0 });
                buf.put_u8(*addr_id);
                buf.put_u32(*token);
                buf.put_u32(*nonce);
            }
            Self::JoinSynAck {
                backup,
                addr_id,
                auth,
                nonce,
            } => {
                buf.put_u8(OPT_KIND);
                buf.put_u8(len);
                buf.put_u8(SUB_JOIN << 4 | if *backup { JOIN_FLAG_BACKUP } else { 0 });
                buf.put_u8(*addr_id);
                buf.put_u64(*auth);
                buf.put_u32(*nonce);
            }
            Self::JoinAck { auth } => {
                buf.put_u8(OPT_KIND);
                buf.put_u8(len);
                buf.put_u8(SUB_JOIN << 4);
                buf.put_u8(0);
                buf.put_slice(auth);
            }
            Self::Dss(dss) => {
                buf.put_u8(OPT_KIND);
                buf.put_u8(len);
                buf.put_u8(SUB_DSS << 4);
                let mut flags = 0u8;
                if dss.data_ack.is_some() {
                    flags |= DSS_FLAG_ACK;
                }
                if dss.mapping.is_some() {
                    flags |= DSS_FLAG_MAP;
                }
                if dss.data_fin {
                    flags |= DSS_FLAG_FIN;
                }
                buf.put_u8(flags);
                if let Some(ack) = dss.data_ack {
                    buf.put_u32(ack);
                }
                if let Some(map) = &dss.mapping {
                    buf.put_u32(map.data_seq);
                    buf.put_u32(map.sub_seq);
                    buf.put_u16(map.data_len);
                    if let Some(csum) = map.checksum {
                        buf.put_u16(csum);
                    }
                }
            }
            Self::AddAddr {
                addr_id,
                addr,
                port,
            } => {
                buf.put_u8(OPT_KIND);
                buf.put_u8(len);
                let ipver = match addr {
                    IpAddr::V4(_) => 4,
                    IpAddr::V6(_) => 6,
                };
                buf.put_u8(SUB_ADD_ADDR << 4 | ipver);
                buf.put_u8(*addr_id);
                match addr {
                    IpAddr::V4(v4) => buf.put_slice(&v4.octets()),
                    IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
                }
                if let Some(port) = port {
                    buf.put_u16(*port);
                }
            }
            Self::RemoveAddr { ids } => {
                buf.put_u8(OPT_KIND);
                buf.put_u8(len);
                buf.put_u8(SUB_REMOVE_ADDR << 4);
                buf.put_slice(ids);
            }
            Self::Fail { dsn } => {
                buf.put_u8(OPT_KIND);
                buf.put_u8(len);
                buf.put_u8(SUB_FAIL << 4);
                buf.put_u8(0);
                buf.put_u32(*dsn);
            }
        }
    }
}

/// Encode a batch of options into a fresh buffer.
#[must_use]
pub fn encode_options(opts: &[MptcpOption]) -> bytes::Bytes {
    let total: usize = opts.iter().map(MptcpOption::encoded_len).sum();
    let mut buf = BytesMut::with_capacity(total);
    for opt in opts {
        opt.encode(&mut buf);
    }
    buf.freeze()
}

/// Decode every MPTCP option in a TCP option region.
///
/// Foreign TCP options are stepped over; malformed MPTCP options are
/// logged and skipped. The walker itself never panics on hostile input.
#[must_use]
pub fn decode_options(src: &[u8]) -> SmallVec<[MptcpOption; 4]> {
    let mut out = SmallVec::new();
    let mut i = 0;
    while i < src.len() {
        let kind = src[i];
        // EOL / NOP have no length octet.
        if kind == 0 {
            break;
        }
        if kind == 1 {
            i += 1;
            continue;
        }
        if i + 1 >= src.len() {
            break;
        }
        let len = src[i + 1] as usize;
        if len < 2 || i + len > src.len() {
            break;
        }
        if kind == OPT_KIND {
            match decode_one(&src[i..i + len]) {
                Ok(opt) => out.push(opt),
                Err(err) => debug!("ignoring MPTCP option: {err}"),
            }
        }
        i += len;
    }
    out
}

/// Decode a single option, `body` spanning from the kind octet.
fn decode_one(body: &[u8]) -> Result<MptcpOption, OptionError> {
    if body.len() < 3 {
        return Err(OptionError::Truncated);
    }
    let len = body.len();
    let subtype = body[2] >> 4;
    let low = body[2] & 0x0f;

    match subtype {
        SUB_CAPABLE => {
            if len < 4 {
                return Err(OptionError::BadLength {
                    subtype: "CAPABLE",
                    len,
                });
            }
            let checksum = body[3] & CAPABLE_FLAG_CSUM != 0;
            match len {
                LEN_CAPABLE_SYN => Ok(MptcpOption::CapableSyn { checksum }),
                LEN_CAPABLE_SYNACK => Ok(MptcpOption::CapableSynAck {
                    checksum,
                    key: read_u64(&body[4..12]),
                }),
                LEN_CAPABLE_ACK => Ok(MptcpOption::CapableAck {
                    checksum,
                    key: read_u64(&body[4..12]),
                    peer_key: read_u64(&body[12..20]),
                }),
                _ => Err(OptionError::BadLength {
                    subtype: "CAPABLE",
                    len,
                }),
            }
        }
        SUB_JOIN => {
            let backup = low & JOIN_FLAG_BACKUP != 0;
            match len {
                LEN_JOIN_SYN => Ok(MptcpOption::JoinSyn {
                    backup,
                    addr_id: body[3],
                    token: read_u32(&body[4..8]),
                    nonce: read_u32(&body[8..12]),
                }),
                LEN_JOIN_SYNACK => Ok(MptcpOption::JoinSynAck {
                    backup,
                    addr_id: body[3],
                    auth: read_u64(&body[4..12]),
                    nonce: read_u32(&body[12..16]),
                }),
                LEN_JOIN_ACK => {
                    let mut auth = [0u8; 20];
                    auth.copy_from_slice(&body[4..24]);
                    Ok(MptcpOption::JoinAck { auth })
                }
                _ => Err(OptionError::BadLength {
                    subtype: "JOIN",
                    len,
                }),
            }
        }
        SUB_DSS => {
            if len < LEN_DSS_BASE {
                return Err(OptionError::BadLength { subtype: "DSS", len });
            }
            let flags = body[3];
            if flags & (DSS_FLAG_ACK8 | DSS_FLAG_MAP8) != 0 {
                // 8-octet sequence forms are not produced here; treat as
                // a length we do not understand.
                return Err(OptionError::BadLength { subtype: "DSS", len });
            }
            let mut dss = Dss {
                data_fin: flags & DSS_FLAG_FIN != 0,
                ..Dss::default()
            };
            let mut at = LEN_DSS_BASE;
            if flags & DSS_FLAG_ACK != 0 {
                if len < at + LEN_DSS_ACK {
                    return Err(OptionError::BadLength { subtype: "DSS", len });
                }
                dss.data_ack = Some(read_u32(&body[at..at + 4]));
                at += LEN_DSS_ACK;
            }
            if flags & DSS_FLAG_MAP != 0 {
                if len < at + LEN_DSS_MAP {
                    return Err(OptionError::BadLength { subtype: "DSS", len });
                }
                let data_seq = read_u32(&body[at..at + 4]);
                let sub_seq = read_u32(&body[at + 4..at + 8]);
                let data_len = read_u16(&body[at + 8..at + 10]);
                at += LEN_DSS_MAP;
                let checksum = if len >= at + LEN_DSS_CSUM {
                    Some(read_u16(&body[at..at + 2]))
                } else {
                    None
                };
                dss.mapping = Some(DssMapping {
                    data_seq,
                    sub_seq,
                    data_len,
                    checksum,
                });
            }
            Ok(MptcpOption::Dss(dss))
        }
        SUB_ADD_ADDR => {
            let (addr, port): (IpAddr, Option<u16>) = match (low, len) {
                (4, 8) => (Ipv4Addr::from(read_u32(&body[4..8])).into(), None),
                (4, 10) => (
                    Ipv4Addr::from(read_u32(&body[4..8])).into(),
                    Some(read_u16(&body[8..10])),
                ),
                (6, 20) => (read_v6(&body[4..20]).into(), None),
                (6, 22) => (read_v6(&body[4..20]).into(), Some(read_u16(&body[20..22]))),
                _ => {
                    return Err(OptionError::BadLength {
                        subtype: "ADD_ADDR",
                        len,
                    })
                }
            };
            Ok(MptcpOption::AddAddr {
                addr_id: body[3],
                addr,
                port,
            })
        }
        SUB_REMOVE_ADDR => {
            if len < 4 {
                return Err(OptionError::BadLength {
                    subtype: "REMOVE_ADDR",
                    len,
                });
            }
            Ok(MptcpOption::RemoveAddr {
                ids: SmallVec::from_slice(&body[3..]),
            })
        }
        SUB_FAIL => {
            if len != LEN_FAIL {
                return Err(OptionError::BadLength {
                    subtype: "FAIL",
                    len,
                });
            }
            Ok(MptcpOption::Fail {
                dsn: read_u32(&body[4..8]),
            })
        }
        other => Err(OptionError::UnknownSubtype(other)),
    }
}

/// 16-bit one's-complement checksum over the DSS mapping fields and the
/// segment payload, as the peer validates it.
#[must_use]
pub fn dss_checksum(data_seq: u32, sub_seq: u32, data_len: u16, payload: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    sum += (data_seq >> 16) + (data_seq & 0xffff);
    sum += (sub_seq >> 16) + (sub_seq & 0xffff);
    sum += u32::from(data_len);

    let mut chunks = payload.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }

    while sum > 0xffff {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    !(sum as u16)
}

#[inline]
fn read_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

#[inline]
fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

#[inline]
fn read_u64(b: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    u64::from_be_bytes(raw)
}

#[inline]
fn read_v6(b: &[u8]) -> Ipv6Addr {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(b);
    Ipv6Addr::from(raw)
}
