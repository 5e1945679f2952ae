//! QUIC 数据包解析器
//!
//! 参考 RFC 9000 Section 16: Variable-Length Integer Encoding
//! 参考 RFC 9000 Section 17: Packet Formats
//!
//! 解析是无状态的：输入一个指向 packet 边界的字节切片，输出一个
//! [`ParsedPacket`] 视图。datagram 中可能携带多个 coalesced packets，
//! 用 [`parse_datagram`] 迭代遍历。

use crate::quic::error::{QuicError, Result};
use bytes::Bytes;
use tracing::trace;

/// QUIC Version 1 (RFC 9000)
pub const QUIC_VERSION_1: u32 = 0x0000_0001;

/// Short Header 数据包没有 DCID 长度字段。
///
/// 路由时假设 DCID 固定为 8 字节：后端签发的 SCID 会按 8 字节前缀
/// 注册到会话表中，因此只要后端的 CID 长度 >= 8，该启发式就成立。
pub const SHORT_HEADER_DCID_LEN: usize = 8;

/// Long Header 数据包类型 (RFC 9000 Section 17.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongHeaderType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongHeaderType {
    /// 从 first byte 的 bits 5-4 解出类型
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0x00 => LongHeaderType::Initial,
            0x01 => LongHeaderType::ZeroRtt,
            0x02 => LongHeaderType::Handshake,
            _ => LongHeaderType::Retry,
        }
    }
}

/// 单个 QUIC packet 的解析视图
///
/// 所有偏移量都相对于传入 [`parse_packet`] 的切片起点。
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    /// Long Header (bit 7 = 1) 还是 Short Header
    pub is_long_header: bool,
    /// Long Header 数据包类型；Short Header 为 None
    pub long_type: Option<LongHeaderType>,
    /// QUIC 版本号；Short Header 数据包没有版本字段，置 0
    pub version: u32,
    /// Destination Connection ID
    pub dcid: Bytes,
    /// Source Connection ID (仅 Long Header)
    pub scid: Bytes,
    /// 头部长度，不含 Packet Number (即 PN 字段的偏移量)
    pub raw_header_len: usize,
    /// 本 packet 在 datagram 中占用的总字节数
    pub full_length: usize,
    /// Length 字段的值 (PN + 加密 payload)；Retry / Short Header 为 0
    pub payload_len: usize,
}

impl ParsedPacket {
    pub fn is_initial(&self) -> bool {
        self.long_type == Some(LongHeaderType::Initial)
    }
}

/// 解析一个 QUIC packet
///
/// `data` 必须从 packet 边界开始；coalesced datagram 中的后续 packet
/// 从 `data[full_length..]` 开始。
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket> {
    if data.is_empty() {
        return Err(QuicError::PacketTooShort {
            expected: 1,
            actual: 0,
        });
    }

    let first_byte = data[0];

    if first_byte & 0x80 == 0 {
        return parse_short_header(data);
    }

    // Long Header: First Byte (1) + Version (4)
    if data.len() < 5 {
        return Err(QuicError::PacketTooShort {
            expected: 5,
            actual: data.len(),
        });
    }

    let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);

    // 版本门禁先于其余字段：version = 0 是 Version Negotiation，
    // 其 CID 字段布局不同，不能按 v1 继续解析。
    if version != QUIC_VERSION_1 {
        if version == 0 {
            return Err(QuicError::VersionNegotiation);
        }
        return Err(QuicError::UnsupportedVersion { version });
    }

    let long_type = LongHeaderType::from_bits((first_byte & 0x30) >> 4);

    let mut offset = 5;

    // DCID Length (1 byte) + DCID
    if data.len() < offset + 1 {
        return Err(QuicError::PacketTooShort {
            expected: offset + 1,
            actual: data.len(),
        });
    }
    let dcid_len = data[offset] as usize;
    offset += 1;
    if data.len() < offset + dcid_len {
        return Err(QuicError::InsufficientData("DCID"));
    }
    let dcid = Bytes::copy_from_slice(&data[offset..offset + dcid_len]);
    offset += dcid_len;

    // SCID Length (1 byte) + SCID
    if data.len() < offset + 1 {
        return Err(QuicError::PacketTooShort {
            expected: offset + 1,
            actual: data.len(),
        });
    }
    let scid_len = data[offset] as usize;
    offset += 1;
    if data.len() < offset + scid_len {
        return Err(QuicError::InsufficientData("SCID"));
    }
    let scid = Bytes::copy_from_slice(&data[offset..offset + scid_len]);
    offset += scid_len;

    trace!(
        "Long header: type={:?}, dcid_len={}, scid_len={}",
        long_type,
        dcid_len,
        scid_len
    );

    // Initial packet 带 Token (长度为 VarInt)；内容对中继无意义，跳过
    if long_type == LongHeaderType::Initial {
        let (token_len, varint_len) = parse_varint(&data[offset..])?;
        offset += varint_len;
        let token_len = token_len as usize;
        if data.len() < offset + token_len {
            return Err(QuicError::InsufficientData("token"));
        }
        offset += token_len;
    }

    if long_type == LongHeaderType::Retry {
        // Retry 没有 Length 字段，占满整个剩余 datagram
        return Ok(ParsedPacket {
            is_long_header: true,
            long_type: Some(long_type),
            version,
            dcid,
            scid,
            raw_header_len: offset,
            full_length: data.len(),
            payload_len: 0,
        });
    }

    // Initial / 0-RTT / Handshake: Length (VarInt) 覆盖 PN + 加密 payload
    let (payload_len, varint_len) = parse_varint(&data[offset..])?;
    offset += varint_len;
    let payload_len = payload_len as usize;

    if data.len() < offset + payload_len {
        return Err(QuicError::InsufficientData("payload"));
    }

    Ok(ParsedPacket {
        is_long_header: true,
        long_type: Some(long_type),
        version,
        dcid,
        scid,
        raw_header_len: offset,
        full_length: offset + payload_len,
        payload_len,
    })
}

/// Short Header: 没有 on-wire 的 DCID 长度字段，按 8 字节启发式取 DCID。
/// Short Header packet 后面不会再跟其他 packet，吞掉剩余全部字节。
fn parse_short_header(data: &[u8]) -> Result<ParsedPacket> {
    if data.len() < 1 + SHORT_HEADER_DCID_LEN {
        return Err(QuicError::PacketTooShort {
            expected: 1 + SHORT_HEADER_DCID_LEN,
            actual: data.len(),
        });
    }

    Ok(ParsedPacket {
        is_long_header: false,
        long_type: None,
        version: 0,
        dcid: Bytes::copy_from_slice(&data[1..1 + SHORT_HEADER_DCID_LEN]),
        scid: Bytes::new(),
        raw_header_len: 1 + SHORT_HEADER_DCID_LEN,
        full_length: data.len(),
        payload_len: 0,
    })
}

/// 遍历 datagram 中的所有 coalesced packets
///
/// RFC 9000 Section 12.2: 只有 Long Header packet 可以被 coalesce；
/// 遇到 Short Header packet 后停止。
pub fn parse_datagram(data: &[u8]) -> Result<Vec<ParsedPacket>> {
    let mut packets = Vec::new();
    let mut curr = 0;

    while curr < data.len() {
        let packet = parse_packet(&data[curr..])?;
        curr += packet.full_length;
        let is_long = packet.is_long_header;
        packets.push(packet);
        if !is_long {
            break;
        }
    }

    Ok(packets)
}

/// 解析 QUIC VarInt (RFC 9000 Section 16)
///
/// 最高 2 bits 决定编码长度 1/2/4/8；其余 6 bits 是值的高位。
///
/// # 返回
/// - (value, bytes_consumed)
pub fn parse_varint(data: &[u8]) -> Result<(u64, usize)> {
    let first = *data
        .first()
        .ok_or(QuicError::BadVarint("empty input"))?;

    let prefix = first >> 6;
    let length = 1usize << prefix;

    if data.len() < length {
        return Err(QuicError::BadVarint("short input"));
    }

    let mut value = (first & 0x3F) as u64;
    for &b in &data[1..length] {
        value = (value << 8) | b as u64;
    }

    Ok((value, length))
}

/// 编码 QUIC VarInt，选用最短编码
///
/// 值域是 [0, 2^62)；主要用于测试中构造数据包。
pub fn encode_varint(value: u64) -> Vec<u8> {
    assert!(value < 1 << 62, "varint value out of range");

    if value < 1 << 6 {
        vec![value as u8]
    } else if value < 1 << 14 {
        let v = (value as u16).to_be_bytes();
        vec![0x40 | v[0], v[1]]
    } else if value < 1 << 30 {
        let v = (value as u32).to_be_bytes();
        vec![0x80 | v[0], v[1], v[2], v[3]]
    } else {
        let v = value.to_be_bytes();
        vec![
            0xC0 | v[0],
            v[1],
            v[2],
            v[3],
            v[4],
            v[5],
            v[6],
            v[7],
        ]
    }
}
