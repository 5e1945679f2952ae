//! QUIC Header Protection 移除
//!
//! 参考 RFC 9001 Section 5.4: Header Protection
//!
//! 中继必须原样转发 datagram，因此这里不做 in-place 解保护：
//! 输入切片保持不变，恢复出的字段通过 [`UnprotectedHeader`] 返回。

use crate::quic::crypto::InitialKeys;
use crate::quic::error::{QuicError, Result};
use ring::aead::quic::{HeaderProtectionKey, AES_128};
use tracing::debug;

/// Header Protection sample 长度 (AES-128 block)
const SAMPLE_LEN: usize = 16;

/// 移除保护后恢复出的头部字段
#[derive(Debug)]
pub struct UnprotectedHeader {
    /// 解保护后的 first byte (低 4 bits 已还原)
    pub first_byte: u8,
    /// 解保护后的 Packet Number 字节 (1-4 bytes)
    pub pn_bytes: Vec<u8>,
    /// Packet Number，按 big-endian 无符号数解释
    pub packet_number: u64,
}

impl UnprotectedHeader {
    pub fn pn_len(&self) -> usize {
        self.pn_bytes.len()
    }
}

/// 计算并应用 header protection mask
///
/// RFC 9001 Section 5.4.2: sample 取自 Packet Number 字段起点之后第 4 个
/// 字节开始的 16 字节（即假设 PN 按最大 4 字节采样）。
///
/// # 参数
/// - `packet`: 从 packet 边界开始的字节切片（不会被修改）
/// - `pn_offset`: Packet Number 字段的偏移量 (`raw_header_len`)
/// - `keys`: 该方向的 Initial Keys
pub fn unprotect_header(
    packet: &[u8],
    pn_offset: usize,
    keys: &InitialKeys,
) -> Result<UnprotectedHeader> {
    let sample_start = pn_offset + 4;
    let sample_end = sample_start + SAMPLE_LEN;

    if packet.len() < sample_end {
        return Err(QuicError::PacketTooShort {
            expected: sample_end,
            actual: packet.len(),
        });
    }

    let sample = &packet[sample_start..sample_end];

    let hp_key = HeaderProtectionKey::new(&AES_128, &keys.hp_key).map_err(|e| {
        QuicError::HeaderProtectionFailed(format!("Failed to create HP key: {:?}", e))
    })?;

    let mask = hp_key
        .new_mask(sample)
        .map_err(|e| QuicError::HeaderProtectionFailed(format!("Failed to generate mask: {:?}", e)))?;

    // Long Header 只有低 4 bits 被保护 (reserved bits + PN length)
    let first_byte = packet[0] ^ (mask[0] & 0x0F);
    let pn_len = (first_byte & 0x03) as usize + 1;

    let mut pn_bytes = Vec::with_capacity(pn_len);
    let mut packet_number: u64 = 0;
    for i in 0..pn_len {
        let b = packet[pn_offset + i] ^ mask[1 + i];
        pn_bytes.push(b);
        packet_number = (packet_number << 8) | b as u64;
    }

    debug!(
        "Header unprotected: first_byte={:#04x}, pn={}, pn_len={}",
        first_byte, packet_number, pn_len
    );

    Ok(UnprotectedHeader {
        first_byte,
        pn_bytes,
        packet_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::crypto::{derive_initial_keys, InitialKeyRole};

    #[test]
    fn test_unprotect_packet_too_short() {
        // sample 需要 pn_offset + 4 + 16 字节
        let packet = [0u8; 30];
        let keys = InitialKeys {
            key: vec![0u8; 16],
            iv: vec![0u8; 12],
            hp_key: vec![0u8; 16],
        };

        let result = unprotect_header(&packet, 25, &keys);
        assert!(matches!(result, Err(QuicError::PacketTooShort { .. })));
    }

    #[test]
    fn test_unprotect_does_not_mutate_input() {
        let dcid = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];
        let keys = derive_initial_keys(&dcid, InitialKeyRole::Client).unwrap();

        let packet = [0xC3u8; 64];
        let before = packet;

        let _ = unprotect_header(&packet, 18, &keys).unwrap();
        assert_eq!(packet, before);
    }

    #[test]
    fn test_pn_len_from_unprotected_first_byte() {
        // 全零 hp_key 下 mask 是确定的；这里只验证 pn_len 取自
        // 解保护后 first byte 的低 2 bits 且 PN 按 big-endian 组装。
        let dcid = [0x01, 0x02];
        let keys = derive_initial_keys(&dcid, InitialKeyRole::Client).unwrap();

        let packet = [0xAB; 40];
        let header = unprotect_header(&packet, 10, &keys).unwrap();

        let expected_len = (header.first_byte & 0x03) as usize + 1;
        assert_eq!(header.pn_bytes.len(), expected_len);

        let mut pn = 0u64;
        for &b in &header.pn_bytes {
            pn = (pn << 8) | b as u64;
        }
        assert_eq!(pn, header.packet_number);
    }
}
