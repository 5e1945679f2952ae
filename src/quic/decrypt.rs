//! QUIC Initial Packet 解密与 SNI 提取
//!
//! 参考 RFC 9001 Section 5: Packet Protection
//! 参考 RFC 9000 Section 19.6: CRYPTO Frames
//!
//! 这是数据路径上唯一的加密操作：只有建立会话时的 Initial packet 会被
//! 解密，后续数据包一律按会话表转发。输入 datagram 不会被修改，转发的
//! 字节与收到的完全一致。

use crate::quic::assembler::CryptoAssembler;
use crate::quic::crypto::{derive_initial_keys, InitialKeyRole};
use crate::quic::error::{QuicError, Result};
use crate::quic::header::unprotect_header;
use crate::quic::parser::{parse_varint, ParsedPacket};
use crate::tls::sni::{extract_sni, SniError};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use tracing::{debug, trace};

/// AES-128-GCM Auth Tag 长度
const TAG_LEN: usize = 16;

/// 解密一个 Initial packet 的 payload，返回明文 frame 序列
///
/// `header` 必须来自对同一 `datagram` 切片的解析。
pub fn decrypt_initial(datagram: &[u8], header: &ParsedPacket) -> Result<Vec<u8>> {
    if !header.is_initial() {
        return Err(QuicError::NotInitialPacket(
            datagram.first().copied().unwrap_or(0),
        ));
    }

    let keys = derive_initial_keys(&header.dcid, InitialKeyRole::Client)?;

    let pn_offset = header.raw_header_len;
    let unprotected = unprotect_header(datagram, pn_offset, &keys)?;
    let pn_len = unprotected.pn_len();

    // Length 字段覆盖 PN + ciphertext (+ tag)
    if header.payload_len < pn_len + TAG_LEN {
        return Err(QuicError::DecryptionFailed(format!(
            "Payload too short: {} < pn({}) + tag({})",
            header.payload_len, pn_len, TAG_LEN
        )));
    }
    let payload_end = pn_offset + header.payload_len;
    if datagram.len() < payload_end {
        return Err(QuicError::InsufficientData("payload"));
    }

    // AEAD AAD = 解保护后的头部 (RFC 9001 Section 5.3):
    // first_byte' ‖ wire[1..pn_offset] ‖ 解保护后的 PN 字节
    let mut aad = Vec::with_capacity(pn_offset + pn_len);
    aad.push(unprotected.first_byte);
    aad.extend_from_slice(&datagram[1..pn_offset]);
    aad.extend_from_slice(&unprotected.pn_bytes);

    let nonce = construct_nonce(&keys.iv, unprotected.packet_number)?;

    let unbound_key = UnboundKey::new(&AES_128_GCM, &keys.key)
        .map_err(|e| QuicError::DecryptionFailed(format!("Failed to create AEAD key: {:?}", e)))?;
    let aead_key = LessSafeKey::new(unbound_key);

    // ciphertext ‖ tag 拷贝出来 in-place 解密，原 datagram 保持不变
    let mut in_out = datagram[pn_offset + pn_len..payload_end].to_vec();
    let plaintext_len = aead_key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(&aad[..]),
            &mut in_out,
        )
        .map_err(|_| QuicError::DecryptionFailed("AEAD authentication failed".to_string()))?
        .len();
    in_out.truncate(plaintext_len);

    debug!(
        "Initial packet decrypted: pn={}, plaintext={} bytes",
        unprotected.packet_number,
        in_out.len()
    );

    Ok(in_out)
}

/// 从 Initial packet 中提取 SNI (端到端)
///
/// 流程：解密 payload → 线性扫描 CRYPTO frame → 重组 TLS handshake →
/// 解析 ClientHello 提取 host_name。
pub fn extract_sni_from_initial(datagram: &[u8], header: &ParsedPacket) -> Result<String> {
    let plaintext = decrypt_initial(datagram, header)?;
    sni_from_frames(&plaintext)
}

/// 扫描明文 frame 序列并提取 SNI
///
/// 只认 CRYPTO (0x06)；其他字节一律前进一个字节继续扫描，这同时覆盖了
/// PADDING (0x00) 和 PING (0x01)。每追加一个 frame 就尝试一次 SNI 解析。
pub(crate) fn sni_from_frames(plaintext: &[u8]) -> Result<String> {
    let mut assembler = CryptoAssembler::new();
    let mut pos = 0;

    while pos < plaintext.len() {
        if plaintext[pos] != 0x06 {
            pos += 1;
            continue;
        }
        pos += 1;

        // CRYPTO frame: Offset (varint) + Length (varint) + Data
        let (offset, n) = parse_varint(&plaintext[pos..])
            .map_err(|e| QuicError::CryptoFrame(format!("Bad CRYPTO offset: {}", e)))?;
        pos += n;

        let (length, n) = parse_varint(&plaintext[pos..])
            .map_err(|e| QuicError::CryptoFrame(format!("Bad CRYPTO length: {}", e)))?;
        pos += n;

        let length = length as usize;
        if plaintext.len() < pos + length {
            return Err(QuicError::CryptoFrame(format!(
                "CRYPTO data truncated: expected {}, got {}",
                length,
                plaintext.len() - pos
            )));
        }

        trace!("CRYPTO frame: offset={}, length={}", offset, length);
        assembler.append(offset, &plaintext[pos..pos + length])?;
        pos += length;

        match extract_sni(assembler.assembled()) {
            Ok(sni) => return Ok(sni),
            Err(SniError::Incomplete) => continue,
            Err(SniError::NotFound) => return Err(QuicError::SniNotFound),
            Err(e) => return Err(QuicError::Tls(e.to_string())),
        }
    }

    if assembler.is_empty() {
        Err(QuicError::CryptoFrame("No CRYPTO frame found".to_string()))
    } else {
        Err(QuicError::SniIncomplete)
    }
}

/// 构造 Nonce (RFC 9001 Section 5.3)
///
/// nonce = IV XOR (Packet Number 零扩展到 12 字节，右对齐)
fn construct_nonce(iv: &[u8], packet_number: u64) -> Result<[u8; 12]> {
    if iv.len() != 12 {
        return Err(QuicError::DecryptionFailed(format!(
            "Invalid IV length: {} (expected 12)",
            iv.len()
        )));
    }

    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(iv);

    let pn_bytes = packet_number.to_be_bytes();
    for i in 0..pn_bytes.len() {
        nonce[4 + i] ^= pn_bytes[i];
    }

    Ok(nonce)
}
