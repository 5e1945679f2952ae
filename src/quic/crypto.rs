//! QUIC Initial 密钥派生
//!
//! 参考 RFC 9001 Section 5: Packet Protection
//! 参考 RFC 8446 Section 7.1: Cryptographic Hash Functions and HKDF

use crate::quic::error::{QuicError, Result};
use ring::hkdf::{Prk, Salt, HKDF_SHA256};
use tracing::debug;

/// QUIC Version 1 Initial Salt
///
/// 用于从 DCID 派生初始密钥的 Salt 值。
/// ⚠️ 重要：这个值是 QUIC v1 标准规定的，不能更改！
pub const INITIAL_SALT_V1: &[u8] = &[
    // RFC 9001: https://www.rfc-editor.org/rfc/rfc9001.html#name-initial-secrets
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// QUIC Initial Packet 加密密钥
///
/// 包含三个密钥：
/// - key: 用于 AES-128-GCM 解密 payload
/// - iv: 初始化向量
/// - hp_key: 用于 header protection 的 AES-ECB mask 密钥
#[derive(Debug, Clone)]
pub struct InitialKeys {
    /// AEAD 密钥 (16 bytes for AES-128-GCM)
    pub key: Vec<u8>,
    /// 初始化向量 (12 bytes)
    pub iv: Vec<u8>,
    /// Header Protection 密钥 (16 bytes for AES-128-ECB)
    pub hp_key: Vec<u8>,
}

/// 密钥方向 (client vs server)
///
/// RFC 9001: Initial keys 按方向派生，label 分别是 "client in" / "server in"。
/// 中继只解密客户端的首个 flight，但派生本身是双向对称的。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialKeyRole {
    Client,
    Server,
}

impl InitialKeyRole {
    fn label(self) -> &'static [u8] {
        match self {
            InitialKeyRole::Client => b"client in",
            InitialKeyRole::Server => b"server in",
        }
    }
}

/// 从 DCID 派生 QUIC Initial Keys
///
/// RFC 9001 Section 5.2: Initial Secrets
///
/// 流程：
/// 1. initial_secret = HKDF-Extract(INITIAL_SALT, DCID)
/// 2. client_initial_secret = HKDF-Expand-Label(initial_secret, "client in", 32)
/// 3. key = HKDF-Expand-Label(client_initial_secret, "quic key", 16)
/// 4. iv = HKDF-Expand-Label(client_initial_secret, "quic iv", 12)
/// 5. hp_key = HKDF-Expand-Label(client_initial_secret, "quic hp", 16)
pub fn derive_initial_keys(dcid: &[u8], role: InitialKeyRole) -> Result<InitialKeys> {
    debug!(
        "Deriving initial keys from DCID ({} bytes), role={:?}",
        dcid.len(),
        role
    );

    let salt = Salt::new(HKDF_SHA256, INITIAL_SALT_V1);
    let initial_secret = salt.extract(dcid);

    let role_secret_bytes = expand_label_from_prk(&initial_secret, role.label(), 32)
        .map_err(|_| {
            QuicError::KeyDerivationFailed(format!("HKDF-Expand '{:?}' failed", role))
        })?;

    // 将派生出的 secret 重新装成 Prk，继续展开 key / iv / hp
    let role_secret = Prk::new_less_safe(HKDF_SHA256, &role_secret_bytes);

    let key = expand_label_from_prk(&role_secret, b"quic key", 16)
        .map_err(|_| QuicError::KeyDerivationFailed("HKDF-Expand 'quic key' failed".into()))?;
    let iv = expand_label_from_prk(&role_secret, b"quic iv", 12)
        .map_err(|_| QuicError::KeyDerivationFailed("HKDF-Expand 'quic iv' failed".into()))?;
    let hp_key = expand_label_from_prk(&role_secret, b"quic hp", 16)
        .map_err(|_| QuicError::KeyDerivationFailed("HKDF-Expand 'quic hp' failed".into()))?;

    Ok(InitialKeys { key, iv, hp_key })
}

/// HKDF-Expand-Label (RFC 8446 Section 7.1)
///
/// ```text
/// HKDF-Expand-Label(Secret, Label, Context, Length) =
///     HKDF-Expand(Secret, HkdfLabel, Length)
/// ```
fn expand_label_from_prk(
    secret: &Prk,
    label: &[u8],
    length: usize,
) -> std::result::Result<Vec<u8>, ring::error::Unspecified> {
    struct LengthLimit(usize);
    impl ring::hkdf::KeyType for LengthLimit {
        fn len(&self) -> usize {
            self.0
        }
    }

    let info = hkdf_label(length, label);
    let info_refs: &[&[u8]] = &[&info[..]];

    let mut output = vec![0u8; length];
    let okm = secret.expand(info_refs, LengthLimit(length))?;
    okm.fill(&mut output[..])?;
    Ok(output)
}

/// 序列化 HkdfLabel 结构
///
/// 格式：[Length (2 bytes)][Label Length (1 byte)]["tls13 " + Label][Context Length (1 byte)]
/// QUIC Initial 派生的 Context 恒为空。
fn hkdf_label(length: usize, label: &[u8]) -> Vec<u8> {
    let prefix = b"tls13 ";
    let mut out = Vec::with_capacity(2 + 1 + prefix.len() + label.len() + 1);

    out.extend_from_slice(&(length as u16).to_be_bytes());
    out.push((prefix.len() + label.len()) as u8);
    out.extend_from_slice(prefix);
    out.extend_from_slice(label);
    out.push(0); // empty context

    out
}
