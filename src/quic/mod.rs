//! QUIC 数据包处理
//!
//! 本模块实现中继所需的全部 QUIC 位级操作，全部无状态：
//!
//! - [`parser`]: VarInt 编解码、Long/Short Header 解析、coalesced packet 遍历
//! - [`crypto`]: Initial 密钥派生 (HKDF-SHA256)
//! - [`header`]: Header Protection 移除 (AES-ECB mask)
//! - [`decrypt`]: Initial payload AEAD 解密 (AES-128-GCM) 与 SNI 提取
//! - [`assembler`]: 按序 CRYPTO 流重组
//! - [`error`]: 错误类型定义
//!
//! # 限制
//!
//! - 仅支持 QUIC v1 (0x00000001)；其余版本 (含 Version Negotiation) 直接丢弃
//! - 不支持 ECH (Encrypted ClientHello)
//! - 不维护连接状态：只解密 Initial，不解密后续任何数据包

pub mod assembler;
pub mod crypto;
pub mod decrypt;
pub mod error;
pub mod header;
pub mod parser;

pub use assembler::CryptoAssembler;
pub use crypto::{derive_initial_keys, InitialKeyRole, InitialKeys};
pub use decrypt::{decrypt_initial, extract_sni_from_initial};
pub use error::{QuicError, Result};
pub use header::{unprotect_header, UnprotectedHeader};
pub use parser::{
    encode_varint, parse_datagram, parse_packet, parse_varint, LongHeaderType, ParsedPacket,
    QUIC_VERSION_1, SHORT_HEADER_DCID_LEN,
};
