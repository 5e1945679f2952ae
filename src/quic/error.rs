//! QUIC 数据包处理错误类型
use thiserror::Error;

/// QUIC 数据包解析 / 解密过程中可能出现的错误
///
/// 每个错误只影响单个 datagram：上层捕获后丢弃该 datagram 并记录日志，
/// 已建立的会话不受影响。
#[derive(Error, Debug)]
pub enum QuicError {
    /// 数据包太短，无法解析固定头部字段
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    /// 头部声明的长度超出了实际数据 (DCID / SCID / Token / Payload)
    #[error("Insufficient data for {0}")]
    InsufficientData(&'static str),

    /// VarInt 解码失败
    #[error("Bad varint: {0}")]
    BadVarint(&'static str),

    /// 不支持的 QUIC 版本 (仅支持 v1 = 0x00000001)
    #[error("Unsupported QUIC version: {version:#010x}")]
    UnsupportedVersion { version: u32 },

    /// Version Negotiation 数据包 (version = 0)
    #[error("Version negotiation packet")]
    VersionNegotiation,

    /// 不是 QUIC Initial Packet (无法为其建立新会话)
    #[error("Not a QUIC Initial packet (first byte: {0:#04x})")]
    NotInitialPacket(u8),

    /// 密钥派生失败
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Header Protection 移除失败
    #[error("Header protection removal failed: {0}")]
    HeaderProtectionFailed(String),

    /// AEAD 解密失败 (认证失败或长度不足)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// CRYPTO Frame 解析失败
    #[error("CRYPTO frame parsing failed: {0}")]
    CryptoFrame(String),

    /// CRYPTO Frame 乱序：首个 flight 中视为致命错误
    #[error("Out of order CRYPTO frame: expected offset {expected}, got {got}")]
    OutOfOrderCrypto { expected: u64, got: u64 },

    /// TLS ClientHello 中没有 SNI 扩展
    #[error("No SNI found in ClientHello")]
    SniNotFound,

    /// CRYPTO 流尚未凑齐完整的 ClientHello
    #[error("ClientHello incomplete, need more CRYPTO data")]
    SniIncomplete,

    /// TLS 解析失败
    #[error("TLS parsing failed: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, QuicError>;
