//! TLS ClientHello SNI 扫描
//!
//! 输入是 QUIC CRYPTO 流重组出的裸 TLS Handshake 字节 (开头 0x01)。
//! 区分两类失败：[`SniError::Incomplete`] 表示缓冲还不够长 (上层可以
//! 继续喂 CRYPTO frame 再试)；[`SniError::NotFound`] 表示 ClientHello
//! 已完整但没有 server_name 扩展。

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SniError {
    /// 缓冲太短，ClientHello 尚未完整
    #[error("ClientHello incomplete")]
    Incomplete,

    /// 不是 ClientHello (handshake type != 0x01)
    #[error("Not a ClientHello (handshake type: {0:#04x})")]
    NotClientHello(u8),

    /// ClientHello 完整但没有 server_name 扩展
    #[error("SNI extension not found")]
    NotFound,

    /// ClientHello 内部结构损坏
    #[error("Malformed ClientHello: {0}")]
    Malformed(&'static str),

    /// host_name 不是合法主机名
    #[error("Invalid hostname")]
    InvalidHostname,
}

/// 从 TLS ClientHello 中提取第一个 host_name
///
/// 解析顺序 (RFC 8446 Section 4.1.2)：
/// Handshake header (1+3) → legacy version (2) → random (32) →
/// session id (u8-len) → cipher suites (u16-len) → compression (u8-len) →
/// extensions (u16-len) → server_name 扩展 (type 0x0000) 的 name list。
pub fn extract_sni(data: &[u8]) -> Result<String, SniError> {
    // Handshake: [msg_type(1)][len(3)][body...]
    if data.len() < 4 {
        return Err(SniError::Incomplete);
    }

    if data[0] != 0x01 {
        return Err(SniError::NotClientHello(data[0]));
    }

    let hs_len =
        ((data[1] as usize) << 16) | ((data[2] as usize) << 8) | (data[3] as usize);
    if data.len() < 4 + hs_len {
        return Err(SniError::Incomplete);
    }

    // 到这里 ClientHello 已完整；body 内的越界属于结构损坏
    let body = &data[4..4 + hs_len];

    // legacy version (2) + random (32)
    if body.len() < 34 {
        return Err(SniError::Malformed("client hello body"));
    }
    let mut offset = 34;

    // legacy session id
    if offset + 1 > body.len() {
        return Err(SniError::Malformed("session id"));
    }
    let session_id_len = body[offset] as usize;
    offset += 1 + session_id_len;

    // cipher suites
    if offset + 2 > body.len() {
        return Err(SniError::Malformed("cipher suites"));
    }
    let cipher_suites_len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
    offset += 2 + cipher_suites_len;

    // compression methods
    if offset + 1 > body.len() {
        return Err(SniError::Malformed("compression methods"));
    }
    let compression_len = body[offset] as usize;
    offset += 1 + compression_len;

    // extensions
    if offset + 2 > body.len() {
        return Err(SniError::Malformed("extensions length"));
    }
    let extensions_len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
    offset += 2;

    if offset + extensions_len > body.len() {
        return Err(SniError::Malformed("extensions"));
    }
    let ext_end = offset + extensions_len;

    while offset + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let ext_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        offset += 4;

        if offset + ext_len > ext_end {
            return Err(SniError::Malformed("extension data"));
        }

        if ext_type == 0x0000 {
            return parse_server_name_extension(&body[offset..offset + ext_len]);
        }

        offset += ext_len;
    }

    Err(SniError::NotFound)
}

/// 解析 server_name 扩展 (RFC 6066 Section 3)，返回第一个 host_name 条目
fn parse_server_name_extension(data: &[u8]) -> Result<String, SniError> {
    if data.len() < 2 {
        return Err(SniError::Malformed("server name list length"));
    }

    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + list_len {
        return Err(SniError::Malformed("server name list"));
    }

    let mut offset = 2;
    let list_end = 2 + list_len;

    while offset + 3 <= list_end {
        let name_type = data[offset];
        let name_len = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
        offset += 3;

        if offset + name_len > list_end {
            return Err(SniError::Malformed("server name entry"));
        }

        if name_type == 0x00 {
            let hostname = std::str::from_utf8(&data[offset..offset + name_len])
                .map_err(|_| SniError::InvalidHostname)?;

            if !is_valid_hostname(hostname) {
                return Err(SniError::InvalidHostname);
            }

            return Ok(hostname.to_string());
        }

        offset += name_len;
    }

    Err(SniError::NotFound)
}

fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }

    hostname
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
}
