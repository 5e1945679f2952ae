//! CRYPTO Frame 重组缓冲
//!
//! 参考 RFC 9000 Section 19.6: CRYPTO Frames
//!
//! 客户端首个 flight 的 CRYPTO frame 几乎总是按序且装在一个 datagram 里。
//! 因此缓冲只接受按序追加：offset 等于当前期望值时追加；来自低位的重叠
//! 吸收其未重叠的尾部；严格超前的 offset 是致命错误，由上层丢弃 datagram。

use crate::quic::error::{QuicError, Result};

/// 按序 CRYPTO 流重组器
#[derive(Debug, Default)]
pub struct CryptoAssembler {
    buffer: Vec<u8>,
    expected_offset: u64,
}

impl CryptoAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个 CRYPTO frame 的数据
    ///
    /// - `offset == expected`: 直接追加
    /// - `offset < expected`: 重复或重叠，只吸收超出已有数据的尾部
    /// - `offset > expected`: 乱序，返回 [`QuicError::OutOfOrderCrypto`]
    pub fn append(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset == self.expected_offset {
            self.buffer.extend_from_slice(data);
            self.expected_offset += data.len() as u64;
            return Ok(());
        }

        if offset < self.expected_offset {
            let end = offset + data.len() as u64;
            if end > self.expected_offset {
                let overlap = (self.expected_offset - offset) as usize;
                self.buffer.extend_from_slice(&data[overlap..]);
                self.expected_offset = end;
            }
            // 完全被覆盖的重复 frame 是 no-op
            return Ok(());
        }

        Err(QuicError::OutOfOrderCrypto {
            expected: self.expected_offset,
            got: offset,
        })
    }

    /// 目前已重组的连续字节
    pub fn assembled(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_in_order() {
        let mut asm = CryptoAssembler::new();
        asm.append(0, b"hello").unwrap();
        asm.append(5, b" world").unwrap();
        assert_eq!(asm.assembled(), b"hello world");
    }

    #[test]
    fn test_overlap_from_below_absorbs_tail() {
        let mut asm = CryptoAssembler::new();
        asm.append(0, b"hello").unwrap();
        asm.append(3, b"lo world").unwrap();
        assert_eq!(asm.assembled(), b"hello world");
    }

    #[test]
    fn test_duplicate_is_noop() {
        let mut asm = CryptoAssembler::new();
        asm.append(0, b"hello").unwrap();
        asm.append(0, b"hello").unwrap();
        asm.append(1, b"ell").unwrap();
        assert_eq!(asm.assembled(), b"hello");
    }

    #[test]
    fn test_future_offset_is_fatal() {
        let mut asm = CryptoAssembler::new();
        asm.append(0, b"hello").unwrap();

        let result = asm.append(10, b"world");
        assert!(matches!(
            result,
            Err(QuicError::OutOfOrderCrypto {
                expected: 5,
                got: 10
            })
        ));
        // 缓冲不被破坏
        assert_eq!(asm.assembled(), b"hello");
    }

    #[test]
    fn test_empty_assembler() {
        let asm = CryptoAssembler::new();
        assert!(asm.is_empty());
        assert_eq!(asm.assembled(), b"");
    }
}
