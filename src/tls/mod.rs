//! TLS ClientHello 解析
pub mod sni;

pub use sni::{extract_sni, SniError};
