//! # HPACK 整数表現 (RFC 7541 Section 5.1)
//!
//! N ビットプレフィックス整数のエンコードと逐次デコード。

use super::{HpackError, HpackResult};

/// デコードで受け付ける最大値 (2^31 - 1)
pub const MAX_INTEGER: u32 = i32::MAX as u32;

#[inline]
fn prefix_mask(prefix_bits: u8) -> u8 {
    debug_assert!((1..=8).contains(&prefix_bits));
    if prefix_bits >= 8 {
        0xFF
    } else {
        (1u8 << prefix_bits) - 1
    }
}

/// 逐次整数デコーダ
///
/// 1 バイト目を `begin_decode` に渡し、`false` が返ったら続くバイトを
/// `decode` に 1 つずつ渡す。継続ビットが 0 のバイトで完了する。
#[derive(Debug, Default, Clone)]
pub struct IntegerDecoder {
    value: u32,
    m: u32,
}

impl IntegerDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 1 バイト目を処理。プレフィックスに収まれば `true`
    pub fn begin_decode(&mut self, first_byte: u8, prefix_bits: u8) -> bool {
        let mask = prefix_mask(prefix_bits);
        let prefix = first_byte & mask;
        self.value = prefix as u32;
        self.m = 0;
        prefix < mask
    }

    /// 継続バイトを処理。完了したら `true`
    pub fn decode(&mut self, byte: u8) -> HpackResult<bool> {
        // 5 バイト目以降の継続は 32 ビットに収まらない
        if self.m > 28 {
            return Err(HpackError::IntegerOverflow);
        }

        let add = ((byte & 0x7F) as u64) << self.m;
        let value = self.value as u64 + add;
        if value > MAX_INTEGER as u64 {
            return Err(HpackError::IntegerOverflow);
        }

        self.value = value as u32;
        self.m += 7;
        Ok(byte & 0x80 == 0)
    }

    /// デコード結果
    #[inline]
    pub fn value(&self) -> u32 {
        self.value
    }
}

/// バッファ先頭の整数をデコード
///
/// 完了すれば `(値, 消費バイト数)`、バイトが足りなければ `None`。
pub fn decode_integer(buf: &[u8], prefix_bits: u8) -> HpackResult<Option<(u32, usize)>> {
    let first = match buf.first() {
        Some(&b) => b,
        None => return Ok(None),
    };

    let mut decoder = IntegerDecoder::new();
    if decoder.begin_decode(first, prefix_bits) {
        return Ok(Some((decoder.value(), 1)));
    }

    for (i, &byte) in buf[1..].iter().enumerate() {
        if decoder.decode(byte)? {
            return Ok(Some((decoder.value(), i + 2)));
        }
    }

    Ok(None)
}

/// 整数のエンコード後のバイト数
pub fn encoded_integer_len(value: usize, prefix_bits: u8) -> usize {
    let mask = prefix_mask(prefix_bits) as usize;
    if value < mask {
        return 1;
    }
    let mut remaining = value - mask;
    let mut len = 2;
    while remaining >= 128 {
        remaining >>= 7;
        len += 1;
    }
    len
}

/// HPACK 整数エンコード
///
/// * `prefix` - 最初のバイトのプレフィックスビット以外の部分
pub fn encode_integer(buf: &mut Vec<u8>, value: usize, prefix_bits: u8, prefix: u8) {
    let mut tmp = [0u8; 16];
    let len = encode_integer_into(&mut tmp, value, prefix_bits, prefix).unwrap_or(0);
    buf.extend_from_slice(&tmp[..len]);
}

/// 固定長バッファへの整数エンコード。入りきらなければ `None`
pub fn encode_integer_into(dst: &mut [u8], value: usize, prefix_bits: u8, prefix: u8) -> Option<usize> {
    let len = encoded_integer_len(value, prefix_bits);
    if dst.len() < len {
        return None;
    }

    let mask = prefix_mask(prefix_bits);
    if value < mask as usize {
        dst[0] = prefix | value as u8;
        return Some(1);
    }

    dst[0] = prefix | mask;
    let mut remaining = value - mask as usize;
    let mut i = 1;
    while remaining >= 128 {
        dst[i] = 0x80 | (remaining as u8 & 0x7F);
        remaining >>= 7;
        i += 1;
    }
    dst[i] = remaining as u8;
    Some(i + 1)
}
