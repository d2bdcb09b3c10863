//! # HPACK エンコーダ (RFC 7541)
//!
//! レスポンスヘッダーを HPACK 形式でエンコードします。
//!
//! 動的テーブルは使用せず、`:status` の静的テーブル参照以外はすべて
//! "Literal Header Field without Indexing" (新しい名前) で出力します。
//! 出力先バッファに収まる分だけヘッダー単位で書き込み、残りは次の
//! `encode` 呼び出し (CONTINUATION フレーム) に持ち越します。

use std::collections::VecDeque;

use super::{HpackError, HpackResult};
use super::integer::{encode_integer_into, encoded_integer_len};
use super::table::{HeaderField, StaticTable};

/// HPACK エンコーダ
#[derive(Debug, Default)]
pub struct HpackEncoder {
    /// 書き込み待ちのヘッダー
    pending: VecDeque<HeaderField>,
    /// 書き込み待ちの `:status`
    pending_status: Option<u16>,
}

impl HpackEncoder {
    /// 新しいエンコーダを作成
    pub fn new() -> Self {
        Self::default()
    }

    /// レスポンスヘッダーのエンコードを開始
    ///
    /// 戻り値は `(完了したか, 書き込んだバイト数)`。未完了なら `encode` で続きを出力する。
    pub fn begin_encode(
        &mut self,
        status: u16,
        headers: Vec<HeaderField>,
        buf: &mut [u8],
    ) -> HpackResult<(bool, usize)> {
        self.pending = headers.into();
        self.pending_status = Some(status);
        self.encode(buf)
    }

    /// トレーラーのエンコードを開始 (`:status` なし)
    pub fn begin_encode_trailers(
        &mut self,
        headers: Vec<HeaderField>,
        buf: &mut [u8],
    ) -> HpackResult<(bool, usize)> {
        self.pending = headers.into();
        self.pending_status = None;
        self.encode(buf)
    }

    /// 持ち越されたヘッダーの続きをエンコード
    pub fn encode(&mut self, buf: &mut [u8]) -> HpackResult<(bool, usize)> {
        let mut written = 0;

        if let Some(status) = self.pending_status {
            match encode_status(status, buf) {
                Some(len) => {
                    written += len;
                    self.pending_status = None;
                }
                None => return Err(HpackError::HeaderTooLarge(status_len(status))),
            }
        }

        while let Some(field) = self.pending.front() {
            match encode_literal(field, &mut buf[written..]) {
                Some(len) => {
                    written += len;
                    self.pending.pop_front();
                }
                None if written == 0 => {
                    // 空のバッファにも入らないヘッダーは分割できない
                    let size = literal_len(field);
                    self.pending.clear();
                    return Err(HpackError::HeaderTooLarge(size));
                }
                None => return Ok((false, written)),
            }
        }

        Ok((true, written))
    }

    /// 未出力のヘッダーが残っているか
    pub fn has_pending(&self) -> bool {
        self.pending_status.is_some() || !self.pending.is_empty()
    }
}

fn status_digits(status: u16) -> [u8; 3] {
    let status = status.min(999);
    [
        b'0' + (status / 100) as u8,
        b'0' + (status / 10 % 10) as u8,
        b'0' + (status % 10) as u8,
    ]
}

fn status_len(status: u16) -> usize {
    let digits = status_digits(status);
    if StaticTable::find_exact(b":status", &digits).is_some() {
        1
    } else {
        // 0x08 (名前インデックス 8) + 長さ + 3 桁
        5
    }
}

fn encode_status(status: u16, buf: &mut [u8]) -> Option<usize> {
    let digits = status_digits(status);

    if let Some(index) = StaticTable::find_exact(b":status", &digits) {
        return encode_integer_into(buf, index, 7, 0x80);
    }

    if buf.len() < 5 {
        return None;
    }
    // Literal without Indexing, 名前は静的テーブル 8 (:status)
    buf[0] = 0x08;
    buf[1] = 3;
    buf[2..5].copy_from_slice(&digits);
    Some(5)
}

fn literal_len(field: &HeaderField) -> usize {
    1 + encoded_integer_len(field.name.len(), 7)
        + field.name.len()
        + encoded_integer_len(field.value.len(), 7)
        + field.value.len()
}

/// Literal Header Field without Indexing - New Name (Section 6.2.2)
/// ```text
///   0   1   2   3   4   5   6   7
/// +---+---+---+---+---+---+---+---+
/// | 0 | 0 | 0 | 0 |       0       |
/// +---+---+-----------------------+
/// | H |     Name Length (7+)      |
/// +---+---------------------------+
/// |  Name String (Length octets)  |
/// +---+---------------------------+
/// | H |     Value Length (7+)     |
/// +---+---------------------------+
/// | Value String (Length octets)  |
/// +-------------------------------+
/// ```
fn encode_literal(field: &HeaderField, buf: &mut [u8]) -> Option<usize> {
    if buf.len() < literal_len(field) {
        return None;
    }

    buf[0] = 0x00;
    let mut pos = 1;

    pos += encode_integer_into(&mut buf[pos..], field.name.len(), 7, 0x00)?;
    for (dst, &b) in buf[pos..pos + field.name.len()].iter_mut().zip(field.name.iter()) {
        *dst = b.to_ascii_lowercase();
    }
    pos += field.name.len();

    pos += encode_integer_into(&mut buf[pos..], field.value.len(), 7, 0x00)?;
    buf[pos..pos + field.value.len()].copy_from_slice(&field.value);
    pos += field.value.len();

    Some(pos)
}
