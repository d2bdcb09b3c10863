//! # HPACK デコーダ (RFC 7541)
//!
//! HEADERS / CONTINUATION のフラグメントを順に受け取り、完成したヘッダー
//! フィールドごとにハンドラを呼び出します。フラグメント境界で途切れた表現は
//! 内部に保持し、次のフラグメントで再開します。
//!
//! 動的テーブルはコネクション単位で 1 つだけ存在し、ストリームがリセット
//! されてもデコードは最後まで行うことで状態の整合性を保ちます。

use super::{HpackError, HpackResult};
use super::integer::decode_integer;
use super::table::{DynamicTable, get_indexed};
use super::huffman::huffman_decode;

/// デコードされたヘッダーを受け取るコールバック
pub trait HeaderHandler {
    fn on_header(&mut self, name: &[u8], value: &[u8]);
}

impl HeaderHandler for Vec<(Vec<u8>, Vec<u8>)> {
    fn on_header(&mut self, name: &[u8], value: &[u8]) {
        self.push((name.to_vec(), value.to_vec()));
    }
}

/// ヘッダー表現の種類 (RFC 7541 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Representation {
    /// Indexed Header Field (6.1)
    Indexed,
    /// Literal with Incremental Indexing (6.2.1)
    IncrementalIndexing,
    /// Literal without Indexing (6.2.2) / Never Indexed (6.2.3)
    WithoutIndexing,
    /// Dynamic Table Size Update (6.3)
    SizeUpdate,
}

impl Representation {
    /// 先頭バイトから種類とプレフィックス長を判定
    fn classify(first_byte: u8) -> (Self, u8) {
        if first_byte & 0x80 != 0 {
            (Self::Indexed, 7)
        } else if first_byte & 0x40 != 0 {
            (Self::IncrementalIndexing, 6)
        } else if first_byte & 0x20 != 0 {
            (Self::SizeUpdate, 5)
        } else {
            // 0x10 (never indexed) と 0x00 (without indexing) は同じ形式
            (Self::WithoutIndexing, 4)
        }
    }
}

/// HPACK デコーダ
pub struct HpackDecoder {
    /// 動的テーブル
    dynamic_table: DynamicTable,
    /// SETTINGS_HEADER_TABLE_SIZE として広告した上限
    max_dynamic_table_size: usize,
    /// 1 つの文字列の最大長 (MaxStringOctets)
    max_string_octets: usize,
    /// 最大ヘッダーリストサイズ
    max_header_list_size: usize,
    /// 前のフラグメントで完結しなかったバイト
    pending: Vec<u8>,
    /// 現在のブロックでヘッダーフィールドを出力済みか
    field_seen: bool,
    /// 現在のブロックのヘッダーリストサイズ
    header_list_size: usize,
}

impl HpackDecoder {
    /// 新しいデコーダを作成
    pub fn new(max_dynamic_table_size: usize, max_string_octets: usize) -> Self {
        Self {
            dynamic_table: DynamicTable::new(max_dynamic_table_size),
            max_dynamic_table_size,
            max_string_octets,
            max_header_list_size: usize::MAX,
            pending: Vec::new(),
            field_seen: false,
            header_list_size: 0,
        }
    }

    /// 最大ヘッダーリストサイズを設定
    pub fn set_max_header_list_size(&mut self, size: usize) {
        self.max_header_list_size = size;
    }

    /// 動的テーブルへの参照を取得
    pub fn dynamic_table(&self) -> &DynamicTable {
        &self.dynamic_table
    }

    /// ヘッダーブロックのフラグメントをデコード
    ///
    /// `end_headers` が真のとき、未完了の表現が残っていれば [`HpackError::Truncated`]。
    pub fn decode<H: HeaderHandler>(
        &mut self,
        payload: &[u8],
        end_headers: bool,
        handler: &mut H,
    ) -> HpackResult<()> {
        let result = if self.pending.is_empty() {
            self.decode_fragment(payload, end_headers, handler)
        } else {
            let mut buf = std::mem::take(&mut self.pending);
            buf.extend_from_slice(payload);
            self.decode_fragment(&buf, end_headers, handler)
        };

        if end_headers || result.is_err() {
            self.pending.clear();
            self.field_seen = false;
            self.header_list_size = 0;
        }

        result
    }

    fn decode_fragment<H: HeaderHandler>(
        &mut self,
        buf: &[u8],
        end_headers: bool,
        handler: &mut H,
    ) -> HpackResult<()> {
        let mut pos = 0;

        while pos < buf.len() {
            match self.decode_representation(&buf[pos..], handler)? {
                Some(consumed) => pos += consumed,
                None => break,
            }
        }

        if pos < buf.len() {
            if end_headers {
                return Err(HpackError::Truncated);
            }
            self.pending = buf[pos..].to_vec();
        }

        Ok(())
    }

    /// 表現を 1 つデコード。バイトが足りなければ `None` を返し、状態は変更しない
    fn decode_representation<H: HeaderHandler>(
        &mut self,
        buf: &[u8],
        handler: &mut H,
    ) -> HpackResult<Option<usize>> {
        let (kind, prefix_bits) = Representation::classify(buf[0]);

        let (index, mut pos) = match decode_integer(buf, prefix_bits)? {
            Some((index, consumed)) => (index as usize, consumed),
            None => return Ok(None),
        };

        match kind {
            Representation::Indexed => {
                let (name, value) = get_indexed(&self.dynamic_table, index)?;
                let (name, value) = (name.to_vec(), value.to_vec());
                self.emit(&name, &value, handler)?;
                Ok(Some(pos))
            }
            Representation::SizeUpdate => {
                // サイズ更新はブロック先頭でのみ許可され、広告した上限を超えてはならない
                if self.field_seen || index > self.max_dynamic_table_size {
                    return Err(HpackError::InvalidTableSizeUpdate(index));
                }
                self.dynamic_table.set_max_size(index);
                Ok(Some(pos))
            }
            Representation::IncrementalIndexing | Representation::WithoutIndexing => {
                let name = if index > 0 {
                    get_indexed(&self.dynamic_table, index)?.0.to_vec()
                } else {
                    match self.decode_string(&buf[pos..])? {
                        Some((name, consumed)) => {
                            pos += consumed;
                            name
                        }
                        None => return Ok(None),
                    }
                };

                let value = match self.decode_string(&buf[pos..])? {
                    Some((value, consumed)) => {
                        pos += consumed;
                        value
                    }
                    None => return Ok(None),
                };

                self.emit(&name, &value, handler)?;

                if kind == Representation::IncrementalIndexing {
                    self.dynamic_table.insert(name, value);
                }
                Ok(Some(pos))
            }
        }
    }

    /// ヘッダーリストサイズを検査してハンドラへ渡す
    fn emit<H: HeaderHandler>(&mut self, name: &[u8], value: &[u8], handler: &mut H) -> HpackResult<()> {
        self.field_seen = true;
        self.header_list_size = self
            .header_list_size
            .saturating_add(name.len() + value.len() + 32);
        if self.header_list_size > self.max_header_list_size {
            return Err(HpackError::HeaderListTooLarge(self.max_header_list_size));
        }
        handler.on_header(name, value);
        Ok(())
    }

    /// 文字列リテラルをデコード (RFC 7541 Section 5.2)
    fn decode_string(&self, buf: &[u8]) -> HpackResult<Option<(Vec<u8>, usize)>> {
        let first = match buf.first() {
            Some(&b) => b,
            None => return Ok(None),
        };
        let huffman = first & 0x80 != 0;

        let (length, consumed) = match decode_integer(buf, 7)? {
            Some((length, consumed)) => (length as usize, consumed),
            None => return Ok(None),
        };

        // 本体の到着を待たずに長さで拒否する
        if length > self.max_string_octets {
            return Err(HpackError::StringTooLong(length, self.max_string_octets));
        }

        if buf.len() < consumed + length {
            return Ok(None);
        }

        let raw = &buf[consumed..consumed + length];
        let value = if huffman {
            let decoded = huffman_decode(raw)?;
            if decoded.len() > self.max_string_octets {
                return Err(HpackError::StringTooLong(decoded.len(), self.max_string_octets));
            }
            decoded
        } else {
            raw.to_vec()
        };

        Ok(Some((value, consumed + length)))
    }
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new(4096, 16 * 1024)
    }
}
