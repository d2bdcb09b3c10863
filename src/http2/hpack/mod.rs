//! # HPACK ヘッダー圧縮 (RFC 7541)
//!
//! HTTP/2 のヘッダー圧縮アルゴリズムを実装します。
//!
//! ## 主要コンポーネント
//!
//! - `StaticTable`: 61 エントリの静的テーブル (Appendix A)
//! - `DynamicTable`: デコーダ側の FIFO 動的テーブル
//! - `IntegerDecoder`: N ビットプレフィックス整数の逐次デコーダ
//! - `Huffman`: Huffman 復号化 (Appendix B)
//! - `HpackEncoder`: リテラル表現のみを出力するエンコーダ（CONTINUATION 分割対応）
//! - `HpackDecoder`: フレームをまたいで再開できるデコーダ

pub mod table;
pub mod huffman;
pub mod integer;
pub mod encoder;
pub mod decoder;

pub use table::{StaticTable, DynamicTable, HeaderField};
pub use huffman::{huffman_encode, huffman_decode};
pub use integer::{IntegerDecoder, decode_integer, encode_integer};
pub use encoder::HpackEncoder;
pub use decoder::{HpackDecoder, HeaderHandler};

/// HPACK エラー
///
/// どのエラーもコネクション全体の圧縮状態に関わるため COMPRESSION_ERROR として扱われる。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HpackError {
    /// 無効なインデックス
    InvalidIndex(usize),
    /// 整数オーバーフロー
    IntegerOverflow,
    /// Huffman デコードエラー
    HuffmanDecodeError,
    /// 文字列長が上限を超えた (実際の長さ, 上限)
    StringTooLong(usize, usize),
    /// ヘッダーリストの合計サイズが上限を超えた
    HeaderListTooLarge(usize),
    /// ヘッダーブロックが表現の途中で終わった
    Truncated,
    /// 動的テーブルサイズ更新が不正
    InvalidTableSizeUpdate(usize),
    /// 1 つのヘッダーが空のバッファにも収まらない
    HeaderTooLarge(usize),
}

impl std::fmt::Display for HpackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidIndex(i) => write!(f, "Invalid HPACK index: {}", i),
            Self::IntegerOverflow => write!(f, "HPACK integer overflow"),
            Self::HuffmanDecodeError => write!(f, "Huffman decode error"),
            Self::StringTooLong(len, max) => {
                write!(f, "HPACK string length {} exceeds limit {}", len, max)
            }
            Self::HeaderListTooLarge(max) => write!(f, "Header list exceeds {} bytes", max),
            Self::Truncated => write!(f, "Header block ended mid-representation"),
            Self::InvalidTableSizeUpdate(size) => {
                write!(f, "Invalid dynamic table size update: {}", size)
            }
            Self::HeaderTooLarge(len) => {
                write!(f, "Header field of {} bytes does not fit in a frame", len)
            }
        }
    }
}

impl std::error::Error for HpackError {}

/// HPACK 処理結果
pub type HpackResult<T> = Result<T, HpackError>;
