//! # Transfer-Encoding: chunked デコーダ
//!
//! RFC 7230 Section 4.1 のステートマシン。入力は任意の位置で分割されて届いてよく、
//! チャンクデータだけを取り出してトレーラーは別に集めます。

use std::fmt;

/// チャンクサイズ行の上限 (拡張を含む)
const MAX_CHUNK_LINE: usize = 4096;
/// トレーラー部の上限
const MAX_TRAILER_SIZE: usize = 16 * 1024;

/// デコーダの状態
#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkedState {
    /// チャンクサイズの16進数を読み取り中
    ReadingChunkSize,
    /// チャンク拡張（;以降）を読み取り中（サイズ行の終わりまでスキップ）
    ReadingChunkExtension,
    /// チャンクサイズ行の\r後、\nを期待
    ExpectingChunkSizeLF,
    /// チャンクデータを読み取り中
    ReadingChunkData,
    /// チャンクデータ後の\rを期待
    ExpectingChunkDataCR,
    /// チャンクデータ後の\nを期待
    ExpectingChunkDataLF,
    /// トレーラーヘッダーまたは終端の空行を読み取り中
    ReadingTrailerLine,
    /// トレーラー行または終端の\r後、\nを期待
    ExpectingTrailerLF,
    /// 転送完了
    Complete,
}

/// 不正なチャンク形式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedError(pub &'static str);

impl fmt::Display for ChunkedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bad chunked request body: {}", self.0)
    }
}

impl std::error::Error for ChunkedError {}

/// Chunked 転送デコーダ
#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    /// 現在のチャンクの残りバイト数
    chunk_remaining: u64,
    /// チャンクサイズの解析中に蓄積する16進数値
    size_accumulator: u64,
    /// サイズに少なくとも1文字は含まれているか
    size_has_digit: bool,
    line_len: usize,
    trailer_line: Vec<u8>,
    trailer_bytes: usize,
    trailers: Vec<(String, String)>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkedState::ReadingChunkSize,
            chunk_remaining: 0,
            size_accumulator: 0,
            size_has_digit: false,
            line_len: 0,
            trailer_line: Vec::new(),
            trailer_bytes: 0,
            trailers: Vec::new(),
        }
    }

    /// 入力をデコードし、チャンクデータを `out` に追加する
    ///
    /// 戻り値は消費したバイト数。終端に達した場合は残りを消費しない
    /// (パイプライン化された次のリクエストの先頭)。
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ChunkedError> {
        let mut i = 0;
        while i < input.len() {
            if self.state == ChunkedState::Complete {
                break;
            }

            if self.state == ChunkedState::ReadingChunkData {
                let n = (self.chunk_remaining.min((input.len() - i) as u64)) as usize;
                out.extend_from_slice(&input[i..i + n]);
                self.chunk_remaining -= n as u64;
                i += n;
                if self.chunk_remaining == 0 {
                    self.state = ChunkedState::ExpectingChunkDataCR;
                }
                continue;
            }

            self.feed_byte(input[i])?;
            i += 1;
        }
        Ok(i)
    }

    fn feed_byte(&mut self, byte: u8) -> Result<(), ChunkedError> {
        match self.state {
            ChunkedState::ReadingChunkSize => {
                self.line_len += 1;
                if self.line_len > MAX_CHUNK_LINE {
                    return Err(ChunkedError("chunk size line too long"));
                }
                match byte {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        let digit = match byte {
                            b'0'..=b'9' => byte - b'0',
                            b'a'..=b'f' => byte - b'a' + 10,
                            _ => byte - b'A' + 10,
                        };
                        self.size_accumulator = self
                            .size_accumulator
                            .checked_mul(16)
                            .and_then(|v| v.checked_add(digit as u64))
                            .ok_or(ChunkedError("chunk size overflow"))?;
                        self.size_has_digit = true;
                    }
                    b';' if self.size_has_digit => {
                        self.state = ChunkedState::ReadingChunkExtension;
                    }
                    b'\r' if self.size_has_digit => {
                        self.state = ChunkedState::ExpectingChunkSizeLF;
                    }
                    _ => return Err(ChunkedError("invalid chunk size")),
                }
            }

            ChunkedState::ReadingChunkExtension => {
                self.line_len += 1;
                if self.line_len > MAX_CHUNK_LINE {
                    return Err(ChunkedError("chunk extension too long"));
                }
                if byte == b'\r' {
                    self.state = ChunkedState::ExpectingChunkSizeLF;
                }
            }

            ChunkedState::ExpectingChunkSizeLF => {
                if byte != b'\n' {
                    return Err(ChunkedError("expected LF after chunk size"));
                }
                if self.size_accumulator == 0 {
                    // 最後のチャンク - トレーラーセクションへ
                    self.state = ChunkedState::ReadingTrailerLine;
                } else {
                    self.chunk_remaining = self.size_accumulator;
                    self.state = ChunkedState::ReadingChunkData;
                }
                self.size_accumulator = 0;
                self.size_has_digit = false;
                self.line_len = 0;
            }

            // decode() が直接処理する
            ChunkedState::ReadingChunkData => {}

            ChunkedState::ExpectingChunkDataCR => {
                if byte != b'\r' {
                    return Err(ChunkedError("expected CRLF after chunk data"));
                }
                self.state = ChunkedState::ExpectingChunkDataLF;
            }

            ChunkedState::ExpectingChunkDataLF => {
                if byte != b'\n' {
                    return Err(ChunkedError("expected CRLF after chunk data"));
                }
                self.state = ChunkedState::ReadingChunkSize;
            }

            ChunkedState::ReadingTrailerLine => {
                self.trailer_bytes += 1;
                if self.trailer_bytes > MAX_TRAILER_SIZE {
                    return Err(ChunkedError("trailers too large"));
                }
                if byte == b'\r' {
                    self.state = ChunkedState::ExpectingTrailerLF;
                } else {
                    self.trailer_line.push(byte);
                }
            }

            ChunkedState::ExpectingTrailerLF => {
                if byte != b'\n' {
                    return Err(ChunkedError("expected LF in trailer section"));
                }
                if self.trailer_line.is_empty() {
                    // 空行 = 転送完了
                    self.state = ChunkedState::Complete;
                } else {
                    let line = std::mem::take(&mut self.trailer_line);
                    self.trailers.push(parse_trailer(&line)?);
                    self.state = ChunkedState::ReadingTrailerLine;
                }
            }

            ChunkedState::Complete => {}
        }
        Ok(())
    }

    /// 転送が完了したかどうか
    pub fn is_complete(&self) -> bool {
        self.state == ChunkedState::Complete
    }

    /// 受信したトレーラー
    pub fn take_trailers(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.trailers)
    }
}

fn parse_trailer(line: &[u8]) -> Result<(String, String), ChunkedError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ChunkedError("malformed trailer"))?;
    let name = &line[..colon];
    if !super::is_valid_header_name(name) {
        return Err(ChunkedError("malformed trailer"));
    }
    let value = std::str::from_utf8(&line[colon + 1..])
        .map_err(|_| ChunkedError("malformed trailer"))?
        .trim();
    let name = String::from_utf8_lossy(name).to_ascii_lowercase();
    Ok((name, value.to_string()))
}
