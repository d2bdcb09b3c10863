//! # HTTP/2 フレームデコーダ
//!
//! 受信バッファの先頭から 1 フレームずつ取り出します。
//! バイトが足りない場合は何も消費せず `None` を返します。

use super::types::{Frame, FrameHeader, FrameType, PrioritySpec};
use crate::http2::error::{Http2Error, Http2ErrorCode, Http2Result};
use crate::http2::settings::defaults;

/// フレームデコーダ
pub struct FrameDecoder {
    /// 受け入れる最大ペイロード長 (None は 2^24-1 まで無制限)
    max_frame_size: Option<u32>,
}

impl FrameDecoder {
    /// 新しいデコーダを作成
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            max_frame_size: Some(max_frame_size),
        }
    }

    /// SETTINGS 交換前の上限なしデコーダ
    pub fn unbounded() -> Self {
        Self { max_frame_size: None }
    }

    /// 最大フレームサイズを設定
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = Some(size);
    }

    /// 現在の上限
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(defaults::MAX_FRAME_SIZE_UPPER_LIMIT)
    }

    /// バッファ先頭からフレームを 1 つ読み取る
    ///
    /// 成功時は `(フレーム, 消費バイト数)` を返す。9 + length バイトに満たない場合は `Ok(None)`。
    /// 長さ超過はペイロード到着を待たずにヘッダー時点で FRAME_SIZE_ERROR とする。
    pub fn read_frame(&self, buf: &[u8]) -> Http2Result<Option<(Frame, usize)>> {
        let header = match self.peek_header(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let total = FrameHeader::SIZE + header.length as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let frame = self.decode(&header, &buf[FrameHeader::SIZE..total])?;
        Ok(Some((frame, total)))
    }

    /// フレームヘッダーだけをデコードして長さを検証
    pub fn peek_header(&self, buf: &[u8]) -> Http2Result<Option<FrameHeader>> {
        if buf.len() < FrameHeader::SIZE {
            return Ok(None);
        }

        let mut header_bytes = [0u8; FrameHeader::SIZE];
        header_bytes.copy_from_slice(&buf[..FrameHeader::SIZE]);
        let header = FrameHeader::decode(&header_bytes);

        if header.length > self.max_frame_size() {
            return Err(Http2Error::frame_size_error(format!(
                "frame length {} exceeds max frame size {}",
                header.length,
                self.max_frame_size()
            )));
        }

        Ok(Some(header))
    }

    /// フレームをデコード
    pub fn decode(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        debug_assert_eq!(payload.len(), header.length as usize);

        match FrameType::from_u8(header.frame_type) {
            Some(FrameType::Data) => self.decode_data(header, payload),
            Some(FrameType::Headers) => self.decode_headers(header, payload),
            Some(FrameType::Priority) => self.decode_priority(header, payload),
            Some(FrameType::RstStream) => self.decode_rst_stream(header, payload),
            Some(FrameType::Settings) => self.decode_settings(header, payload),
            Some(FrameType::PushPromise) => {
                // クライアントは PUSH_PROMISE を送れない (RFC 7540 Section 8.2)
                Err(Http2Error::protocol_error("PUSH_PROMISE received from client"))
            }
            Some(FrameType::Ping) => self.decode_ping(header, payload),
            Some(FrameType::GoAway) => self.decode_goaway(header, payload),
            Some(FrameType::WindowUpdate) => self.decode_window_update(header, payload),
            Some(FrameType::Continuation) => self.decode_continuation(header, payload),
            None => Ok(Frame::Unknown {
                frame_type: header.frame_type,
                flags: header.flags,
                stream_id: header.stream_id,
                payload: payload.to_vec(),
            }),
        }
    }

    /// DATA フレームをデコード
    fn decode_data(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id == 0 {
            return Err(Http2Error::protocol_error("DATA frame with stream ID 0"));
        }

        if payload.is_empty() && !header.is_end_stream() {
            return Err(Http2Error::protocol_error("empty DATA frame without END_STREAM"));
        }

        let data = self.extract_padding(header, payload)?;

        Ok(Frame::Data {
            stream_id: header.stream_id,
            end_stream: header.is_end_stream(),
            data: data.to_vec(),
            flow_controlled_length: header.length,
        })
    }

    /// HEADERS フレームをデコード
    fn decode_headers(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id == 0 {
            return Err(Http2Error::protocol_error("HEADERS frame with stream ID 0"));
        }

        let data = self.extract_padding(header, payload)?;

        let (priority, header_block) = if header.is_priority() {
            if data.len() < 5 {
                return Err(Http2Error::frame_size_error("HEADERS priority too short"));
            }
            let priority = decode_priority_spec(&data[..5]);
            (Some(priority), &data[5..])
        } else {
            (None, data)
        };

        Ok(Frame::Headers {
            stream_id: header.stream_id,
            end_stream: header.is_end_stream(),
            end_headers: header.is_end_headers(),
            priority,
            header_block: header_block.to_vec(),
        })
    }

    /// PRIORITY フレームをデコード
    fn decode_priority(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id == 0 {
            return Err(Http2Error::protocol_error("PRIORITY frame with stream ID 0"));
        }

        if payload.len() != 5 {
            return Err(Http2Error::frame_size_error("PRIORITY frame must be 5 bytes"));
        }

        Ok(Frame::Priority {
            stream_id: header.stream_id,
            priority: decode_priority_spec(payload),
        })
    }

    /// RST_STREAM フレームをデコード
    fn decode_rst_stream(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id == 0 {
            return Err(Http2Error::protocol_error("RST_STREAM frame with stream ID 0"));
        }

        if payload.len() != 4 {
            return Err(Http2Error::frame_size_error("RST_STREAM frame must be 4 bytes"));
        }

        Ok(Frame::RstStream {
            stream_id: header.stream_id,
            error_code: read_u32(payload),
        })
    }

    /// SETTINGS フレームをデコード
    fn decode_settings(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id != 0 {
            return Err(Http2Error::protocol_error("SETTINGS frame with non-zero stream ID"));
        }

        if header.is_ack() {
            if !payload.is_empty() {
                return Err(Http2Error::frame_size_error("SETTINGS ACK must be empty"));
            }
            return Ok(Frame::Settings {
                ack: true,
                settings: Vec::new(),
            });
        }

        if payload.len() % 6 != 0 {
            return Err(Http2Error::frame_size_error("SETTINGS payload must be multiple of 6"));
        }

        let settings = payload
            .chunks_exact(6)
            .map(|chunk| (u16::from_be_bytes([chunk[0], chunk[1]]), read_u32(&chunk[2..])))
            .collect();

        Ok(Frame::Settings { ack: false, settings })
    }

    /// PING フレームをデコード
    fn decode_ping(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id != 0 {
            return Err(Http2Error::protocol_error("PING frame with non-zero stream ID"));
        }

        if payload.len() != 8 {
            return Err(Http2Error::frame_size_error("PING frame must be 8 bytes"));
        }

        let mut data = [0u8; 8];
        data.copy_from_slice(payload);

        Ok(Frame::Ping {
            ack: header.is_ack(),
            data,
        })
    }

    /// GOAWAY フレームをデコード
    fn decode_goaway(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id != 0 {
            return Err(Http2Error::protocol_error("GOAWAY frame with non-zero stream ID"));
        }

        if payload.len() < 8 {
            return Err(Http2Error::frame_size_error("GOAWAY frame too short"));
        }

        Ok(Frame::GoAway {
            last_stream_id: read_u32(payload) & 0x7FFFFFFF,
            error_code: read_u32(&payload[4..]),
            debug_data: payload[8..].to_vec(),
        })
    }

    /// WINDOW_UPDATE フレームをデコード
    ///
    /// 増分 0 はストリーム宛てならストリームエラー、コネクション宛てならコネクションエラー。
    fn decode_window_update(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if payload.len() != 4 {
            return Err(Http2Error::frame_size_error("WINDOW_UPDATE frame must be 4 bytes"));
        }

        let increment = read_u32(payload) & 0x7FFFFFFF;

        if increment == 0 {
            return Err(if header.stream_id == 0 {
                Http2Error::protocol_error("WINDOW_UPDATE increment must be non-zero")
            } else {
                Http2Error::stream_error(
                    header.stream_id,
                    Http2ErrorCode::ProtocolError,
                    "WINDOW_UPDATE increment must be non-zero",
                )
            });
        }

        Ok(Frame::WindowUpdate {
            stream_id: header.stream_id,
            increment,
        })
    }

    /// CONTINUATION フレームをデコード
    fn decode_continuation(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id == 0 {
            return Err(Http2Error::protocol_error("CONTINUATION frame with stream ID 0"));
        }

        Ok(Frame::Continuation {
            stream_id: header.stream_id,
            end_headers: header.is_end_headers(),
            header_block: payload.to_vec(),
        })
    }

    /// パディングを取り除いたペイロードを返す
    fn extract_padding<'a>(&self, header: &FrameHeader, payload: &'a [u8]) -> Http2Result<&'a [u8]> {
        if !header.is_padded() {
            return Ok(payload);
        }

        if payload.is_empty() {
            return Err(Http2Error::protocol_error("PADDED frame has no pad length"));
        }

        // パディング長がペイロード長以上なら負の長さになる
        let pad_length = payload[0] as usize;
        if pad_length >= payload.len() {
            return Err(Http2Error::protocol_error("Pad length exceeds payload"));
        }

        let data_end = payload.len() - pad_length;
        Ok(&payload[1..data_end])
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(defaults::MAX_FRAME_SIZE)
    }
}

#[inline]
fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Priority spec をデコード
fn decode_priority_spec(data: &[u8]) -> PrioritySpec {
    let first_word = read_u32(data);
    PrioritySpec {
        dependency: first_word & 0x7FFFFFFF,
        exclusive: first_word & 0x80000000 != 0,
        weight: data[4],
    }
}
