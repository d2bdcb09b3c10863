//! # HTTP/2 フレームエンコーダ
//!
//! 送信するフレームをバイト列に変換します。ヘッダーブロックは
//! ピアの SETTINGS_MAX_FRAME_SIZE に従って HEADERS + CONTINUATION に、
//! 本文は複数の DATA フレームに分割されます。

use super::types::{Frame, FrameHeader, FrameType, FrameFlags, PrioritySpec};
use crate::http2::hpack::{HeaderField, HpackEncoder, HpackResult};

/// フレームエンコーダ
pub struct FrameEncoder {
    /// 最大フレームサイズ (ピアが広告した値)
    max_frame_size: u32,
}

impl FrameEncoder {
    /// 新しいエンコーダを作成
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    /// 最大フレームサイズを設定
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// 最大フレームサイズを取得
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    #[inline]
    fn put_header(buf: &mut Vec<u8>, frame_type: FrameType, flags: u8, stream_id: u32, length: usize) {
        let header = FrameHeader::new(frame_type, flags, stream_id, length as u32);
        let mut header_buf = [0u8; FrameHeader::SIZE];
        header.encode(&mut header_buf);
        buf.extend_from_slice(&header_buf);
    }

    /// DATA フレームを 1 つエンコード
    pub fn encode_data(&self, stream_id: u32, data: &[u8], end_stream: bool) -> Vec<u8> {
        let flags = if end_stream { FrameFlags::END_STREAM } else { 0 };
        let mut buf = Vec::with_capacity(FrameHeader::SIZE + data.len());
        Self::put_header(&mut buf, FrameType::Data, flags, stream_id, data.len());
        buf.extend_from_slice(data);
        buf
    }

    /// 本文を最大フレームサイズごとの DATA フレーム列にエンコード
    ///
    /// END_STREAM は最後のフレームにのみ付与される。空の本文は空の DATA フレーム 1 つになる。
    pub fn encode_data_frames(&self, stream_id: u32, data: &[u8], end_stream: bool) -> Vec<u8> {
        let chunk_size = self.max_frame_size.max(1) as usize;
        if data.is_empty() {
            return self.encode_data(stream_id, data, end_stream);
        }

        let frames = data.len().div_ceil(chunk_size);
        let mut buf = Vec::with_capacity(frames * FrameHeader::SIZE + data.len());
        let mut chunks = data.chunks(chunk_size).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let flags = if last && end_stream { FrameFlags::END_STREAM } else { 0 };
            Self::put_header(&mut buf, FrameType::Data, flags, stream_id, chunk.len());
            buf.extend_from_slice(chunk);
        }
        buf
    }

    /// レスポンスヘッダー (またはトレーラー) を HEADERS + CONTINUATION にエンコード
    ///
    /// `status` が `None` のときはトレーラーとして扱う。
    pub fn encode_header_block(
        &self,
        hpack: &mut HpackEncoder,
        stream_id: u32,
        status: Option<u16>,
        headers: Vec<HeaderField>,
        end_stream: bool,
    ) -> HpackResult<Vec<u8>> {
        let payload_size = self.max_frame_size as usize;
        let mut buf = Vec::with_capacity(FrameHeader::SIZE + payload_size);
        let mut frame_type = FrameType::Headers;
        let mut first = true;

        loop {
            let start = buf.len();
            buf.resize(start + FrameHeader::SIZE + payload_size, 0);
            let payload = &mut buf[start + FrameHeader::SIZE..];

            let (done, written) = if first {
                match status {
                    Some(status) => hpack.begin_encode(status, headers.clone(), payload)?,
                    None => hpack.begin_encode_trailers(headers.clone(), payload)?,
                }
            } else {
                hpack.encode(payload)?
            };

            let mut flags = 0;
            if first && end_stream {
                flags |= FrameFlags::END_STREAM;
            }
            if done {
                flags |= FrameFlags::END_HEADERS;
            }

            let header = FrameHeader::new(frame_type, flags, stream_id, written as u32);
            let mut header_buf = [0u8; FrameHeader::SIZE];
            header.encode(&mut header_buf);
            buf[start..start + FrameHeader::SIZE].copy_from_slice(&header_buf);
            buf.truncate(start + FrameHeader::SIZE + written);

            if done {
                return Ok(buf);
            }
            first = false;
            frame_type = FrameType::Continuation;
        }
    }

    /// HEADERS フレームをエンコード (ヘッダーブロックはエンコード済み)
    pub fn encode_headers(
        &self,
        stream_id: u32,
        header_block: &[u8],
        end_stream: bool,
        end_headers: bool,
        priority: Option<PrioritySpec>,
    ) -> Vec<u8> {
        let mut flags = 0u8;
        if end_stream {
            flags |= FrameFlags::END_STREAM;
        }
        if end_headers {
            flags |= FrameFlags::END_HEADERS;
        }
        if priority.is_some() {
            flags |= FrameFlags::PRIORITY;
        }

        let priority_len = if priority.is_some() { 5 } else { 0 };
        let length = priority_len + header_block.len();

        let mut buf = Vec::with_capacity(FrameHeader::SIZE + length);
        Self::put_header(&mut buf, FrameType::Headers, flags, stream_id, length);
        if let Some(p) = priority {
            Self::put_priority(&mut buf, p);
        }
        buf.extend_from_slice(header_block);
        buf
    }

    fn put_priority(buf: &mut Vec<u8>, p: PrioritySpec) {
        let dep = if p.exclusive { p.dependency | 0x80000000 } else { p.dependency };
        buf.extend_from_slice(&dep.to_be_bytes());
        buf.push(p.weight);
    }

    /// SETTINGS フレームをエンコード
    pub fn encode_settings(&self, settings: &[(u16, u32)], ack: bool) -> Vec<u8> {
        let flags = if ack { FrameFlags::ACK } else { 0 };
        let length = if ack { 0 } else { settings.len() * 6 };

        let mut buf = Vec::with_capacity(FrameHeader::SIZE + length);
        Self::put_header(&mut buf, FrameType::Settings, flags, 0, length);
        if !ack {
            for &(id, value) in settings {
                buf.extend_from_slice(&id.to_be_bytes());
                buf.extend_from_slice(&value.to_be_bytes());
            }
        }
        buf
    }

    /// SETTINGS ACK フレームをエンコード
    pub fn encode_settings_ack(&self) -> Vec<u8> {
        self.encode_settings(&[], true)
    }

    /// WINDOW_UPDATE フレームをエンコード
    pub fn encode_window_update(&self, stream_id: u32, increment: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FrameHeader::SIZE + 4);
        Self::put_header(&mut buf, FrameType::WindowUpdate, 0, stream_id, 4);
        buf.extend_from_slice(&(increment & 0x7FFFFFFF).to_be_bytes());
        buf
    }

    /// PING フレームをエンコード
    pub fn encode_ping(&self, data: &[u8; 8], ack: bool) -> Vec<u8> {
        let flags = if ack { FrameFlags::ACK } else { 0 };
        let mut buf = Vec::with_capacity(FrameHeader::SIZE + 8);
        Self::put_header(&mut buf, FrameType::Ping, flags, 0, 8);
        buf.extend_from_slice(data);
        buf
    }

    /// RST_STREAM フレームをエンコード
    pub fn encode_rst_stream(&self, stream_id: u32, error_code: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FrameHeader::SIZE + 4);
        Self::put_header(&mut buf, FrameType::RstStream, 0, stream_id, 4);
        buf.extend_from_slice(&error_code.to_be_bytes());
        buf
    }

    /// GOAWAY フレームをエンコード
    pub fn encode_goaway(&self, last_stream_id: u32, error_code: u32, debug_data: &[u8]) -> Vec<u8> {
        let length = 8 + debug_data.len();
        let mut buf = Vec::with_capacity(FrameHeader::SIZE + length);
        Self::put_header(&mut buf, FrameType::GoAway, 0, 0, length);
        buf.extend_from_slice(&(last_stream_id & 0x7FFFFFFF).to_be_bytes());
        buf.extend_from_slice(&error_code.to_be_bytes());
        buf.extend_from_slice(debug_data);
        buf
    }

    /// CONTINUATION フレームをエンコード
    pub fn encode_continuation(&self, stream_id: u32, header_block: &[u8], end_headers: bool) -> Vec<u8> {
        let flags = if end_headers { FrameFlags::END_HEADERS } else { 0 };
        let mut buf = Vec::with_capacity(FrameHeader::SIZE + header_block.len());
        Self::put_header(&mut buf, FrameType::Continuation, flags, stream_id, header_block.len());
        buf.extend_from_slice(header_block);
        buf
    }

    /// PRIORITY フレームをエンコード
    pub fn encode_priority(&self, stream_id: u32, priority: PrioritySpec) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FrameHeader::SIZE + 5);
        Self::put_header(&mut buf, FrameType::Priority, 0, stream_id, 5);
        Self::put_priority(&mut buf, priority);
        buf
    }

    /// Frame 型からエンコード
    pub fn encode(&self, frame: &Frame) -> Vec<u8> {
        match frame {
            Frame::Data { stream_id, end_stream, data, .. } => {
                self.encode_data(*stream_id, data, *end_stream)
            }
            Frame::Headers { stream_id, end_stream, end_headers, priority, header_block } => {
                self.encode_headers(*stream_id, header_block, *end_stream, *end_headers, *priority)
            }
            Frame::Settings { ack, settings } => self.encode_settings(settings, *ack),
            Frame::WindowUpdate { stream_id, increment } => {
                self.encode_window_update(*stream_id, *increment)
            }
            Frame::Ping { ack, data } => self.encode_ping(data, *ack),
            Frame::RstStream { stream_id, error_code } => {
                self.encode_rst_stream(*stream_id, *error_code)
            }
            Frame::GoAway { last_stream_id, error_code, debug_data } => {
                self.encode_goaway(*last_stream_id, *error_code, debug_data)
            }
            Frame::Continuation { stream_id, end_headers, header_block } => {
                self.encode_continuation(*stream_id, header_block, *end_headers)
            }
            Frame::Priority { stream_id, priority } => self.encode_priority(*stream_id, *priority),
            Frame::Unknown { frame_type, flags, stream_id, payload } => {
                let header = FrameHeader {
                    length: payload.len() as u32,
                    frame_type: *frame_type,
                    flags: *flags,
                    stream_id: *stream_id & 0x7FFFFFFF,
                };
                let mut buf = Vec::with_capacity(FrameHeader::SIZE + payload.len());
                let mut header_buf = [0u8; FrameHeader::SIZE];
                header.encode(&mut header_buf);
                buf.extend_from_slice(&header_buf);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(16384)
    }
}
