//! # フレーム型
//!
//! 9 バイトのフレームヘッダーと、デコード済みフレームの列挙型。
//! 受信側の処理は [`Frame`] に対する網羅的な match で行う。

/// フレームタイプ (RFC 7540 Section 6)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    /// サーバーからは送らず、クライアントから届けばコネクションエラー
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    const ALL: [FrameType; 10] = [
        Self::Data,
        Self::Headers,
        Self::Priority,
        Self::RstStream,
        Self::Settings,
        Self::PushPromise,
        Self::Ping,
        Self::GoAway,
        Self::WindowUpdate,
        Self::Continuation,
    ];

    /// 未知のタイプは `None` (受信側は読み捨てる)
    pub fn from_u8(val: u8) -> Option<Self> {
        Self::ALL.get(val as usize).copied()
    }
}

/// フレームフラグ
#[allow(non_snake_case)]
pub mod FrameFlags {
    pub const END_STREAM: u8 = 0x01;
    /// SETTINGS / PING の ACK (END_STREAM と同じビット)
    pub const ACK: u8 = 0x01;
    pub const END_HEADERS: u8 = 0x04;
    pub const PADDED: u8 = 0x08;
    /// HEADERS に優先度フィールドが付いている
    pub const PRIORITY: u8 = 0x20;
}

/// フレームヘッダー
///
/// 24 ビット長、タイプ、フラグ、31 ビットのストリーム ID。
/// 予約ビット R は送信時に 0、受信時には無視する。
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;

impl FrameHeader {
    pub const SIZE: usize = 9;

    pub fn new(frame_type: FrameType, flags: u8, stream_id: u32, length: u32) -> Self {
        Self {
            length,
            frame_type: frame_type as u8,
            flags,
            stream_id: stream_id & STREAM_ID_MASK,
        }
    }

    #[inline]
    pub fn decode(buf: &[u8; 9]) -> Self {
        Self {
            length: u32::from_be_bytes([0, buf[0], buf[1], buf[2]]),
            frame_type: buf[3],
            flags: buf[4],
            stream_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & STREAM_ID_MASK,
        }
    }

    #[inline]
    pub fn encode(&self, buf: &mut [u8; 9]) {
        let length = self.length.to_be_bytes();
        buf[..3].copy_from_slice(&length[1..]);
        buf[3] = self.frame_type;
        buf[4] = self.flags;
        buf[5..].copy_from_slice(&(self.stream_id & STREAM_ID_MASK).to_be_bytes());
    }

    #[inline]
    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.has(FrameFlags::END_STREAM)
    }

    pub fn is_end_headers(&self) -> bool {
        self.has(FrameFlags::END_HEADERS)
    }

    pub fn is_ack(&self) -> bool {
        self.has(FrameFlags::ACK)
    }

    pub fn is_padded(&self) -> bool {
        self.has(FrameFlags::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.has(FrameFlags::PRIORITY)
    }
}

/// デコード済みフレーム
///
/// パディングと優先度フィールドは取り除かれている。
#[derive(Debug, Clone)]
pub enum Frame {
    Data {
        stream_id: u32,
        end_stream: bool,
        data: Vec<u8>,
        /// フロー制御で数える長さ (パディングを含むペイロード全体)
        flow_controlled_length: u32,
    },
    Headers {
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        priority: Option<PrioritySpec>,
        header_block: Vec<u8>,
    },
    Priority {
        stream_id: u32,
        priority: PrioritySpec,
    },
    RstStream {
        stream_id: u32,
        error_code: u32,
    },
    Settings {
        ack: bool,
        settings: Vec<(u16, u32)>,
    },
    Ping {
        ack: bool,
        data: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: u32,
        debug_data: Vec<u8>,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        end_headers: bool,
        header_block: Vec<u8>,
    },
    /// 未知のタイプ (拡張フレーム)
    Unknown {
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: Vec<u8>,
    },
}

/// 優先度 (受け取って検証するだけで、スケジューリングには使わない)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub dependency: u32,
    pub exclusive: bool,
    pub weight: u8,
}

impl Frame {
    /// コネクション宛てのフレームは 0
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// ログ用の名前
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Data { .. } => "DATA",
            Frame::Headers { .. } => "HEADERS",
            Frame::Priority { .. } => "PRIORITY",
            Frame::RstStream { .. } => "RST_STREAM",
            Frame::Settings { .. } => "SETTINGS",
            Frame::Ping { .. } => "PING",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
            Frame::Continuation { .. } => "CONTINUATION",
            Frame::Unknown { .. } => "UNKNOWN",
        }
    }
}
