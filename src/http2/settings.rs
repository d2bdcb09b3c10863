//! # HTTP/2 設定 (SETTINGS)
//!
//! RFC 7540 Section 6.5 で定義された SETTINGS パラメータを管理します。
//!
//! - [`Http2Settings`]: サーバーが広告するローカル設定と DoS 対策の上限
//! - [`PeerSettings`]: クライアントから受信した設定（範囲チェック付きで適用）

use crate::http2::error::{Http2Error, Http2ErrorCode, Http2Result};

/// SETTINGS パラメータ ID (RFC 7540 Section 6.5.2)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsId {
    /// ヘッダー圧縮テーブルサイズ
    HeaderTableSize = 0x1,
    /// サーバープッシュ有効化
    EnablePush = 0x2,
    /// 最大同時ストリーム数
    MaxConcurrentStreams = 0x3,
    /// 初期ウィンドウサイズ
    InitialWindowSize = 0x4,
    /// 最大フレームサイズ
    MaxFrameSize = 0x5,
    /// 最大ヘッダーリストサイズ
    MaxHeaderListSize = 0x6,
}

impl SettingsId {
    /// u16 から SettingsId を作成
    pub fn from_u16(val: u16) -> Option<Self> {
        match val {
            0x1 => Some(Self::HeaderTableSize),
            0x2 => Some(Self::EnablePush),
            0x3 => Some(Self::MaxConcurrentStreams),
            0x4 => Some(Self::InitialWindowSize),
            0x5 => Some(Self::MaxFrameSize),
            0x6 => Some(Self::MaxHeaderListSize),
            _ => None, // 未知の ID は無視
        }
    }
}

/// デフォルト値
pub mod defaults {
    /// ヘッダーテーブルサイズ: 4096 bytes (RFC 既定値)
    pub const HEADER_TABLE_SIZE: u32 = 4096;
    /// RFC 既定の初期ウィンドウサイズ: 65535 bytes
    pub const INITIAL_WINDOW_SIZE: u32 = 65535;
    /// サーバーが広告するストリーム受信ウィンドウ: 96KB
    pub const STREAM_RECEIVE_WINDOW: u32 = 96 * 1024;
    /// サーバーのコネクション受信ウィンドウ: 128KB
    pub const CONNECTION_RECEIVE_WINDOW: u32 = 128 * 1024;
    /// 最大同時ストリーム数
    pub const MAX_CONCURRENT_STREAMS: u32 = 100;
    /// 最大フレームサイズ: 16384 bytes (最小値、RFC 7540 要件)
    pub const MAX_FRAME_SIZE: u32 = 16384;
    /// 最大フレームサイズ上限: 16777215 bytes (2^24 - 1)
    pub const MAX_FRAME_SIZE_UPPER_LIMIT: u32 = 16777215;
    /// 最大ヘッダーリストサイズ: 32KB
    pub const MAX_HEADER_LIST_SIZE: u32 = 32 * 1024;
    /// ヘッダーフィールド 1 つあたりの最大デコード長 (MaxStringOctets)
    pub const MAX_REQUEST_HEADER_FIELD_SIZE: usize = 16 * 1024;
    /// ウィンドウの上限 (2^31 - 1)
    pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;
    /// コネクションプリフェース
    pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

    // ====================
    // DoS 対策用定数 (仕様外の制約)
    // ====================

    /// RST_STREAM レート制限 (Rapid Reset 対策: CVE-2023-44487)
    pub const MAX_RST_STREAM_PER_SECOND: u32 = 100;

    /// CONTINUATION フレーム制限 (CONTINUATION Flood 対策: CVE-2024-24786)
    pub const MAX_CONTINUATION_FRAMES: u32 = 10;
}

/// サーバー側のローカル設定
#[derive(Debug, Clone)]
pub struct Http2Settings {
    /// ヘッダー圧縮テーブルサイズ (bytes)
    pub header_table_size: u32,
    /// 最大同時ストリーム数
    pub max_concurrent_streams: u32,
    /// ストリーム受信ウィンドウ (bytes)
    pub initial_window_size: u32,
    /// 最大フレームサイズ (bytes)
    pub max_frame_size: u32,
    /// 最大ヘッダーリストサイズ (bytes)
    pub max_header_list_size: u32,
    /// コネクション受信ウィンドウ (bytes)
    pub connection_window_size: u32,
    /// ヘッダーフィールド文字列の最大長 (bytes)
    pub max_request_header_field_size: usize,

    // ====================
    // DoS 対策設定
    // ====================
    /// RST_STREAM レート制限 (1秒あたりの最大数)
    pub max_rst_stream_per_second: u32,

    /// CONTINUATION フレーム制限 (ヘッダーブロックあたりの最大数)
    pub max_continuation_frames: u32,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            header_table_size: defaults::HEADER_TABLE_SIZE,
            max_concurrent_streams: defaults::MAX_CONCURRENT_STREAMS,
            initial_window_size: defaults::STREAM_RECEIVE_WINDOW,
            max_frame_size: defaults::MAX_FRAME_SIZE,
            max_header_list_size: defaults::MAX_HEADER_LIST_SIZE,
            connection_window_size: defaults::CONNECTION_RECEIVE_WINDOW,
            max_request_header_field_size: defaults::MAX_REQUEST_HEADER_FIELD_SIZE,
            max_rst_stream_per_second: defaults::MAX_RST_STREAM_PER_SECOND,
            max_continuation_frames: defaults::MAX_CONTINUATION_FRAMES,
        }
    }
}

impl Http2Settings {
    /// 新しい設定を作成
    pub fn new() -> Self {
        Self::default()
    }

    /// RFC 既定値と異なるパラメータのみを SETTINGS エントリとして返す
    ///
    /// MAX_CONCURRENT_STREAMS と MAX_HEADER_LIST_SIZE は RFC 上「無制限」が既定のため常に送る。
    pub fn non_default_entries(&self) -> Vec<(u16, u32)> {
        let mut entries = Vec::with_capacity(5);
        if self.header_table_size != defaults::HEADER_TABLE_SIZE {
            entries.push((SettingsId::HeaderTableSize as u16, self.header_table_size));
        }
        entries.push((SettingsId::MaxConcurrentStreams as u16, self.max_concurrent_streams));
        if self.initial_window_size != defaults::INITIAL_WINDOW_SIZE {
            entries.push((SettingsId::InitialWindowSize as u16, self.initial_window_size));
        }
        if self.max_frame_size != defaults::MAX_FRAME_SIZE {
            entries.push((SettingsId::MaxFrameSize as u16, self.max_frame_size));
        }
        entries.push((SettingsId::MaxHeaderListSize as u16, self.max_header_list_size));
        entries
    }
}

/// クライアントから受信した SETTINGS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSettings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            header_table_size: defaults::HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            initial_window_size: defaults::INITIAL_WINDOW_SIZE,
            max_frame_size: defaults::MAX_FRAME_SIZE,
            max_header_list_size: u32::MAX,
        }
    }
}

impl PeerSettings {
    /// SETTINGS エントリを順に適用
    ///
    /// 成功時は INITIAL_WINDOW_SIZE の変化量（全ストリームの送信ウィンドウに加算する値）を返す。
    /// 一部だけ適用された状態を残さないよう、検証はコピーに対して行う。
    pub fn apply(&mut self, entries: &[(u16, u32)]) -> Http2Result<i64> {
        let mut next = self.clone();

        for &(id, value) in entries {
            match SettingsId::from_u16(id) {
                Some(SettingsId::HeaderTableSize) => next.header_table_size = value,
                Some(SettingsId::EnablePush) => {
                    if value > 1 {
                        return Err(Http2Error::protocol_error("ENABLE_PUSH must be 0 or 1"));
                    }
                    next.enable_push = value == 1;
                }
                Some(SettingsId::MaxConcurrentStreams) => next.max_concurrent_streams = value,
                Some(SettingsId::InitialWindowSize) => {
                    if value > defaults::MAX_WINDOW_SIZE {
                        return Err(Http2Error::connection_error(
                            Http2ErrorCode::FlowControlError,
                            "INITIAL_WINDOW_SIZE exceeds 2^31-1",
                        ));
                    }
                    next.initial_window_size = value;
                }
                Some(SettingsId::MaxFrameSize) => {
                    if !(defaults::MAX_FRAME_SIZE..=defaults::MAX_FRAME_SIZE_UPPER_LIMIT).contains(&value) {
                        return Err(Http2Error::protocol_error(format!(
                            "MAX_FRAME_SIZE must be between {} and {}",
                            defaults::MAX_FRAME_SIZE,
                            defaults::MAX_FRAME_SIZE_UPPER_LIMIT
                        )));
                    }
                    next.max_frame_size = value;
                }
                Some(SettingsId::MaxHeaderListSize) => next.max_header_list_size = value,
                None => {
                    // 未知の設定は無視 (RFC 7540 Section 6.5)
                }
            }
        }

        let delta = next.initial_window_size as i64 - self.initial_window_size as i64;
        *self = next;
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_default_entries() {
        let settings = Http2Settings::default();
        let entries = settings.non_default_entries();

        // ヘッダーテーブルサイズと最大フレームサイズは既定値なので送らない
        assert!(!entries.iter().any(|(id, _)| *id == SettingsId::HeaderTableSize as u16));
        assert!(!entries.iter().any(|(id, _)| *id == SettingsId::MaxFrameSize as u16));
        assert!(entries.contains(&(SettingsId::MaxConcurrentStreams as u16, 100)));
        assert!(entries.contains(&(SettingsId::InitialWindowSize as u16, 96 * 1024)));
        assert!(entries.contains(&(SettingsId::MaxHeaderListSize as u16, 32 * 1024)));
    }

    #[test]
    fn test_peer_settings_window_delta() {
        let mut peer = PeerSettings::default();
        let delta = peer.apply(&[(0x4, 100_000)]).unwrap();
        assert_eq!(delta, 100_000 - 65535);
        let delta = peer.apply(&[(0x4, 10)]).unwrap();
        assert_eq!(delta, 10 - 100_000);
        assert_eq!(peer.initial_window_size, 10);
    }

    #[test]
    fn test_peer_settings_invalid_enable_push() {
        let mut peer = PeerSettings::default();
        let err = peer.apply(&[(0x2, 2)]).unwrap_err();
        assert_eq!(err.error_code(), Http2ErrorCode::ProtocolError);
    }

    #[test]
    fn test_peer_settings_window_too_large() {
        let mut peer = PeerSettings::default();
        let err = peer.apply(&[(0x4, 0x8000_0000)]).unwrap_err();
        assert_eq!(err.error_code(), Http2ErrorCode::FlowControlError);
    }

    #[test]
    fn test_peer_settings_invalid_frame_size_is_atomic() {
        let mut peer = PeerSettings::default();
        let err = peer.apply(&[(0x4, 1000), (0x5, 16)]).unwrap_err();
        assert_eq!(err.error_code(), Http2ErrorCode::ProtocolError);
        // 途中までの値は適用されない
        assert_eq!(peer.initial_window_size, defaults::INITIAL_WINDOW_SIZE);

        assert!(peer.apply(&[(0x5, defaults::MAX_FRAME_SIZE_UPPER_LIMIT + 1)]).is_err());
        assert!(peer.apply(&[(0x5, defaults::MAX_FRAME_SIZE_UPPER_LIMIT)]).is_ok());
    }

    #[test]
    fn test_unknown_setting_ignored() {
        let mut peer = PeerSettings::default();
        assert_eq!(peer.apply(&[(0x99, 7)]).unwrap(), 0);
        assert_eq!(peer, PeerSettings::default());
    }
}
