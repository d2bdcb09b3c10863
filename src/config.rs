//! # サーバー設定
//!
//! `config.toml` を serde + toml で読み込み、プロトコルエンジンが使う
//! 値 (フレームサイズ、ウィンドウ、最小データレート、各種タイムアウト) に変換します。
//! すべてのフィールドに既定値があり、セクションごと省略できます。

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::http2::settings::{defaults, Http2Settings};
use crate::timeout::MinDataRate;

/// 設定エラー
#[derive(Debug)]
pub enum ConfigError {
    /// ファイルを読めなかった
    Io(io::Error),
    /// TOML の構文・型エラー
    Parse(toml::de::Error),
    /// 値の範囲外
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Config read error: {}", e),
            Self::Parse(e) => write!(f, "TOML parse error: {}", e),
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse(e)
    }
}

// ====================
// 設定構造体
// ====================

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfigSection,
    pub limits: LimitsConfigSection,
    pub http2: Http2ConfigSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfigSection {
    pub listen: String,
}

impl Default for ServerConfigSection {
    fn default() -> Self {
        Self { listen: "0.0.0.0:8080".to_string() }
    }
}

/// 最小データレート設定
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MinDataRateConfig {
    pub bytes_per_second: f64,
    pub grace_period_secs: u64,
}

impl Default for MinDataRateConfig {
    fn default() -> Self {
        Self { bytes_per_second: 240.0, grace_period_secs: 5 }
    }
}

impl MinDataRateConfig {
    pub fn to_rate(&self) -> MinDataRate {
        MinDataRate::new(self.bytes_per_second, Duration::from_secs(self.grace_period_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfigSection {
    pub keep_alive_timeout_secs: u64,
    pub request_headers_timeout_secs: u64,
    pub request_body_drain_timeout_secs: u64,
    /// HTTP/1.1 リクエスト行 + ヘッダーの最大バイト数
    pub max_request_header_bytes: usize,
    pub max_request_body_size: u64,
    /// `None` のときリクエストボディの読み込みレートを検査しない
    pub min_request_body_data_rate: Option<MinDataRateConfig>,
    pub min_response_data_rate: Option<MinDataRateConfig>,
}

impl Default for LimitsConfigSection {
    fn default() -> Self {
        Self {
            keep_alive_timeout_secs: 130,
            request_headers_timeout_secs: 30,
            request_body_drain_timeout_secs: 5,
            max_request_header_bytes: 32 * 1024,
            max_request_body_size: 30_000_000,
            min_request_body_data_rate: Some(MinDataRateConfig::default()),
            min_response_data_rate: Some(MinDataRateConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Http2ConfigSection {
    pub max_frame_size: u32,
    pub header_table_size: u32,
    /// ストリームごとの受信ウィンドウ
    pub initial_window_size: u32,
    pub initial_connection_window_size: u32,
    pub max_concurrent_streams: u32,
    /// HPACK 文字列の最大長 (MaxStringOctets)
    pub max_request_header_field_size: usize,
    pub max_header_list_size: u32,
}

impl Default for Http2ConfigSection {
    fn default() -> Self {
        Self {
            max_frame_size: defaults::MAX_FRAME_SIZE,
            header_table_size: defaults::HEADER_TABLE_SIZE,
            initial_window_size: defaults::STREAM_RECEIVE_WINDOW,
            initial_connection_window_size: defaults::CONNECTION_RECEIVE_WINDOW,
            max_concurrent_streams: defaults::MAX_CONCURRENT_STREAMS,
            max_request_header_field_size: defaults::MAX_REQUEST_HEADER_FIELD_SIZE,
            max_header_list_size: defaults::MAX_HEADER_LIST_SIZE,
        }
    }
}

/// 実行時に参照するタイムアウト・レート制限
///
/// HTTP/1.1 と HTTP/2 の両方が同じ値を使う。
#[derive(Debug, Clone)]
pub struct ServerLimits {
    pub keep_alive_timeout: Duration,
    pub request_headers_timeout: Duration,
    pub request_body_drain_timeout: Duration,
    pub max_request_header_bytes: usize,
    pub max_request_body_size: u64,
    pub min_request_body_data_rate: Option<MinDataRate>,
    pub min_response_data_rate: Option<MinDataRate>,
}

impl Default for ServerLimits {
    fn default() -> Self {
        LimitsConfigSection::default().to_limits()
    }
}

impl LimitsConfigSection {
    pub fn to_limits(&self) -> ServerLimits {
        ServerLimits {
            keep_alive_timeout: Duration::from_secs(self.keep_alive_timeout_secs),
            request_headers_timeout: Duration::from_secs(self.request_headers_timeout_secs),
            request_body_drain_timeout: Duration::from_secs(self.request_body_drain_timeout_secs),
            max_request_header_bytes: self.max_request_header_bytes,
            max_request_body_size: self.max_request_body_size,
            min_request_body_data_rate: self.min_request_body_data_rate.map(|r| r.to_rate()),
            min_response_data_rate: self.min_response_data_rate.map(|r| r.to_rate()),
        }
    }
}

impl Http2ConfigSection {
    pub fn to_settings(&self) -> Http2Settings {
        Http2Settings {
            header_table_size: self.header_table_size,
            max_concurrent_streams: self.max_concurrent_streams,
            initial_window_size: self.initial_window_size,
            max_frame_size: self.max_frame_size,
            max_header_list_size: self.max_header_list_size,
            connection_window_size: self.initial_connection_window_size,
            max_request_header_field_size: self.max_request_header_field_size,
            ..Http2Settings::default()
        }
    }
}

impl Config {
    /// TOML 文字列から読み込んで検証
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// ファイルから読み込んで検証
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_str = fs::read_to_string(path)?;
        Self::from_toml(&config_str)
    }

    /// 値の範囲を検査
    pub fn validate(&self) -> Result<(), ConfigError> {
        let h2 = &self.http2;
        if !(defaults::MAX_FRAME_SIZE..=defaults::MAX_FRAME_SIZE_UPPER_LIMIT).contains(&h2.max_frame_size) {
            return Err(ConfigError::Invalid(format!(
                "http2.max_frame_size must be between {} and {}",
                defaults::MAX_FRAME_SIZE,
                defaults::MAX_FRAME_SIZE_UPPER_LIMIT
            )));
        }
        for (name, value) in [
            ("http2.initial_window_size", h2.initial_window_size),
            ("http2.initial_connection_window_size", h2.initial_connection_window_size),
        ] {
            if value == 0 || value > defaults::MAX_WINDOW_SIZE {
                return Err(ConfigError::Invalid(format!("{} must be between 1 and 2^31-1", name)));
            }
        }
        if h2.initial_connection_window_size < defaults::INITIAL_WINDOW_SIZE {
            return Err(ConfigError::Invalid(
                "http2.initial_connection_window_size must be at least 65535".to_string(),
            ));
        }
        if h2.max_concurrent_streams == 0 {
            return Err(ConfigError::Invalid("http2.max_concurrent_streams must be positive".to_string()));
        }

        let limits = &self.limits;
        for (name, rate) in [
            ("limits.min_request_body_data_rate", limits.min_request_body_data_rate),
            ("limits.min_response_data_rate", limits.min_response_data_rate),
        ] {
            if let Some(rate) = rate {
                if !rate.bytes_per_second.is_finite() || rate.bytes_per_second <= 0.0 {
                    return Err(ConfigError::Invalid(format!("{}.bytes_per_second must be positive", name)));
                }
            }
        }
        if limits.max_request_header_bytes == 0 {
            return Err(ConfigError::Invalid("limits.max_request_header_bytes must be positive".to_string()));
        }
        Ok(())
    }
}
