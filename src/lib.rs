//! # zerocopy-h2
//!
//! monoio 上で動く HTTP/2 (RFC 7540 / RFC 7541) と HTTP/1.1 のプロトコルエンジンです。
//! ソケットのバイト列をリクエストに変換してアプリケーションに渡し、
//! ヘッダー受信・ボディ受信・レスポンス送信の最小データレートを監視します。
//!
//! ## モジュール構成
//!
//! - `config`: TOML 設定
//! - `transport`: 双方向バイトストリームの抽象
//! - `protocol`: プリフェースによる HTTP/1.1 / HTTP/2 の判定
//! - `http`: プロトコル共通のリクエスト・レスポンス
//! - `http1`: HTTP/1.1 のメッセージループ
//! - `http2`: HTTP/2 のフレーム・HPACK・ストリーム・コネクション
//! - `timeout`: タイムアウトと最小データレートの判定

pub mod config;
pub mod http;
pub mod http1;
pub mod http2;
pub mod protocol;
pub mod timeout;
pub mod transport;

pub use config::{Config, ServerLimits};
pub use http::{AbortReason, AppError, Application, HttpContext, Request};
pub use protocol::{serve_connection, ConnectionSettings};
