//! # HTTP/2 プロトコル実装
//!
//! RFC 7540 (HTTP/2) と RFC 7541 (HPACK) のサーバー側実装。
//! 平文 TCP 上の prior-knowledge 接続を monoio のタスクで処理します。
//!
//! ## モジュール構成
//!
//! - `frame`: フレームのエンコード/デコード
//! - `hpack`: HPACK ヘッダー圧縮
//! - `stream`: ストリームの状態遷移とリクエストヘッダーの検証
//! - `flow_control`: 送信・受信ウィンドウ
//! - `writer`: フレームの書き込みとレスポンス出力
//! - `connection`: コネクションの多重化
//! - `error`: エラーコード
//!
//! ## 使用例
//!
//! ```rust,ignore
//! let conn = Http2Connection::new(reader, writer, Rc::new(app), Http2Settings::default(), limits);
//! conn.register(&heartbeat);
//! conn.run().await;
//! ```

pub mod frame;
pub mod hpack;
pub mod stream;
pub mod flow_control;
pub mod writer;
pub mod connection;
pub mod error;
pub mod settings;

pub use error::{Http2Error, Http2ErrorCode, Http2Result};
pub use settings::{Http2Settings, PeerSettings};
pub use connection::{Http2Connection, Http2ConnectionHandle};
pub use stream::{Stream, StreamState, StreamManager};
pub use writer::Http2Sink;
