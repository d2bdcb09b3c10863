//! 統合テスト
//!
//! メモリ上の双方向ストリームでコネクション全体を動かし、
//! クライアント側からフレーム・バイト列を直接検証します。

mod common;

use std::rc::Rc;
use std::time::{Duration, Instant};

use common::*;
use zerocopy_h2::config::ServerLimits;
use zerocopy_h2::http::AbortReason;
use zerocopy_h2::http1::Http1Connection;
use zerocopy_h2::http2::frame::{Frame, FrameFlags, FrameType};
use zerocopy_h2::http2::{Http2Connection, Http2ErrorCode, Http2Settings};
use zerocopy_h2::timeout::{FixedDebugger, TimeoutControl};
use zerocopy_h2::transport::{duplex, MemoryReader, MemoryWriter, TransportWrite};
use zerocopy_h2::{serve_connection, Application, ConnectionSettings};

const PROTOCOL_ERROR: u32 = 0x1;
const INTERNAL_ERROR: u32 = 0x2;
const STREAM_CLOSED: u32 = 0x5;
const REFUSED_STREAM: u32 = 0x7;
const ENHANCE_YOUR_CALM: u32 = 0xb;

/// HTTP/2 サーバーを起動してクライアントを返す
fn start_h2<A: Application>(app: A, settings: Http2Settings) -> (H2Client, Rc<TimeoutControl>) {
    let (server, client) = duplex();
    let (reader, writer) = server.split();
    let conn = Http2Connection::with_debugger(
        reader,
        writer,
        Rc::new(app),
        settings,
        ServerLimits::default(),
        FixedDebugger(false),
    );
    let control = conn.timeout_control();
    monoio::spawn(conn.run());
    (H2Client::new(client), control)
}

/// HTTP/1.1 サーバーを起動
fn start_h1<A: Application>(app: A) -> (MemoryReader, MemoryWriter, Rc<TimeoutControl>) {
    let (server, client) = duplex();
    let (reader, writer) = server.split();
    let conn = Http1Connection::with_debugger(reader, writer, Rc::new(app), ServerLimits::default(), FixedDebugger(false));
    let control = conn.timeout_control();
    monoio::spawn(conn.run());
    let (client_r, client_w) = client.split();
    (client_r, client_w, control)
}

fn post_headers(content_length: Option<&str>) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        (":method", "POST".to_string()),
        (":scheme", "http".to_string()),
        (":authority", "localhost".to_string()),
        (":path", "/upload".to_string()),
    ];
    if let Some(len) = content_length {
        fields.push(("content-length", len.to_string()));
    }
    fields
}

async fn send_post(client: &mut H2Client, stream_id: u32, content_length: Option<&str>) {
    let owned = post_headers(content_length);
    let fields: Vec<(&str, &str)> = owned.iter().map(|(n, v)| (*n, v.as_str())).collect();
    client.send_headers(stream_id, &fields, false).await;
}

async fn settle() {
    monoio::time::sleep(Duration::from_millis(20)).await;
}

// ====================
// ハンドシェイク
// ====================

#[test]
fn test_h2_settings_exchange() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        let (settings, window_update) = client.handshake().await;

        assert!(settings.contains(&(0x3, 100)));
        assert!(settings.contains(&(0x4, 96 * 1024)));
        assert!(settings.contains(&(0x6, 32 * 1024)));
        // 既定値と同じ MAX_FRAME_SIZE は送らない
        assert!(!settings.iter().any(|(id, _)| *id == 0x5));
        assert_eq!(window_update, 128 * 1024 - 65_535);
    });
}

#[test]
fn test_h2_invalid_preface() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        client.send(b"PRI * HTTP/1.1\r\n\r\nSM\r\n\r\n".to_vec()).await;
        let (last, code) = client.expect_goaway().await;
        assert_eq!(last, 0);
        assert_eq!(code, PROTOCOL_ERROR);
        client.expect_eof().await;
    });
}

#[test]
fn test_h2_first_frame_must_be_settings() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        let mut out = zerocopy_h2::http2::settings::defaults::CONNECTION_PREFACE.to_vec();
        out.extend(client.encoder().encode_ping(&[0; 8], false));
        client.send(out).await;
        let (_, code) = client.expect_goaway().await;
        assert_eq!(code, PROTOCOL_ERROR);
    });
}

#[test]
fn test_h2_ping_ack() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        client.handshake().await;
        let ping = client.encoder().encode_ping(b"12345678", false);
        client.send(ping).await;
        match client.read_frame().await {
            Some(Frame::Ping { ack: true, data }) => assert_eq!(&data, b"12345678"),
            other => panic!("expected PING ACK, got {:?}", other),
        }
    });
}

// ====================
// リクエスト・レスポンス
// ====================

#[test]
fn test_h2_get() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        client.handshake().await;
        client.send_get(1, "/index.html").await;

        let response = client.read_response(1).await;
        assert_eq!(response.status, Some(200));
        assert!(response.headers.contains(&("content-length".to_string(), "5".to_string())));
        assert_eq!(response.body, b"hello");
        assert_eq!(response.reset, None);
    });
}

#[test]
fn test_h2_serve_connection_prior_knowledge() {
    run(async {
        let (server, client) = duplex();
        let (reader, writer) = server.split();
        monoio::spawn(async move {
            serve_connection(reader, writer, Rc::new(EchoApp), &ConnectionSettings::default(), None).await;
        });

        let mut client = H2Client::new(client);
        client.handshake().await;
        client.send_get(1, "/").await;
        let response = client.read_response(1).await;
        assert_eq!(response.status, Some(200));
        assert_eq!(response.body, b"hello");
    });
}

#[test]
fn test_h2_post_content_length_exact() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        client.handshake().await;
        send_post(&mut client, 1, Some("12")).await;
        client.send_data(1, b"hello ", false).await;
        client.send_data(1, b"world!", true).await;

        let response = client.read_response(1).await;
        assert_eq!(response.status, Some(200));
        assert_eq!(response.body, b"hello world!");
    });
}

#[test]
fn test_h2_post_content_length_short() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        client.handshake().await;
        send_post(&mut client, 1, Some("12")).await;
        client.send_data(1, b"hello world", true).await;

        assert_eq!(client.expect_rst(1).await, PROTOCOL_ERROR);

        // コネクションは継続する
        client.send_get(3, "/").await;
        assert_eq!(client.read_response(3).await.body, b"hello");
    });
}

#[test]
fn test_h2_post_content_length_long() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        client.handshake().await;
        send_post(&mut client, 1, Some("12")).await;
        client.send_data(1, b"hello world!!", false).await;

        assert_eq!(client.expect_rst(1).await, PROTOCOL_ERROR);
    });
}

#[test]
fn test_h2_large_response_respects_flow_control() {
    run(async {
        let (mut client, _control) = start_h2(LargeApp(100_000), Http2Settings::default());
        client.handshake().await;
        client.send_get(1, "/large").await;

        let response = client.read_response(1).await;
        assert_eq!(response.status, Some(200));
        assert_eq!(response.body.len(), 100_000);
    });
}

#[test]
fn test_h2_data_frames_respect_max_frame_size() {
    run(async {
        let (mut client, _control) = start_h2(LargeApp(40_000), Http2Settings::default());
        client.handshake().await;
        client.send_get(1, "/").await;

        let mut total = 0;
        loop {
            match client.read_frame().await.unwrap() {
                Frame::Data { stream_id: 1, data, end_stream, .. } => {
                    assert!(data.len() <= 16_384);
                    total += data.len();
                    if end_stream {
                        break;
                    }
                }
                Frame::Headers { stream_id: 1, .. } => {}
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(total, 40_000);
    });
}

// ====================
// ストリームエラー
// ====================

#[test]
fn test_h2_malformed_headers_reset_stream() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        client.handshake().await;
        client
            .send_headers(
                1,
                &[(":method", "GET"), (":scheme", "http"), (":path", "/"), ("connection", "keep-alive")],
                true,
            )
            .await;
        assert_eq!(client.expect_rst(1).await, PROTOCOL_ERROR);

        client.send_get(3, "/").await;
        assert_eq!(client.read_response(3).await.status, Some(200));
    });
}

#[test]
fn test_h2_refused_stream_over_limit() {
    run(async {
        let settings = Http2Settings { max_concurrent_streams: 1, ..Http2Settings::default() };
        let app = HangingApp::default();
        let (mut client, _control) = start_h2(app.clone(), settings);
        client.handshake().await;
        client.send_get(1, "/one").await;
        client.send_get(3, "/two").await;

        assert_eq!(client.expect_rst(3).await, REFUSED_STREAM);
        settle().await;
        assert_eq!(*app.started.borrow(), vec!["/one".to_string()]);
    });
}

#[test]
fn test_h2_data_after_stream_closed() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        client.handshake().await;
        client.send_get(1, "/").await;
        client.read_response(1).await;
        settle().await;

        client.send_data(1, b"late", false).await;
        assert_eq!(client.expect_rst(1).await, STREAM_CLOSED);
    });
}

#[test]
fn test_h2_zero_window_update_on_stream() {
    run(async {
        let app = HangingApp::default();
        let (mut client, _control) = start_h2(app.clone(), Http2Settings::default());
        client.handshake().await;
        client.send_get(1, "/").await;
        client.send(raw_frame(FrameType::WindowUpdate, 0, 1, &0u32.to_be_bytes())).await;

        assert_eq!(client.expect_rst(1).await, PROTOCOL_ERROR);
        settle().await;
        assert_eq!(*app.aborted.borrow(), vec![AbortReason::Reset(Http2ErrorCode::ProtocolError)]);
    });
}

#[test]
fn test_h2_client_reset_aborts_application() {
    run(async {
        let app = HangingApp::default();
        let (mut client, _control) = start_h2(app.clone(), Http2Settings::default());
        client.handshake().await;
        client.send_get(1, "/").await;
        settle().await;
        let rst = client.encoder().encode_rst_stream(1, 0x8);
        client.send(rst).await;
        settle().await;

        assert_eq!(*app.aborted.borrow(), vec![AbortReason::Reset(Http2ErrorCode::Cancel)]);
    });
}

// ====================
// コネクションエラー
// ====================

#[test]
fn test_h2_data_on_stream_zero() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        client.handshake().await;
        client.send(raw_frame(FrameType::Data, FrameFlags::END_STREAM, 0, b"x")).await;

        let (last, code) = client.expect_goaway().await;
        assert_eq!(last, 0);
        assert_eq!(code, PROTOCOL_ERROR);
        client.expect_eof().await;
    });
}

#[test]
fn test_h2_frame_inside_header_block() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        client.handshake().await;
        let block = client.header_block(&[(":method", "GET"), (":scheme", "http"), (":path", "/")]);
        let headers = client.encoder().encode_headers(1, &block, true, false, None);
        client.send(headers).await;
        let ping = client.encoder().encode_ping(&[0; 8], false);
        client.send(ping).await;

        let (_, code) = client.expect_goaway().await;
        assert_eq!(code, PROTOCOL_ERROR);
    });
}

#[test]
fn test_h2_continuation_flood() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        client.handshake().await;
        let headers = client.encoder().encode_headers(1, &[], true, false, None);
        client.send(headers).await;
        for _ in 0..11 {
            let continuation = client.encoder().encode_continuation(1, &[], false);
            client.send(continuation).await;
        }

        let (_, code) = client.expect_goaway().await;
        assert_eq!(code, ENHANCE_YOUR_CALM);
    });
}

#[test]
fn test_h2_headers_on_closed_stream() {
    run(async {
        let (mut client, _control) = start_h2(EchoApp, Http2Settings::default());
        client.handshake().await;
        client.send_get(3, "/").await;
        client.read_response(3).await;
        // 3 より小さい ID は開けない
        client.send_get(1, "/").await;

        let (last, code) = client.expect_goaway().await;
        assert_eq!(last, 3);
        assert_eq!(code, STREAM_CLOSED);
    });
}

#[test]
fn test_h2_goaway_aborts_open_streams() {
    run(async {
        let app = HangingApp::default();
        let (mut client, _control) = start_h2(app.clone(), Http2Settings::default());
        client.handshake().await;
        client.send_get(1, "/a").await;
        client.send_get(3, "/b").await;
        client.send_get(5, "/c").await;
        settle().await;
        assert_eq!(app.started.borrow().len(), 3);

        let goaway = client.encoder().encode_goaway(0, 0, b"");
        client.send(goaway).await;

        let (last, code) = client.expect_goaway().await;
        assert_eq!(last, 5);
        assert_eq!(code, 0);
        client.expect_eof().await;
        assert_eq!(*app.aborted.borrow(), vec![AbortReason::GoAway; 3]);
    });
}

// ====================
// タイムアウト
// ====================

#[test]
fn test_h2_keep_alive_timeout_sends_goaway() {
    run(async {
        let (mut client, control) = start_h2(EchoApp, Http2Settings::default());
        client.handshake().await;
        client.send_get(1, "/").await;
        client.read_response(1).await;
        settle().await;

        control.tick(Instant::now() + Duration::from_secs(200));
        let (last, code) = client.expect_goaway().await;
        assert_eq!(last, 1);
        assert_eq!(code, 0);
        client.expect_eof().await;
    });
}

#[test]
fn test_h2_no_keep_alive_timeout_while_stream_active() {
    run(async {
        let app = HangingApp::default();
        let (mut client, control) = start_h2(app.clone(), Http2Settings::default());
        client.handshake().await;
        client.send_get(1, "/").await;
        settle().await;

        control.tick(Instant::now() + Duration::from_secs(200));
        settle().await;
        assert!(app.aborted.borrow().is_empty());

        // 接続はまだ応答する
        let ping = client.encoder().encode_ping(b"stillok!", false);
        client.send(ping).await;
        loop {
            if let Some(Frame::Ping { ack: true, data }) = client.read_frame().await {
                assert_eq!(&data, b"stillok!");
                break;
            }
        }
    });
}

#[test]
fn test_h2_request_headers_timeout() {
    run(async {
        let (mut client, control) = start_h2(EchoApp, Http2Settings::default());
        client.handshake().await;
        let block = client.header_block(&[(":method", "GET"), (":scheme", "http")]);
        let headers = client.encoder().encode_headers(1, &block, true, false, None);
        client.send(headers).await;
        settle().await;

        control.tick(Instant::now() + Duration::from_secs(60));
        let (_, code) = client.expect_goaway().await;
        assert_eq!(code, INTERNAL_ERROR);
        client.expect_eof().await;
    });
}

#[test]
fn test_h2_request_body_read_rate_timeout() {
    run(async {
        let app = HangingApp::default();
        let (mut client, control) = start_h2(app.clone(), Http2Settings::default());
        client.handshake().await;
        send_post(&mut client, 1, None).await;
        settle().await;

        // 猶予期間 (5 秒) を過ぎても 1 バイトも届かない
        let start = control.last_timestamp();
        for i in 1..=7 {
            control.tick(start + Duration::from_secs(i));
        }

        let (_, code) = client.expect_goaway().await;
        assert_eq!(code, INTERNAL_ERROR);
        client.expect_eof().await;
        assert_eq!(
            *app.aborted.borrow(),
            vec![AbortReason::Timeout(zerocopy_h2::timeout::TimeoutReason::ReadDataRate)]
        );
    });
}

#[test]
fn test_h2_full_stream_does_not_hide_slow_stream() {
    run(async {
        let app = HangingApp::default();
        let settings = Http2Settings { initial_window_size: 1024, ..Http2Settings::default() };
        let (mut client, control) = start_h2(app.clone(), settings);
        client.handshake().await;

        // ストリーム 1 はアプリが読まないままボディパイプが一杯になる
        send_post(&mut client, 1, None).await;
        client.send_data(1, &[b'a'; 1024], false).await;
        // ストリーム 3 は 1 バイトしか送らない
        send_post(&mut client, 3, None).await;
        client.send_data(3, b"b", false).await;
        settle().await;
        assert_eq!(app.started.borrow().len(), 2);

        let start = control.last_timestamp();
        for i in 1..=10 {
            control.tick(start + Duration::from_secs(i));
        }

        let (_, code) = client.expect_goaway().await;
        assert_eq!(code, INTERNAL_ERROR);
        client.expect_eof().await;
        let aborted = app.aborted.borrow();
        assert_eq!(aborted.len(), 2);
        assert!(aborted
            .iter()
            .all(|r| *r == AbortReason::Timeout(zerocopy_h2::timeout::TimeoutReason::ReadDataRate)));
    });
}

// ====================
// HTTP/1.1
// ====================

#[test]
fn test_http1_get() {
    run(async {
        let (mut reader, mut writer, _control) = start_h1(EchoApp);
        let (res, _) = writer
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n".to_vec())
            .await;
        res.unwrap();

        let text = read_to_eof(&mut reader).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    });
}

#[test]
fn test_http1_keep_alive_serves_two_requests() {
    run(async {
        let (mut reader, mut writer, _control) = start_h1(EchoApp);
        let (res, _) = writer.write_all(b"GET /1 HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec()).await;
        res.unwrap();
        let first = read_until(&mut reader, "hello").await;
        assert!(!first.contains("connection: close"));

        let (res, _) = writer
            .write_all(b"GET /2 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n".to_vec())
            .await;
        res.unwrap();
        let second = read_to_eof(&mut reader).await;
        assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(second.ends_with("hello"));
    });
}

#[test]
fn test_http1_chunked_request_body() {
    run(async {
        let (mut reader, mut writer, _control) = start_h1(EchoApp);
        let (res, _) = writer
            .write_all(
                b"POST /echo HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
                  5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
                    .to_vec(),
            )
            .await;
        res.unwrap();

        let text = read_to_eof(&mut reader).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 11\r\n"));
        assert!(text.ends_with("hello world"));
    });
}

#[test]
fn test_http1_keep_alive_timeout_closes() {
    run(async {
        let (mut reader, _writer, control) = start_h1(EchoApp);
        settle().await;
        control.tick(Instant::now() + Duration::from_secs(200));
        let text = read_to_eof(&mut reader).await;
        assert!(text.is_empty());
    });
}
