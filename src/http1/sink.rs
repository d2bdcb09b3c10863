//! # HTTP/1.1 レスポンス出力

use std::cell::Cell;
use std::rc::Rc;

use futures::future::{self, Either};
use futures::lock::Mutex;

use super::reason_phrase;
use crate::http::{AbortReason, AbortToken, HttpVersion};
use crate::timeout::{MinDataRate, TimeoutControl};
use crate::transport::{write_timed, BoxWrite};

/// HTTP/1.1 のレスポンス出力先
pub struct Http1Sink {
    writer: Rc<Mutex<BoxWrite>>,
    control: Rc<TimeoutControl>,
    rate: Option<MinDataRate>,
    version: HttpVersion,
    /// レスポンス後もコネクションを維持できるか
    keep_alive: Rc<Cell<bool>>,
    chunked: bool,
    abort: AbortToken,
}

impl Http1Sink {
    pub fn new(
        writer: Rc<Mutex<BoxWrite>>,
        control: Rc<TimeoutControl>,
        rate: Option<MinDataRate>,
        version: HttpVersion,
        keep_alive: bool,
    ) -> Self {
        Self {
            writer,
            control,
            rate,
            version,
            keep_alive: Rc::new(Cell::new(keep_alive)),
            chunked: false,
            abort: AbortToken::new(),
        }
    }

    /// 書き込みを中断させるシグナルを設定
    pub fn with_abort(mut self, abort: AbortToken) -> Self {
        self.abort = abort;
        self
    }

    /// keep-alive 判定の共有ハンドル
    pub fn keep_alive_handle(&self) -> Rc<Cell<bool>> {
        self.keep_alive.clone()
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    async fn write(&mut self, buf: Vec<u8>) -> Result<(), AbortReason> {
        let mut writer = self.writer.lock().await;
        let write = write_timed(&mut *writer, &self.control, self.rate, buf);
        let aborted = self.abort.aborted();
        futures::pin_mut!(write, aborted);
        match future::select(write, aborted).await {
            Either::Left((Ok(()), _)) => Ok(()),
            Either::Left((Err(e), _)) => {
                let reason = AbortReason::ConnectionAborted(e.to_string());
                self.keep_alive.set(false);
                self.abort.abort(reason.clone());
                Err(reason)
            }
            Either::Right((reason, _)) => {
                self.keep_alive.set(false);
                Err(reason)
            }
        }
    }

    /// ステータス行とヘッダーを送信
    pub async fn start(
        &mut self,
        status: u16,
        headers: &[(String, String)],
        content_length: Option<u64>,
        end_stream: bool,
    ) -> Result<(), AbortReason> {
        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(b"HTTP/1.1 ");
        head.extend_from_slice(status.to_string().as_bytes());
        head.push(b' ');
        head.extend_from_slice(reason_phrase(status).as_bytes());
        head.extend_from_slice(b"\r\n");

        for (name, value) in headers {
            // フレーミングはこちらで決める
            if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("transfer-encoding") {
                continue;
            }
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }

        let bodyless = (100..200).contains(&status) || status == 204 || status == 304;
        if content_length.is_none() && !bodyless {
            if end_stream {
                head.extend_from_slice(b"content-length: 0\r\n");
            } else if self.version == HttpVersion::Http11 {
                head.extend_from_slice(b"transfer-encoding: chunked\r\n");
                self.chunked = true;
            } else {
                // HTTP/1.0 で長さ不明ならコネクションの切断で終端を示す
                self.keep_alive.set(false);
            }
        }

        if !self.keep_alive.get() {
            head.extend_from_slice(b"connection: close\r\n");
        } else if self.version == HttpVersion::Http10 {
            head.extend_from_slice(b"connection: keep-alive\r\n");
        }
        head.extend_from_slice(b"\r\n");

        self.write(head).await
    }

    /// ボディを送信
    pub async fn data(&mut self, data: &[u8]) -> Result<(), AbortReason> {
        if data.is_empty() {
            return Ok(());
        }
        let buf = if self.chunked {
            let mut buf = Vec::with_capacity(data.len() + 12);
            buf.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
            buf.extend_from_slice(data);
            buf.extend_from_slice(b"\r\n");
            buf
        } else {
            data.to_vec()
        };
        self.write(buf).await
    }

    /// レスポンスを終える (chunked なら終端とトレーラーを送る)
    pub async fn end(&mut self, trailers: &[(String, String)]) -> Result<(), AbortReason> {
        if !self.chunked {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(b"0\r\n");
        for (name, value) in trailers {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        self.write(buf).await
    }

    pub async fn flush(&mut self) -> Result<(), AbortReason> {
        let mut writer = self.writer.lock().await;
        writer
            .flush_boxed()
            .await
            .map_err(|e| AbortReason::ConnectionAborted(e.to_string()))
    }
}
