//! # トランスポート境界
//!
//! プロトコルエンジンが使う双方向バイトストリームの抽象です。
//! monoio と同じく「バッファの所有権を渡して返してもらう」形の API で、
//! 読み込み側と書き込み側は独立したハーフとして扱います。
//!
//! - [`MonoioReader`] / [`MonoioWriter`]: monoio の `AsyncReadRent` / `AsyncWriteRent` のアダプタ
//! - [`duplex`]: テスト用のメモリ上の双方向ストリーム

use std::cell::RefCell;
use std::future::Future;
use std::io;

use futures::channel::mpsc;
use futures::future::{Either, LocalBoxFuture};
use futures::{FutureExt, StreamExt};
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};

use crate::http::AbortToken;
use crate::timeout::{MinDataRate, TimeoutControl};

/// 読み込みバッファの既定サイズ
pub const BUF_SIZE: usize = 65536;

/// 読み込みハーフ
pub trait TransportRead {
    /// `buf` の先頭から容量まで読み込む
    ///
    /// 戻ったバッファの `len()` は読み込んだバイト数と等しい。0 は EOF。
    fn read(&mut self, buf: Vec<u8>) -> impl Future<Output = (io::Result<usize>, Vec<u8>)>;
}

/// 書き込みハーフ
pub trait TransportWrite {
    /// バッファ全体を書き込む
    fn write_all(&mut self, buf: Vec<u8>) -> impl Future<Output = (io::Result<()>, Vec<u8>)>;

    /// 送信バッファをフラッシュ
    fn flush(&mut self) -> impl Future<Output = io::Result<()>>;

    /// 書き込み方向を閉じる
    fn shutdown(&mut self) -> impl Future<Output = io::Result<()>>;
}

/// オブジェクト安全な書き込みハーフ
///
/// レスポンス出力やフレーム書き込みはコネクションの型に依存させたくないので、
/// 書き込みハーフはこの型に詰め替えて保持する。
pub trait DynTransportWrite {
    fn write_all_boxed(&mut self, buf: Vec<u8>) -> LocalBoxFuture<'_, (io::Result<()>, Vec<u8>)>;
    fn flush_boxed(&mut self) -> LocalBoxFuture<'_, io::Result<()>>;
    fn shutdown_boxed(&mut self) -> LocalBoxFuture<'_, io::Result<()>>;
}

impl<T: TransportWrite> DynTransportWrite for T {
    fn write_all_boxed(&mut self, buf: Vec<u8>) -> LocalBoxFuture<'_, (io::Result<()>, Vec<u8>)> {
        self.write_all(buf).boxed_local()
    }

    fn flush_boxed(&mut self) -> LocalBoxFuture<'_, io::Result<()>> {
        self.flush().boxed_local()
    }

    fn shutdown_boxed(&mut self) -> LocalBoxFuture<'_, io::Result<()>> {
        self.shutdown().boxed_local()
    }
}

/// 型消去した書き込みハーフ
pub type BoxWrite = Box<dyn DynTransportWrite>;

/// 書き込みレートを計測しながらバッファ全体を書き込む
///
/// 計測は `rate` が `None` なら行わない。書き込み完了 (またはエラー) で計測を終える。
pub async fn write_timed(
    writer: &mut BoxWrite,
    control: &TimeoutControl,
    rate: Option<MinDataRate>,
    buf: Vec<u8>,
) -> io::Result<()> {
    let handle = rate.map(|rate| control.start_timing_write(rate, buf.len() as u64));
    let (result, _) = writer.write_all_boxed(buf).await;
    if let Some(handle) = handle {
        control.stop_timing_write(handle);
    }
    result
}

/// [`read_or_abort`] の結果
pub enum ReadOutcome {
    /// 読み込んだデータ (空でない)
    Data(Vec<u8>),
    /// ピアが書き込み方向を閉じた
    Eof,
    /// 読み込み中にコネクションが中断された
    Aborted,
    Error(io::Error),
}

/// 中断シグナルと競合させて 1 回読み込む
///
/// 中断された場合は読み込み中のデータを捨てる。コネクションを閉じる時にだけ使う。
pub async fn read_or_abort<R: TransportRead>(reader: &mut R, abort: &AbortToken) -> ReadOutcome {
    if abort.is_aborted() {
        return ReadOutcome::Aborted;
    }
    let read = reader.read(buf_get());
    let aborted = abort.aborted();
    futures::pin_mut!(read, aborted);
    match futures::future::select(read, aborted).await {
        Either::Left(((Ok(0), buf), _)) => {
            buf_put(buf);
            ReadOutcome::Eof
        }
        Either::Left(((Ok(n), mut buf), _)) => {
            buf.truncate(n);
            ReadOutcome::Data(buf)
        }
        Either::Left(((Err(e), buf), _)) => {
            buf_put(buf);
            ReadOutcome::Error(e)
        }
        Either::Right(_) => ReadOutcome::Aborted,
    }
}

// ====================
// バッファプール
// ====================

thread_local! {
    static BUF_POOL: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
}

/// 空の読み込みバッファを取得 (容量 `BUF_SIZE`)
#[inline]
pub fn buf_get() -> Vec<u8> {
    BUF_POOL.with(|p| p.borrow_mut().pop().unwrap_or_else(|| Vec::with_capacity(BUF_SIZE)))
}

/// バッファを返却
///
/// 前のリクエストのデータを残さないよう長さを 0 にしてから保持する。
#[inline]
pub fn buf_put(mut buf: Vec<u8>) {
    if buf.capacity() < BUF_SIZE {
        return;
    }
    BUF_POOL.with(|p| {
        let mut pool = p.borrow_mut();
        if pool.len() < 128 {
            buf.clear();
            pool.push(buf);
        }
    });
}

// ====================
// monoio アダプタ
// ====================

/// monoio の読み込みハーフ
pub struct MonoioReader<R>(pub R);

/// monoio の書き込みハーフ
pub struct MonoioWriter<W>(pub W);

impl<R: AsyncReadRent> TransportRead for MonoioReader<R> {
    async fn read(&mut self, mut buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        buf.clear();
        self.0.read(buf).await
    }
}

impl<W: AsyncWriteRent> TransportWrite for MonoioWriter<W> {
    async fn write_all(&mut self, buf: Vec<u8>) -> (io::Result<()>, Vec<u8>) {
        let (result, buf) = AsyncWriteRentExt::write_all(&mut self.0, buf).await;
        (result.map(|_| ()), buf)
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.0.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

/// TCP ストリームを読み書きのハーフに分割
pub fn split_tcp(
    stream: monoio::net::TcpStream,
) -> (
    MonoioReader<monoio::io::OwnedReadHalf<monoio::net::TcpStream>>,
    MonoioWriter<monoio::io::OwnedWriteHalf<monoio::net::TcpStream>>,
) {
    use monoio::io::Splitable;
    let (r, w) = stream.into_split();
    (MonoioReader(r), MonoioWriter(w))
}

// ====================
// メモリ上の双方向ストリーム
// ====================

/// メモリストリームの読み込みハーフ
pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    /// 前回の読み込みで返しきれなかったチャンク
    leftover: Vec<u8>,
    pos: usize,
}

/// メモリストリームの書き込みハーフ
pub struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// メモリストリームの片側
pub struct MemoryStream {
    pub reader: MemoryReader,
    pub writer: MemoryWriter,
}

impl MemoryStream {
    pub fn split(self) -> (MemoryReader, MemoryWriter) {
        (self.reader, self.writer)
    }
}

/// 接続された 2 つのメモリストリームを作成
pub fn duplex() -> (MemoryStream, MemoryStream) {
    let (a_tx, a_rx) = mpsc::unbounded();
    let (b_tx, b_rx) = mpsc::unbounded();
    let a = MemoryStream {
        reader: MemoryReader { rx: b_rx, leftover: Vec::new(), pos: 0 },
        writer: MemoryWriter { tx: Some(a_tx) },
    };
    let b = MemoryStream {
        reader: MemoryReader { rx: a_rx, leftover: Vec::new(), pos: 0 },
        writer: MemoryWriter { tx: Some(b_tx) },
    };
    (a, b)
}

impl TransportRead for MemoryReader {
    async fn read(&mut self, mut buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        buf.clear();
        if buf.capacity() == 0 {
            buf.reserve(BUF_SIZE);
        }

        while self.pos >= self.leftover.len() {
            match self.rx.next().await {
                Some(chunk) => {
                    self.leftover = chunk;
                    self.pos = 0;
                }
                None => return (Ok(0), buf),
            }
        }

        let n = (self.leftover.len() - self.pos).min(buf.capacity());
        buf.extend_from_slice(&self.leftover[self.pos..self.pos + n]);
        self.pos += n;
        (Ok(n), buf)
    }
}

impl TransportWrite for MemoryWriter {
    async fn write_all(&mut self, buf: Vec<u8>) -> (io::Result<()>, Vec<u8>) {
        let result = match &self.tx {
            Some(tx) if buf.is_empty() => {
                if tx.is_closed() {
                    Err(io::Error::from(io::ErrorKind::BrokenPipe))
                } else {
                    Ok(())
                }
            }
            Some(tx) => tx
                .unbounded_send(buf.clone())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe)),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };
        (result, buf)
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<F: Future>(f: F) -> F::Output {
        monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
            .enable_timer()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn test_duplex_roundtrip_and_eof() {
        run(async {
            let (a, b) = duplex();
            let (_a_r, mut a_w) = a.split();
            let (mut b_r, _b_w) = b.split();

            let (res, _) = a_w.write_all(b"hello world".to_vec()).await;
            res.unwrap();

            // 容量が小さいと分割して読み出される
            let (res, buf) = b_r.read(Vec::with_capacity(5)).await;
            assert_eq!(res.unwrap(), 5);
            assert_eq!(buf, b"hello");
            let (res, buf) = b_r.read(Vec::with_capacity(64)).await;
            assert_eq!(res.unwrap(), 6);
            assert_eq!(buf, b" world");

            a_w.shutdown().await.unwrap();
            let (res, _) = b_r.read(Vec::with_capacity(64)).await;
            assert_eq!(res.unwrap(), 0);
        });
    }

    #[test]
    fn test_write_after_peer_dropped() {
        run(async {
            let (a, b) = duplex();
            let (_a_r, mut a_w) = a.split();
            drop(b);
            let (res, _) = a_w.write_all(b"x".to_vec()).await;
            assert_eq!(res.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        });
    }

    #[test]
    fn test_boxed_writer() {
        run(async {
            let (a, b) = duplex();
            let (_a_r, a_w) = a.split();
            let (mut b_r, _b_w) = b.split();
            let mut writer: BoxWrite = Box::new(a_w);
            let (res, _) = writer.write_all_boxed(b"boxed".to_vec()).await;
            res.unwrap();
            writer.shutdown_boxed().await.unwrap();

            let (res, buf) = b_r.read(Vec::with_capacity(16)).await;
            assert_eq!(res.unwrap(), 5);
            assert_eq!(&buf[..], b"boxed");
            let (res, _) = b_r.read(buf).await;
            assert_eq!(res.unwrap(), 0);
        });
    }

    #[test]
    fn test_buffer_pool_returns_cleared_buffers() {
        let mut buf = buf_get();
        buf.extend_from_slice(b"secret");
        buf_put(buf);
        let buf = buf_get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= BUF_SIZE);
    }
}
