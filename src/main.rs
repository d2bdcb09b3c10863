//! # デモサーバー
//!
//! 平文 TCP で HTTP/1.1 と HTTP/2 (prior knowledge) を受け付けるエコーサーバーです。
//!
//! - `GET` はリクエストの概要をテキストで返す
//! - それ以外のメソッドはリクエストボディをそのまま返す
//!
//! CPU コアごとに monoio ランタイムを 1 つ起動し、SO_REUSEPORT で
//! 同じポートを共有します (thread-per-core)。
//!
//! ```text
//! cargo run --release -- config.toml
//! curl --http2-prior-knowledge http://127.0.0.1:8080/hello
//! ```

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ftlog::{error, info};
use monoio::net::TcpListener;
use monoio::time::timeout;
use monoio::RuntimeBuilder;

use zerocopy_h2::timeout::Heartbeat;
use zerocopy_h2::transport::split_tcp;
use zerocopy_h2::{serve_connection, AppError, Application, Config, ConnectionSettings, HttpContext};

/// Graceful Shutdown 用のフラグ
static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

/// エコーアプリケーション
struct EchoApp;

impl Application for EchoApp {
    async fn handle(&self, ctx: &mut HttpContext) -> Result<(), AppError> {
        let response = &mut ctx.response;
        response.append_header("server", "zerocopy-h2")?;

        if ctx.request.method == "GET" || ctx.request.method == "HEAD" {
            let text = format!(
                "{} {} {}\nauthority: {}\nheaders: {}\n",
                ctx.request.method,
                ctx.request.path,
                ctx.request.version,
                ctx.request.authority,
                ctx.request.headers.len()
            );
            response.append_header("content-type", "text/plain; charset=utf-8")?;
            response.set_content_length(text.len() as u64)?;
            response.write(text.as_bytes()).await?;
            return Ok(());
        }

        if let Some(len) = ctx.request.content_length() {
            response.set_content_length(len)?;
        }
        if let Some(content_type) = ctx.request.header("content-type") {
            let content_type = content_type.to_string();
            response.append_header("content-type", &content_type)?;
        }
        while let Some(chunk) = ctx.body.read().await? {
            response.write(&chunk).await?;
        }
        Ok(())
    }
}

fn main() {
    let _guard = match ftlog::Builder::new().try_init() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logger init error: {}", e);
            return;
        }
    };

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = if Path::new(&config_path).exists() {
        match Config::load(Path::new(&config_path)) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Config load error: {}", e);
                return;
            }
        }
    } else {
        Config::default()
    };

    let listen_addr = config
        .server
        .listen
        .parse::<SocketAddr>()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));
    let settings = Arc::new(ConnectionSettings::from_config(&config));

    info!("============================================");
    info!("HTTP/2 + HTTP/1.1 Echo Server");
    info!("Listen Address: {}", listen_addr);
    info!("Threads: {}", num_cpus::get());
    info!("Keep-Alive Timeout: {:?}", settings.limits.keep_alive_timeout);
    info!("Request Headers Timeout: {:?}", settings.limits.request_headers_timeout);
    info!("Max Concurrent Streams: {}", settings.http2.max_concurrent_streams);
    info!("============================================");

    setup_signal_handler();

    let num_threads = num_cpus::get();
    let mut handles = Vec::with_capacity(num_threads);

    for thread_id in 0..num_threads {
        let settings = settings.clone();
        let addr = listen_addr;

        let handle = thread::spawn(move || {
            let mut rt = match RuntimeBuilder::<monoio::IoUringDriver>::new().enable_timer().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("[Thread {}] Failed to create runtime: {}", thread_id, e);
                    return;
                }
            };
            rt.block_on(worker(thread_id, addr, settings));
        });
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    info!("Server shutdown complete");
}

async fn worker(thread_id: usize, addr: SocketAddr, settings: Arc<ConnectionSettings>) {
    let listener = match create_listener(addr) {
        Ok(l) => l,
        Err(e) => {
            error!("[Thread {}] Bind error: {}", thread_id, e);
            return;
        }
    };

    // スレッド内で共有する (monoio タスクは !Send)
    let settings = Rc::new((*settings).clone());
    let app = Rc::new(EchoApp);
    let heartbeat = Heartbeat::default();
    heartbeat.spawn();

    info!("[Thread {}] Worker started", thread_id);

    loop {
        if SHUTDOWN_FLAG.load(Ordering::Relaxed) {
            info!("[Thread {}] Shutting down...", thread_id);
            break;
        }

        // タイムアウト付き accept (Graceful Shutdown 対応)
        let (stream, peer_addr) = match timeout(Duration::from_secs(1), listener.accept()).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                error!("[Thread {}] Accept error: {}", thread_id, e);
                continue;
            }
            Err(_) => continue,
        };
        let _ = stream.set_nodelay(true);
        ftlog::debug!("[Thread {}] Accepted {}", thread_id, peer_addr);

        let (reader, writer) = split_tcp(stream);
        let app = app.clone();
        let settings = settings.clone();
        let heartbeat = heartbeat.clone();
        monoio::spawn(async move {
            serve_connection(reader, writer, app, &settings, Some(&heartbeat)).await;
        });
    }

    heartbeat.stop();
    info!("[Thread {}] Worker stopped", thread_id);
}

/// シグナルハンドラのセットアップ
fn setup_signal_handler() {
    // SIGINT, SIGTERM をキャッチしてシャットダウンフラグを設定
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal, initiating graceful shutdown...");
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    }) {
        error!("Failed to set signal handler: {}", e);
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let config = monoio::net::ListenerConfig::default().reuse_port(true).backlog(8192);
    TcpListener::bind_with_config(addr, &config)
}
