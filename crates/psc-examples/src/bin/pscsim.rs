//! PSC 对端模拟器：手工联调用的 TCP 服务端。
//!
//! 行为：
//! - 每秒广播一帧 `msgid 42` 的问候与一帧 `msgid 55` 的演示波形；
//! - 收到的任何帧以 `msgid + 10` 回显；`msgid >= 1000` 时在报文体前
//!   附加一个 `sec/nsec` 时间戳对。
//!
//! 用法：`pscsim [监听地址，默认 127.0.0.1:8765]`

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use psc_core::wire::{FrameHeader, HEADER_LEN};

fn frame(msgid: u16, body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    FrameHeader {
        msgid,
        bodylen: body.len() as u32,
    }
    .encode(&mut out);
    out.extend_from_slice(body);
    out
}

fn timestamp_pair() -> [u8; 8] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut raw = [0u8; 8];
    raw[..4].copy_from_slice(&(now.as_secs() as u32).to_be_bytes());
    raw[4..].copy_from_slice(&now.subsec_nanos().to_be_bytes());
    raw
}

async fn serve(mut stream: TcpStream, peer: std::net::SocketAddr) {
    tracing::info!(%peer, "connection");
    let (mut rd, mut wr) = stream.split();
    let mut rxbuf = BytesMut::with_capacity(64 * 1024);
    let mut ping = tokio::time::interval(Duration::from_secs(1));
    let wave: Vec<u8> = (1u16..20).flat_map(|v| v.to_be_bytes()).collect();

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if wr.write_all(&frame(42, b"hello world!")).await.is_err() {
                    break;
                }
                if wr.write_all(&frame(55, &wave)).await.is_err() {
                    break;
                }
            }
            read = rd.read_buf(&mut rxbuf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                loop {
                    if rxbuf.len() < HEADER_LEN {
                        break;
                    }
                    let head = match FrameHeader::parse(&rxbuf[..HEADER_LEN]) {
                        Ok(head) => head,
                        Err(err) => {
                            tracing::error!(%peer, %err, "framing error, closing");
                            return;
                        }
                    };
                    let total = head.frame_len();
                    if rxbuf.len() < total {
                        break;
                    }
                    let whole = rxbuf.split_to(total);
                    let body = &whole[HEADER_LEN..];
                    tracing::debug!(msgid = head.msgid, bytes = body.len(), "echo");
                    // msgid + 10 回显；大帧号附带时间戳前缀。
                    let reply = if head.msgid >= 1000 {
                        let mut stamped = Vec::with_capacity(8 + body.len());
                        stamped.extend_from_slice(&timestamp_pair());
                        stamped.extend_from_slice(body);
                        frame(head.msgid + 10, &stamped)
                    } else {
                        frame(head.msgid + 10, body)
                    };
                    if wr.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    tracing::info!(%peer, "disconnect");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let listen = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8765".to_owned());
    let listener = TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "pscsim listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(serve(stream, peer));
    }
}
