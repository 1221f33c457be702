//! `engine_contract` 集成测试：以真实套接字验证 TCP 引擎的端到端契约。
//!
//! # 测试目标（Why）
//! - 帧的任意切割、成帧错误、退避重连与发送背压都只有在真实连接上
//!   才能暴露时序问题；
//! - 测试服务端用标准库阻塞套接字实现，与引擎的共享反应器互不纠缠。
//!
//! # 结构安排（How）
//! - `recv_block_updates_on_echo`：完整帧一次到达的基本路径；
//! - `split_header_defers_dispatch`：逐字节投喂验证两阶段解码的时点；
//! - `framing_error_tears_down_connection`：坏魔数只拆一次连接；
//! - `send_queue_backpressure`：超限入队同步失败、冲刷后恢复；
//! - `reconnect_after_peer_close`：对端关闭后 5 秒退避再连。

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use psc_core::config::tunables;
use psc_core::{Block, ListenerCtx};
use psc_transport_tcp::TcpEngine;

fn frame(msgid: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(b"PS");
    out.extend_from_slice(&msgid.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// 轮询等待条件成立；超时返回 `false`。
fn wait_until(limit: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn count_hits(ctx: &ListenerCtx, _block: &Block) {
    ctx.downcast_ref::<AtomicU32>()
        .expect("ctx type")
        .fetch_add(1, Ordering::Relaxed);
}

#[test]
fn recv_block_updates_on_echo() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut conn, _) = listener.accept().expect("accept");
        conn.write_all(&frame(42, b"hello")).expect("send frame");
        // 保持连接直到客户端消化完毕。
        thread::sleep(Duration::from_secs(2));
    });

    let engine = TcpEngine::new("t1", "127.0.0.1", port, 0).expect("engine");
    let block = engine.core().get_recv(42);
    let hits: ListenerCtx = Arc::new(AtomicU32::new(0));
    block.add_listener(count_hits, hits.clone());

    engine.connect();
    assert!(
        wait_until(Duration::from_secs(5), || block.count() == 1),
        "block 42 should be delivered once, report: {}",
        engine.report(2)
    );
    assert_eq!(block.state().data.to_vec(), b"hello");
    assert!(block.rxtime().is_some());
    let hits = hits.downcast_ref::<AtomicU32>().unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 1);
    assert!(engine.core().is_connected());
    assert_eq!(engine.core().last_message(), "Connected");
    assert_eq!(engine.core().conn_count(), 1);

    engine.stop();
    server.join().unwrap();
}

#[test]
fn split_header_defers_dispatch() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let (step_tx, step_rx) = mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let (mut conn, _) = listener.accept().expect("accept");
        let wire = frame(42, b"hello");
        for byte in wire {
            step_rx.recv().expect("step");
            conn.write_all(&[byte]).expect("byte");
            conn.flush().expect("flush");
        }
        thread::sleep(Duration::from_secs(1));
    });

    let engine = TcpEngine::new("t2", "127.0.0.1", port, 0).expect("engine");
    let block = engine.core().get_recv(42);
    let hits: ListenerCtx = Arc::new(AtomicU32::new(0));
    block.add_listener(count_hits, hits.clone());
    engine.connect();
    assert!(wait_until(Duration::from_secs(5), || {
        engine.core().is_connected()
    }));

    // 前 7 个字节：头未满，Block 纹丝不动。
    for _ in 0..7 {
        step_tx.send(()).unwrap();
    }
    thread::sleep(Duration::from_millis(300));
    assert_eq!(block.count(), 0);

    // 第 8 个字节：头解出、计数加一，但订阅者还没被触达。
    step_tx.send(()).unwrap();
    assert!(wait_until(Duration::from_secs(2), || block.count() == 1));
    let hits_ref = hits.downcast_ref::<AtomicU32>().unwrap();
    assert_eq!(hits_ref.load(Ordering::Relaxed), 0);
    assert_eq!(block.state().data.size(), 0);

    // 后 5 个字节补齐报文体：恰好一次派发。
    for _ in 0..5 {
        step_tx.send(()).unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || {
        hits_ref.load(Ordering::Relaxed) == 1
    }));
    assert_eq!(block.count(), 1);
    assert_eq!(block.state().data.to_vec(), b"hello");

    engine.stop();
    server.join().unwrap();
}

#[test]
fn framing_error_tears_down_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut conn, _) = listener.accept().expect("accept");
        conn.write_all(&[0x58, 0x59, 0, 1, 0, 0, 0, 0]).expect("junk");
        // 等引擎主动拆线。
        let mut sink = [0u8; 16];
        let _ = conn.read(&mut sink);
    });

    let engine = TcpEngine::new("t3", "127.0.0.1", port, 0).expect("engine");
    let block = engine.core().get_recv(0x0001);
    engine.connect();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.core().last_message() == "Framing error!"
    }));
    assert!(!engine.core().is_connected());
    assert_eq!(block.count(), 0);
    // 下一次成功握手之前连接计数保持不变。
    assert_eq!(engine.core().conn_count(), 1);

    engine.stop();
    server.join().unwrap();
}

#[test]
fn send_queue_backpressure() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut conn, _) = listener.accept().expect("accept");
        // 只等首帧的 60 个字节，读满即返回。
        let mut sink = vec![0u8; 60];
        conn.read_exact(&mut sink).expect("first frame bytes");
        sink
    });

    let engine = TcpEngine::new("t4", "127.0.0.1", port, 0).expect("engine");
    engine.connect();
    assert!(wait_until(Duration::from_secs(5), || {
        engine.core().is_connected()
    }));

    tunables().set_max_send_buffer(64);
    // 60 字节的帧在 64 字节的上限内。
    let first = engine.core().get_send(1);
    engine
        .queue_send_block(&first, &[0u8; 52])
        .expect("first frame fits");
    assert!(first.queued());
    assert_eq!(first.count(), 1);

    // 再入队 20 字节会冲破上限：同步失败，首帧保持在队。
    let second = engine.core().get_send(2);
    let err = engine
        .queue_send_block(&second, &[0u8; 20])
        .expect_err("second frame must overflow");
    assert_eq!(err.stable_code(), "psc.send.overflow");
    assert!(first.queued());
    assert!(!second.queued());

    // 冲刷成功后全部发送块的在队标志清零，字节如数到达对端。
    engine.flush_send().expect("flush");
    assert!(!first.queued());
    tunables().set_max_send_buffer(1024 * 1024);

    let seen = server.join().unwrap();
    assert_eq!(&seen[..2], b"PS");
    assert_eq!(u16::from_be_bytes([seen[2], seen[3]]), 1);
    assert_eq!(u32::from_be_bytes([seen[4], seen[5], seen[6], seen[7]]), 52);
    engine.stop();
}

#[test]
fn reconnect_after_peer_close() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        // 第一条连接立即关闭，第二条保持。
        let (first, _) = listener.accept().expect("accept #1");
        drop(first);
        let (second, _) = listener.accept().expect("accept #2");
        thread::sleep(Duration::from_secs(1));
        drop(second);
    });

    let engine = TcpEngine::new("t5", "127.0.0.1", port, 0).expect("engine");
    engine.connect();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.core().last_message() == "Connection closed by PSC"
    }));
    // 5 秒退避后自动重连成功。
    assert!(wait_until(Duration::from_secs(10), || {
        engine.core().conn_count() == 2
    }));

    engine.stop();
    server.join().unwrap();
}
