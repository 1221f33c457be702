//! `udp_contract` 集成测试：真实回环套接字上的数据报引擎契约。
//!
//! # 覆盖点（How）
//! - `valid_datagram_updates_block`：正常帧进 Block，陌生来源被过滤；
//! - `malformed_datagrams_are_counted`：短包、坏魔数、截断声明各自记账，
//!   暂存缓冲在截断后扩容并接住重发；
//! - `tx_queue_is_bounded`：入队上限 64，冲刷后对端逐包收到。

use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use psc_transport_udp::UdpEngine;

fn frame(msgid: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(b"PS");
    out.extend_from_slice(&msgid.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

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

/// 对端套接字 + 指向它的引擎。
fn engine_with_peer(name: &str) -> (UdpSocket, Arc<UdpEngine>) {
    let peer = UdpSocket::bind("127.0.0.1:0").expect("bind peer");
    let peer_port = peer.local_addr().unwrap().port();
    let engine = UdpEngine::new(name, "127.0.0.1", peer_port, 0).expect("engine");
    (peer, engine)
}

#[test]
fn valid_datagram_updates_block() {
    let (peer, engine) = engine_with_peer("u1");
    let target = engine.local_addr().expect("local addr");
    let block = engine.core().get_recv(7);
    engine.connect();
    assert!(engine.core().is_connected());

    peer.send_to(&frame(7, b"abcd"), target).expect("send");
    assert!(wait_until(Duration::from_secs(3), || block.count() == 1));
    assert_eq!(block.state().data.to_vec(), b"abcd");

    // 陌生来源的合法帧被整体忽略。
    let stranger = UdpSocket::bind("127.0.0.1:0").expect("bind stranger");
    stranger.send_to(&frame(7, b"evil"), target).expect("send");
    peer.send_to(&frame(7, b"good"), target).expect("send");
    assert!(wait_until(Duration::from_secs(3), || block.count() == 2));
    assert_eq!(block.state().data.to_vec(), b"good");

    engine.stop();
}

#[test]
fn malformed_datagrams_are_counted() {
    let (peer, engine) = engine_with_peer("u2");
    let target = engine.local_addr().expect("local addr");
    let block = engine.core().get_recv(9);
    engine.connect();

    // 短包。
    peer.send_to(b"PS\x00", target).expect("send short");
    assert!(wait_until(Duration::from_secs(3), || {
        engine.core().unknown_count() == 1
    }));
    assert_eq!(engine.core().last_message(), "small packet");

    // 坏魔数。
    peer.send_to(&[0x58, 0x59, 0, 9, 0, 0, 0, 0], target)
        .expect("send corrupt");
    assert!(wait_until(Duration::from_secs(3), || {
        engine.core().unknown_count() == 2
    }));
    assert_eq!(engine.core().last_message(), "Corrupt packet!");

    // 声明 2000 字节的报文体装不进 1024 字节的暂存：丢弃并扩容。
    let big = frame(9, &vec![0x5au8; 2000]);
    peer.send_to(&big, target).expect("send big");
    assert!(wait_until(Duration::from_secs(3), || {
        engine.core().unknown_count() == 3
    }));
    assert_eq!(engine.core().last_message(), "truncated body");
    assert_eq!(block.count(), 0);

    // 扩容后的重发完整到达。
    peer.send_to(&big, target).expect("resend big");
    assert!(wait_until(Duration::from_secs(3), || block.count() == 1));
    assert_eq!(block.state().data.size(), 2000);

    engine.stop();
}

#[test]
fn tx_queue_is_bounded() {
    let (peer, engine) = engine_with_peer("u3");
    peer.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    engine.connect();

    let block = engine.core().get_send(3);
    for i in 0..64u8 {
        engine
            .queue_send_block(&block, &[i])
            .expect("queue within bound");
    }
    let err = engine
        .queue_send_block(&block, &[0xff])
        .expect_err("65th datagram must be rejected");
    assert_eq!(err.stable_code(), "psc.udp.tx_queue_full");
    assert!(block.queued());
    assert_eq!(block.count(), 64);

    engine.flush_send().expect("flush");
    assert!(!block.queued());

    let mut seen = 0usize;
    let mut buf = [0u8; 64];
    while seen < 64 {
        let (len, _) = peer.recv_from(&mut buf).expect("datagram");
        assert_eq!(len, 9);
        assert_eq!(&buf[..2], b"PS");
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 3);
        assert_eq!(buf[8], seen as u8);
        seen += 1;
    }

    engine.stop();
}
