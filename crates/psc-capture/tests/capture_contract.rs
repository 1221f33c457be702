//! `capture_contract` 集成测试：采集流水线的端到端行为。
//!
//! # 覆盖点（How）
//! - `journal_round_trip`：N 个报文落盘后逐条解析回来，与发送序一致；
//! - `blocks_and_snapshot_ring`：Block 更新、短缓冲装填上界、类型化
//!   快照读取与清空归还；
//! - `invalid_packets_feed_nignore`：坏魔数与声明比实际还短的长度记账；
//!   声明超过报文体缓冲的帧必须照常接收，不得混入 `nignore`。
//!
//! 吞吐旋钮在构造前压到测试量级（速率 1000 pkt/s），自由链表只有
//! 两千个 1 KiB 缓冲，避免测试进程吃掉数百 MB 预分配。

use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use psc_capture::{CaptureEngine, JournalReader};
use psc_core::config::tunables;
use psc_core::wire::JOURNAL_HEADER_LEN;

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
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// 把全局吞吐旋钮压到测试量级（幂等，各测试设同一组值）。
fn tame_tunables() {
    let t = tunables();
    t.set_udp_max_packet_rate(1_000);
    t.set_udp_buffer_period_ms(1_000);
    t.set_udp_max_packet_size(1024);
}

fn engine_with_sender(name: &str) -> (UdpSocket, Arc<CaptureEngine>) {
    tame_tunables();
    let sender = UdpSocket::bind("127.0.0.1:0").expect("bind sender");
    let sender_port = sender.local_addr().unwrap().port();
    let engine = CaptureEngine::new(name, "127.0.0.1", sender_port, 0).expect("engine");
    (sender, engine)
}

#[test]
fn journal_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (sender, engine) = engine_with_sender("cap1");
    let target = engine.local_addr();

    engine.set_filedir(dir.path().to_str().unwrap());
    engine.set_filebase("t");
    engine.set_record(true);
    engine.connect().expect("connect");

    let sent: Vec<(u16, Vec<u8>)> = (0..5u16)
        .map(|i| (100 + i, format!("payload-{i}").into_bytes()))
        .collect();
    let expect_bytes: usize = sent
        .iter()
        .map(|(_, body)| JOURNAL_HEADER_LEN + body.len())
        .sum();
    for (msgid, body) in &sent {
        sender.send_to(&frame(*msgid, body), target).expect("send");
        // 分批次投喂，顺带覆盖多次批量收包。
        thread::sleep(Duration::from_millis(30));
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            engine.counters().storewrote >= expect_bytes
        }),
        "journal should absorb all packets, counters: {:?}",
        engine.counters()
    );
    let file = engine.last_file();
    assert!(!file.is_empty());
    engine.stop();

    // 文件内容必须逐条解析回发送序，且没有半条记录。
    let reader = JournalReader::new(std::fs::File::open(&file).expect("reopen journal"));
    let mut replay = Vec::new();
    for record in reader {
        let record = record.expect("intact record");
        assert!(record.sec > 0);
        replay.push((record.msgid, record.body));
    }
    assert_eq!(replay, sent);
}

#[test]
fn blocks_and_snapshot_ring() {
    let (sender, engine) = engine_with_sender("cap2");
    let target = engine.local_addr();
    let block = engine.core().get_recv(300);
    engine.set_short_limit(3);
    engine.connect().expect("connect");

    // 每帧带一个大端 u32 与一个紧凑 s24。
    for i in 0..5u32 {
        let mut body = Vec::new();
        body.extend_from_slice(&(1000 + i).to_be_bytes());
        body.extend_from_slice(&[0xff, 0xfe, i as u8]);
        sender.send_to(&frame(300, &body), target).expect("send");
        thread::sleep(Duration::from_millis(30));
    }

    assert!(wait_until(Duration::from_secs(5), || block.count() == 5));
    assert_eq!(engine.counters().rxcnt, 5);
    assert!(block.rxtime().is_some());

    // 短缓冲装填不超过上限。
    assert!(wait_until(Duration::from_secs(2), || {
        engine.report(2).contains("short 3/3")
    }));

    // 典型快照读取：u32 在偏移 0，s24 在偏移 4。
    let mut vals = [0u32; 3];
    assert_eq!(engine.snapshot_u32_be(300, 0, 0, &mut vals), 3);
    assert_eq!(vals[0], 1000);
    let mut s24 = [0i32; 3];
    assert_eq!(engine.snapshot_i24_be(300, 4, 0, &mut s24), 3);
    // 0xfffe00+i 按 24 位补码是负数。
    assert!(s24[0] < 0);

    // 目的区比短缓冲大：读取不满并请求放大下一轮容量。
    let mut want_more = [0u32; 8];
    assert_eq!(engine.snapshot_u32_be(300, 0, 0, &mut want_more), 3);
    assert_eq!(engine.short_limit(), 8);

    // 清空把缓冲归还自由链表。
    assert_eq!(engine.snapshot_clear(), 3);
    assert_eq!(engine.snapshot_u32_be(300, 0, 0, &mut vals), 0);

    engine.stop();
}

#[test]
fn invalid_packets_feed_nignore() {
    let (sender, engine) = engine_with_sender("cap3");
    let target = engine.local_addr();
    let oversized = engine.core().get_recv(6);
    engine.connect().expect("connect");

    // 坏魔数。
    sender
        .send_to(&[0x58, 0x59, 0, 1, 0, 0, 0, 0], target)
        .expect("send corrupt");
    // 声明长度比实际少：8 字节报文体只声明 2 字节。
    let mut lying = frame(5, &[0u8; 8]);
    lying[4..8].copy_from_slice(&2u32.to_be_bytes());
    sender.send_to(&lying, target).expect("send lying");
    // 合法帧仍然照常入账。
    sender.send_to(&frame(5, b"ok"), target).expect("send good");

    assert!(wait_until(Duration::from_secs(5), || {
        engine.counters().nignore == 2
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        engine.counters().rxcnt == 3
    }));
    // 未注册的帧号走 ukncount。
    assert!(wait_until(Duration::from_secs(5), || {
        engine.core().unknown_count() == 1
    }));

    // 声明 5000 字节、实际只带 16 字节：超出 1024 字节的报文体缓冲，
    // 但四项拒收标准都不命中，必须照常进块而不是混入 nignore。
    let mut huge = frame(6, &[0x5au8; 16]);
    huge[4..8].copy_from_slice(&5000u32.to_be_bytes());
    sender.send_to(&huge, target).expect("send oversized");

    assert!(wait_until(Duration::from_secs(5), || oversized.count() == 1));
    assert_eq!(engine.counters().nignore, 2);
    assert_eq!(engine.counters().rxcnt, 4);
    // 入块的载荷按缓冲实际持有的字节钳制。
    assert_eq!(oversized.state().data.size(), 1024);

    engine.stop();
}
