//! UDP 突发发包器：给采集引擎做带载联调。
//!
//! 以固定速率向目标地址发送 PSC 帧，报文体为可辨识的计数序列，便于在
//! 接收端核对丢包与顺序。
//!
//! 用法：`udpblast <目标地址> [msgid=500] [包数=10000] [速率 pkt/s=1000] [体长=64]`

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use psc_core::wire::FrameHeader;

fn main() -> std::io::Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(target) = args.next() else {
        eprintln!("usage: udpblast <host:port> [msgid] [count] [pps] [bodylen]");
        std::process::exit(2);
    };
    let msgid: u16 = args.next().and_then(|v| v.parse().ok()).unwrap_or(500);
    let count: u64 = args.next().and_then(|v| v.parse().ok()).unwrap_or(10_000);
    let pps: u64 = args.next().and_then(|v| v.parse().ok()).unwrap_or(1_000).max(1);
    let bodylen: usize = args.next().and_then(|v| v.parse().ok()).unwrap_or(64).max(4);

    let sock = UdpSocket::bind("0.0.0.0:0")?;
    sock.connect(&target)?;
    println!(
        "blasting {count} frames of msgid {msgid} ({bodylen} B body) to {target} at {pps} pkt/s"
    );

    let interval = Duration::from_nanos(1_000_000_000 / pps);
    let started = Instant::now();
    let mut frame = BytesMut::with_capacity(8 + bodylen);
    for seq in 0..count {
        frame.clear();
        FrameHeader {
            msgid,
            bodylen: bodylen as u32,
        }
        .encode(&mut frame);
        // 报文体首 4 字节是大端序号，其余按序号低字节填充。
        frame.extend_from_slice(&(seq as u32).to_be_bytes());
        frame.resize(8 + bodylen, seq as u8);
        sock.send(&frame)?;

        let due = started + interval * ((seq + 1).min(u32::MAX as u64) as u32);
        if let Some(wait) = due.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
    }
    let elapsed = started.elapsed().as_secs_f64();
    println!(
        "done: {count} frames in {elapsed:.2}s ({:.0} pkt/s effective)",
        count as f64 / elapsed.max(f64::EPSILON)
    );
    Ok(())
}
