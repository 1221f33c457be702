use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex, MutexGuard};
use socket2::{Domain, Protocol, Socket, Type};

use psc_buffer::{DBuffer, PacketPool};
use psc_core::config::tunables;
use psc_core::wire::{FrameHeader, HEADER_LEN};
use psc_core::{Block, EngineCore, PscError, Result, ScanToken};

use crate::batch::{recv_batch, RecvSlot};
use crate::journal::Journal;
use crate::pkt::Pkt;

/// 收包超时后发往对端的重订阅探针（10 字节含 NUL）。
/// 对不认识它的服务器无害——现有目标从不读取客户端字节。
const SUBSCRIBE_PROBE: &[u8] = b"SUBSCRIBE\0";

/// 未见于用户态的链路开销估计：以太网 14+2、IPv4 20、UDP 8。
const WIRE_OVERHEAD: usize = 16 + 20 + 8;

/// 接收锁保护的共享体：自由链表与待处理队列同属一个临界区。
struct RxShared {
    vpool: PacketPool,
    pending: Vec<Pkt>,
}

/// 快照锁保护的短缓冲。
struct ShortShared {
    buf: Vec<Pkt>,
    limit: usize,
}

/// 日志控制面：记录开关、轮转请求与文件名状态。
#[derive(Default)]
struct JournalCtl {
    record: bool,
    reopen: bool,
    filedir: String,
    filebase: String,
    lastfile: String,
    lasterror: String,
}

#[derive(Default)]
struct Counters {
    rxcnt: AtomicUsize,
    ntimeout: AtomicUsize,
    ndrops: AtomicUsize,
    nignore: AtomicUsize,
    noom: AtomicUsize,
    netrx: AtomicUsize,
    storewrote: AtomicUsize,
    lastsize: AtomicUsize,
}

/// 计数器快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureCounters {
    /// 批量收包取回的报文总数（含未通过校验者）。
    pub rxcnt: usize,
    /// 1 秒收包超时的次数。
    pub ntimeout: usize,
    /// 内核报告的溢出丢包（`SO_RXQ_OVFL` 差值累计）。
    pub ndrops: usize,
    /// 来源、长度或魔数校验失败而丢弃的报文数。
    pub nignore: usize,
    /// 自由链表耗尽导致 RX 线程停摆的次数。
    pub noom: usize,
    /// 含链路层开销估计的累计接收字节。
    pub netrx: usize,
    /// 累计写入数据文件的字节。
    pub storewrote: usize,
    /// 当前数据文件的字节数。
    pub lastsize: usize,
}

/// 高速率 UDP 采集引擎。
///
/// # 结构（How）
/// - 专职 RX 线程对阻塞套接字执行 `recvmmsg` 批量收包（`SO_RCVTIMEO`
///   1 秒兜底），校验通过的报文连同捐出的缓冲压入 `pending`；
/// - 专职 CACHE 线程换出整个 `pending`：更新 Block、按需写数据文件并
///   轮转、装填短缓冲，最后把缓冲归还自由链表；
/// - `rxLock`（自由链表 + 待处理队列）与 `shortLock`（短缓冲）都是
///   叶锁，持有期间不得再取引擎锁。
///
/// # 背压（What）
/// - 自由链表按 `ceil(2 × 最大速率 × 缓冲周期)` 预分配；耗尽时 RX 线程
///   计一次 `noom` 并阻塞在 `vpoolStall` 上，直到 CACHE 线程归还缓冲；
/// - 内核侧丢包只记账（`ndrops`），不重试。
pub struct CaptureEngine {
    core: Arc<EngineCore>,
    sock: std::net::UdpSocket,
    peer: SocketAddr,
    local: SocketAddr,
    running: AtomicBool,
    batch_size: usize,
    vpool_total: usize,
    iov_limit: usize,
    rx: Mutex<RxShared>,
    vpool_stall: Condvar,
    pending_ready: Condvar,
    short: Mutex<ShortShared>,
    short_full: ScanToken,
    ctl: Mutex<JournalCtl>,
    counters: Counters,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl CaptureEngine {
    /// 建立套接字、预分配自由链表。吞吐参数在构造时各读取一次。
    pub fn new(
        name: &str,
        host: &str,
        host_port: u16,
        bind_port: u16,
    ) -> Result<Arc<CaptureEngine>> {
        let t = tunables();
        let core = EngineCore::new(name, host, host_port, 0);

        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|err| PscError::io("udp socket", err))?;
        // 活性节拍：无包时每秒醒一次，顺带触发重订阅探针。
        sock.set_read_timeout(Some(Duration::from_secs(1)))
            .map_err(|err| PscError::io("SO_RCVTIMEO", err))?;
        if let Err(err) = set_sockopt_i32(sock.as_raw_fd(), libc::SO_PRIORITY, 6) {
            tracing::warn!(engine = name, %err, "unable to set SO_PRIORITY");
        }
        if let Err(err) = set_sockopt_i32(sock.as_raw_fd(), libc::SO_RXQ_OVFL, 1) {
            tracing::warn!(engine = name, %err, "unable to set SO_RXQ_OVFL");
        }
        let want_buf = t.udp_set_sock_buf();
        if want_buf > 0
            && let Err(err) = sock.set_recv_buffer_size(want_buf)
        {
            tracing::warn!(engine = name, want_buf, %err, "unable to set SO_RCVBUF");
        }
        let rcvbuf = sock
            .recv_buffer_size()
            .map_err(|err| PscError::io("SO_RCVBUF", err))?;
        if rcvbuf == 0 {
            return Err(PscError::io(
                "SO_RCVBUF",
                io::Error::other("zero RX buffer length not valid"),
            ));
        }

        let peer = resolve_peer(host, host_port)?;
        let bind_at = SocketAddr::from((Ipv4Addr::UNSPECIFIED, bind_port));
        sock.bind(&bind_at.into())
            .map_err(|err| PscError::io("udp bind", err))?;
        let local = sock
            .local_addr()
            .map_err(|err| PscError::io("getsockname", err))?
            .as_socket()
            .ok_or_else(|| PscError::io("getsockname", io::Error::other("not an inet socket")))?;

        let max_packet = t.udp_max_packet_size();
        let iov_limit = iov_max();
        // 一次 recvmmsg 最多只能取出套接字缓冲里装得下的量。
        let batch_size = (rcvbuf / max_packet).clamp(1, iov_limit);
        // 预分配两个缓冲周期的量：一份在积累、一份在冲刷。
        let rate = t.udp_max_packet_rate() as u64;
        let period_ms = t.udp_buffer_period_ms() as u64;
        let vpool_total = ((2 * rate * period_ms).div_ceil(1000)).max(1) as usize;

        tracing::info!(
            engine = name,
            rcvbuf,
            batch_size,
            vpool_total,
            max_packet,
            %peer,
            "capture engine ready"
        );

        let mut pending = Vec::new();
        pending.reserve(vpool_total);

        Ok(Arc::new(CaptureEngine {
            core,
            sock: sock.into(),
            peer,
            local,
            running: AtomicBool::new(true),
            batch_size,
            vpool_total,
            iov_limit,
            rx: Mutex::new(RxShared {
                vpool: PacketPool::with_capacity(vpool_total, max_packet),
                pending,
            }),
            vpool_stall: Condvar::new(),
            pending_ready: Condvar::new(),
            short: Mutex::new(ShortShared {
                buf: Vec::new(),
                limit: 0,
            }),
            short_full: ScanToken::new(),
            ctl: Mutex::new(JournalCtl {
                reopen: true,
                ..JournalCtl::default()
            }),
            counters: Counters::default(),
            workers: Mutex::new(Vec::new()),
        }))
    }

    /// 引擎共享记录。
    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    /// 本地绑定地址（`bind_port` 为零时为内核分配的临时端口）。
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// 短缓冲填满时投递的扫描令牌。
    pub fn short_full_scan(&self) -> &ScanToken {
        &self.short_full
    }

    /// 启动两个工作线程并进入已连接状态。重复调用为空操作。
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() || !self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let rx_me = Arc::clone(self);
        workers.push(
            thread::Builder::new()
                .name("udpfrx".to_owned())
                .spawn(move || rx_me.rx_worker())
                .map_err(|err| PscError::io("spawn rx worker", err))?,
        );
        let cache_me = Arc::clone(self);
        workers.push(
            thread::Builder::new()
                .name("udpfc".to_owned())
                .spawn(move || cache_me.cache_worker())
                .map_err(|err| PscError::io("spawn cache worker", err))?,
        );
        drop(workers);
        self.core.mark_connected();
        Ok(())
    }

    /// 停止采集：两个工作线程退出并被合流。幂等。
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.core.lock();
            state.connected = false;
        }
        // 自发一个零长报文，打断阻塞中的批量收包。
        let wake = SocketAddr::from((Ipv4Addr::LOCALHOST, self.local.port()));
        if let Err(err) = self.sock.send_to(&[], wake) {
            tracing::error!(engine = self.core.name(), %err, "error waking rx worker");
        }
        self.vpool_stall.notify_all();
        self.pending_ready.notify_all();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }

    /// 采集引擎只收不发：能力集中的发送操作全部为空操作。
    pub fn queue_send(&self, _msgid: u16, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    pub fn queue_send_block(&self, _block: &Arc<Block>, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    pub fn queue_send_buffer(&self, _block: &Arc<Block>, _body: &DBuffer) -> Result<()> {
        Ok(())
    }

    pub fn send(&self, _msgid: u16) -> Result<()> {
        Ok(())
    }

    pub fn flush_send(&self) -> Result<()> {
        Ok(())
    }

    pub fn force_reconnect(&self) {}

    /// 计数器快照。
    pub fn counters(&self) -> CaptureCounters {
        CaptureCounters {
            rxcnt: self.counters.rxcnt.load(Ordering::Relaxed),
            ntimeout: self.counters.ntimeout.load(Ordering::Relaxed),
            ndrops: self.counters.ndrops.load(Ordering::Relaxed),
            nignore: self.counters.nignore.load(Ordering::Relaxed),
            noom: self.counters.noom.load(Ordering::Relaxed),
            netrx: self.counters.netrx.load(Ordering::Relaxed),
            storewrote: self.counters.storewrote.load(Ordering::Relaxed),
            lastsize: self.counters.lastsize.load(Ordering::Relaxed),
        }
    }

    /// 打开/关闭记录。关闭后当前文件由 CACHE 线程在下个批次收口。
    pub fn set_record(&self, on: bool) {
        self.ctl.lock().record = on;
    }

    pub fn recording(&self) -> bool {
        self.ctl.lock().record
    }

    /// 设置数据文件目录；下次写入换新文件。
    pub fn set_filedir(&self, dir: &str) {
        let mut ctl = self.ctl.lock();
        ctl.filedir = dir.to_owned();
        ctl.reopen = true;
    }

    /// 设置文件名前缀；下次写入换新文件。
    pub fn set_filebase(&self, base: &str) {
        let mut ctl = self.ctl.lock();
        ctl.filebase = base.to_owned();
        ctl.reopen = true;
    }

    /// 主动要求轮转。
    pub fn request_reopen(&self) {
        self.ctl.lock().reopen = true;
    }

    /// 最近打开的数据文件名。
    pub fn last_file(&self) -> String {
        self.ctl.lock().lastfile.clone()
    }

    /// 最近一次日志错误的描述。
    pub fn last_error(&self) -> String {
        self.ctl.lock().lasterror.clone()
    }

    /// 短缓冲容量。
    pub fn short_limit(&self) -> usize {
        self.short.lock().limit
    }

    pub fn set_short_limit(&self, limit: usize) {
        self.short.lock().limit = limit;
    }

    /// 原子换出短缓冲并把缓冲归还自由链表，返回清掉的报文数。
    pub fn snapshot_clear(&self) -> usize {
        let drained = {
            let mut short = self.short.lock();
            std::mem::take(&mut short.buf)
        };
        let count = drained.len();
        if count == 0 {
            return 0;
        }
        let mut rx = self.rx.lock();
        let was_starved = rx.vpool.is_empty();
        for pkt in drained {
            if !pkt.body.is_empty() {
                rx.vpool.put(pkt.body);
            }
        }
        if was_starved && !rx.vpool.is_empty() {
            self.vpool_stall.notify_one();
        }
        count
    }

    /// 从短缓冲里读大端 u32 字段。
    ///
    /// 对每个 `msgid` 匹配的报文，从 `offset` 起按 `step` 间隔取值
    /// （`step == 0` 表示每报文一个值），直到填满 `dst` 或报文体耗尽。
    /// `dst` 未填满说明短缓冲容量不足，下一轮容量自动放大。
    pub fn snapshot_u32_be(
        &self,
        msgid: u16,
        offset: usize,
        step: usize,
        dst: &mut [u32],
    ) -> usize {
        self.snapshot_read(msgid, offset, step, 4, dst, |raw| {
            u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
        })
    }

    /// 从短缓冲里读紧凑的大端带符号 24 位字段（常用 `step == 3`）。
    pub fn snapshot_i24_be(
        &self,
        msgid: u16,
        offset: usize,
        step: usize,
        dst: &mut [i32],
    ) -> usize {
        self.snapshot_read(msgid, offset, step, 3, dst, |raw| {
            // 放进高三字节再算术右移，符号位自然扩展。
            ((raw[0] as i32) << 24 | (raw[1] as i32) << 16 | (raw[2] as i32) << 8) >> 8
        })
    }

    fn snapshot_read<T>(
        &self,
        msgid: u16,
        offset: usize,
        step: usize,
        width: usize,
        dst: &mut [T],
        decode: impl Fn(&[u8]) -> T,
    ) -> usize {
        let mut short = self.short.lock();
        let mut filled = 0usize;
        let mut matched = 0usize;
        for pkt in short.buf.iter().filter(|p| p.msgid == msgid) {
            matched += 1;
            let payload = pkt.payload();
            let mut at = offset;
            while filled < dst.len() && at + width <= payload.len() {
                dst[filled] = decode(&payload[at..at + width]);
                filled += 1;
                if step == 0 {
                    break;
                }
                at += step;
            }
            if filled == dst.len() {
                break;
            }
        }
        if filled < dst.len() {
            // 短缓冲不够读满目的区：按观测到的每报文产出估算下一轮容量。
            let per_pkt = if matched > 0 {
                (filled / matched).max(1)
            } else {
                1
            };
            let needed = dst.len().div_ceil(per_pkt);
            if needed > short.limit {
                if tunables().debug_at(2) {
                    tracing::debug!(
                        engine = self.core.name(),
                        from = short.limit,
                        to = needed,
                        "short buffer grow requested"
                    );
                }
                short.limit = needed;
            }
        }
        filled
    }

    /// 人类可读的状态报告。
    pub fn report(&self, level: u8) -> String {
        use std::fmt::Write as _;

        let mut out = self.core.report(level);
        if level == 0 {
            return out;
        }
        let c = self.counters();
        let _ = writeln!(
            out,
            " Capture  : rx:{} timeout:{} drops:{} ignore:{} oom:{}",
            c.rxcnt, c.ntimeout, c.ndrops, c.nignore, c.noom
        );
        let _ = writeln!(
            out,
            " Store    : wrote:{} lastsize:{} lastfile:\"{}\"",
            c.storewrote,
            c.lastsize,
            self.last_file()
        );
        let (vfree, vtotal, npending) = {
            let rx = self.rx.lock();
            let snap = rx.vpool.snapshot();
            (snap.free, snap.total, rx.pending.len())
        };
        let _ = writeln!(out, " vpool#={vfree}/{vtotal} pending#={npending}");
        let (slen, slimit) = {
            let short = self.short.lock();
            (short.buf.len(), short.limit)
        };
        let _ = writeln!(out, " short {slen}/{slimit}");
        out
    }

    /// RX 线程主体：指派缓冲 → 批量收包 → 校验入队。
    fn rx_worker(self: Arc<Self>) {
        let t = tunables();
        if t.debug_at(2) {
            tracing::debug!(engine = self.core.name(), "rx worker starts");
        }
        let fd = self.sock.as_raw_fd();
        let mut prev_overflow = 0u32;
        let mut slots: Vec<RecvSlot> = (0..self.batch_size).map(|_| RecvSlot::new()).collect();
        let mut notify_cache = false;

        let mut rx = self.rx.lock();
        while self.running.load(Ordering::Acquire) {
            if rx.vpool.is_empty() {
                self.counters.noom.fetch_add(1, Ordering::Relaxed);
                if t.debug_at(1) {
                    tracing::warn!(engine = self.core.name(), "vpool stall");
                }
                // 先确保 CACHE 线程醒来归还缓冲，再停摆等待。
                MutexGuard::unlocked(&mut rx, || self.pending_ready.notify_one());
                self.vpool_stall.wait(&mut rx);
                continue;
            }

            // 指派缓冲；上一轮未被消费的槽位直接复用。
            let mut nassign = 0usize;
            for slot in slots.iter_mut() {
                if slot.is_assigned() {
                    nassign += 1;
                    continue;
                }
                match rx.vpool.take() {
                    Some(body) => {
                        slot.attach(body);
                        nassign += 1;
                    }
                    None => break,
                }
            }
            if nassign < slots.len() && t.debug_at(2) {
                tracing::debug!(
                    engine = self.core.name(),
                    nassign,
                    batch = slots.len(),
                    "insufficient buffers for full batch"
                );
            }

            let nrx = MutexGuard::unlocked(&mut rx, || {
                if notify_cache {
                    if t.debug_at(4) {
                        tracing::trace!(engine = self.core.name(), "notify cache worker");
                    }
                    self.pending_ready.notify_one();
                    notify_cache = false;
                }
                if nassign == 0 {
                    return 0;
                }
                match recv_batch(fd, &mut slots[..nassign]) {
                    Ok(got) => got,
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) =>
                    {
                        self.counters.ntimeout.fetch_add(1, Ordering::Relaxed);
                        if t.debug_at(2) {
                            tracing::debug!(engine = self.core.name(), "recvmmsg timeout");
                        }
                        if let Err(perr) = self.sock.send_to(SUBSCRIBE_PROBE, self.peer) {
                            tracing::warn!(engine = self.core.name(), %perr, "subscribe probe failed");
                        }
                        0
                    }
                    Err(err) => {
                        tracing::error!(engine = self.core.name(), %err, "recvmmsg failed");
                        0
                    }
                }
            });

            // 同一批次的报文共享一个接收时间戳。
            let rxtime = SystemTime::now();
            self.counters.rxcnt.fetch_add(nrx, Ordering::Relaxed);

            let mut net_total = 0usize;
            for slot in slots.iter_mut().take(nrx) {
                if slot.ctrl_truncated() && t.debug_at(1) {
                    tracing::warn!(engine = self.core.name(), "control message truncated");
                }
                // 丢包计数独立于报文有效性。
                if let Some(reported) = slot.overflow() {
                    let delta = drop_delta(&mut prev_overflow, reported);
                    if delta > 0 {
                        self.counters
                            .ndrops
                            .fetch_add(delta as usize, Ordering::Relaxed);
                        if t.debug_at(1) {
                            tracing::warn!(
                                engine = self.core.name(),
                                lost = delta,
                                "socket buffer overflow"
                            );
                        }
                    }
                }
                let Some((msgid, bodylen)) = validate_slot(slot, self.peer) else {
                    self.counters.nignore.fetch_add(1, Ordering::Relaxed);
                    continue;
                };
                if t.debug_at(3) {
                    tracing::trace!(engine = self.core.name(), msgid, bodylen, "recv'd block");
                }
                net_total += slot.len + WIRE_OVERHEAD;
                // 每个突发只通知一次，等锁释放后再发避免来回弹跳。
                notify_cache |= rx.pending.is_empty();
                rx.pending.push(Pkt {
                    msgid,
                    bodylen,
                    rxtime,
                    body: slot.detach(),
                });
            }
            self.counters.netrx.fetch_add(net_total, Ordering::Relaxed);
        }
        drop(rx);
        if t.debug_at(2) {
            tracing::debug!(engine = self.core.name(), "rx worker ends");
        }
    }

    /// CACHE 线程主体：换出批次 → Block 更新 → 日志 → 短缓冲 → 归还。
    fn cache_worker(self: Arc<Self>) {
        let t = tunables();
        if t.debug_at(2) {
            tracing::debug!(engine = self.core.name(), "cache worker starts");
        }
        let mut inprog: Vec<Pkt> = Vec::with_capacity(self.vpool_total);
        let mut journal = Journal::new();

        loop {
            // 归还上一批消费掉的缓冲，必要时解除 RX 停摆。
            {
                let mut rx = self.rx.lock();
                let was_starved = rx.vpool.is_empty();
                for pkt in inprog.drain(..) {
                    if !pkt.body.is_empty() {
                        rx.vpool.put(pkt.body);
                    }
                }
                if was_starved && !rx.vpool.is_empty() {
                    if t.debug_at(1) {
                        tracing::info!(engine = self.core.name(), "vpool stall resume");
                    }
                    self.vpool_stall.notify_one();
                }
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            let now;
            {
                let mut rx = self.rx.lock();
                while rx.pending.is_empty() && self.running.load(Ordering::Acquire) {
                    self.pending_ready.wait(&mut rx);
                }
                now = SystemTime::now();
                std::mem::swap(&mut inprog, &mut rx.pending);
            }
            if t.debug_at(5) {
                tracing::trace!(engine = self.core.name(), batch = inprog.len(), "consuming");
            }

            if !self.recording() && journal.is_open() {
                journal.close();
                if t.debug_at(1) {
                    tracing::info!(
                        engine = self.core.name(),
                        file = %self.last_file(),
                        "journal closed"
                    );
                }
            }

            // Block 更新在引擎锁内完成，订阅者在同一临界区被触达。
            {
                let state = self.core.lock();
                for pkt in &inprog {
                    match state.recv_blocks.get(&pkt.msgid) {
                        Some(block) => {
                            let block = Arc::clone(block);
                            {
                                let mut bstate = block.state();
                                bstate.rxtime = Some(pkt.rxtime);
                                bstate.data.assign(pkt.payload());
                            }
                            block.bump_count();
                            block.publish();
                        }
                        None => {
                            self.core.bump_unknown();
                        }
                    }
                }
            }
            if inprog.is_empty() {
                continue;
            }

            if journal.should_rotate(t.udp_max_len_mb()) {
                self.ctl.lock().reopen = true;
                if t.debug_at(2) {
                    tracing::debug!(
                        engine = self.core.name(),
                        size = journal.written(),
                        "rotate data file for size"
                    );
                }
            }

            let open_request = {
                let mut ctl = self.ctl.lock();
                if ctl.record && ctl.reopen && !ctl.filebase.is_empty() {
                    ctl.reopen = false;
                    Some((ctl.filedir.clone(), ctl.filebase.clone()))
                } else {
                    None
                }
            };
            if let Some((dir, base)) = open_request {
                match journal.open_new(&dir, &base, now) {
                    Ok(name) => {
                        if t.debug_at(1) {
                            tracing::info!(engine = self.core.name(), file = name.as_str(), "journal opened");
                        }
                        self.ctl.lock().lastfile = name;
                    }
                    Err(err) => {
                        tracing::error!(engine = self.core.name(), %err, "journal open failed");
                        let mut ctl = self.ctl.lock();
                        ctl.record = false;
                        ctl.lasterror = failure_text(&err);
                    }
                }
            }

            if journal.is_open() {
                match journal.write_packets(&inprog, self.iov_limit) {
                    Ok(total) => {
                        self.counters
                            .storewrote
                            .fetch_add(total as usize, Ordering::Relaxed);
                        self.counters
                            .lastsize
                            .store(journal.written() as usize, Ordering::Relaxed);
                        if let Err(err) = journal.maybe_sync(t.udp_dsync_size_mb()) {
                            tracing::error!(engine = self.core.name(), %err, "fdatasync failed");
                            self.ctl.lock().lasterror = failure_text(&err);
                        }
                    }
                    Err(err) => {
                        tracing::error!(engine = self.core.name(), %err, "journal write failed");
                        journal.close();
                        let mut ctl = self.ctl.lock();
                        ctl.record = false;
                        ctl.lasterror = failure_text(&err);
                    }
                }
            }

            // 日志先于短缓冲：被移走的报文体已经完成落盘。
            let short_filled = {
                let mut short = self.short.lock();
                let room = short.limit.saturating_sub(short.buf.len());
                let nmove = room.min(inprog.len());
                for pkt in inprog.iter_mut().take(nmove) {
                    short.buf.push(pkt.take());
                }
                nmove > 0 && short.buf.len() >= short.limit
            };
            if short_filled {
                self.short_full.post();
            }
        }
        if t.debug_at(2) {
            tracing::debug!(engine = self.core.name(), "cache worker ends");
        }
    }
}

/// 校验一个收包槽位；不合格返回 `None`（调用方计 `nignore`）。
///
/// 拒收仅限四种情形：来源不符、不足一个帧头、魔数不符、声明长度比
/// 实际收到的还短。声明长度超过报文体缓冲的帧照常接收，落盘与入块
/// 时按缓冲内实际持有的字节取用。
fn validate_slot(slot: &RecvSlot, peer: SocketAddr) -> Option<(u16, u32)> {
    if slot.src_addr() != Some(peer) {
        return None;
    }
    if slot.len < HEADER_LEN {
        return None;
    }
    let head = FrameHeader::parse(&slot.head).ok()?;
    let got_body = slot.len - HEADER_LEN;
    // 声明长度比实际收到的还短：报文自相矛盾。
    if (head.bodylen as usize) < got_body {
        return None;
    }
    Some((head.msgid, head.bodylen))
}

/// `SO_RXQ_OVFL` 的绝对计数换算为增量；内核消息按发生顺序抵达。
fn drop_delta(prev: &mut u32, reported: u32) -> u32 {
    if reported == *prev {
        return 0;
    }
    let delta = reported.wrapping_sub(*prev);
    *prev = reported;
    delta
}

fn failure_text(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(code) => format!("({code}) {err}"),
        None => err.to_string(),
    }
}

fn set_sockopt_i32(fd: std::os::fd::RawFd, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            (&raw const value).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn iov_max() -> usize {
    let lim = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
    if lim > 0 { lim as usize } else { 16 }
}

/// 解析一次对端地址，只接受 IPv4（采集套接字为 AF_INET）。
fn resolve_peer(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs = (host, port).to_socket_addrs().map_err(|_| PscError::Resolve {
        host: host.to_owned(),
        port,
    })?;
    for addr in addrs {
        if addr.is_ipv4() {
            return Ok(addr);
        }
    }
    Err(PscError::Resolve {
        host: host.to_owned(),
        port,
    })
}
