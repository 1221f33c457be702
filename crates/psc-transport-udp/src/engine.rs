use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use psc_buffer::DBuffer;
use psc_core::config::tunables;
use psc_core::wire::{FrameHeader, HEADER_LEN, MAGIC};
use psc_core::{Block, EngineCore, PscError, Reactor, Result};

/// 发送队列的报文数上限。
const TX_QUEUE_LIMIT: usize = 64;
/// 发送缓冲自由链表的上限。
const TX_POOL_LIMIT: usize = 64;
/// 接收节拍：无包到达时每 5 秒醒来一次报告超时。
const RX_TICK: Duration = Duration::from_secs(5);
/// 接收暂存的初始长度，必须大于帧头。
const RX_SCRATCH_INIT: usize = 1024;

/// 发送侧状态：暂存队列、在途队列与缓冲自由链表。
///
/// `staged` 由 `queue_send*` 填充；`flush_send` 把它整体移交 `inflight`
/// 并唤醒写任务；写完的缓冲回到 `pool` 复用。
struct UdpTx {
    staged: VecDeque<Vec<u8>>,
    inflight: VecDeque<Vec<u8>>,
    pool: Vec<Vec<u8>>,
}

/// 写路径计数。
#[derive(Default)]
struct UdpStats {
    txerrs: AtomicU32,
}

/// 共享反应器上的 PSC 数据报引擎。
///
/// # 运行方式（How）
/// - 构造时解析并固定对端地址、绑定本地端口，套接字挂到共享反应器；
/// - [`UdpEngine::connect`] 启动收发两个任务并标记已连接（数据报引擎
///   没有握手，连接标志表达的是"任务已就绪"）；
/// - 接收任务以 5 秒超时节拍轮询：每次唤醒尽量排空套接字里的全部
///   报文，再统一回到等待。
pub struct UdpEngine {
    core: Arc<EngineCore>,
    reactor: Arc<Reactor>,
    sock: Arc<UdpSocket>,
    peer: SocketAddr,
    tx: Arc<Mutex<UdpTx>>,
    tx_ready: Arc<Notify>,
    stats: Arc<UdpStats>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpEngine {
    /// 创建引擎：解析一次对端地址、绑定 `iface_port`（0 为临时端口）。
    pub fn new(
        name: &str,
        host: &str,
        host_port: u16,
        iface_port: u16,
    ) -> Result<Arc<UdpEngine>> {
        let reactor = Reactor::shared()?;
        let core = EngineCore::new(name, host, host_port, 0);

        let peer = resolve_peer(host, host_port)?;
        let sock = bind_socket(iface_port).map_err(|err| PscError::io("udp bind", err))?;
        let sock = {
            // 套接字注册进共享反应器的驱动。
            let _enter = reactor.handle().enter();
            UdpSocket::from_std(sock).map_err(|err| PscError::io("udp register", err))?
        };
        tracing::info!(engine = name, %peer, "udp target address");

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(UdpEngine {
            core,
            reactor,
            sock: Arc::new(sock),
            peer,
            tx: Arc::new(Mutex::new(UdpTx {
                staged: VecDeque::new(),
                inflight: VecDeque::new(),
                pool: Vec::new(),
            })),
            tx_ready: Arc::new(Notify::new()),
            stats: Arc::new(UdpStats::default()),
            shutdown,
            stopped: AtomicBool::new(false),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// 引擎共享记录。
    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    /// 解析后的对端地址。
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// 本地绑定地址（`iface_port` 为零时为内核分配的临时端口）。
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.sock
            .local_addr()
            .map_err(|err| PscError::io("getsockname", err))
    }

    /// 启动收发任务并进入已连接状态。重复调用为空操作。
    pub fn connect(&self) {
        if self.stopped.load(Ordering::Acquire) || self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks.push(self.reactor.spawn(rx_loop(
            Arc::clone(&self.core),
            Arc::clone(&self.sock),
            self.peer,
            self.shutdown.subscribe(),
        )));
        tasks.push(self.reactor.spawn(tx_loop(
            self.core.name().to_owned(),
            Arc::clone(&self.sock),
            self.peer,
            Arc::clone(&self.tx),
            Arc::clone(&self.tx_ready),
            Arc::clone(&self.stats),
            self.shutdown.subscribe(),
        )));
        drop(tasks);
        self.core.mark_connected();
    }

    /// 把 `payload` 组帧后暂存到 `msgid` 对应的发送块。
    pub fn queue_send(&self, msgid: u16, payload: &[u8]) -> Result<()> {
        let block = self.core.get_send(msgid);
        self.queue_send_block(&block, payload)
    }

    /// 把 `payload` 组帧后暂存。队列满时同步失败。
    pub fn queue_send_block(&self, block: &Arc<Block>, payload: &[u8]) -> Result<()> {
        let state = self.core.lock();
        if !state.connected {
            return Ok(());
        }
        self.stage_locked(block, |buf| buf.extend_from_slice(payload), payload.len())
    }

    /// 以外部缓冲为报文体入队。
    pub fn queue_send_buffer(&self, block: &Arc<Block>, body: &DBuffer) -> Result<()> {
        let state = self.core.lock();
        if !state.connected {
            return Ok(());
        }
        self.stage_locked(
            block,
            |buf| {
                for stride in body.strides() {
                    buf.extend_from_slice(stride);
                }
            },
            body.size(),
        )
    }

    /// 把发送块自身的当前载荷入队。块不存在时为空操作。
    pub fn send(&self, msgid: u16) -> Result<()> {
        let state = self.core.lock();
        if !state.connected {
            return Ok(());
        }
        let Some(block) = state.send_blocks.get(&msgid).cloned() else {
            return Ok(());
        };
        let body = block.state().data.to_vec();
        self.stage_locked(&block, |buf| buf.extend_from_slice(&body), body.len())
    }

    /// 暂存一帧：复用自由链表里的缓冲，组帧后压入 `staged`。
    fn stage_locked(
        &self,
        block: &Arc<Block>,
        fill: impl FnOnce(&mut Vec<u8>),
        bodylen: usize,
    ) -> Result<()> {
        let mut tx = self.tx.lock();
        if tx.staged.len() + tx.inflight.len() >= TX_QUEUE_LIMIT {
            return Err(PscError::TxQueueFull {
                limit: TX_QUEUE_LIMIT,
            });
        }
        let mut buf = tx.pool.pop().unwrap_or_default();
        buf.clear();
        buf.reserve(HEADER_LEN + bodylen);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&block.code().to_be_bytes());
        buf.extend_from_slice(&(bodylen as u32).to_be_bytes());
        fill(&mut buf);
        tx.staged.push_back(buf);
        drop(tx);

        block.state().queued = true;
        block.bump_count();
        if tunables().debug_at(2) {
            tracing::debug!(
                engine = self.core.name(),
                code = block.code(),
                bytes = bodylen,
                "enqueue datagram"
            );
        }
        Ok(())
    }

    /// 把暂存报文移交在途队列并唤醒写任务，随后清除发送块的 `queued`。
    pub fn flush_send(&self) -> Result<()> {
        let state = self.core.lock();
        if !state.connected {
            return Ok(());
        }
        {
            let mut tx = self.tx.lock();
            while let Some(pkt) = tx.staged.pop_front() {
                tx.inflight.push_back(pkt);
            }
        }
        for block in state.send_blocks.values() {
            block.state().queued = false;
        }
        self.tx_ready.notify_one();
        Ok(())
    }

    /// 数据报引擎没有可拆的连接；保留能力集中的空操作。
    pub fn force_reconnect(&self) {}

    /// 停止引擎：收发任务退出、连接标志清除。幂等。
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        {
            let mut state = self.core.lock();
            state.connected = false;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// 人类可读的状态报告。
    pub fn report(&self, level: u8) -> String {
        use std::fmt::Write as _;

        let mut out = self.core.report(level);
        if level == 0 {
            return out;
        }
        let (staged, inflight, pooled) = {
            let tx = self.tx.lock();
            (tx.staged.len(), tx.inflight.len(), tx.pool.len())
        };
        let _ = writeln!(
            out,
            " TX queue : staged:{staged} inflight:{inflight} pool:{pooled} errors:{}",
            self.stats.txerrs.load(Ordering::Relaxed)
        );
        out
    }
}

/// 解析一次对端地址，只接受 IPv4（套接字为 AF_INET）。
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

/// 建立非阻塞数据报套接字并绑定本地端口。
fn bind_socket(iface_port: u16) -> io::Result<std::net::UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.set_nonblocking(true)?;
    let bind_at = SocketAddr::from((Ipv4Addr::UNSPECIFIED, iface_port));
    sock.bind(&bind_at.into())?;
    Ok(sock.into())
}

/// 接收循环：5 秒节拍，超时与错误都走状态扫描。
async fn rx_loop(
    core: Arc<EngineCore>,
    sock: Arc<UdpSocket>,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut scratch = vec![0u8; RX_SCRATCH_INIT];
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            r = tokio::time::timeout(RX_TICK, sock.recv_from(&mut scratch)) => r,
        };
        match received {
            Err(_) => {
                // 节拍超时：记录层借状态扫描观察链路静默。
                core.set_message("Rx timeout");
                continue;
            }
            Ok(Err(err)) => {
                core.set_message(format!("Rx socket error: {err}"));
                continue;
            }
            Ok(Ok((len, src))) => {
                handle_datagram(&core, peer, &mut scratch, len, src);
            }
        }
        // 排空一次唤醒里积压的其余报文。
        loop {
            match sock.try_recv_from(&mut scratch) {
                Ok((len, src)) => handle_datagram(&core, peer, &mut scratch, len, src),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    core.set_message(format!("Rx socket error: {err}"));
                    break;
                }
            }
        }
    }
}

/// 单个数据报的校验与入块。
fn handle_datagram(
    core: &Arc<EngineCore>,
    peer: SocketAddr,
    scratch: &mut Vec<u8>,
    len: usize,
    src: SocketAddr,
) {
    if src != peer {
        core.bump_unknown();
        if tunables().debug_at(4) {
            tracing::trace!(engine = core.name(), %src, "ignore datagram from stranger");
        }
        return;
    }
    if len < HEADER_LEN {
        core.bump_unknown();
        core.set_message("small packet");
        return;
    }
    let head = match FrameHeader::parse(&scratch[..len]) {
        Ok(head) => head,
        Err(_) => {
            core.bump_unknown();
            core.set_message("Corrupt packet!");
            tracing::warn!(engine = core.name(), "corrupt datagram header");
            return;
        }
    };
    let bodylen = head.bodylen as usize;
    if bodylen > scratch.len() - HEADER_LEN {
        // 声明的报文体装不下：这帧已经被截断，只能扩容暂存接住下一帧。
        core.bump_unknown();
        core.set_message("truncated body");
        scratch.resize(bodylen + HEADER_LEN, 0);
        if tunables().debug_at(3) {
            tracing::debug!(
                engine = core.name(),
                scratch = scratch.len(),
                "truncated body, scratch resized"
            );
        }
        return;
    }

    let state = core.lock();
    match state.recv_blocks.get(&head.msgid) {
        Some(block) => {
            let block = Arc::clone(block);
            {
                let mut bstate = block.state();
                bstate.rxtime = Some(SystemTime::now());
                bstate
                    .data
                    .assign(&scratch[HEADER_LEN..HEADER_LEN + bodylen]);
            }
            block.bump_count();
            block.publish();
        }
        None => {
            core.bump_unknown();
            if tunables().debug_at(3) {
                tracing::trace!(engine = core.name(), msgid = head.msgid, "ignore message");
            }
        }
    }
}

/// 写循环：冲刷唤醒后把在途报文逐个送出，缓冲回自由链表。
async fn tx_loop(
    name: String,
    sock: Arc<UdpSocket>,
    peer: SocketAddr,
    tx: Arc<Mutex<UdpTx>>,
    ready: Arc<Notify>,
    stats: Arc<UdpStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = ready.notified() => {}
        }
        loop {
            let Some(pkt) = tx.lock().inflight.pop_front() else {
                break;
            };
            match sock.send_to(&pkt, peer).await {
                Ok(written) if written != pkt.len() => {
                    stats.txerrs.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        engine = name.as_str(),
                        written,
                        expected = pkt.len(),
                        "partial datagram send"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    stats.txerrs.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(engine = name.as_str(), %err, "datagram send failed");
                }
            }
            let mut tx = tx.lock();
            if tx.pool.len() < TX_POOL_LIMIT {
                tx.pool.push(pkt);
            }
        }
    }
}
