use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use psc_buffer::DBuffer;
use psc_core::config::tunables;
use psc_core::wire::{FrameHeader, HEADER_LEN};
use psc_core::{Block, CoreState, EngineCore, PscError, Reactor, Result};

use crate::decoder::{FrameDecoder, FrameEvent, MIN_RX_BUFFER};

/// 重连退避间隔。
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// 写路径的共享出口：引擎锁之后获取的"套接字侧锁"。
struct TxShared {
    /// 已冲刷、待写入套接字的帧字节。
    out: Mutex<BytesMut>,
    /// 冲刷后唤醒写任务；许可语义容忍先通知后等待。
    ready: Notify,
}

/// 解码进度快照，仅供 `report` 展示。
#[derive(Debug, Default, Clone, Copy)]
struct DecodeInfo {
    have_head: bool,
    msgid: u16,
    bodylen: u32,
    expect: usize,
}

/// 会话驱动持有的全部共享件。刻意不持有 `TcpEngine` 本身，
/// 反应器销毁时不会因此连带合流反应器线程。
struct SessionCtx {
    core: Arc<EngineCore>,
    tx: Arc<TxShared>,
    shutdown: watch::Receiver<bool>,
    force: watch::Sender<u64>,
    decode_info: Arc<Mutex<DecodeInfo>>,
}

/// 一次会话结束的原因，驱动映射为状态消息。
enum Outcome {
    /// 解析或发起连接失败。
    InitFailed,
    /// 连接阶段超时。
    ConnectTimeout,
    /// 套接字错误（含写路径）。
    SockErr(io::Error),
    /// 读方向闲置超时。
    RxTimeout,
    /// 写方向闲置超时。
    TxTimeout,
    /// 对端关闭。
    Eof,
    /// 线缆字节不以 `'P','S'` 开头。
    Framing,
    /// `force_reconnect` 要求拆连接，状态消息保持原样。
    Forced,
    /// 引擎停止。
    Stopped,
}

/// 重连 TCP 引擎。
///
/// # 契约定义（What）
/// - 公开方法线程安全，内部按"引擎锁 → 套接字侧锁"的固定顺序进锁；
/// - `queue_send*` 在 `Block.queued` 已置位时报 `AlreadyQueued`，在发送
///   缓冲将超限时报 `SendOverflow`，头与体在同一临界区内一次性追加；
/// - [`TcpEngine::flush_send`] 将发送缓冲整体移交写队列，成功后清除全部
///   发送块的 `queued` 标志；
/// - 未连接时的入队与冲刷是静默空操作——连接状态由记录层经状态扫描
///   单独报警，不在数据路径上重复报错。
///
/// # 运行方式（How）
/// - [`TcpEngine::connect`] 在共享反应器上派生会话驱动：每轮解析主机名、
///   发起连接、进入读循环；任何断线原因都回到 5 秒退避后重试；
/// - 读循环每次唤醒后在引擎锁内批量推进帧解码，命中的接收 Block 打上
///   时间戳、计数加一、载荷零拷贝移交，随后同步触达订阅者并投递扫描。
pub struct TcpEngine {
    core: Arc<EngineCore>,
    reactor: Arc<Reactor>,
    tx: Arc<TxShared>,
    force: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    decode_info: Arc<Mutex<DecodeInfo>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TcpEngine {
    /// 创建引擎（不主动连接）。共享反应器不可用时构造失败。
    pub fn new(name: &str, host: &str, port: u16, timeout_mask: u32) -> Result<Arc<TcpEngine>> {
        let reactor = Reactor::shared()?;
        let core = EngineCore::new(name, host, port, timeout_mask);
        let (shutdown, _) = watch::channel(false);
        let (force, _) = watch::channel(0u64);
        Ok(Arc::new(TcpEngine {
            core,
            reactor,
            tx: Arc::new(TxShared {
                out: Mutex::new(BytesMut::new()),
                ready: Notify::new(),
            }),
            force,
            shutdown,
            stopped: AtomicBool::new(false),
            decode_info: Arc::new(Mutex::new(DecodeInfo::default())),
            driver: Mutex::new(None),
        }))
    }

    /// 引擎共享记录。
    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    /// 启动会话驱动。已启动或已停止时为空操作。
    pub fn connect(&self) {
        let mut driver = self.driver.lock();
        if driver.is_some() || self.stopped.load(Ordering::Acquire) {
            return;
        }
        let ctx = SessionCtx {
            core: Arc::clone(&self.core),
            tx: Arc::clone(&self.tx),
            shutdown: self.shutdown.subscribe(),
            force: self.force.clone(),
            decode_info: Arc::clone(&self.decode_info),
        };
        *driver = Some(self.reactor.spawn(drive(ctx)));
    }

    /// 把 `payload` 组帧后加入 `msgid` 对应发送块的队列。
    pub fn queue_send(&self, msgid: u16, payload: &[u8]) -> Result<()> {
        let block = self.core.get_send(msgid);
        self.queue_send_block(&block, payload)
    }

    /// 把 `payload` 组帧后加入指定发送块的队列。
    pub fn queue_send_block(&self, block: &Arc<Block>, payload: &[u8]) -> Result<()> {
        let mut state = self.core.lock();
        if !state.connected {
            return Ok(());
        }
        self.enqueue_locked(&mut state, block, Payload::Slice(payload))
    }

    /// 以外部缓冲为报文体入队，按分段追加、不要求连续。
    pub fn queue_send_buffer(&self, block: &Arc<Block>, body: &DBuffer) -> Result<()> {
        let mut state = self.core.lock();
        if !state.connected {
            return Ok(());
        }
        self.enqueue_locked(&mut state, block, Payload::Buffer(body))
    }

    /// 把发送块自身的当前载荷入队。块不存在时为空操作。
    pub fn send(&self, msgid: u16) -> Result<()> {
        let mut state = self.core.lock();
        if !state.connected {
            return Ok(());
        }
        let Some(block) = state.send_blocks.get(&msgid).cloned() else {
            return Ok(());
        };
        self.enqueue_locked(&mut state, &block, Payload::OwnData)
    }

    /// 帧入队的公共路径：容量检查覆盖头与体，两者在同一临界区内追加。
    fn enqueue_locked(
        &self,
        state: &mut CoreState,
        block: &Arc<Block>,
        payload: Payload<'_>,
    ) -> Result<()> {
        let mut bstate = block.state();
        if bstate.queued {
            return Err(PscError::AlreadyQueued {
                code: block.code(),
            });
        }
        let bodylen = match &payload {
            Payload::Slice(s) => s.len(),
            Payload::Buffer(d) => d.size(),
            Payload::OwnData => bstate.data.size(),
        };
        let need = HEADER_LEN + bodylen;
        let limit = tunables().max_send_buffer();
        if limit > 0 && state.sendbuf.len() + need > limit {
            return Err(PscError::SendOverflow { need, limit });
        }
        state.sendbuf.reserve(need);
        FrameHeader {
            msgid: block.code(),
            bodylen: bodylen as u32,
        }
        .encode(&mut state.sendbuf);
        match payload {
            Payload::Slice(s) => state.sendbuf.extend_from_slice(s),
            Payload::Buffer(d) => d.append_to(&mut state.sendbuf),
            Payload::OwnData => bstate.data.append_to(&mut state.sendbuf),
        }
        bstate.queued = true;
        drop(bstate);
        block.bump_count();
        if tunables().debug_at(2) {
            tracing::debug!(
                engine = self.core.name(),
                code = block.code(),
                bytes = bodylen,
                "enqueue block"
            );
        }
        Ok(())
    }

    /// 把发送缓冲整体移交套接字写队列（即实际发出）。
    ///
    /// 写队列已超限时同步失败且不移动任何字节；成功后所有发送块的
    /// `queued` 标志清零，写任务被唤醒。
    pub fn flush_send(&self) -> Result<()> {
        let mut state = self.core.lock();
        if !state.connected {
            return Ok(());
        }
        if tunables().debug_at(2) {
            tracing::debug!(engine = self.core.name(), "flush");
        }
        let limit = tunables().max_send_buffer();
        {
            let mut out = self.tx.out.lock();
            if limit > 0 && out.len() >= limit {
                return Err(PscError::SendOverflow {
                    need: state.sendbuf.len(),
                    limit,
                });
            }
            let pending = state.sendbuf.split();
            out.extend_from_slice(&pending);
        }
        for block in state.send_blocks.values() {
            block.state().queued = false;
        }
        self.tx.ready.notify_one();
        Ok(())
    }

    /// 拆掉当前连接并走正常退避重连。仅在已连接时有效。
    pub fn force_reconnect(&self) {
        if !self.core.is_connected() {
            return;
        }
        if tunables().debug_at(2) {
            tracing::debug!(engine = self.core.name(), "force reconnection");
        }
        self.force.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// 停止引擎：会话驱动退出、连接标志清除。幂等。
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        {
            let mut state = self.core.lock();
            state.connected = false;
        }
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        if tunables().debug_at(2) {
            tracing::debug!(engine = self.core.name(), "stop");
        }
    }

    /// 人类可读的状态报告。
    pub fn report(&self, level: u8) -> String {
        use std::fmt::Write as _;

        let mut out = self.core.report(level);
        if level == 0 {
            return out;
        }
        let info = *self.decode_info.lock();
        let _ = writeln!(
            out,
            " Decode   : Header:{} {} {}",
            if info.have_head { "Yes" } else { "No" },
            info.msgid,
            info.bodylen
        );
        let _ = writeln!(out, " Expecting: {} bytes", info.expect);
        if level >= 2 {
            let txlen = self.tx.out.lock().len();
            let sendlen = self.core.lock().sendbuf.len();
            let _ = writeln!(out, " Buffers  : Tx:{txlen} Queue:{sendlen}");
        }
        out
    }
}

/// 报文体的三种来源。`OwnData` 在块状态锁内读取块自身载荷。
enum Payload<'a> {
    Slice(&'a [u8]),
    Buffer(&'a DBuffer),
    OwnData,
}

/// 会话驱动主循环：连接 → 读循环 → 记录断线原因 → 退避 → 重试。
async fn drive(mut ctx: SessionCtx) {
    loop {
        if *ctx.shutdown.borrow() {
            break;
        }
        let outcome = run_session(&mut ctx).await;
        match &outcome {
            Outcome::Stopped => break,
            Outcome::Forced => {
                // 状态消息保持原样，仅摘掉连接标志。
                let mut state = ctx.core.lock();
                state.connected = false;
                drop(state);
                ctx.core.scan().post();
            }
            Outcome::InitFailed => ctx.core.mark_disconnected("Failed to initiate connection."),
            Outcome::ConnectTimeout => ctx.core.mark_disconnected("Timeout while connecting"),
            Outcome::Eof => ctx.core.mark_disconnected("Connection closed by PSC"),
            Outcome::Framing => ctx.core.mark_disconnected("Framing error!"),
            Outcome::RxTimeout => ctx.core.mark_disconnected("RX Data Timeout"),
            Outcome::TxTimeout => ctx.core.mark_disconnected("TX Data Timeout"),
            Outcome::SockErr(err) => {
                ctx.core.mark_disconnected(format!("Socket Error: {err}"))
            }
        }
        if tunables().debug_at(1) {
            tracing::info!(
                engine = ctx.core.name(),
                message = %ctx.core.last_message(),
                "session ended"
            );
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = ctx.shutdown.changed() => break,
        }
    }
}

/// 单次会话：解析、连接、读写循环；返回断线原因。
async fn run_session(ctx: &mut SessionCtx) -> Outcome {
    *ctx.decode_info.lock() = DecodeInfo {
        expect: HEADER_LEN,
        ..DecodeInfo::default()
    };
    ctx.tx.out.lock().clear();

    ctx.core.set_message("Connecting...");
    if tunables().debug_at(1) {
        tracing::info!(engine = ctx.core.name(), "connecting");
    }

    // 每次重连都重新解析主机名，目标可能换过地址。
    let host = ctx.core.host().to_owned();
    let port = ctx.core.port();
    let addrs: Vec<std::net::SocketAddr> =
        match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(iter) => iter.collect(),
            Err(err) => {
                tracing::warn!(engine = ctx.core.name(), %err, "host lookup failed");
                return Outcome::InitFailed;
            }
        };
    if addrs.is_empty() {
        return Outcome::InitFailed;
    }

    let inactivity = tunables().inactivity_time();
    let connect_all = async {
        let mut last: Option<io::Error> = None;
        for addr in &addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last = Some(err),
            }
        }
        Err(last.unwrap_or_else(|| io::Error::other("no address to try")))
    };
    let stream = if inactivity > 0 {
        match tokio::time::timeout(Duration::from_secs(inactivity as u64), connect_all).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Outcome::SockErr(err),
            Err(_) => return Outcome::ConnectTimeout,
        }
    } else {
        match connect_all.await {
            Ok(stream) => stream,
            Err(err) => return Outcome::SockErr(err),
        }
    };

    ctx.core.mark_connected();
    if tunables().debug_at(1) {
        tracing::info!(engine = ctx.core.name(), "connected");
    }

    let (rd, wr) = stream.into_split();
    let mut writer = tokio::spawn(run_writer(
        wr,
        Arc::clone(&ctx.tx),
        ctx.shutdown.clone(),
    ));
    let outcome = read_loop(ctx, rd, &mut writer).await;
    writer.abort();
    outcome
}

/// 读循环：读唤醒 → 引擎锁内批量解码 → 调整高水位。
async fn read_loop(
    ctx: &mut SessionCtx,
    mut rd: OwnedReadHalf,
    writer: &mut JoinHandle<Outcome>,
) -> Outcome {
    let mut decoder = FrameDecoder::new();
    let mut bodyblock: Option<Arc<Block>> = None;
    let mut rxbuf = BytesMut::with_capacity(MIN_RX_BUFFER);
    // 本会话期内的强制重连信号；连接建立前的请求一律不算数。
    let mut force_rx = ctx.force.subscribe();

    loop {
        let inactivity = tunables().inactivity_time();
        let read_timeout = (inactivity > 0 && ctx.core.timeout_mask() & 1 != 0)
            .then(|| Duration::from_secs(inactivity as u64));

        let read_step = async {
            match read_timeout {
                Some(limit) => tokio::time::timeout(limit, rd.read_buf(&mut rxbuf))
                    .await
                    .map_err(|_| ReadEnd::Timeout)
                    .and_then(|r| r.map_err(ReadEnd::Err)),
                None => rd.read_buf(&mut rxbuf).await.map_err(ReadEnd::Err),
            }
        };

        let got = tokio::select! {
            biased;
            _ = ctx.shutdown.changed() => return Outcome::Stopped,
            _ = force_rx.changed() => return Outcome::Forced,
            end = &mut *writer => {
                return end.unwrap_or_else(|err| {
                    Outcome::SockErr(io::Error::other(format!("writer task failed: {err}")))
                });
            }
            got = read_step => got,
        };

        match got {
            Err(ReadEnd::Timeout) => return Outcome::RxTimeout,
            Err(ReadEnd::Err(err)) => return Outcome::SockErr(err),
            Ok(0) => return Outcome::Eof,
            Ok(_) => {}
        }

        if let Err(err) = pump(ctx, &mut decoder, &mut bodyblock, &mut rxbuf) {
            debug_assert!(matches!(err, PscError::BadMagic));
            tracing::warn!(engine = ctx.core.name(), "framing error");
            return Outcome::Framing;
        }

        // 高水位：至少容得下下一阶段，小报文场景维持兆级缓冲。
        let highwater = decoder.highwater();
        if rxbuf.len() < highwater {
            rxbuf.reserve(highwater - rxbuf.len());
        }
    }
}

enum ReadEnd {
    Timeout,
    Err(io::Error),
}

/// 在引擎锁内推进解码状态机，直到输入字节不足。
fn pump(
    ctx: &SessionCtx,
    decoder: &mut FrameDecoder,
    bodyblock: &mut Option<Arc<Block>>,
    rxbuf: &mut BytesMut,
) -> Result<()> {
    let state = ctx.core.lock();
    loop {
        match decoder.step(rxbuf)? {
            None => break,
            Some(FrameEvent::Header { msgid, bodylen }) => {
                if tunables().debug_at(3) {
                    tracing::trace!(
                        engine = ctx.core.name(),
                        msgid,
                        bodylen,
                        "expect block"
                    );
                }
                match state.recv_blocks.get(&msgid) {
                    Some(block) => {
                        let block = Arc::clone(block);
                        block.state().rxtime = Some(SystemTime::now());
                        block.bump_count();
                        *bodyblock = Some(block);
                    }
                    None => {
                        ctx.core.bump_unknown();
                        *bodyblock = None;
                    }
                }
            }
            Some(FrameEvent::Body { msgid, mut payload }) => {
                if let Some(block) = bodyblock.take() {
                    {
                        let mut bstate = block.state();
                        let len = payload.len();
                        bstate.data.consume(&mut payload, len);
                    }
                    block.publish();
                } else if tunables().debug_at(3) {
                    // 合法但无人订阅的帧号，整体丢弃。
                    tracing::trace!(engine = ctx.core.name(), msgid, "ignore message");
                }
            }
        }
    }
    let (have_head, msgid, bodylen) = match decoder.mid_frame() {
        Some((msgid, bodylen)) => (true, msgid, bodylen),
        None => (false, 0, 0),
    };
    *ctx.decode_info.lock() = DecodeInfo {
        have_head,
        msgid,
        bodylen,
        expect: decoder.expect(),
    };
    Ok(())
}

/// 写任务：等待冲刷通知，把写队列整体搬到套接字上。
///
/// 写方向的闲置超时恒开启（配置大于零时）；超时或写错误都会让会话
/// 以相应原因拆除。
async fn run_writer(
    mut wr: OwnedWriteHalf,
    tx: Arc<TxShared>,
    mut shutdown: watch::Receiver<bool>,
) -> Outcome {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Outcome::Stopped,
            _ = tx.ready.notified() => {}
        }
        loop {
            let chunk = {
                let mut out = tx.out.lock();
                if out.is_empty() {
                    break;
                }
                out.split()
            };
            let inactivity = tunables().inactivity_time();
            let write_all = wr.write_all(&chunk);
            let result = if inactivity > 0 {
                match tokio::time::timeout(Duration::from_secs(inactivity as u64), write_all)
                    .await
                {
                    Ok(done) => done,
                    Err(_) => return Outcome::TxTimeout,
                }
            } else {
                write_all.await
            };
            if let Err(err) = result {
                return Outcome::SockErr(err);
            }
        }
    }
}
