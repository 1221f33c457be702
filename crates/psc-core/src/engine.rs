use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Mutex, MutexGuard};

use crate::block::Block;
use crate::scan::ScanToken;
use crate::subscriber::{CbList, ListenerCtx};

/// 引擎互斥锁保护的可变状态。
///
/// 锁序约定：引擎锁在前、套接字侧锁在后；反应器回调按同一顺序重新获取。
pub struct CoreState {
    /// 当前是否处于已连接状态。
    pub connected: bool,
    /// 最近一条人类可读的状态消息。
    pub message: String,
    /// 发送方向的 Block 映射，按帧号索引。
    pub send_blocks: BTreeMap<u16, Arc<Block>>,
    /// 接收方向的 Block 映射，按帧号索引。
    pub recv_blocks: BTreeMap<u16, Arc<Block>>,
    /// 待冲刷的已组帧字节（TCP 引擎的发送队列）。
    pub sendbuf: BytesMut,
    /// 每次成功进入已连接状态后要同步处理的回调列表。
    pub on_connect: CbList<EngineCore>,
}

/// 引擎共享记录：三种引擎变体内嵌的公共状态。
///
/// # 角色定位（Why）
/// - TCP、UDP 与高速率采集引擎共享同一套身份、Block 映射、连接标志与
///   计数器；把它们收拢在一个记录里，引擎变体只需补充自己的套接字侧
///   状态。
///
/// # 并发契约（What）
/// - 可变状态集中在 [`CoreState`]，由单把引擎锁保护；
/// - `ukncount`/`conncount` 为原子量，`report` 等只读路径无须抢锁；
/// - 状态扫描令牌（[`EngineCore::scan`]）在连接状态或消息变化后投递，
///   供记录层刷新报警。
pub struct EngineCore {
    name: String,
    host: String,
    port: u16,
    mask: u32,
    state: Mutex<CoreState>,
    scan: ScanToken,
    ukncount: AtomicU32,
    conncount: AtomicU32,
}

impl EngineCore {
    /// 建立一个尚未连接的引擎记录，初始消息为 `"Initialize"`。
    pub fn new(name: &str, host: &str, port: u16, timeout_mask: u32) -> Arc<EngineCore> {
        Arc::new(EngineCore {
            name: name.to_owned(),
            host: host.to_owned(),
            port,
            mask: timeout_mask,
            state: Mutex::new(CoreState {
                connected: false,
                message: "Initialize".to_owned(),
                send_blocks: BTreeMap::new(),
                recv_blocks: BTreeMap::new(),
                sendbuf: BytesMut::new(),
                on_connect: CbList::new(),
            }),
            scan: ScanToken::new(),
            ukncount: AtomicU32::new(0),
            conncount: AtomicU32::new(0),
        })
    }

    /// 进程内唯一的引擎名。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 对端主机名或地址字面量。
    pub fn host(&self) -> &str {
        &self.host
    }

    /// 对端端口。
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 超时掩码：bit0 置位时读方向也应用闲置超时。
    pub fn timeout_mask(&self) -> u32 {
        self.mask
    }

    /// 获取引擎锁。
    pub fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock()
    }

    /// 引擎状态扫描令牌。
    pub fn scan(&self) -> &ScanToken {
        &self.scan
    }

    /// 当前连接状态。
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// 最近一条状态消息的拷贝。
    pub fn last_message(&self) -> String {
        self.state.lock().message.clone()
    }

    /// 未命中接收映射的帧计数。
    pub fn unknown_count(&self) -> u32 {
        self.ukncount.load(Ordering::Relaxed)
    }

    /// 未知帧计数加一。
    pub fn bump_unknown(&self) -> u32 {
        self.ukncount.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 成功建立连接的次数。
    pub fn conn_count(&self) -> u32 {
        self.conncount.load(Ordering::Relaxed)
    }

    /// 连接计数加一。
    pub fn bump_conn(&self) -> u32 {
        self.conncount.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 取（或惰性创建）发送方向的 Block。
    pub fn get_send(self: &Arc<Self>, code: u16) -> Arc<Block> {
        let mut state = self.state.lock();
        state
            .send_blocks
            .entry(code)
            .or_insert_with(|| Block::new(self, code))
            .clone()
    }

    /// 取（或惰性创建）接收方向的 Block。
    pub fn get_recv(self: &Arc<Self>, code: u16) -> Arc<Block> {
        let mut state = self.state.lock();
        state
            .recv_blocks
            .entry(code)
            .or_insert_with(|| Block::new(self, code))
            .clone()
    }

    /// 仅查找接收 Block，不创建。
    pub fn find_recv(&self, code: u16) -> Option<Arc<Block>> {
        self.state.lock().recv_blocks.get(&code).cloned()
    }

    /// 仅查找发送 Block，不创建。
    pub fn find_send(&self, code: u16) -> Option<Arc<Block>> {
        self.state.lock().send_blocks.get(&code).cloned()
    }

    /// 注册连接后处理回调；列表常驻，每次成功连接都会重放。
    pub fn add_on_connect(&self, func: fn(&ListenerCtx, &EngineCore), ctx: ListenerCtx) {
        self.state.lock().on_connect.add(func, ctx);
    }

    /// 更新状态消息并投递状态扫描。
    pub fn set_message(&self, message: impl Into<String>) {
        {
            let mut state = self.state.lock();
            state.message = message.into();
        }
        self.scan.post();
    }

    /// 进入已连接状态：置标志、记消息、连接计数加一、投递状态扫描，
    /// 最后在锁外同步重放连接后处理列表。
    pub fn mark_connected(self: &Arc<Self>) {
        let on_connect = {
            let mut state = self.state.lock();
            state.connected = true;
            state.message = "Connected".to_owned();
            state.on_connect.clone()
        };
        self.bump_conn();
        self.scan.post();
        on_connect.invoke(&self.name, self);
    }

    /// 离开已连接状态并记录原因。
    pub fn mark_disconnected(&self, message: impl Into<String>) {
        {
            let mut state = self.state.lock();
            state.connected = false;
            state.message = message.into();
        }
        self.scan.post();
    }

    /// 人类可读的状态报告。`level >= 2` 时包含每个 Block 的明细。
    pub fn report(&self, level: u8) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "PSC {} : {}:{}", self.name, self.host, self.port);
        if level == 0 {
            return out;
        }
        let state = self.state.lock();
        let _ = writeln!(
            out,
            " Connected: {}",
            if state.connected { "Yes" } else { "No" }
        );
        let _ = writeln!(out, " Conn Cnt : {}", self.conn_count());
        let _ = writeln!(out, " Unkn Cnt : {}", self.unknown_count());
        let _ = writeln!(out, " Last msg : {}", state.message);
        if level >= 2 {
            let _ = writeln!(out, " Send blocks");
            for block in state.send_blocks.values() {
                report_block(&mut out, block);
            }
            let _ = writeln!(out, " Recv blocks");
            for block in state.recv_blocks.values() {
                report_block(&mut out, block);
            }
        }
        out
    }
}

fn report_block(out: &mut String, block: &Arc<Block>) {
    let state = block.state();
    let _ = writeln!(out, " Block {}", block.code());
    let _ = writeln!(
        out,
        "  Queued : {}",
        if state.queued { "Yes" } else { "No" }
    );
    let _ = writeln!(
        out,
        "  IOCount: {}  Size: {}",
        block.count(),
        state.data.size()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as A;

    #[test]
    fn blocks_are_created_lazily_and_cached() {
        let engine = EngineCore::new("lazy", "h", 1, 0);
        let first = engine.get_recv(42);
        let second = engine.get_recv(42);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(engine.find_recv(42).is_some());
        assert!(engine.find_recv(43).is_none());
        // 发送与接收映射互不相通。
        assert!(engine.find_send(42).is_none());
    }

    #[test]
    fn mark_connected_replays_on_connect_list_every_time() {
        fn tick(ctx: &ListenerCtx, _engine: &EngineCore) {
            ctx.downcast_ref::<A>().unwrap().fetch_add(1, Ordering::Relaxed);
        }

        let engine = EngineCore::new("replay", "h", 1, 0);
        let hits: ListenerCtx = Arc::new(A::new(0));
        engine.add_on_connect(tick, hits.clone());

        engine.mark_connected();
        engine.mark_disconnected("Connection closed by PSC");
        engine.mark_connected();

        assert_eq!(engine.conn_count(), 2);
        assert_eq!(engine.last_message(), "Connected");
        let hits = hits.downcast_ref::<A>().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn report_levels_expand_detail() {
        let engine = EngineCore::new("rep", "example.org", 4000, 0);
        engine.get_send(1);
        engine.get_recv(2);
        let brief = engine.report(0);
        assert!(brief.contains("rep"));
        assert!(!brief.contains("Connected:"));
        let full = engine.report(2);
        assert!(full.contains("Send blocks"));
        assert!(full.contains("Block 2"));
    }
}
