use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard};
use psc_buffer::DBuffer;

use crate::engine::EngineCore;
use crate::scan::{ScanSink, ScanToken};
use crate::subscriber::{CbList, ListenerCtx};

/// Block 的载荷侧状态，由块级互斥锁保护。
#[derive(Default)]
pub struct BlockState {
    /// 最近一帧的载荷字节。
    pub data: DBuffer,
    /// 发送块是否已暂存在引擎发送缓冲中；冲刷成功后清除。
    pub queued: bool,
    /// 接收时间戳；同一批次内的全部报文取同一时刻。
    pub rxtime: Option<SystemTime>,
}

/// 扫描节流状态：忙碌位集 + 合并标志。
#[derive(Default)]
struct Throttle {
    busy: u8,
    queued: bool,
}

/// 具名帧槽位：一个 `msgid` 对应的最新载荷与它的订阅关系。
///
/// # 角色定位（Why）
/// - 收包路径把解出的载荷写进 Block，随后同步触达订阅者并投递扫描令牌；
///   记录层据此重读字段。Block 是协议引擎与记录层之间唯一的数据交汇点。
///
/// # 并发契约（What）
/// - 载荷状态（`data`/`queued`/`rxtime`）由块级互斥锁保护，通过
///   [`Block::state`] 获取守卫访问；
/// - `count` 为单调原子计数：接收块每收一帧加一，发送块每次成功入队加一；
/// - 订阅者回调在更新线程上同步执行，收到 `&Block` 后可读取计数与载荷，
///   但**不得重入引擎、不得阻塞**。
///
/// # 扫描节流（How）
/// - [`Block::request_scan`]：空闲时把本次投递触达的层级记入忙碌位集并
///   触达消费者；忙碌期间的请求只置一个合并标志并累计溢出计数；
/// - 每个层级的完成回执清除对应位；位集清零且存在合并请求时自动补投
///   一次，把任意长度的突发坍缩为至多一次待决扫描。
pub struct Block {
    code: u16,
    engine: Weak<EngineCore>,
    engine_name: Arc<str>,
    weak_self: Weak<Block>,
    state: Mutex<BlockState>,
    count: AtomicU32,
    listeners: Mutex<CbList<Block>>,
    scan: ScanToken,
    throttle: Mutex<Throttle>,
    scan_count: AtomicU32,
    scan_oflow: AtomicU32,
}

impl Block {
    /// 由所属引擎创建；`engine` 为非拥有型回引。
    pub(crate) fn new(engine: &Arc<EngineCore>, code: u16) -> Arc<Block> {
        let engine_name: Arc<str> = Arc::from(engine.name());
        Arc::new_cyclic(|weak_self| Block {
            code,
            engine: Arc::downgrade(engine),
            engine_name,
            weak_self: weak_self.clone(),
            state: Mutex::new(BlockState::default()),
            count: AtomicU32::new(0),
            listeners: Mutex::new(CbList::new()),
            scan: ScanToken::new(),
            throttle: Mutex::new(Throttle::default()),
            scan_count: AtomicU32::new(0),
            scan_oflow: AtomicU32::new(0),
        })
    }

    /// 16 位帧号，构造后不变。
    pub fn code(&self) -> u16 {
        self.code
    }

    /// 所属引擎；引擎销毁后返回 `None`。
    pub fn engine(&self) -> Option<Arc<EngineCore>> {
        self.engine.upgrade()
    }

    /// 所属引擎名（日志定位用）。
    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    /// 锁定载荷状态。
    pub fn state(&self) -> MutexGuard<'_, BlockState> {
        self.state.lock()
    }

    /// 单调计数的当前值。
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// 计数加一，返回新值。
    pub fn bump_count(&self) -> u32 {
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 最近一次接收时间戳。
    pub fn rxtime(&self) -> Option<SystemTime> {
        self.state.lock().rxtime
    }

    /// 发送块当前是否暂存于发送缓冲。
    pub fn queued(&self) -> bool {
        self.state.lock().queued
    }

    /// 注册订阅者。
    pub fn add_listener(&self, func: fn(&ListenerCtx, &Block), ctx: ListenerCtx) {
        self.listeners.lock().add(func, ctx);
    }

    /// 注销订阅者。
    pub fn del_listener(&self, func: fn(&ListenerCtx, &Block), ctx: &ListenerCtx) {
        self.listeners.lock().del(func, ctx);
    }

    /// 扫描令牌；外部扫描器按优先级订阅。
    pub fn scan(&self) -> &ScanToken {
        &self.scan
    }

    /// 成功投递的扫描次数。
    pub fn scan_count(&self) -> u32 {
        self.scan_count.load(Ordering::Relaxed)
    }

    /// 因忙碌而被合并的请求次数。
    pub fn scan_overflow(&self) -> u32 {
        self.scan_oflow.load(Ordering::Relaxed)
    }

    /// 一次更新的对外发布：先同步触达订阅者，再投递扫描令牌。
    pub fn publish(self: &Arc<Self>) {
        // 先克隆快照再触达，订阅者在回调内增删订阅不会与列表锁互锁。
        let snapshot = self.listeners.lock().clone();
        snapshot.invoke(&self.engine_name, self);
        self.request_scan();
    }

    /// 投递一次扫描请求，突发期间自动合并。
    pub fn request_scan(self: &Arc<Self>) {
        let pending = {
            let mut throttle = self.throttle.lock();
            if throttle.busy != 0 {
                throttle.queued = true;
                self.scan_oflow.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                let sink: Arc<dyn ScanSink> = Arc::clone(self) as Arc<dyn ScanSink>;
                let pending = self.scan.prepare(Some(sink));
                // 先置忙再触达，完成回执不可能跑在忙碌位之前。
                throttle.busy = pending.mask();
                Some(pending)
            }
        };
        if let Some(pending) = pending {
            self.scan_count.fetch_add(1, Ordering::Relaxed);
            pending.fire();
        }
    }
}

impl ScanSink for Block {
    fn scan_complete(&self, level: u8) {
        let requeue = {
            let mut throttle = self.throttle.lock();
            throttle.busy &= !(1u8 << level);
            if throttle.busy == 0 && throttle.queued {
                throttle.queued = false;
                true
            } else {
                false
            }
        };
        if requeue && let Some(me) = self.weak_self.upgrade() {
            me.request_scan();
        }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Block")
            .field("code", &self.code)
            .field("size", &state.data.size())
            .field("queued", &state.queued)
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanDone;
    use parking_lot::Mutex as PMutex;

    fn test_block() -> Arc<Block> {
        let engine = EngineCore::new("blk-test", "localhost", 7, 0);
        engine.get_recv(1)
    }

    fn park(ctx: &ListenerCtx, done: ScanDone) {
        let slot = ctx
            .downcast_ref::<PMutex<Vec<ScanDone>>>()
            .expect("ctx type");
        slot.lock().push(done);
    }

    #[test]
    fn burst_requests_collapse_into_one_pending_scan() {
        let block = test_block();
        let parked: Arc<PMutex<Vec<ScanDone>>> = Arc::new(PMutex::new(Vec::new()));
        block.scan().subscribe(0, park, parked.clone());

        block.request_scan();
        assert_eq!(block.scan_count(), 1);

        // 扫描尚未完成，继续请求只会累计合并。
        block.request_scan();
        block.request_scan();
        assert_eq!(block.scan_count(), 1);
        assert_eq!(block.scan_overflow(), 2);

        // 完成首次扫描：合并的请求自动补投一次。补投会重新触达消费者，
        // 因此先把回执整体移出、释放列表锁，再逐个完成。
        let held: Vec<ScanDone> = std::mem::take(&mut *parked.lock());
        held.into_iter().for_each(ScanDone::done);
        assert_eq!(block.scan_count(), 2);

        // 补投的扫描完成后回到空闲。
        let held: Vec<ScanDone> = std::mem::take(&mut *parked.lock());
        held.into_iter().for_each(ScanDone::done);
        assert_eq!(block.scan_count(), 2);
    }

    #[test]
    fn request_scan_without_consumers_stays_idle() {
        let block = test_block();
        block.request_scan();
        block.request_scan();
        // 没有消费者时位集为零，不会卡在忙碌状态。
        assert_eq!(block.scan_count(), 2);
        assert_eq!(block.scan_overflow(), 0);
    }

    #[test]
    fn listeners_observe_payload_and_count() {
        use std::sync::atomic::AtomicU32 as A;

        fn observe(ctx: &ListenerCtx, block: &Block) {
            let seen = ctx.downcast_ref::<A>().unwrap();
            let state = block.state();
            seen.store(state.data.size() as u32 + block.count(), Ordering::Relaxed);
        }

        let block = test_block();
        let seen: ListenerCtx = Arc::new(A::new(0));
        block.add_listener(observe, seen.clone());

        {
            let mut state = block.state();
            state.data.assign(b"abcd");
        }
        block.bump_count();
        block.publish();

        let seen = seen.downcast_ref::<A>().unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 5);
    }
}
