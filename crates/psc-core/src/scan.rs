use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::subscriber::ListenerCtx;

/// 扫描优先级层数。投递位集中第 `p` 位对应层级 `p`。
pub const SCAN_LEVELS: u8 = 3;

/// 扫描消费者回调：收到一次更新通知与对应的完成回执。
pub type ScanFn = fn(&ListenerCtx, ScanDone);

/// 完成回执的接收方。Block 实现它来驱动扫描节流。
pub trait ScanSink: Send + Sync {
    /// 层级 `level` 上的全部消费者均已完成本次扫描。
    fn scan_complete(&self, level: u8);
}

#[derive(Clone)]
struct Consumer {
    level: u8,
    func: ScanFn,
    ctx: ListenerCtx,
}

/// 更新通知令牌：外部扫描器按优先级订阅，更新方投递。
///
/// # 角色定位（Why）
/// - 记录层的扫描线程希望在 Block 更新后被唤醒重读数据；令牌把"谁在听、
///   在哪个优先级听"从更新路径中隔离出来；
/// - 每个层级的完成回执聚合后回送给投递方（见 [`ScanSink`]），供
///   Block 做突发合并。
///
/// # 契约定义（What）
/// - `post` 同步触达每个消费者，返回本次触达的层级位集；
/// - 同一层级有多个消费者时，该层的完成回执在**最后一个**消费者完成后
///   才送达；
/// - 消费者可以把 [`ScanDone`] 带到别的线程稍后完成；遗忘的回执在
///   `Drop` 时自动补上，保证位集最终清零。
pub struct ScanToken {
    consumers: Mutex<Vec<Consumer>>,
}

impl Default for ScanToken {
    fn default() -> Self {
        ScanToken {
            consumers: Mutex::new(Vec::new()),
        }
    }
}

impl ScanToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在层级 `level`（0 起）注册一个消费者。
    ///
    /// 越界层级被钳制到最高层。
    pub fn subscribe(&self, level: u8, func: ScanFn, ctx: ListenerCtx) {
        let level = level.min(SCAN_LEVELS - 1);
        self.consumers.lock().push(Consumer { level, func, ctx });
    }

    /// 注销首个身份匹配的消费者。
    pub fn unsubscribe(&self, level: u8, func: ScanFn, ctx: &ListenerCtx) {
        let level = level.min(SCAN_LEVELS - 1);
        let mut consumers = self.consumers.lock();
        if let Some(at) = consumers.iter().position(|c| {
            c.level == level && std::ptr::fn_addr_eq(c.func, func) && Arc::ptr_eq(&c.ctx, ctx)
        }) {
            consumers.remove(at);
        }
    }

    /// 生成一次待投递的快照。
    ///
    /// 调用方先以 [`PendingScan::mask`] 设置忙碌位，再 [`PendingScan::fire`]
    /// 触达消费者——两步拆开是为了让完成回执永远不会先于忙碌位到达。
    pub fn prepare(&self, sink: Option<Arc<dyn ScanSink>>) -> PendingScan {
        PendingScan {
            consumers: self.consumers.lock().clone(),
            sink,
        }
    }

    /// 无节流的直接投递，返回触达的层级位集。
    pub fn post(&self) -> u8 {
        self.prepare(None).fire()
    }

    /// 当前注册的消费者数量。
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }
}

/// 一次已快照、尚未触达的投递。
pub struct PendingScan {
    consumers: Vec<Consumer>,
    sink: Option<Arc<dyn ScanSink>>,
}

impl PendingScan {
    /// 本次投递将触达的层级位集。
    pub fn mask(&self) -> u8 {
        let mut mask = 0u8;
        for c in &self.consumers {
            mask |= 1 << c.level;
        }
        mask
    }

    /// 同步触达全部消费者；单个消费者的 panic 被隔离（回执仍会送出）。
    pub fn fire(self) -> u8 {
        let mask = self.mask();
        for level in 0..SCAN_LEVELS {
            let at: Vec<&Consumer> = self
                .consumers
                .iter()
                .filter(|c| c.level == level)
                .collect();
            if at.is_empty() {
                continue;
            }
            let shared = Arc::new(LevelDone {
                sink: self.sink.clone(),
                level,
                remaining: AtomicUsize::new(at.len()),
            });
            for c in at {
                let done = ScanDone {
                    shared: Some(Arc::clone(&shared)),
                };
                if let Err(payload) =
                    panic::catch_unwind(AssertUnwindSafe(|| (c.func)(&c.ctx, done)))
                {
                    // done 已随栈回卷被释放，完成计数不缺位。
                    tracing::error!(
                        level,
                        reason = crate::subscriber::panic_label(&payload),
                        "scan consumer panicked"
                    );
                }
            }
        }
        mask
    }
}

struct LevelDone {
    sink: Option<Arc<dyn ScanSink>>,
    level: u8,
    remaining: AtomicUsize,
}

/// 一次扫描的完成回执。
///
/// 消费者处理完毕后调用 [`ScanDone::done`]；直接丢弃等价于完成。
pub struct ScanDone {
    shared: Option<Arc<LevelDone>>,
}

impl ScanDone {
    /// 本回执所属的层级。
    pub fn level(&self) -> u8 {
        self.shared.as_ref().map(|s| s.level).unwrap_or(0)
    }

    /// 显式完成。
    pub fn done(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(shared) = self.shared.take()
            && shared.remaining.fetch_sub(1, Ordering::AcqRel) == 1
            && let Some(sink) = &shared.sink
        {
            sink.scan_complete(shared.level);
        }
    }
}

impl Drop for ScanDone {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;

    struct Recorder {
        completions: PMutex<Vec<u8>>,
    }

    impl ScanSink for Recorder {
        fn scan_complete(&self, level: u8) {
            self.completions.lock().push(level);
        }
    }

    fn complete_now(_ctx: &ListenerCtx, done: ScanDone) {
        done.done();
    }

    fn park(ctx: &ListenerCtx, done: ScanDone) {
        let slot = ctx
            .downcast_ref::<PMutex<Vec<ScanDone>>>()
            .expect("ctx type");
        slot.lock().push(done);
    }

    #[test]
    fn post_reports_levels_with_consumers() {
        let token = ScanToken::new();
        token.subscribe(0, complete_now, Arc::new(()));
        token.subscribe(2, complete_now, Arc::new(()));
        assert_eq!(token.post(), 0b101);
    }

    #[test]
    fn level_completion_waits_for_last_consumer() {
        let token = ScanToken::new();
        let parked: Arc<PMutex<Vec<ScanDone>>> = Arc::new(PMutex::new(Vec::new()));
        token.subscribe(1, park, parked.clone());
        token.subscribe(1, park, parked.clone());

        let sink = Arc::new(Recorder {
            completions: PMutex::new(Vec::new()),
        });
        let pending = token.prepare(Some(sink.clone()));
        assert_eq!(pending.mask(), 0b010);
        pending.fire();

        let mut held: Vec<ScanDone> = std::mem::take(&mut *parked.lock());
        assert_eq!(held.len(), 2);
        held.pop().unwrap().done();
        assert!(sink.completions.lock().is_empty());
        held.pop().unwrap().done();
        assert_eq!(&*sink.completions.lock(), &[1]);
    }

    #[test]
    fn dropped_receipt_counts_as_completion() {
        let token = ScanToken::new();
        token.subscribe(0, complete_now, Arc::new(()));
        let sink = Arc::new(Recorder {
            completions: PMutex::new(Vec::new()),
        });
        token.prepare(Some(sink.clone())).fire();
        assert_eq!(&*sink.completions.lock(), &[0]);
    }
}
