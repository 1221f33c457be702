use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// 订阅者携带的不透明上下文。
pub type ListenerCtx = Arc<dyn Any + Send + Sync>;

/// 以 `(函数, 上下文)` 为键的回调注册表。
///
/// # 角色定位（Why）
/// - Block 更新与连接后处理都通过它把事件同步派发给进程内的订阅者；
/// - 订阅者属于记录层，质量不受本驱动控制，因此单个订阅者的 panic
///   必须被隔离：记录日志后继续触达其余订阅者，不得拖垮更新线程。
///
/// # 契约定义（What）
/// - `add`/`del` 以函数指针相等加 `Arc` 指针相等做身份匹配，重复注册
///   合法且各自独立触达；
/// - `invoke` 按插入顺序遍历注册表的一次性快照——遍历期间的增删
///   只影响下一次触达；
/// - 回调在调用方线程上同步执行，期间不得重入引擎、不得阻塞。
pub struct CbList<T: ?Sized> {
    entries: Vec<(fn(&ListenerCtx, &T), ListenerCtx)>,
}

impl<T: ?Sized> Clone for CbList<T> {
    fn clone(&self) -> Self {
        CbList {
            entries: self.entries.clone(),
        }
    }
}

impl<T: ?Sized> Default for CbList<T> {
    fn default() -> Self {
        CbList {
            entries: Vec::new(),
        }
    }
}

impl<T: ?Sized> CbList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个订阅者。
    pub fn add(&mut self, func: fn(&ListenerCtx, &T), ctx: ListenerCtx) {
        self.entries.push((func, ctx));
    }

    /// 删除首个身份匹配的订阅者；不存在则静默。
    pub fn del(&mut self, func: fn(&ListenerCtx, &T), ctx: &ListenerCtx) {
        if let Some(at) = self
            .entries
            .iter()
            .position(|(f, c)| std::ptr::fn_addr_eq(*f, func) && Arc::ptr_eq(c, ctx))
        {
            self.entries.remove(at);
        }
    }

    /// 按插入顺序同步触达全部订阅者，panic 被逐个隔离。
    ///
    /// `owner` 仅用于日志定位（通常是引擎名）。
    pub fn invoke(&self, owner: &str, arg: &T) {
        let snapshot: Vec<_> = self.entries.clone();
        for (func, ctx) in snapshot {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| func(&ctx, arg))) {
                tracing::error!(
                    owner,
                    reason = panic_label(&payload),
                    "listener panicked; continuing with remaining listeners"
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 从 panic 载荷中提取可读文本。
pub(crate) fn panic_label(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
