use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{PscError, Result};

/// 保活周期：足够长到不构成负载，又保证循环永远持有至少一个定时事件。
const KEEPALIVE: Duration = Duration::from_secs(10_000);

static SHARED: Mutex<Weak<Reactor>> = Mutex::new(Weak::new());

/// 进程共享的事件循环宿主。
///
/// # 角色定位（Why）
/// - 所有 TCP/UDP 引擎的套接字与定时器都挂在同一个长驻反应器线程上，
///   避免每个引擎自带线程；高速率采集引擎例外，自带两个专用工作线程。
/// - 通过弱引用单例共享：首个使用者惰性创建，最后一个使用者释放后
///   线程随之退出；下一次需要时再重建。
///
/// # 契约定义（What）
/// - [`Reactor::shared`] 返回当前共享实例（必要时新建）；底层运行时
///   创建失败按资源耗尽处理，错误向上传递给引擎构造方；
/// - [`Reactor::spawn`] 可从任意线程调用；
/// - 循环运行期间持有一个约 10 000 秒的保活定时器，防止空事件集让
///   循环观察到"无事可做"而提前返回。
///
/// # 实现方式（How）
/// - 单线程 tokio 运行时由专用 OS 线程 `block_on` 驱动；退出通过
///   [`Notify`] 投递（许可语义保证先发后等也能命中），`Drop` 时合流
///   工作线程。
pub struct Reactor {
    handle: Handle,
    shutdown: Arc<Notify>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Reactor {
    /// 取得共享实例；不存在时创建。
    pub fn shared() -> Result<Arc<Reactor>> {
        let mut slot = SHARED.lock();
        if let Some(existing) = slot.upgrade() {
            return Ok(existing);
        }
        let fresh = Reactor::start()?;
        *slot = Arc::downgrade(&fresh);
        Ok(fresh)
    }

    fn start() -> Result<Arc<Reactor>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| PscError::Reactor(err.to_string()))?;
        let handle = runtime.handle().clone();
        let shutdown = Arc::new(Notify::new());
        let exit = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name("psc-reactor".to_owned())
            .spawn(move || {
                tracing::debug!("reactor loop start");
                runtime.block_on(async move {
                    let mut keepalive = tokio::time::interval(KEEPALIVE);
                    loop {
                        tokio::select! {
                            _ = keepalive.tick() => {}
                            _ = exit.notified() => break,
                        }
                    }
                });
                // 运行时在此随 block_on 返回而销毁，未决任务一并取消。
                tracing::debug!("reactor loop stop");
            })
            .map_err(|err| PscError::Reactor(err.to_string()))?;

        Ok(Arc::new(Reactor {
            handle,
            shutdown,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// 运行时句柄，用于 `enter` 上下文中的套接字注册。
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// 在反应器上派生一个任务。
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// 投递退出并合流工作线程。重复调用无害。
    pub fn stop(&self) {
        self.shutdown.notify_one();
        let joinable = self.thread.lock().take();
        join_off_thread(joinable);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown.notify_one();
        join_off_thread(self.thread.get_mut().take());
    }
}

/// 合流反应器线程；若释放动作恰好发生在反应器线程自身上，只投递退出、
/// 不做合流，线程在 `block_on` 返回后自行结束。
fn join_off_thread(joinable: Option<thread::JoinHandle<()>>) {
    if let Some(thread) = joinable {
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        let _ = thread.join();
    }
}
