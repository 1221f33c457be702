use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use psc_buffer::DBuffer;
use psc_capture::CaptureEngine;
use psc_core::{Block, EngineCore, PscError, Result};
use psc_transport_tcp::TcpEngine;
use psc_transport_udp::UdpEngine;

static REGISTRY: Mutex<BTreeMap<String, EngineHandle>> = Mutex::new(BTreeMap::new());

/// 注册表槽位：三种引擎变体共享一套能力集。
///
/// 公共状态（身份、Block 映射、计数器、状态扫描）都在各变体内嵌的
/// [`EngineCore`] 里；本类型只做按变体分派。
#[derive(Clone)]
pub enum EngineHandle {
    Tcp(Arc<TcpEngine>),
    Udp(Arc<UdpEngine>),
    Capture(Arc<CaptureEngine>),
}

impl EngineHandle {
    /// 引擎共享记录。
    pub fn core(&self) -> &Arc<EngineCore> {
        match self {
            EngineHandle::Tcp(engine) => engine.core(),
            EngineHandle::Udp(engine) => engine.core(),
            EngineHandle::Capture(engine) => engine.core(),
        }
    }

    /// 进程内唯一的引擎名。
    pub fn name(&self) -> &str {
        self.core().name()
    }

    /// 当前连接状态。
    pub fn is_connected(&self) -> bool {
        self.core().is_connected()
    }

    /// 最近一条状态消息。
    pub fn last_message(&self) -> String {
        self.core().last_message()
    }

    /// 取（或惰性创建）发送方向的 Block。
    pub fn get_send(&self, code: u16) -> Arc<Block> {
        self.core().get_send(code)
    }

    /// 取（或惰性创建）接收方向的 Block。
    pub fn get_recv(&self, code: u16) -> Arc<Block> {
        self.core().get_recv(code)
    }

    /// 发起连接（或启动采集线程）。
    pub fn connect(&self) -> Result<()> {
        match self {
            EngineHandle::Tcp(engine) => {
                engine.connect();
                Ok(())
            }
            EngineHandle::Udp(engine) => {
                engine.connect();
                Ok(())
            }
            EngineHandle::Capture(engine) => engine.connect(),
        }
    }

    /// 把 `payload` 组帧后入队到 `msgid` 对应的发送块。
    pub fn queue_send(&self, msgid: u16, payload: &[u8]) -> Result<()> {
        match self {
            EngineHandle::Tcp(engine) => engine.queue_send(msgid, payload),
            EngineHandle::Udp(engine) => engine.queue_send(msgid, payload),
            EngineHandle::Capture(engine) => engine.queue_send(msgid, payload),
        }
    }

    /// 把 `payload` 组帧后入队到指定发送块。
    pub fn queue_send_block(&self, block: &Arc<Block>, payload: &[u8]) -> Result<()> {
        match self {
            EngineHandle::Tcp(engine) => engine.queue_send_block(block, payload),
            EngineHandle::Udp(engine) => engine.queue_send_block(block, payload),
            EngineHandle::Capture(engine) => engine.queue_send_block(block, payload),
        }
    }

    /// 以外部缓冲为报文体入队。
    pub fn queue_send_buffer(&self, block: &Arc<Block>, body: &DBuffer) -> Result<()> {
        match self {
            EngineHandle::Tcp(engine) => engine.queue_send_buffer(block, body),
            EngineHandle::Udp(engine) => engine.queue_send_buffer(block, body),
            EngineHandle::Capture(engine) => engine.queue_send_buffer(block, body),
        }
    }

    /// 把发送块自身的当前载荷入队。
    pub fn send(&self, msgid: u16) -> Result<()> {
        match self {
            EngineHandle::Tcp(engine) => engine.send(msgid),
            EngineHandle::Udp(engine) => engine.send(msgid),
            EngineHandle::Capture(engine) => engine.send(msgid),
        }
    }

    /// 把暂存的帧实际发出。
    pub fn flush_send(&self) -> Result<()> {
        match self {
            EngineHandle::Tcp(engine) => engine.flush_send(),
            EngineHandle::Udp(engine) => engine.flush_send(),
            EngineHandle::Capture(engine) => engine.flush_send(),
        }
    }

    /// 拆掉当前连接并按退避重连。
    pub fn force_reconnect(&self) {
        match self {
            EngineHandle::Tcp(engine) => engine.force_reconnect(),
            EngineHandle::Udp(engine) => engine.force_reconnect(),
            EngineHandle::Capture(engine) => engine.force_reconnect(),
        }
    }

    /// 停止引擎。幂等。
    pub fn stop(&self) {
        match self {
            EngineHandle::Tcp(engine) => engine.stop(),
            EngineHandle::Udp(engine) => engine.stop(),
            EngineHandle::Capture(engine) => engine.stop(),
        }
    }

    /// 人类可读的状态报告。
    pub fn report(&self, level: u8) -> String {
        match self {
            EngineHandle::Tcp(engine) => engine.report(level),
            EngineHandle::Udp(engine) => engine.report(level),
            EngineHandle::Capture(engine) => engine.report(level),
        }
    }

    /// 采集引擎专属接口（快照读取、记录控制）。
    pub fn as_capture(&self) -> Option<&Arc<CaptureEngine>> {
        match self {
            EngineHandle::Capture(engine) => Some(engine),
            _ => None,
        }
    }
}

/// 写入注册表；同名旧引擎先停止再被替换。
fn register(name: &str, handle: EngineHandle) -> EngineHandle {
    let replaced = REGISTRY
        .lock()
        .insert(name.to_owned(), handle.clone());
    if let Some(old) = replaced {
        tracing::warn!(engine = name, "replacing registry slot; stopping old engine");
        old.stop();
    }
    handle
}

/// 构造重连 TCP 引擎并注册。
pub fn create_psc(name: &str, host: &str, port: u16, timeout_mask: u32) -> Result<EngineHandle> {
    let engine = TcpEngine::new(name, host, port, timeout_mask)?;
    Ok(register(name, EngineHandle::Tcp(engine)))
}

/// 构造数据报引擎并注册。
pub fn create_psc_udp(
    name: &str,
    host: &str,
    host_port: u16,
    iface_port: u16,
) -> Result<EngineHandle> {
    let engine = UdpEngine::new(name, host, host_port, iface_port)?;
    Ok(register(name, EngineHandle::Udp(engine)))
}

/// 构造高速率采集引擎并注册。
pub fn create_psc_udp_fast(
    name: &str,
    host: &str,
    host_port: u16,
    iface_port: u16,
) -> Result<EngineHandle> {
    let engine = CaptureEngine::new(name, host, host_port, iface_port)?;
    Ok(register(name, EngineHandle::Capture(engine)))
}

/// 按名字查引擎。
pub fn get(name: &str) -> Option<EngineHandle> {
    REGISTRY.lock().get(name).cloned()
}

/// 把发送块预分配为固定大小（零填充）。
pub fn set_send_block_size(name: &str, code: u16, size: usize) -> Result<()> {
    let handle = get(name).ok_or_else(|| PscError::UnknownEngine(name.to_owned()))?;
    let block = handle.get_send(code);
    block.state().data.resize(size);
    tracing::info!(engine = name, code, size, "send block preallocated");
    Ok(())
}

/// 宿主进入运行态：逐一连接全部已注册引擎。单个失败不拦住其余。
pub fn start_all() {
    let engines: Vec<EngineHandle> = REGISTRY.lock().values().cloned().collect();
    for engine in engines {
        if let Err(err) = engine.connect() {
            tracing::error!(engine = engine.name(), %err, "connect failed");
        }
    }
}

/// 有序收尾：注册表整体换出，每个引擎先停止再释放。
pub fn stop_all() {
    let drained = std::mem::take(&mut *REGISTRY.lock());
    for (_, engine) in &drained {
        engine.stop();
    }
    drop(drained);
}

/// 全部引擎的状态报告拼接。
pub fn report_all(level: u8) -> String {
    let engines: Vec<EngineHandle> = REGISTRY.lock().values().cloned().collect();
    let mut out = String::new();
    for engine in engines {
        out.push_str(&engine.report(level));
    }
    out
}
