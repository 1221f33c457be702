//! 进程级可调参数。
//!
//! # 定位（Why）
//! - 这些旋钮与对端没有任何协商，由启动脚本或运维在运行期直接设置；
//!   每个使用点在需要时读取一次即可，修改即刻对后续操作生效。
//!
//! # 约定（What）
//! - `debug`：0–5 的日志冗余度。0 仅错误；1 连接生命周期；2 队列与冲刷；
//!   3 逐帧；4 唤醒事件；5 缓冲记账。
//! - 时间类参数以秒（或毫秒）存储，字节类以字节存储；注释标注默认值。

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// 全局可调参数的原子存储。
#[derive(Debug)]
pub struct Tunables {
    debug: AtomicU32,
    inactivity_time: AtomicU32,
    max_send_buffer: AtomicUsize,
    udp_max_packet_size: AtomicUsize,
    udp_max_packet_rate: AtomicU32,
    udp_buffer_period_ms: AtomicU32,
    udp_max_len_mb: AtomicU32,
    udp_set_sock_buf: AtomicUsize,
    udp_dsync_size_mb: AtomicU32,
}

impl Tunables {
    const fn new() -> Self {
        Tunables {
            debug: AtomicU32::new(1),
            // 读写闲置超时（秒），默认 5
            inactivity_time: AtomicU32::new(5),
            // 发送缓冲上限（字节），默认 1 MiB
            max_send_buffer: AtomicUsize::new(1024 * 1024),
            // 单报文最大字节数，默认 1024
            udp_max_packet_size: AtomicUsize::new(1024),
            // 最大收包速率（pkt/s），默认 280 000
            udp_max_packet_rate: AtomicU32::new(280_000),
            // 缓冲周期（毫秒），默认 1 s
            udp_buffer_period_ms: AtomicU32::new(1_000),
            // 数据文件轮转阈值（MB），默认 2000
            udp_max_len_mb: AtomicU32::new(2_000),
            // 期望的 SO_RCVBUF；0 表示沿用内核默认
            udp_set_sock_buf: AtomicUsize::new(0),
            // 周期性 fdatasync 阈值（MB）；0 表示从不
            udp_dsync_size_mb: AtomicU32::new(0),
        }
    }

    /// 当前日志冗余度。
    pub fn debug(&self) -> u32 {
        self.debug.load(Ordering::Relaxed)
    }

    /// 冗余度是否达到 `level`，热路径日志以此做前置判断。
    pub fn debug_at(&self, level: u32) -> bool {
        self.debug() >= level
    }

    pub fn set_debug(&self, level: u32) {
        self.debug.store(level, Ordering::Relaxed);
    }

    /// 读写闲置超时（秒）；0 表示不启用。
    pub fn inactivity_time(&self) -> u32 {
        self.inactivity_time.load(Ordering::Relaxed)
    }

    pub fn set_inactivity_time(&self, secs: u32) {
        self.inactivity_time.store(secs, Ordering::Relaxed);
    }

    /// 发送缓冲上限（字节）；0 表示不设限。
    pub fn max_send_buffer(&self) -> usize {
        self.max_send_buffer.load(Ordering::Relaxed)
    }

    pub fn set_max_send_buffer(&self, bytes: usize) {
        self.max_send_buffer.store(bytes, Ordering::Relaxed);
    }

    /// 单个 UDP 报文的最大字节数（至少 8）。
    pub fn udp_max_packet_size(&self) -> usize {
        self.udp_max_packet_size.load(Ordering::Relaxed).max(8)
    }

    pub fn set_udp_max_packet_size(&self, bytes: usize) {
        self.udp_max_packet_size.store(bytes, Ordering::Relaxed);
    }

    /// 预期最大收包速率（pkt/s）。
    pub fn udp_max_packet_rate(&self) -> u32 {
        self.udp_max_packet_rate.load(Ordering::Relaxed)
    }

    pub fn set_udp_max_packet_rate(&self, rate: u32) {
        self.udp_max_packet_rate.store(rate, Ordering::Relaxed);
    }

    /// 缓冲周期（毫秒）。
    pub fn udp_buffer_period_ms(&self) -> u32 {
        self.udp_buffer_period_ms.load(Ordering::Relaxed)
    }

    pub fn set_udp_buffer_period_ms(&self, ms: u32) {
        self.udp_buffer_period_ms.store(ms, Ordering::Relaxed);
    }

    /// 数据文件轮转阈值（MB）。
    pub fn udp_max_len_mb(&self) -> u32 {
        self.udp_max_len_mb.load(Ordering::Relaxed)
    }

    pub fn set_udp_max_len_mb(&self, mb: u32) {
        self.udp_max_len_mb.store(mb, Ordering::Relaxed);
    }

    /// 期望的套接字接收缓冲（字节）；0 表示沿用内核默认。
    pub fn udp_set_sock_buf(&self) -> usize {
        self.udp_set_sock_buf.load(Ordering::Relaxed)
    }

    pub fn set_udp_set_sock_buf(&self, bytes: usize) {
        self.udp_set_sock_buf.store(bytes, Ordering::Relaxed);
    }

    /// 周期性 fdatasync 阈值（MB）；0 表示从不主动刷盘。
    pub fn udp_dsync_size_mb(&self) -> u32 {
        self.udp_dsync_size_mb.load(Ordering::Relaxed)
    }

    pub fn set_udp_dsync_size_mb(&self, mb: u32) {
        self.udp_dsync_size_mb.store(mb, Ordering::Relaxed);
    }
}

static TUNABLES: Tunables = Tunables::new();

/// 进程级可调参数单例。
pub fn tunables() -> &'static Tunables {
    &TUNABLES
}
