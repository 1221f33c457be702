use std::io;

use thiserror::Error;

use crate::wire::HEADER_LEN;

/// PSC 驱动跨层共享的稳定错误域。
///
/// # 设计背景（Why）
/// - 引擎内部在反应器回调里捕获并吞掉的异常、以及向记录层上抛的报警，
///   都需要一个可机读的分类来源；`stable_code` 提供 `psc.<域>.<语义>`
///   形式的稳定码，日志与告警据此做自动化归并。
///
/// # 契约说明（What）
/// - 错误文案面向排障人员；稳定码面向机器，承诺不随措辞调整而变化；
/// - `Io` 变体保留底层 `std::io::Error` 作为根因链路。
#[derive(Debug, Error)]
pub enum PscError {
    /// 线缆字节不以 `'P','S'` 开头。
    #[error("帧头损坏：前两个字节不是 'P','S'")]
    BadMagic,

    /// 帧头字节数不足。
    #[error("帧头不完整：收到 {actual} 字节，至少需要 {HEADER_LEN} 字节")]
    ShortHeader { actual: usize },

    /// 同一发送块在上一次 flush 之前被再次入队。
    #[error("发送块 {code} 已经在发送队列中")]
    AlreadyQueued { code: u16 },

    /// 入队或冲刷将超出发送缓冲上限。
    #[error("再入队 {need} 字节将超出 {limit} 字节的发送缓冲上限")]
    SendOverflow { need: usize, limit: usize },

    /// UDP 发送队列达到报文数上限。
    #[error("发送队列已满（上限 {limit} 个报文）")]
    TxQueueFull { limit: usize },

    /// 对端主机名无法解析出可用地址。
    #[error("无法解析对端地址 {host}:{port}")]
    Resolve { host: String, port: u16 },

    /// 全局注册表中不存在该名字的引擎。
    #[error("未注册的引擎 '{0}'")]
    UnknownEngine(String),

    /// 共享事件循环创建失败或已停止。
    #[error("事件循环不可用：{0}")]
    Reactor(String),

    /// 底层系统调用失败。
    #[error("{op} 失败: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// 数据文件写入或轮转失败。
    #[error("数据文件错误：{0}")]
    Journal(String),
}

impl PscError {
    /// 以操作名包裹一个底层 IO 错误。
    pub fn io(op: &'static str, source: io::Error) -> Self {
        PscError::Io { op, source }
    }

    /// 稳定机读码，`psc.<域>.<语义>` 命名。
    pub fn stable_code(&self) -> &'static str {
        match self {
            PscError::BadMagic => "psc.wire.bad_magic",
            PscError::ShortHeader { .. } => "psc.wire.short_header",
            PscError::AlreadyQueued { .. } => "psc.send.already_queued",
            PscError::SendOverflow { .. } => "psc.send.overflow",
            PscError::TxQueueFull { .. } => "psc.udp.tx_queue_full",
            PscError::Resolve { .. } => "psc.engine.resolve_failed",
            PscError::UnknownEngine(_) => "psc.registry.unknown_engine",
            PscError::Reactor(_) => "psc.reactor.unavailable",
            PscError::Io { .. } => "psc.io.failed",
            PscError::Journal(_) => "psc.capture.journal",
        }
    }
}

/// crate 级结果别名。
pub type Result<T, E = PscError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_codes_follow_naming_scheme() {
        let samples: [PscError; 4] = [
            PscError::BadMagic,
            PscError::AlreadyQueued { code: 7 },
            PscError::SendOverflow { need: 9, limit: 8 },
            PscError::io("bind", io::Error::from(io::ErrorKind::AddrInUse)),
        ];
        for err in &samples {
            let code = err.stable_code();
            assert!(code.starts_with("psc."), "{code}");
            assert_eq!(code.split('.').count(), 3, "{code}");
        }
    }
}
