use bytes::BytesMut;

use psc_core::wire::{FrameHeader, HEADER_LEN};
use psc_core::PscError;

/// 接收缓冲的最低高水位。小报文密集到达时批量缓冲，减少读唤醒次数。
pub const MIN_RX_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// 等满 8 字节帧头。
    Header,
    /// 等满 `bodylen` 字节报文体。
    Body { msgid: u16, bodylen: u32 },
}

/// 两阶段帧解码状态机。
///
/// # 工作方式（How）
/// - [`FrameDecoder::step`] 在输入不足 [`FrameDecoder::expect`] 字节时返回
///   `None`，否则切下一个阶段的字节并产出事件：头阶段校验魔数并解出
///   `msgid`/`bodylen`；体阶段零拷贝切出载荷、回到头阶段；
/// - 零长度报文体合法：头事件之后立即产出空载荷的体事件；
/// - 魔数不符返回 `BadMagic`，由引擎拆连接——状态机自身不做重同步。
#[derive(Debug)]
pub struct FrameDecoder {
    phase: Phase,
}

/// 解码产出的事件。
#[derive(Debug)]
pub enum FrameEvent {
    /// 帧头就绪。引擎据此查找接收 Block 并打时间戳。
    Header { msgid: u16, bodylen: u32 },
    /// 报文体就绪，载荷从输入缓冲整体切出。
    Body { msgid: u16, payload: BytesMut },
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder {
            phase: Phase::Header,
        }
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 下一步所需的最少输入字节数。
    pub fn expect(&self) -> usize {
        match self.phase {
            Phase::Header => HEADER_LEN,
            Phase::Body { bodylen, .. } => bodylen as usize,
        }
    }

    /// 是否已解出帧头、正在等报文体。
    pub fn mid_frame(&self) -> Option<(u16, u32)> {
        match self.phase {
            Phase::Header => None,
            Phase::Body { msgid, bodylen } => Some((msgid, bodylen)),
        }
    }

    /// 读缓冲的高水位建议：`max(expect, MIN_RX_BUFFER)`。
    pub fn highwater(&self) -> usize {
        self.expect().max(MIN_RX_BUFFER)
    }

    /// 推进一步。输入不足返回 `Ok(None)`。
    pub fn step(&mut self, buf: &mut BytesMut) -> Result<Option<FrameEvent>, PscError> {
        match self.phase {
            Phase::Header => {
                if buf.len() < HEADER_LEN {
                    return Ok(None);
                }
                let raw = buf.split_to(HEADER_LEN);
                let head = FrameHeader::parse(&raw)?;
                self.phase = Phase::Body {
                    msgid: head.msgid,
                    bodylen: head.bodylen,
                };
                Ok(Some(FrameEvent::Header {
                    msgid: head.msgid,
                    bodylen: head.bodylen,
                }))
            }
            Phase::Body { msgid, bodylen } => {
                let need = bodylen as usize;
                if buf.len() < need {
                    return Ok(None);
                }
                let payload = buf.split_to(need);
                self.phase = Phase::Header;
                Ok(Some(FrameEvent::Body { msgid, payload }))
            }
        }
    }
}
