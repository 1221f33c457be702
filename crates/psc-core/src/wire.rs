//! PSC 线缆格式：帧头与数据文件记录头的编解码。
//!
//! # 布局（What）
//! - 帧头 8 字节：ASCII `'P','S'`、`msgid`（u16 大端）、`bodylen`（u32 大端），
//!   其后紧跟 `bodylen` 个不透明载荷字节；无校验和、无版本协商；
//!   零长度报文体合法。
//! - 数据文件记录头 16 字节：在帧头的 `'P','S'`、`msgid`、`bodylen` 之后
//!   追加 `sec`（POSIX 纪元秒，u32 大端）与 `nsec`（u32 大端）。
//!
//! 载荷字节序由订阅者自行解释，本模块不做任何转换。

use bytes::{BufMut, BytesMut};

use crate::error::PscError;

/// 帧头魔数。
pub const MAGIC: [u8; 2] = *b"PS";
/// 帧头字节数。
pub const HEADER_LEN: usize = 8;
/// 数据文件记录头字节数。
pub const JOURNAL_HEADER_LEN: usize = 16;

/// 一帧的头部字段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// 16 位帧号。
    pub msgid: u16,
    /// 报文体字节数。
    pub bodylen: u32,
}

impl FrameHeader {
    /// 编码到字节缓冲尾部。
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&MAGIC);
        dst.put_u16(self.msgid);
        dst.put_u32(self.bodylen);
    }

    /// 写入固定长度的头部数组。
    pub fn write_to(&self, dst: &mut [u8; HEADER_LEN]) {
        dst[..2].copy_from_slice(&MAGIC);
        dst[2..4].copy_from_slice(&self.msgid.to_be_bytes());
        dst[4..8].copy_from_slice(&self.bodylen.to_be_bytes());
    }

    /// 从字节序列头部解析。
    ///
    /// 前置条件：调用方已确认至少有 [`HEADER_LEN`] 字节；不足返回
    /// `ShortHeader`，魔数不符返回 `BadMagic`。
    pub fn parse(raw: &[u8]) -> Result<FrameHeader, PscError> {
        if raw.len() < HEADER_LEN {
            return Err(PscError::ShortHeader { actual: raw.len() });
        }
        if raw[..2] != MAGIC {
            return Err(PscError::BadMagic);
        }
        Ok(FrameHeader {
            msgid: u16::from_be_bytes([raw[2], raw[3]]),
            bodylen: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
    }

    /// 整帧长度（头 + 体）。
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.bodylen as usize
    }
}

/// 数据文件中单条记录的头部。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub msgid: u16,
    pub bodylen: u32,
    /// POSIX 纪元秒。
    pub sec: u32,
    /// 秒内纳秒。
    pub nsec: u32,
}

impl JournalHeader {
    /// 写入固定长度的记录头数组。
    pub fn write_to(&self, dst: &mut [u8; JOURNAL_HEADER_LEN]) {
        dst[..2].copy_from_slice(&MAGIC);
        dst[2..4].copy_from_slice(&self.msgid.to_be_bytes());
        dst[4..8].copy_from_slice(&self.bodylen.to_be_bytes());
        dst[8..12].copy_from_slice(&self.sec.to_be_bytes());
        dst[12..16].copy_from_slice(&self.nsec.to_be_bytes());
    }

    /// 从字节序列头部解析一条记录头。
    pub fn parse(raw: &[u8]) -> Result<JournalHeader, PscError> {
        if raw.len() < JOURNAL_HEADER_LEN {
            return Err(PscError::ShortHeader { actual: raw.len() });
        }
        let frame = FrameHeader::parse(raw)?;
        Ok(JournalHeader {
            msgid: frame.msgid,
            bodylen: frame.bodylen,
            sec: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
            nsec: u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]),
        })
    }
}
