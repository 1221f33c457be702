use std::time::{SystemTime, UNIX_EPOCH};

use psc_core::wire::JournalHeader;

/// 采集流水线中的一个已验证报文。
///
/// `body` 是从自由链表借出的满容量向量；有效载荷是前 `bodylen` 个字节，
/// 声明超出缓冲的部分取不到，按缓冲实际持有的字节取用。向量被移交给
/// 短缓冲后以空向量占位（见 [`Pkt::take`]），缓冲归还时据此跳过。
#[derive(Debug)]
pub(crate) struct Pkt {
    pub msgid: u16,
    pub bodylen: u32,
    pub rxtime: SystemTime,
    pub body: Vec<u8>,
}

impl Pkt {
    /// 有效载荷视图：前 `bodylen` 个字节，钳制在缓冲容量内。
    pub fn payload(&self) -> &[u8] {
        let len = (self.bodylen as usize).min(self.body.len());
        &self.body[..len]
    }

    /// 把报文整体移出，原位留下一个空壳（身份字段保留、缓冲为空）。
    pub fn take(&mut self) -> Pkt {
        Pkt {
            msgid: self.msgid,
            bodylen: self.bodylen,
            rxtime: self.rxtime,
            body: std::mem::take(&mut self.body),
        }
    }

    /// 对应的数据文件记录头。长度字段与 [`Pkt::payload`] 实际落盘的
    /// 字节数一致，记录流保持可逐条解析。
    pub fn journal_header(&self) -> JournalHeader {
        let since_epoch = self
            .rxtime
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        JournalHeader {
            msgid: self.msgid,
            bodylen: self.payload().len() as u32,
            sec: since_epoch.as_secs() as u32,
            nsec: since_epoch.subsec_nanos(),
        }
    }
}
