//! 采集数据的磁盘日志：只追加、按大小轮转、无文件头尾。
//!
//! 每条记录为 16 字节记录头（`'P' 'S' msgid bodylen sec nsec`，大端）
//! 紧跟 `bodylen` 字节报文体。文件尾部的半条记录意味着崩溃或截断，
//! 读取方按此判定。

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::time::SystemTime;

use chrono::{DateTime, Local};

use psc_core::wire::{JournalHeader, JOURNAL_HEADER_LEN};

use crate::pkt::Pkt;

/// 当前日志文件与它的写入记账。
pub(crate) struct Journal {
    file: Option<File>,
    /// 当前文件累计字节，轮转判据。
    filetotal: u64,
    /// 距上次 `fdatasync` 的累计字节。
    sync_accum: u64,
}

impl Journal {
    pub fn new() -> Self {
        Journal {
            file: None,
            filetotal: 0,
            sync_accum: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// 当前文件累计写入的字节数。
    pub fn written(&self) -> u64 {
        self.filetotal
    }

    /// 是否达到轮转阈值。
    pub fn should_rotate(&self, max_len_mb: u32) -> bool {
        self.is_open() && self.filetotal >= u64::from(max_len_mb) << 20
    }

    /// 关闭当前文件（若开着）。
    pub fn close(&mut self) {
        self.file = None;
    }

    /// 关旧开新：文件名由 `{dir}/{base}{YYYYMMDD-HHMMSS}.dat` 组成，
    /// 时间取首包的墙钟时刻。独占创建（`O_EXCL`），已存在即失败。
    pub fn open_new(&mut self, dir: &str, base: &str, when: SystemTime) -> io::Result<String> {
        self.close();
        let stamp: DateTime<Local> = when.into();
        let name = if dir.is_empty() {
            format!("{base}{}.dat", stamp.format("%Y%m%d-%H%M%S"))
        } else {
            format!("{dir}/{base}{}.dat", stamp.format("%Y%m%d-%H%M%S"))
        };
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .custom_flags(libc::O_CLOEXEC)
            .open(&name)?;
        self.file = Some(file);
        self.filetotal = 0;
        self.sync_accum = 0;
        Ok(name)
    }

    /// 把一批报文按批次散布写（`writev`）落盘，每批至多
    /// `iov_limit / 2` 条记录。
    ///
    /// 返回本次写入的总字节数。短写与系统错误都按错误上抛，调用方
    /// 负责关文件、清记录开关并发布 `lasterror`。
    pub fn write_packets(&mut self, pkts: &[Pkt], iov_limit: usize) -> io::Result<u64> {
        let Some(file) = &self.file else {
            return Ok(0);
        };
        let fd = file.as_raw_fd();
        let per_batch = (iov_limit / 2).max(1);
        let mut headers: Vec<[u8; JOURNAL_HEADER_LEN]> = Vec::with_capacity(per_batch);
        let mut iov: Vec<libc::iovec> = Vec::with_capacity(per_batch * 2);
        let mut total = 0u64;

        for batch in pkts.chunks(per_batch) {
            headers.clear();
            for pkt in batch {
                let mut raw = [0u8; JOURNAL_HEADER_LEN];
                pkt.journal_header().write_to(&mut raw);
                headers.push(raw);
            }
            iov.clear();
            let mut batch_total = 0usize;
            for (raw, pkt) in headers.iter().zip(batch) {
                let payload = pkt.payload();
                iov.push(libc::iovec {
                    iov_base: raw.as_ptr().cast_mut().cast(),
                    iov_len: raw.len(),
                });
                iov.push(libc::iovec {
                    iov_base: payload.as_ptr().cast_mut().cast(),
                    iov_len: payload.len(),
                });
                batch_total += raw.len() + payload.len();
            }

            let wrote = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) };
            if wrote < 0 {
                return Err(io::Error::last_os_error());
            }
            if wrote as usize != batch_total {
                return Err(io::Error::other(format!(
                    "data file write incomplete {wrote} of {batch_total}"
                )));
            }
            total += batch_total as u64;
            self.filetotal += batch_total as u64;
            self.sync_accum += batch_total as u64;
        }
        Ok(total)
    }

    /// 累计量达到阈值时执行一次 `fdatasync`；阈值为零表示从不。
    pub fn maybe_sync(&mut self, dsync_mb: u32) -> io::Result<()> {
        if dsync_mb == 0 {
            return Ok(());
        }
        if let Some(file) = &self.file
            && self.sync_accum >= u64::from(dsync_mb) << 20
        {
            self.sync_accum = 0;
            file.sync_data()?;
        }
        Ok(())
    }
}

/// 数据文件中的一条完整记录。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub msgid: u16,
    /// POSIX 纪元秒。
    pub sec: u32,
    pub nsec: u32,
    pub body: Vec<u8>,
}

/// 顺序读取数据文件的记录流。
///
/// 文件没有头尾与索引，按格式逐条消费即可；恰好停在记录边界的 EOF
/// 是正常结束，停在记录中间则按崩溃/截断上报 `UnexpectedEof`。
pub struct JournalReader<R> {
    inner: R,
}

impl<R: Read> JournalReader<R> {
    pub fn new(inner: R) -> Self {
        JournalReader { inner }
    }

    /// 读下一条记录；到达文件末尾返回 `None`。
    pub fn next_record(&mut self) -> io::Result<Option<JournalRecord>> {
        let mut raw = [0u8; JOURNAL_HEADER_LEN];
        match self.inner.read(&mut raw)? {
            0 => return Ok(None),
            got => self.inner.read_exact(&mut raw[got..])?,
        }
        let head = JournalHeader::parse(&raw)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut body = vec![0u8; head.bodylen as usize];
        self.inner.read_exact(&mut body)?;
        Ok(Some(JournalRecord {
            msgid: head.msgid,
            sec: head.sec,
            nsec: head.nsec,
            body,
        }))
    }
}

impl<R: Read> Iterator for JournalReader<R> {
    type Item = io::Result<JournalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use std::time::UNIX_EPOCH;

    fn pkt(msgid: u16, body: &[u8], sec: u64) -> Pkt {
        Pkt {
            msgid,
            bodylen: body.len() as u32,
            rxtime: UNIX_EPOCH + Duration::from_secs(sec),
            body: body.to_vec(),
        }
    }

    #[test]
    fn records_concatenate_without_framing_overhead() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut journal = Journal::new();
        let name = journal
            .open_new(dir.path().to_str().unwrap(), "t", UNIX_EPOCH)
            .expect("open journal");

        let pkts = vec![pkt(1, b"abc", 10), pkt(2, b"", 11), pkt(3, b"defgh", 12)];
        // iov_limit 压到 4：三条记录强制分两批写。
        let wrote = journal.write_packets(&pkts, 4).expect("writev");
        assert_eq!(wrote, (16 + 3) + 16 + (16 + 5));
        assert_eq!(journal.written(), wrote);

        let mut raw = Vec::new();
        File::open(&name)
            .expect("reopen")
            .read_to_end(&mut raw)
            .expect("read back");
        assert_eq!(raw.len() as u64, wrote);
        // 第一条记录可直接按格式解析。
        assert_eq!(&raw[..2], b"PS");
        assert_eq!(u16::from_be_bytes([raw[2], raw[3]]), 1);
        assert_eq!(u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]), 3);
        assert_eq!(&raw[16..19], b"abc");
    }

    #[test]
    fn reader_replays_records_and_detects_truncation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut journal = Journal::new();
        let name = journal
            .open_new(dir.path().to_str().unwrap(), "r", UNIX_EPOCH)
            .expect("open journal");
        let pkts = vec![pkt(7, b"alpha", 100), pkt(8, b"", 101)];
        journal.write_packets(&pkts, 64).expect("writev");
        journal.close();

        let mut reader = JournalReader::new(File::open(&name).expect("reopen"));
        let first = reader.next_record().expect("read").expect("record");
        assert_eq!(first.msgid, 7);
        assert_eq!(first.sec, 100);
        assert_eq!(first.body, b"alpha");
        let second = reader.next_record().expect("read").expect("record");
        assert_eq!((second.msgid, second.body.len()), (8, 0));
        assert!(reader.next_record().expect("clean eof").is_none());

        // 掐掉尾部字节模拟崩溃：读取方报 UnexpectedEof。
        let raw = std::fs::read(&name).expect("read all");
        let truncated = &raw[..raw.len() - 2];
        let mut reader = JournalReader::new(truncated);
        assert!(reader.next_record().expect("intact first").is_some());
        let err = reader.next_record().expect_err("torn record");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn exclusive_create_rejects_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut journal = Journal::new();
        let when = UNIX_EPOCH + Duration::from_secs(1234);
        journal
            .open_new(dir.path().to_str().unwrap(), "dup", when)
            .expect("first open");
        let err = journal
            .open_new(dir.path().to_str().unwrap(), "dup", when)
            .expect_err("same stamp must collide");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn rotation_threshold_uses_mebibytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut journal = Journal::new();
        journal
            .open_new(dir.path().to_str().unwrap(), "rot", UNIX_EPOCH)
            .expect("open");
        assert!(!journal.should_rotate(1));
        let big = pkt(9, &vec![0u8; 1 << 20], 0);
        journal.write_packets(std::slice::from_ref(&big), 64).expect("write");
        assert!(journal.should_rotate(1));
        assert!(!journal.should_rotate(2));
    }
}
