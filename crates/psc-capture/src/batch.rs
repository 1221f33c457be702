//! `recvmmsg` 批量收包的系统调用封装。
//!
//! # 模块定位（Why）
//! - 单次系统调用取回一整批数据报，把内核/用户态切换摊到批次上；
//! - 报文头与报文体收进两段 iovec：头落在槽位自带的 8 字节数组里，
//!   体直接落进自由链表捐出的向量，校验通过后整体移交流水线，全程
//!   不再复制载荷。
//!
//! # 契约（What）
//! - [`RecvSlot`] 在调用前必须挂上（`attach`）一个容量不小于 8 字节的
//!   报文体缓冲；收包结果通过 `len`/`src_addr`/`overflow` 等访问器读出；
//! - [`recv_batch`] 只对 `slots` 的前缀操作，返回实际收到的报文数；
//!   `SO_RCVTIMEO` 到期映射为 `WouldBlock` 类错误，由调用方按超时处理。
//!
//! # 实现说明（How）
//! - `mmsghdr`/`iovec` 数组逐次在栈上重建，指针指向槽位内的稳定存储；
//! - `SO_RXQ_OVFL` 的控制消息在本模块内解析完毕，上层只看到安全的
//!   `Option<u32>` 绝对计数。

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

use psc_core::wire::HEADER_LEN;

/// 控制消息缓冲：以 `u64` 对齐，64 字节足以容纳 `SO_RXQ_OVFL` 的
/// 4 字节负载加上 `cmsghdr` 本身。
const CMSG_WORDS: usize = 8;

/// 一个批量收包槽位。
pub(crate) struct RecvSlot {
    /// 帧头落点。
    pub head: [u8; HEADER_LEN],
    /// 报文体落点；空向量表示未指派。
    body: Vec<u8>,
    /// 本次收到的总字节数（头 + 体）。
    pub len: usize,
    src: libc::sockaddr_storage,
    cmsg: [u64; CMSG_WORDS],
    overflow: Option<u32>,
    ctrl_truncated: bool,
}

impl RecvSlot {
    pub fn new() -> Self {
        RecvSlot {
            head: [0; HEADER_LEN],
            body: Vec::new(),
            len: 0,
            src: unsafe { mem::zeroed() },
            cmsg: [0; CMSG_WORDS],
            overflow: None,
            ctrl_truncated: false,
        }
    }

    /// 是否已挂上报文体缓冲。
    pub fn is_assigned(&self) -> bool {
        !self.body.is_empty()
    }

    /// 挂上一个自由链表缓冲。
    pub fn attach(&mut self, body: Vec<u8>) {
        debug_assert!(body.len() >= HEADER_LEN);
        self.body = body;
    }

    /// 摘下报文体缓冲，槽位回到未指派状态。
    pub fn detach(&mut self) -> Vec<u8> {
        mem::take(&mut self.body)
    }

    /// 本报文的来源地址。
    pub fn src_addr(&self) -> Option<SocketAddr> {
        storage_to_addr(&self.src)
    }

    /// 内核报告的累计丢包数（`SO_RXQ_OVFL`，绝对值）。
    pub fn overflow(&self) -> Option<u32> {
        self.overflow
    }

    /// 控制消息缓冲是否被截断（说明 `CMSG_WORDS` 估小了）。
    pub fn ctrl_truncated(&self) -> bool {
        self.ctrl_truncated
    }
}

/// 对 `slots` 的前缀执行一次 `recvmmsg(MSG_WAITFORONE)`。
///
/// 前置条件：前缀内的槽位都已 `attach`。返回收到的报文数；内核超时
/// （`SO_RCVTIMEO`）表现为 `WouldBlock`/`TimedOut` 类错误。
pub(crate) fn recv_batch(fd: RawFd, slots: &mut [RecvSlot]) -> io::Result<usize> {
    if slots.is_empty() {
        return Ok(0);
    }
    let count = slots.len();
    let mut iovecs: Vec<[libc::iovec; 2]> = Vec::with_capacity(count);
    for slot in slots.iter_mut() {
        debug_assert!(slot.is_assigned());
        iovecs.push([
            libc::iovec {
                iov_base: slot.head.as_mut_ptr().cast(),
                iov_len: slot.head.len(),
            },
            libc::iovec {
                iov_base: slot.body.as_mut_ptr().cast(),
                iov_len: slot.body.len(),
            },
        ]);
    }

    let mut headers: Vec<libc::mmsghdr> = Vec::with_capacity(count);
    for (idx, slot) in slots.iter_mut().enumerate() {
        slot.len = 0;
        slot.overflow = None;
        slot.ctrl_truncated = false;

        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        hdr.msg_name = (&raw mut slot.src).cast();
        hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        hdr.msg_iov = iovecs[idx].as_mut_ptr();
        hdr.msg_iovlen = 2 as _;
        hdr.msg_control = slot.cmsg.as_mut_ptr().cast();
        hdr.msg_controllen = mem::size_of_val(&slot.cmsg) as _;
        headers.push(libc::mmsghdr {
            msg_hdr: hdr,
            msg_len: 0,
        });
    }

    let received = unsafe {
        libc::recvmmsg(
            fd,
            headers.as_mut_ptr(),
            headers.len() as libc::c_uint,
            libc::MSG_WAITFORONE,
            std::ptr::null_mut(),
        )
    };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let received = received as usize;
    for idx in 0..received {
        // 先读完 msghdr（含指向槽位的裸指针），再拿槽位的可变借用回填。
        let len = headers[idx].msg_len as usize;
        let truncated = headers[idx].msg_hdr.msg_flags & libc::MSG_CTRUNC != 0;
        let overflow = unsafe { parse_overflow(&headers[idx].msg_hdr) };
        let slot = &mut slots[idx];
        slot.len = len;
        slot.ctrl_truncated = truncated;
        slot.overflow = overflow;
    }
    Ok(received)
}

/// 在控制消息链里找 `SO_RXQ_OVFL`。内核在计数为零时会省略该消息。
unsafe fn parse_overflow(hdr: &libc::msghdr) -> Option<u32> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(hdr);
        while !cmsg.is_null() {
            let level = (*cmsg).cmsg_level;
            let kind = (*cmsg).cmsg_type;
            if level == libc::SOL_SOCKET
                && kind == libc::SO_RXQ_OVFL
                && (*cmsg).cmsg_len as usize >= libc::CMSG_LEN(4) as usize
            {
                let mut value = 0u32;
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    (&raw mut value).cast(),
                    mem::size_of::<u32>(),
                );
                return Some(value);
            }
            cmsg = libc::CMSG_NXTHDR(hdr, cmsg);
        }
        None
    }
}

/// `sockaddr_storage` 还原为标准库地址；只认 IPv4/IPv6。
fn storage_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin: &libc::sockaddr_in =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast() };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6: &libc::sockaddr_in6 =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast() };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
