/// 固定容量报文体的自由链表。
///
/// # 角色定位（Why）
/// - 高速率采集引擎在启动时一次性预分配全部报文体向量，运行期只在
///   自由链表与在途队列之间搬移所有权，稳态下不触碰分配器；
/// - 链表本身不含锁：它与 `pending` 队列同属一把接收锁的保护范围，
///   由嵌入它的引擎决定临界区边界。
///
/// # 契约定义（What）
/// - `take` 移出一个长度恢复为 `packet_len` 的向量；链表耗尽返回 `None`，
///   由调用方记账并阻塞等待归还；
/// - `put` 归还一个向量：容量不足时补足、长度恢复为 `packet_len`，
///   超出 `total` 的多余归还被静默丢弃（所有权守恒的兜底）。
#[derive(Debug)]
pub struct PacketPool {
    free: Vec<Vec<u8>>,
    packet_len: usize,
    total: usize,
}

/// 自由链表的占用快照，用于 `report` 与测试断言。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// 仍在链表中的向量个数。
    pub free: usize,
    /// 预分配总数。
    pub total: usize,
    /// 单个向量的长度。
    pub packet_len: usize,
}

impl PacketPool {
    /// 预分配 `total` 个长度为 `packet_len` 的向量。
    pub fn with_capacity(total: usize, packet_len: usize) -> Self {
        let mut free = Vec::with_capacity(total);
        for _ in 0..total {
            free.push(vec![0u8; packet_len]);
        }
        PacketPool {
            free,
            packet_len,
            total,
        }
    }

    /// 移出一个可用向量；链表耗尽时返回 `None`。
    pub fn take(&mut self) -> Option<Vec<u8>> {
        self.free.pop()
    }

    /// 归还一个向量，恢复其长度供下一次批量收包直接使用。
    pub fn put(&mut self, mut body: Vec<u8>) {
        if self.free.len() >= self.total {
            return;
        }
        if body.capacity() < self.packet_len {
            body.reserve_exact(self.packet_len - body.len());
        }
        body.resize(self.packet_len, 0);
        self.free.push(body);
    }

    /// 链表是否已耗尽。
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// 当前占用快照。
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            free: self.free.len(),
            total: self.total,
            packet_len: self.packet_len,
        }
    }

    /// 单个向量的长度。
    pub fn packet_len(&self) -> usize {
        self.packet_len
    }
}
