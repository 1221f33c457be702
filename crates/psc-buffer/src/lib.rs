#![doc = r#"
# psc-buffer

## 模块使命（Why）
- **承接零拷贝收包路径**：PSC 帧的报文体从网络栈缓冲整段"捐赠"进入 Block 缓存，
  本 crate 提供可以同时表达"自有连续向量"与"外部分段链"两种形态的字节容器
  [`DBuffer`]，使收包路径不必为每一帧做整体复制。
- **支撑高速率采集的内存纪律**：`recvmmsg` 批量收包要求预先分配全部报文体，
  [`PacketPool`] 以固定容量自由链表（Free List）管理这些向量，杜绝稳态下的堆分配。

## 核心契约（What）
- [`DBuffer`]：任一时刻只有一种后备形态（自有向量或 `Bytes` 分段链）；
  `size()` 恒等于各分段长度之和；`copyout_shape` 只产出完整元素。
- [`PacketPool`]：内部不含锁，由调用方将其嵌入自身的临界区
  （采集引擎将其与 `pending` 队列置于同一把 `rxLock` 之下）。

## 实现策略（How）
- 分段链直接存放 `bytes::Bytes`，捐赠通过 `BytesMut::split_to().freeze()` 完成，
  引用计数保证段内存活到最后一个读者离开；
- 带跨步的 `copyout_shape` 以"分段游标"逐段推进，复制永不越过段边界。
"#]

mod dbuffer;
mod pool;

pub use dbuffer::DBuffer;
pub use pool::{PacketPool, PoolSnapshot};
