#![doc = r#"
# psc-transport-tcp

## 模块使命（Why）
- **面向不稳定链路的客户端引擎**：嵌入式目标会重启、网络会抖动，
  引擎以固定 5 秒退避自动重连，断线原因落在引擎状态消息里供记录层报警。
- **严格的帧边界**：TCP 字节流按 8 字节帧头 + 报文体切分；魔数一旦
  对不上即视为不可恢复的成帧错误，拆连接重来，绝不尝试重新同步。

## 核心契约（What）
- [`TcpEngine::connect`] 启动会话驱动；状态机为
  `Idle → Connecting → Connected → Backoff → Connecting …`；
- `queue_send*` 把帧暂存进引擎发送缓冲（头与体一次性预留、原子追加），
  超过发送缓冲上限同步失败；[`TcpEngine::flush_send`] 把暂存整体移交
  套接字写队列并清除所有发送块的 `queued` 标志；
- 闲置超时恒作用于写方向，读方向仅在超时掩码 bit0 置位时启用。

## 并发模型（How）
- 会话驱动与写任务运行在共享反应器上；回调按"引擎锁 → 套接字侧锁"
  的固定顺序进锁，与公开方法互不死锁；
- 解码在每次读唤醒后于引擎锁内批量推进，订阅者在同一临界区内被
  同步触达。
"#]

mod decoder;
mod engine;

pub use decoder::{FrameDecoder, FrameEvent, MIN_RX_BUFFER};
pub use engine::TcpEngine;
