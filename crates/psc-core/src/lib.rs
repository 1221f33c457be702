#![doc = r#"
# psc-core

## 模块使命（Why）
- **统一 PSC 帧协议的内核语义**：TCP、UDP 与高速率采集三种引擎共享同一套
  帧头编解码、Block 缓存、订阅分发与扫描节流逻辑，本 crate 是它们的公共底座。
- **单一事件循环**：进程内所有 TCP/UDP 引擎复用一个长驻的反应器线程
  （[`Reactor`]），由弱引用单例共享，最后一个使用者离开后自动回收。

## 核心契约（What）
- [`wire`]：`'P','S'` 魔数、8 字节帧头、16 字节数据文件记录头，一律大端。
- [`Block`]：以 16 位帧号命名的载荷槽位，携带接收时间戳、单调计数、
  订阅者列表与扫描节流状态。
- [`EngineCore`]：引擎共享记录——身份、收发 Block 映射、连接标志、
  最后一条状态消息、计数器与连接后处理列表。
- [`PscError`]：稳定错误域，`stable_code()` 提供 `psc.<域>.<语义>` 形式的
  机读码。

## 并发模型（How）
- 引擎状态由每引擎互斥锁保护；Block 的载荷由块级互斥锁保护、计数为原子量；
- 订阅者在更新线程上同步触达，异常被逐个隔离，不得重入引擎；
- 扫描令牌按三个优先级投递，完成回执驱动 [`Block::request_scan`] 的
  忙碌/合并节流。
"#]

pub mod config;
pub mod error;
pub mod wire;

mod block;
mod engine;
mod reactor;
mod scan;
mod subscriber;

pub use block::{Block, BlockState};
pub use engine::{CoreState, EngineCore};
pub use error::{PscError, Result};
pub use reactor::Reactor;
pub use scan::{PendingScan, ScanDone, ScanFn, ScanSink, ScanToken, SCAN_LEVELS};
pub use subscriber::{CbList, ListenerCtx};
