#![doc = r#"
# psc-capture

## 模块使命（Why）
- **不丢包优先的采集通路**：普通数据报引擎按事件循环节拍收包，在每秒
  二三十万包的量级下撑不住；本引擎用两个专职线程、`recvmmsg` 批量系统
  调用与预分配的报文体自由链表，把稳态路径上的分配和唤醒都挤掉；
- **掉包要看得见**：内核侧溢出经 `SO_RXQ_OVFL` 控制消息换算成差值计入
  `ndrops`，用户侧自由链表耗尽计入 `noom` 并阻塞等待——两类丢失都被
  记账而不是被掩盖。

## 流水线（How）
```text
socket -> RX 线程 -> pending[] -> CACHE 线程 -> {Block 更新, 数据文件, 短缓冲}
            ^                                              |
            +-------- vpool 自由链表 <---- 缓冲归还 --------+
```
- RX 线程在 `rxLock` 下从 `vpool` 指派缓冲，锁外执行批量收包，校验后
  把报文压入 `pending`，每个突发只唤醒 CACHE 线程一次；
- CACHE 线程换出整个 `pending`，依次完成 Block 更新、日志落盘（`writev`
  散布写，按大小轮转）与短缓冲装填，最后把缓冲归还 `vpool`。

## 核心契约（What）
- 同一批次的全部报文共享一个接收时间戳；
- 日志记录格式：`'P' 'S' msgid bodylen sec nsec body`，无文件头尾；
  写失败即关文件、清记录开关、发布 `lasterror`；
- 短缓冲容量 `shortLimit` 之内装填，装满投递 `shortFull` 扫描；快照
  读取不够用时自动请求放大下一轮容量。
"#]

mod batch;
mod engine;
mod journal;
mod pkt;

pub use engine::{CaptureCounters, CaptureEngine};
pub use journal::{JournalReader, JournalRecord};
