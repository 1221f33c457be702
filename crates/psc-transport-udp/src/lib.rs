#![doc = r#"
# psc-transport-udp

## 模块使命（Why）
- **无连接语义下的 PSC 帧通路**：数据报天然保留帧边界，引擎只需校验
  魔数与长度声明，无须 TCP 那样的流式解码状态机；
- **来源过滤**：凡源地址不等于构造时解析出的对端地址的报文一律丢弃，
  共享端口上的杂音不会污染 Block 缓存。

## 核心契约（What）
- 对端地址在构造时解析一次；本地绑定端口可选（0 为临时端口）；
- 接收以 5 秒超时节拍运行：超时与套接字错误都更新状态消息并投递
  状态扫描，供记录层刷新报警；
- 发送队列有界（64 个报文），配套同容量的缓冲自由链表避免重分配；
  [`UdpEngine::flush_send`] 把暂存报文移交写任务，部分写入计为发送错误。
"#]

mod engine;

pub use engine::UdpEngine;
