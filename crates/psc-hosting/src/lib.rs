#![doc = r#"
# psc-hosting

## 模块使命（Why）
- **一个名字对应一个引擎**：启动外壳按名字构造引擎、记录层按名字找到
  引擎，本 crate 维护这张进程级注册表并负责统一的启动与收尾；
- **三种引擎、一套能力**：注册表槽位是带标签的变体 [`EngineHandle`]，
  把 TCP、UDP 与高速率采集引擎的公共能力集（连接、入队、冲刷、强制
  重连、停止、报告）收拢在一组按变体分派的方法后面。

## 生命周期（What）
- [`create_psc`] / [`create_psc_udp`] / [`create_psc_udp_fast`] 构造引擎并
  写入注册表；同名重复构造会替换旧槽位（旧引擎先被停止）；
- [`start_all`] 在宿主进入运行态时逐一调用 `connect`；
- [`stop_all`] 把注册表整体换出，停止每个引擎再释放句柄；共享反应器
  随最后一个引擎句柄的释放而退出。
"#]

mod registry;

pub use registry::{
    create_psc, create_psc_udp, create_psc_udp_fast, get, report_all, set_send_block_size,
    start_all, stop_all, EngineHandle,
};
