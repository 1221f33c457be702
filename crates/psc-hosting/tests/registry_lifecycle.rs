//! `registry_lifecycle` 集成测试：注册表是进程级单例，生命周期相关的
//! 断言集中在一个测试函数里顺序执行，避免并行测试互相清空注册表。

use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use psc_hosting::{
    create_psc, get, report_all, set_send_block_size, start_all, stop_all,
};

fn wait_until(limit: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn registry_create_start_report_stop() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let keeper = thread::spawn(move || {
        // 接住第一条连接并保持到测试收尾。
        let (conn, _) = listener.accept().expect("accept");
        thread::sleep(Duration::from_secs(3));
        drop(conn);
    });

    let handle = create_psc("dev1", "127.0.0.1", port, 0).expect("create tcp engine");
    assert_eq!(handle.name(), "dev1");
    assert!(!handle.is_connected());
    assert_eq!(handle.last_message(), "Initialize");

    // 同名重建会替换槽位；旧句柄的引擎被停止。
    let replacement = create_psc("dev1", "127.0.0.1", port, 1).expect("replace engine");
    assert_eq!(replacement.core().timeout_mask(), 1);
    let looked_up = get("dev1").expect("lookup");
    assert_eq!(looked_up.core().timeout_mask(), 1);
    assert!(get("missing").is_none());

    // 发送块预分配为固定大小并零填充。
    set_send_block_size("dev1", 0x20, 32).expect("preallocate");
    let block = looked_up.get_send(0x20);
    assert_eq!(block.state().data.size(), 32);
    assert!(matches!(
        set_send_block_size("missing", 1, 8),
        Err(err) if err.stable_code() == "psc.registry.unknown_engine"
    ));

    start_all();
    assert!(wait_until(Duration::from_secs(5), || {
        looked_up.is_connected()
    }));
    let report = report_all(2);
    assert!(report.contains("dev1"));
    assert!(report.contains("Block 32"));

    stop_all();
    assert!(get("dev1").is_none());
    assert!(!looked_up.is_connected());
    keeper.join().unwrap();
}
