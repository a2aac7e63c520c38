//! Ctrl-C against a consumer running process workers over SQLite.
//!
//! Spawns the `scrooge_consumer` binary, so it is ignored by default:
//! `cargo test --features sql-storage -- --ignored`.

#![cfg(all(unix, feature = "sql-storage"))]

use scrooge::prelude::*;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

async fn wait_until_empty(scrooge: &Scrooge) -> bool {
    for _ in 0..500 {
        if scrooge.pending_count().await.unwrap() == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
#[ignore]
async fn test_sigint_lets_process_worker_finish_its_task() {
    let dir = std::env::temp_dir().join(format!("scrooge-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let database = dir.join("queue.db");

    let mut config = ScroogeConfig::default();
    config.name = "sigint".to_string();
    config.storage = StorageConfig::sql(format!("sqlite://{}?mode=rwc", database.display()));
    let config_path = dir.join("scrooge.json");
    std::fs::write(&config_path, serde_json::to_vec(&config).unwrap()).unwrap();

    let scrooge = Scrooge::from_config(&config).await.unwrap();
    let sleep = scrooge
        .task(TaskOptions::new("sleep"), |seconds: f64| async move {
            Ok::<_, TaskError>(seconds)
        })
        .unwrap();

    // Own process group, so the interrupt reaches the consumer and its
    // workers the way a terminal Ctrl-C would, and nothing else.
    let mut consumer = Command::new(env!("CARGO_BIN_EXE_scrooge_consumer"))
        .arg("--config")
        .arg(&config_path)
        .args(["-k", "process", "-w", "1", "-d", "0.05", "-q"])
        .stdout(Stdio::null())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let pgid = consumer.id().unwrap();

    let handle = sleep.call(1.0).await.unwrap();
    assert!(wait_until_empty(&scrooge).await, "worker never picked up the task");

    let status = Command::new("kill")
        .args(["-s", "INT", "--", &format!("-{}", pgid)])
        .status()
        .await
        .unwrap();
    assert!(status.success());

    let exit = tokio::time::timeout(Duration::from_secs(15), consumer.wait())
        .await
        .expect("consumer did not exit after SIGINT")
        .unwrap();
    assert!(exit.success());

    assert_eq!(handle.get().await.unwrap(), Some(1.0));
    let _ = std::fs::remove_dir_all(&dir);
}
