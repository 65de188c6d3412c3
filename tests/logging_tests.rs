use std::fs;
use tempfile::tempdir;

use rpmforge::init_global_logger;

/// The global logger can only be installed once per process, so everything
/// runs in this single test.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_global_logger_full_cycle() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let collector = init_global_logger(temp_dir.path().join("logs"), log::LevelFilter::Info)
        .expect("Failed to install logger");
    assert!(collector.log_path().starts_with(temp_dir.path()));

    log::info!("[Test] from the runtime");
    log::debug!("[Test] below the level");
    tokio::task::spawn_blocking(|| log::warn!("[Test] from a blocking worker"))
        .await
        .unwrap();
    let threads: Vec<_> = (0..4)
        .map(|i| std::thread::spawn(move || log::info!("[Test] from thread {}", i)))
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    collector.wait_for_empty().await.expect("flush");
    let content = fs::read_to_string(collector.log_path()).expect("log file");
    assert!(content.contains("[INFO] [Test] from the runtime"));
    assert!(content.contains("[WARN] [Test] from a blocking worker"));
    for i in 0..4 {
        assert!(content.contains(&format!("[Test] from thread {}", i)));
    }
    assert!(!content.contains("below the level"));

    let second = init_global_logger(temp_dir.path().join("other"), log::LevelFilter::Info);
    assert!(second.is_err());
}
