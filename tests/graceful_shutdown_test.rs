//! Daemon shutdown: the stop signal closes the listener, the instruments and the
//! loggers, and returns promptly even with clients still attached.

use std::time::{Duration, Instant};

use rust_hkd::app::Daemon;
use rust_hkd::config::{HardwareConfig, Settings};
use rust_hkd::data::SyncFrameConfig;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const HARDWARE: &str = r#"[
  {"type": "sim_heater", "wait_time": 0.01, "channels": [{"name": "H_still"}]}
]"#;

fn settings(dir: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.storage.data_dir = dir.path().to_path_buf();
    settings.command_server.port = 0;
    settings.sync_frames = Some(SyncFrameConfig::default());
    settings
}

#[tokio::test]
async fn test_daemon_stops_promptly() {
    let dir = TempDir::new().expect("tempdir");
    let hardware = HardwareConfig::from_json_str(HARDWARE).expect("hardware");
    let daemon = Daemon::start(settings(&dir), hardware).await.expect("daemon");
    let addr = daemon.command_addr().expect("addr");

    let started = Instant::now();
    timeout(
        Duration::from_secs(5),
        daemon.run_until(sleep(Duration::from_millis(200))),
    )
    .await
    .expect("shutdown in time")
    .expect("clean shutdown");
    assert!(started.elapsed() < Duration::from_secs(3));

    assert!(TcpStream::connect(addr).await.is_err(), "listener still open");
    assert!(dir.path().join("syncframes").is_dir());
}

#[tokio::test]
async fn test_attached_client_does_not_block_shutdown() {
    let dir = TempDir::new().expect("tempdir");
    let hardware = HardwareConfig::from_json_str(HARDWARE).expect("hardware");
    let daemon = Daemon::start(settings(&dir), hardware).await.expect("daemon");
    let addr = daemon.command_addr().expect("addr");

    let running = tokio::spawn(daemon.run_until(async {
        sleep(Duration::from_millis(300)).await;
    }));
    let _client = TcpStream::connect(addr).await.expect("connect");

    timeout(Duration::from_secs(5), running)
        .await
        .expect("shutdown in time")
        .expect("join")
        .expect("clean shutdown");
}
