//! Lakeshore 336 polled through a GPIB controller on an in-memory link.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_hkd::calibration::CalibrationRegistry;
use rust_hkd::data::{LogRecord, LogValue, Logger};
use rust_hkd::error::AppResult;
use rust_hkd::hardware::{
    Frame, FrameChannel, FramedTransport, FramingConfig, GpibAddress, GpibBus, MockLinkOpener,
    TransportTiming,
};
use rust_hkd::instrument::{BuildContext, Instrument, Lakeshore336, Ls336Config, ScpiTiming};
use rust_hkd::sensor::{TargetKind, TargetRegistry};
use tokio::io::{split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

#[derive(Default)]
struct Capture {
    values: Mutex<HashMap<String, f64>>,
}

impl Capture {
    fn get(&self, name: &str) -> Option<f64> {
        self.values.lock().expect("lock").get(name).copied()
    }
}

impl Logger for Capture {
    fn log(&self, record: &LogRecord<'_>) -> AppResult<()> {
        if let LogValue::Number(value) = record.value {
            let key = format!("{}/{}", record.name, record.sensor_type);
            self.values.lock().expect("lock").insert(key, value);
        }
        Ok(())
    }
}

/// Answer the queries a 336 gets; every line received is forwarded to `seen`.
async fn controller(device: DuplexStream, seen: mpsc::UnboundedSender<String>) {
    let (read, mut write) = split(device);
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let answer = match line.as_str() {
            "*IDN?" => Some("LSCI,MODEL336,LSA1234/#######,2.9"),
            "KRDG? 0" => Some("+0.0120,+0.8000,+4.2000,+51.000"),
            "MOUT? 1" => Some("12.5"),
            "MOUT? 2" => Some("0.0"),
            "RANGE? 1" => Some("3"),
            "RANGE? 2" => Some("0"),
            _ => None,
        };
        let _ = seen.send(line);
        if let Some(answer) = answer {
            if write.write_all(format!("{}\r\n", answer).as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

fn config() -> Ls336Config {
    serde_json::from_value(serde_json::json!({
        "port": "/dev/ttyUSB-prologix",
        "gpib_address": 12,
        "wait_time": 0.02,
        "channels": [
            {"name": "T_mc"}, {"name": "T_still", "calib_func": "double"}, {"name": "T_4k"},
            {"name": "T_50k"}, {"name": "H_sorb"}, {"name": "H_switch"}
        ]
    }))
    .expect("config")
}

fn context() -> BuildContext {
    let mut calibrations = CalibrationRegistry::new();
    calibrations.register("double", Arc::new(|raw: f64| raw * 2.0));
    BuildContext::new(
        None,
        fast_timing(),
        ScpiTiming {
            reconfig_pause: Duration::from_millis(10),
            ..ScpiTiming::default()
        },
        calibrations,
    )
}

fn fast_timing() -> TransportTiming {
    TransportTiming {
        read_timeout: Duration::from_millis(5),
        reconnect_interval: Duration::from_millis(20),
        rx_pause: Duration::from_millis(1),
        tx_pause: Duration::from_millis(1),
        ask_timeout: Duration::from_millis(500),
        ..TransportTiming::default()
    }
}

/// Run the instrument's update loop until `done` holds or two seconds pass.
async fn drive(
    ls: &mut Lakeshore336,
    targets: &mut TargetRegistry,
    mut done: impl FnMut(&mut TargetRegistry) -> bool,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        ls.update(targets);
        if done(targets) {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_lakeshore_over_gpib() {
    let opener = Arc::new(MockLinkOpener::new("prologix"));
    let device = opener.connect_device();
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    tokio::spawn(controller(device, seen_tx));

    let transport = Arc::new(
        FramedTransport::spawn(
            opener,
            FramingConfig::text("\n"),
            fast_timing(),
            Arc::new(|_: Frame| {}),
        )
        .expect("transport"),
    );
    let bus = GpibBus::new(transport.clone());
    let channel: Arc<dyn FrameChannel> =
        Arc::new(bus.device(GpibAddress::new(12).expect("address")));

    let mut ls = Lakeshore336::with_channel(&config(), channel, &context()).expect("ls336");
    let capture = Arc::new(Capture::default());
    ls.add_logger(capture.clone());
    let mut targets = TargetRegistry::new();
    ls.connect_targets(&mut targets).expect("targets");
    assert!(targets.lookup(TargetKind::State, "H_sorb").is_some());

    let polled = drive(&mut ls, &mut targets, |_| {
        capture.get("T_50k/temperature").is_some() && capture.get("H_switch/state").is_some()
    })
    .await;
    assert!(polled, "no readings arrived");
    assert_eq!(capture.get("T_mc/temperature"), Some(0.012));
    assert_eq!(capture.get("T_still/temperature"), Some(1.6));
    assert_eq!(capture.get("H_sorb/percentage"), Some(12.5));
    assert_eq!(capture.get("H_sorb/state"), Some(3.0));

    assert!(targets.set_target(TargetKind::Percentage, "H_switch", 37.5));
    let cleared = drive(&mut ls, &mut targets, |targets| {
        targets
            .find_mut(TargetKind::Percentage, "H_switch")
            .is_some_and(|s| s.value().is_nan())
    })
    .await;
    assert!(cleared, "percentage target never sent");

    let found = timeout(Duration::from_secs(1), async {
        while let Some(line) = seen.recv().await {
            if line == "MOUT 2 37.5" {
                return true;
            }
        }
        false
    })
    .await;
    assert!(matches!(found, Ok(true)), "MOUT 2 37.5 never reached the controller");

    ls.close().await.expect("close");
    transport.close().await;
}
