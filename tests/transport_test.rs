//! Framed transport behaviour against in-memory links.

use std::sync::Arc;
use std::time::Duration;

use rust_hkd::hardware::{
    Frame, FrameChannel, FramedTransport, FramingConfig, GpibAddress, GpibBus, MockLinkOpener,
    ResponseHandler, TransportTiming,
};
use tokio::io::{split, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn fast_timing() -> TransportTiming {
    TransportTiming {
        read_timeout: Duration::from_millis(5),
        packet_timeout: Duration::from_millis(200),
        reconnect_interval: Duration::from_millis(20),
        rx_pause: Duration::from_millis(1),
        tx_pause: Duration::from_millis(1),
        ask_timeout: Duration::from_millis(200),
        ..TransportTiming::default()
    }
}

/// Transport whose unsolicited frames land in the returned receiver.
fn spawn_transport(
    opener: Arc<MockLinkOpener>,
    framing: FramingConfig,
) -> (FramedTransport, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = FramedTransport::spawn(
        opener,
        framing,
        fast_timing(),
        Arc::new(move |frame: Frame| {
            let _ = tx.send(frame);
        }),
    )
    .expect("transport");
    (transport, rx)
}

fn reply_to(tx: &mpsc::UnboundedSender<(usize, String)>, index: usize) -> ResponseHandler {
    let tx = tx.clone();
    Box::new(move |frame: Frame| {
        let text = frame.as_text().unwrap_or_default().to_string();
        let _ = tx.send((index, text));
    })
}

async fn wait_connected(transport: &FramedTransport) {
    timeout(Duration::from_secs(2), async {
        while !transport.is_connected() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("transport never connected");
}

#[tokio::test]
async fn test_framing_round_trip_through_both_paths() {
    let cases: Vec<FramingConfig> = vec![
        FramingConfig::text("\n"),
        FramingConfig::text("\r\n"),
        FramingConfig::text("»").with_start("«".as_bytes()),
        FramingConfig::text("END").with_start(b"<<"),
    ];

    for framing in cases {
        let opener = Arc::new(MockLinkOpener::new("mock"));
        let mut device = opener.connect_device();
        let (transport, mut frames) = spawn_transport(opener.clone(), framing.clone());
        wait_connected(&transport).await;

        let payload = "KRDG? 0 ±0.5 K";
        device
            .write_all(&framing.encode(payload.as_bytes()))
            .await
            .expect("device write");
        let frame = timeout(Duration::from_secs(1), frames.recv())
            .await
            .expect("frame in time")
            .expect("frame");
        assert_eq!(frame.as_text(), Some(payload), "framing {:?}", framing);

        transport.send(payload.as_bytes().to_vec(), None);
        let expected = framing.encode(payload.as_bytes());
        let mut wire = vec![0u8; expected.len()];
        timeout(Duration::from_secs(1), device.read_exact(&mut wire))
            .await
            .expect("wire in time")
            .expect("device read");
        assert_eq!(wire, expected);

        transport.close().await;
    }
}

#[tokio::test]
async fn test_start_marker_discards_leading_noise() {
    let opener = Arc::new(MockLinkOpener::new("mock"));
    let mut device = opener.connect_device();
    let framing = FramingConfig::text("\n").with_start(b"$");
    let (transport, mut frames) = spawn_transport(opener.clone(), framing);
    wait_connected(&transport).await;

    device.write_all(b"garbage$T=4.2\n").await.expect("write");
    let frame = timeout(Duration::from_secs(1), frames.recv())
        .await
        .expect("frame in time")
        .expect("frame");
    assert_eq!(frame.as_text(), Some("T=4.2"));
    transport.close().await;
}

/// Play a device that answers each `Q<n>` line with `A<n>` and ignores the rest.
async fn echo_device(device: DuplexStream) {
    let (read, mut write) = split(device);
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(n) = line.strip_prefix('Q') {
            if write.write_all(format!("A{}\n", n).as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

#[tokio::test]
async fn test_asks_answered_in_order_between_plain_frames() {
    let opener = Arc::new(MockLinkOpener::new("mock"));
    let device = opener.connect_device();
    let (transport, mut unsolicited) = spawn_transport(opener.clone(), FramingConfig::text("\n"));
    tokio::spawn(echo_device(device));
    wait_connected(&transport).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for i in 1..=5 {
        transport.send(format!("Q{}", i).into_bytes(), Some(reply_to(&tx, i)));
        transport.send(format!("P{}", i).into_bytes(), None);
    }

    let mut answers = Vec::new();
    for _ in 1..=5 {
        let answer = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("answer in time")
            .expect("answer");
        answers.push(answer);
    }
    let expected: Vec<(usize, String)> = (1..=5).map(|i| (i, format!("A{}", i))).collect();
    assert_eq!(answers, expected);
    assert!(unsolicited.try_recv().is_err());

    transport.close().await;
}

#[tokio::test]
async fn test_ask_timeout_frees_the_slot() {
    let opener = Arc::new(MockLinkOpener::new("mock"));
    let device = opener.connect_device();
    let (transport, _unsolicited) = spawn_transport(opener.clone(), FramingConfig::text("\n"));
    wait_connected(&transport).await;

    let (read, mut write) = split(device);
    let mut lines = BufReader::new(read).lines();

    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.send(b"silent?".to_vec(), Some(reply_to(&tx, 1)));
    let first = timeout(Duration::from_secs(1), lines.next_line())
        .await
        .expect("first ask in time")
        .expect("read");
    assert_eq!(first.as_deref(), Some("silent?"));
    assert!(transport.ask_pending());

    // Unanswered; the transport gives up after ask_timeout.
    sleep(Duration::from_millis(400)).await;
    assert!(!transport.ask_pending());

    transport.send(b"Q2".to_vec(), Some(reply_to(&tx, 2)));
    let second = timeout(Duration::from_secs(1), lines.next_line())
        .await
        .expect("second ask in time")
        .expect("read");
    assert_eq!(second.as_deref(), Some("Q2"));
    write.write_all(b"A2\n").await.expect("answer");

    let answer = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("answer in time")
        .expect("answer");
    assert_eq!(answer, (2, "A2".to_string()));
    assert!(rx.try_recv().is_err());

    transport.close().await;
}

#[tokio::test]
async fn test_reconnects_after_link_loss() {
    let opener = Arc::new(MockLinkOpener::new("mock"));
    let device = opener.connect_device();
    let (transport, mut frames) = spawn_transport(opener.clone(), FramingConfig::text("\n"));
    wait_connected(&transport).await;
    assert_eq!(opener.open_count(), 1);

    let mut replacement = opener.connect_device();
    drop(device);

    timeout(Duration::from_secs(2), async {
        while opener.open_count() < 2 || !transport.is_connected() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reconnect in time");

    replacement.write_all(b"back\n").await.expect("write");
    let frame = timeout(Duration::from_secs(1), frames.recv())
        .await
        .expect("frame in time")
        .expect("frame");
    assert_eq!(frame.as_text(), Some("back"));

    transport.close().await;
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_handler_panic_does_not_stop_dispatch() {
    let opener = Arc::new(MockLinkOpener::new("mock"));
    let device = opener.connect_device();
    let (transport, _unsolicited) = spawn_transport(opener.clone(), FramingConfig::text("\n"));
    tokio::spawn(echo_device(device));
    wait_connected(&transport).await;

    transport.send(b"Q1".to_vec(), Some(Box::new(|_: Frame| panic!("handler bug"))));
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.send(b"Q2".to_vec(), Some(reply_to(&tx, 2)));

    let answer = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("answer in time")
        .expect("answer");
    assert_eq!(answer, (2, "A2".to_string()));
    transport.close().await;
}

#[tokio::test]
async fn test_gpib_frames_carry_their_address() {
    let opener = Arc::new(MockLinkOpener::new("prologix"));
    let device = opener.connect_device();
    let (transport, _unsolicited) = spawn_transport(opener.clone(), FramingConfig::text("\n"));
    let bus = GpibBus::new(Arc::new(transport));
    wait_connected(bus.transport()).await;

    let lakeshore = bus.device(GpibAddress::new(12).expect("address"));
    let meter = bus.device(GpibAddress::new(5).expect("address"));
    lakeshore.prepare();
    lakeshore.send_frame(b"KRDG? 0", None);
    meter.send_frame(b"*CLS", None);

    let (read, _write) = split(device);
    let mut lines = BufReader::new(read).lines();
    let mut seen = Vec::new();
    for _ in 0..6 {
        let line = timeout(Duration::from_secs(1), lines.next_line())
            .await
            .expect("line in time")
            .expect("read")
            .expect("line");
        seen.push(line);
    }
    assert_eq!(
        seen,
        vec!["++mode 1", "++auto 1", "++addr 12", "KRDG? 0", "++addr 5", "*CLS"]
    );
    assert!(lakeshore.describe().contains("GPIB 12"));

    bus.transport().close().await;
}
