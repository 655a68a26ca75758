//! Integration tests for the stepper protocol client over an in-memory link
//!
//! The device end of a `tokio::io::duplex` pair plays the firmware: it reads the
//! command lines the client writes and answers with ACK and STAT lines.

use disc_motion::config::AppConfig;
use disc_motion::hardware::mock::MockGpioLine;
use disc_motion::hardware::{
    Command, GpioLine, LineValue, MotorMode, MoveRequest, SerialTransport, StepperDevice,
    StepperDriver,
};
use disc_motion::MotionError;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.driver.ack_timeout = Duration::from_millis(100);
    config
}

async fn start_driver(
    config: &AppConfig,
    enable: Option<MockGpioLine>,
) -> (StepperDriver, DuplexStream) {
    let (host, device) = tokio::io::duplex(4096);
    let transport = Arc::new(SerialTransport::from_stream(
        host,
        "duplex",
        config.serial.write_timeout,
    ));
    let driver = StepperDriver::start(
        transport,
        enable.map(|line| Box::new(line) as Box<dyn GpioLine>),
        config,
    )
    .await
    .unwrap();
    (driver, device)
}

// =============================================================================
// ACK correlation
// =============================================================================

#[tokio::test]
async fn oldest_unconsumed_ack_is_delivered() {
    let (driver, mut device) = start_driver(&test_config(), None).await;

    driver.send_command(Command::SetMode(MotorMode::Positional)).await.unwrap();
    driver.send_command(Command::SetValue(90.0)).await.unwrap();
    device.write_all(b"ACK:0:A\nACK:0:B\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let first = driver.wait_ack(None).await.unwrap().expect("first ACK");
    assert_eq!(first.echo, "A");

    // B arrived while A was still pending and was dropped
    let second = driver.wait_ack(Some(Duration::from_millis(100))).await.unwrap();
    assert!(second.is_none());

    driver.close().await.unwrap();
}

#[tokio::test]
async fn ack_timeout_is_not_an_error() {
    let (driver, _device) = start_driver(&test_config(), None).await;
    assert!(!driver.set_mode(MotorMode::ContinuousHz).await.unwrap());
    driver.close().await.unwrap();
}

#[tokio::test]
async fn reader_exit_turns_ack_wait_into_error() {
    let (driver, device) = start_driver(&test_config(), None).await;
    drop(device);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(
        driver.wait_ack(Some(Duration::from_millis(100))).await,
        Err(MotionError::TransportClosed)
    ));
    driver.close().await.unwrap();
}

// =============================================================================
// Stop retries
// =============================================================================

/// Reads `count` command lines, answering only those whose index is in `answer`.
fn scripted_device(
    device: DuplexStream,
    count: usize,
    answer: &'static [usize],
) -> tokio::task::JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let (rd, mut wr) = tokio::io::split(device);
        let mut lines = BufReader::new(rd).lines();
        let mut seen = Vec::new();
        for index in 0..count {
            let line = lines.next_line().await.unwrap().unwrap();
            if answer.contains(&index) {
                wr.write_all(b"ACK:3:0\n").await.unwrap();
            }
            seen.push(line);
        }
        seen
    })
}

#[tokio::test]
async fn stop_retries_until_acknowledged() {
    let (driver, device) = start_driver(&test_config(), None).await;
    let responder = scripted_device(device, 4, &[2]);

    assert!(driver.stop().await.unwrap());
    assert_eq!(
        responder.await.unwrap(),
        vec!["STOP:0", "MODO:3", "STOP:0", "MODO:3"]
    );
    driver.close().await.unwrap();
}

#[tokio::test]
async fn stop_gives_up_after_configured_attempts() {
    let mut config = test_config();
    config.driver.stop_attempts = 2;
    let (driver, device) = start_driver(&config, None).await;
    let responder = scripted_device(device, 4, &[]);

    assert!(!driver.stop().await.unwrap());
    assert_eq!(responder.await.unwrap().len(), 4);
    driver.close().await.unwrap();
}

// =============================================================================
// Settle detection
// =============================================================================

#[tokio::test(start_paused = true)]
async fn settles_after_two_quiet_samples() {
    let (driver, mut device) = start_driver(&test_config(), None).await;
    device.write_all(b"STAT:0:5.0\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Telemetry lands between polls (polls at 0, 100, 200 ms)
    let emitter = tokio::spawn(async move {
        for (delay, frame) in [
            (50, "STAT:90:0.005\n"),
            (100, "STAT:90:0.003\n"),
            (100, "STAT:91:2.0\n"),
        ] {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            device.write_all(frame.as_bytes()).await.unwrap();
        }
        device
    });

    let started = tokio::time::Instant::now();
    assert!(driver
        .wait_settled(Some(Duration::from_secs(2)), None)
        .await
        .unwrap());
    assert!(started.elapsed() < Duration::from_millis(250));
    assert!(driver.status().rpm < 0.01);

    let _device = emitter.await.unwrap();
    driver.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn settle_wait_times_out_while_moving() {
    let (driver, mut device) = start_driver(&test_config(), None).await;
    device.write_all(b"STAT:0:120.0\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(!driver
        .wait_settled(Some(Duration::from_millis(500)), None)
        .await
        .unwrap());
    driver.close().await.unwrap();
}

#[tokio::test]
async fn move_without_wait_returns_after_acks() {
    let (driver, device) = start_driver(&test_config(), None).await;
    let (rd, mut wr) = tokio::io::split(device);
    let responder = tokio::spawn(async move {
        let mut lines = BufReader::new(rd).lines();
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(lines.next_line().await.unwrap().unwrap());
            wr.write_all(b"ACK:0:ok\n").await.unwrap();
        }
        seen
    });

    let request = MoveRequest::new(720.0).with_velocity(800.0);
    assert!(driver.move_degrees(request).await.unwrap());
    assert_eq!(responder.await.unwrap(), vec!["MODO:0", "VEL:800", "SET:720"]);
    driver.close().await.unwrap();
}

// =============================================================================
// ENABLE line lifecycle
// =============================================================================

#[tokio::test]
async fn close_twice_keeps_driver_disabled() {
    let line = MockGpioLine::new();
    let probe = line.clone();
    let (driver, _device) = start_driver(&test_config(), Some(line)).await;

    driver.enable_driver(true).unwrap();
    driver.close().await.unwrap();
    driver.close().await.unwrap();

    assert!(driver.is_closed());
    assert_eq!(probe.level(), Some(LineValue::Active));
    assert_eq!(probe.release_count(), 1);
}

#[tokio::test]
async fn active_high_enable_polarity() {
    let mut config = test_config();
    config.driver.enable_active_high = true;
    let line = MockGpioLine::new();
    let probe = line.clone();
    let (driver, _device) = start_driver(&config, Some(line)).await;

    assert_eq!(probe.writes(), vec![LineValue::Inactive]);
    driver.enable_driver(true).unwrap();
    assert_eq!(probe.level(), Some(LineValue::Active));

    driver.close().await.unwrap();
    assert_eq!(probe.level(), Some(LineValue::Inactive));
}

#[tokio::test]
async fn dropping_an_open_driver_disables_it() {
    let line = MockGpioLine::new();
    let probe = line.clone();
    let (driver, _device) = start_driver(&test_config(), Some(line)).await;

    driver.enable_driver(true).unwrap();
    drop(driver);

    assert_eq!(probe.level(), Some(LineValue::Active));
    assert_eq!(probe.release_count(), 1);
}

// =============================================================================
// Encoder counter
// =============================================================================

#[tokio::test]
async fn encoder_get_exchange() {
    use disc_motion::config::EncoderConfig;
    use disc_motion::hardware::encoder::{EncoderDirection, EncoderReader};

    let (host, device) = tokio::io::duplex(1024);
    let transport = Arc::new(SerialTransport::from_stream(
        host,
        "encoder",
        Duration::from_millis(200),
    ));
    let (rd, mut wr) = tokio::io::split(device);
    let counter = tokio::spawn(async move {
        let mut lines = BufReader::new(rd).lines();
        for reply in ["RPM: 12.5 | COUNTER: 40 | Dirección: CW\r\n", "COU:46 | Dir:CCW\r\n"] {
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "GET");
            wr.write_all(reply.as_bytes()).await.unwrap();
        }
    });

    let mut reader = EncoderReader::new(
        transport,
        &EncoderConfig::default(),
        Duration::from_millis(200),
    );
    let first = reader.read().await.unwrap().unwrap();
    assert_eq!(first.rpm, 12.5);
    assert_eq!(first.counter, 40);

    let second = reader.read().await.unwrap().unwrap();
    assert_eq!(second.counter, 46);
    assert_eq!(second.direction, EncoderDirection::Ccw);
    // (6 / 600) * (60 / 0.005) * 2
    assert!((second.rpm - 240.0).abs() < 1e-9);

    counter.await.unwrap();
}
