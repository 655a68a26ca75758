//! Stepper controller protocol client.
//!
//! Turns a [`LineTransport`] into the stateful device API used by the control
//! loops. One background task reads the link continuously and sorts every line
//! into telemetry (stored as the latest sample), acknowledgements (handed to the
//! waiting sender) or noise (dropped).
//!
//! ## ACK correlation
//!
//! Acknowledgements go through a single-slot channel. An ACK that arrives before
//! anyone waits stays in the slot for the next waiter. If the slot is already
//! occupied the newer ACK is dropped, so the oldest unconsumed ACK is always the
//! one delivered.
//!
//! ## Lifecycle
//!
//! The ENABLE line (if any) is driven to "disabled" as soon as the client starts.
//! [`StepperDriver::close`] disables the driver, stops the reader, closes the
//! transport and releases the line. It is idempotent.
//!
//! # Example
//!
//! ```rust,ignore
//! let driver = StepperDriver::open(&config).await?;
//! driver.enable_driver(true)?;
//! driver.move_degrees(MoveRequest::new(720.0).with_velocity(800.0).wait_settled(None)).await?;
//! driver.stop().await?;
//! driver.close().await?;
//! ```

use crate::config::{AppConfig, DriverConfig, SettleConfig};
use crate::control::settle::SettleDetector;
use crate::control::stop_signal::StopSignal;
use crate::error::{AppResult, MotionError};
use crate::hardware::capabilities::{
    GpioLine, LineTransport, MoveRequest, StepperDevice, TelemetrySample,
};
use crate::hardware::gpio::{enable_line_level, open_enable_line};
use crate::hardware::protocol::{classify_line, Ack, Command, DeviceLine, MotorMode};
use crate::hardware::serial_transport::SerialTransport;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

/// How long `close` waits for the reader task before aborting it.
const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// State written by the reader task and read by everyone else.
struct Shared {
    latest: RwLock<TelemetrySample>,
    last_mode: Mutex<Option<String>>,
}

/// Protocol client for the disc stepper controller.
pub struct StepperDriver {
    transport: Arc<dyn LineTransport>,
    shared: Arc<Shared>,
    /// Single-slot ACK receiver. Holding the lock serializes command exchanges.
    ack_rx: tokio::sync::Mutex<mpsc::Receiver<Ack>>,
    enable_line: Mutex<Option<Box<dyn GpioLine>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    reader_stop: StopSignal,
    closed: AtomicBool,
    driver: DriverConfig,
    settle: SettleConfig,
}

impl StepperDriver {
    /// Open the configured serial port and ENABLE line, then start the client.
    pub async fn open(config: &AppConfig) -> AppResult<Self> {
        let transport: Arc<dyn LineTransport> =
            Arc::new(SerialTransport::open(&config.serial).await?);

        let enable_line = match config.driver.enable_pin {
            Some(pin) => match open_enable_line(pin) {
                Ok(line) => Some(line),
                Err(e) => {
                    let _ = transport.close().await;
                    return Err(e);
                }
            },
            None => None,
        };

        Self::start(transport, enable_line, config).await
    }

    /// Start the client on an existing transport.
    ///
    /// Discards stale input, spawns the reader task and drives the ENABLE line
    /// to "disabled". On failure everything acquired so far is released.
    pub async fn start(
        transport: Arc<dyn LineTransport>,
        enable_line: Option<Box<dyn GpioLine>>,
        config: &AppConfig,
    ) -> AppResult<Self> {
        if let Err(e) = transport.reset_input_buffer().await {
            let _ = transport.close().await;
            if let Some(mut line) = enable_line {
                let _ = line.release();
            }
            return Err(e);
        }

        let shared = Arc::new(Shared {
            latest: RwLock::new(TelemetrySample::default()),
            last_mode: Mutex::new(None),
        });
        let (ack_tx, ack_rx) = mpsc::channel(1);
        let reader_stop = StopSignal::new();

        let handle = tokio::spawn(reader_loop(
            transport.clone(),
            shared.clone(),
            ack_tx,
            reader_stop.clone(),
            config.serial.read_timeout,
            config.driver.reader_backoff,
        ));

        let driver = Self {
            transport,
            shared,
            ack_rx: tokio::sync::Mutex::new(ack_rx),
            enable_line: Mutex::new(enable_line),
            reader: Mutex::new(Some(handle)),
            reader_stop,
            closed: AtomicBool::new(false),
            driver: config.driver.clone(),
            settle: config.settle.clone(),
        };

        if let Err(e) = driver.enable_driver(false) {
            let _ = driver.close().await;
            return Err(e);
        }
        Ok(driver)
    }

    /// Write one command without waiting for its ACK.
    pub async fn send_command(&self, command: Command) -> AppResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MotionError::TransportClosed);
        }
        self.transport.send_line(&command.encode()).await
    }

    /// Take the pending ACK, waiting up to `timeout` (driver default if `None`).
    ///
    /// Returns `Ok(None)` on timeout. Fails once the reader has exited.
    pub async fn wait_ack(&self, timeout: Option<Duration>) -> AppResult<Option<Ack>> {
        let mut ack_rx = self.ack_rx.lock().await;
        recv_ack(&mut ack_rx, timeout.unwrap_or(self.driver.ack_timeout)).await
    }

    /// One command/ACK exchange.
    async fn exchange(&self, command: Command) -> AppResult<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MotionError::TransportClosed);
        }
        let mut ack_rx = self.ack_rx.lock().await;
        self.transport.send_line(&command.encode()).await?;

        match recv_ack(&mut ack_rx, self.driver.ack_timeout).await? {
            Some(ack) => {
                trace!(command = %command, ack_mode = %ack.mode, ack_echo = %ack.echo, "ACK");
                Ok(true)
            }
            None => {
                warn!(command = %command, timeout = ?self.driver.ack_timeout, "No ACK from device");
                Ok(false)
            }
        }
    }

    /// Poll telemetry until the settle detector fires.
    ///
    /// Returns `Ok(false)` if `timeout` elapses or `stop` is set first.
    pub async fn wait_settled(
        &self,
        timeout: Option<Duration>,
        stop: Option<&StopSignal>,
    ) -> AppResult<bool> {
        let mut detector = SettleDetector::from_config(&self.settle);
        let start = Instant::now();

        loop {
            let rpm = self.status().rpm;
            if detector.observe(rpm) {
                debug!(elapsed = ?start.elapsed(), "Motion settled");
                return Ok(true);
            }
            if let Some(timeout) = timeout {
                if start.elapsed() > timeout {
                    warn!(?timeout, rpm, "Motion did not settle in time");
                    return Ok(false);
                }
            }

            let stopped = match stop {
                Some(stop) => stop.sleep(self.settle.poll_interval).await,
                None => {
                    tokio::time::sleep(self.settle.poll_interval).await;
                    false
                }
            };
            if stopped {
                debug!("Settle wait cancelled");
                return Ok(false);
            }
        }
    }

    /// Mode field of the most recent ACK.
    pub fn last_acked_mode(&self) -> Option<String> {
        self.shared.last_mode.lock().clone()
    }

    /// Steps per revolution the firmware is configured with.
    pub fn steps_per_revolution(&self) -> u32 {
        self.driver.steps_per_revolution
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Disable the driver, stop the reader, close the link and release the ENABLE line.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) -> AppResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            // Already closed; make sure the line stays deasserted if still held
            let _ = self.enable_driver(false);
            return Ok(());
        }

        if let Err(e) = self.enable_driver(false) {
            warn!(error = %e, "Failed to disable driver on close");
        }

        self.reader_stop.set();
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Failed to close transport");
        }

        let handle = self.reader.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut handle).await.is_err() {
                warn!("Serial reader did not stop in time, aborting");
                handle.abort();
            }
        }

        let line = self.enable_line.lock().take();
        if let Some(mut line) = line {
            line.release()?;
        }
        debug!("Stepper driver closed");
        Ok(())
    }
}

#[async_trait]
impl StepperDevice for StepperDriver {
    #[instrument(skip(self), err, level = "debug")]
    async fn set_mode(&self, mode: MotorMode) -> AppResult<bool> {
        self.exchange(Command::SetMode(mode)).await
    }

    #[instrument(skip(self), err, level = "debug")]
    async fn set_value(&self, value: f64) -> AppResult<bool> {
        self.exchange(Command::SetValue(value)).await
    }

    #[instrument(skip(self), err, level = "debug")]
    async fn set_default_velocity(&self, hz: f64) -> AppResult<bool> {
        self.exchange(Command::SetVelocity(hz)).await
    }

    #[instrument(skip(self, request), fields(angle = request.angle_deg, wait = request.wait), err)]
    async fn move_degrees(&self, request: MoveRequest) -> AppResult<bool> {
        let mut ok = self.set_mode(MotorMode::Positional).await?;
        if let Some(hz) = request.velocity_hz {
            ok &= self.set_default_velocity(hz).await?;
        }
        ok &= self.set_value(request.angle_deg).await?;

        if !ok || !request.wait {
            return Ok(ok);
        }
        self.wait_settled(request.timeout, request.stop.as_ref()).await
    }

    async fn run_rpm(&self, rpm: f64) -> AppResult<bool> {
        let mut ok = self.set_mode(MotorMode::ContinuousRpm).await?;
        ok &= self.set_value(rpm).await?;
        Ok(ok)
    }

    async fn run_hz(&self, hz: f64) -> AppResult<bool> {
        let mut ok = self.set_mode(MotorMode::ContinuousHz).await?;
        ok &= self.set_value(hz).await?;
        Ok(ok)
    }

    #[instrument(skip(self), err)]
    async fn stop(&self) -> AppResult<bool> {
        for attempt in 1..=self.driver.stop_attempts {
            let stop_acked = self.exchange(Command::Stop).await?;
            let mode_acked = self.exchange(Command::SetMode(MotorMode::Stop)).await?;
            if stop_acked || mode_acked {
                debug!(attempt, "Motor stopped");
                return Ok(true);
            }
            warn!(attempt, max = self.driver.stop_attempts, "Stop not acknowledged");
        }
        tracing::error!(
            attempts = self.driver.stop_attempts,
            "Device never acknowledged stop"
        );
        Ok(false)
    }

    fn status(&self) -> TelemetrySample {
        *self.shared.latest.read()
    }

    fn enable_driver(&self, active: bool) -> AppResult<()> {
        let mut guard = self.enable_line.lock();
        let Some(line) = guard.as_mut() else {
            return Ok(());
        };
        let level = enable_line_level(active, self.driver.enable_active_high);
        line.write(level)?;
        debug!(active, ?level, "Driver ENABLE line set");
        Ok(())
    }
}

impl Drop for StepperDriver {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reader_stop.set();
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
        if let Some(mut line) = self.enable_line.get_mut().take() {
            let _ = line.write(enable_line_level(false, self.driver.enable_active_high));
            let _ = line.release();
        }
    }
}

async fn recv_ack(ack_rx: &mut mpsc::Receiver<Ack>, timeout: Duration) -> AppResult<Option<Ack>> {
    match tokio::time::timeout(timeout, ack_rx.recv()).await {
        Ok(Some(ack)) => Ok(Some(ack)),
        // Reader has exited; no ACK can ever arrive
        Ok(None) => Err(MotionError::TransportClosed),
        Err(_) => Ok(None),
    }
}

async fn reader_loop(
    transport: Arc<dyn LineTransport>,
    shared: Arc<Shared>,
    ack_tx: mpsc::Sender<Ack>,
    stop: StopSignal,
    read_timeout: Duration,
    backoff: Duration,
) {
    debug!("Serial reader started");
    while !stop.is_set() {
        match transport.read_line(read_timeout).await {
            Ok(None) => continue,
            Ok(Some(line)) => handle_line(&shared, &ack_tx, &line),
            Err(MotionError::TransportClosed) => break,
            Err(e) if e.is_transient() => {
                debug!(error = %e, "Transient read error");
                if stop.sleep(backoff).await {
                    break;
                }
            }
            Err(e) => {
                if !stop.is_set() {
                    warn!(error = %e, "Serial reader stopping");
                }
                break;
            }
        }
    }
    debug!("Serial reader exited");
}

fn handle_line(shared: &Shared, ack_tx: &mpsc::Sender<Ack>, line: &str) {
    match classify_line(line) {
        Ok(DeviceLine::Status(frame)) => {
            *shared.latest.write() = TelemetrySample {
                pos_deg: frame.pos_deg,
                rpm: frame.rpm,
                received_at: Some(chrono::Utc::now()),
            };
        }
        Ok(DeviceLine::Ack(ack)) => {
            *shared.last_mode.lock() = Some(ack.mode.clone());
            if let Err(mpsc::error::TrySendError::Full(dropped)) = ack_tx.try_send(ack) {
                warn!(
                    ack_mode = %dropped.mode,
                    ack_echo = %dropped.echo,
                    "Dropping ACK, previous one not consumed yet"
                );
            }
        }
        Ok(DeviceLine::Noise) => trace!(line, "Ignoring line"),
        Err(e) => debug!(error = %e, "Malformed telemetry"),
    }
}
