//! Newline-framed serial transport.
//!
//! Wraps any async byte stream (a `tokio_serial::SerialStream` in production, a
//! `tokio::io::DuplexStream` in tests) and exposes the [`LineTransport`]
//! capability. The stream is split into read and write halves behind separate
//! locks so the background reader can block on `read_line` while command
//! senders write.
//!
//! # Example
//!
//! ```rust,ignore
//! use disc_motion::hardware::serial_transport::SerialTransport;
//!
//! let transport = SerialTransport::open(&config.serial).await?;
//! transport.reset_input_buffer().await?;
//! transport.send_line("MODO:3").await?;
//! ```

use crate::config::SerialConfig;
use crate::control::stop_signal::StopSignal;
use crate::error::{AppResult, MotionError};
use crate::hardware::capabilities::LineTransport;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Trait alias for async serial port I/O.
///
/// Any `AsyncRead + AsyncWrite + Unpin + Send` type can back a transport:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// How long `reset_input_buffer` keeps draining once input goes quiet.
const DRAIN_WINDOW: Duration = Duration::from_millis(20);

struct LineReader {
    stream: Option<BufReader<ReadHalf<DynSerial>>>,
    /// Bytes of a line not yet terminated. Survives read timeouts.
    pending: Vec<u8>,
}

/// Line transport over a serial stream.
pub struct SerialTransport {
    label: String,
    reader: Mutex<LineReader>,
    writer: Mutex<Option<WriteHalf<DynSerial>>>,
    write_timeout: Duration,
    closed: StopSignal,
}

impl SerialTransport {
    /// Wrap an already-open stream.
    pub fn new(port: DynSerial, label: impl Into<String>, write_timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(port);
        Self {
            label: label.into(),
            reader: Mutex::new(LineReader {
                stream: Some(BufReader::new(read_half)),
                pending: Vec::with_capacity(64),
            }),
            writer: Mutex::new(Some(write_half)),
            write_timeout,
            closed: StopSignal::new(),
        }
    }

    /// Wrap any concrete stream (duplex, TCP bridge, ...).
    pub fn from_stream<S: SerialPortIO + 'static>(
        stream: S,
        label: impl Into<String>,
        write_timeout: Duration,
    ) -> Self {
        Self::new(Box::new(stream), label, write_timeout)
    }

    /// Open the configured serial port (8 data bits, no parity, 1 or 2 stop bits).
    pub async fn open(config: &SerialConfig) -> AppResult<Self> {
        let stream = open_serial_async(config).await?;
        debug!(
            port = %config.port,
            baud = config.baud_rate,
            stop_bits = config.stop_bits,
            "Serial port opened"
        );
        Ok(Self::from_stream(
            stream,
            config.port.clone(),
            config.write_timeout,
        ))
    }

    /// Port label used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_set()
    }
}

#[async_trait]
impl LineTransport for SerialTransport {
    async fn send_line(&self, text: &str) -> AppResult<()> {
        if self.closed.is_set() {
            return Err(MotionError::TransportClosed);
        }
        let mut line = text.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(MotionError::TransportClosed)?;

        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => {
                result?;
                trace!(port = %self.label, line = %line.trim_end(), "tx");
                Ok(())
            }
            Err(_) => Err(MotionError::WriteTimeout(self.write_timeout)),
        }
    }

    async fn read_line(&self, timeout: Duration) -> AppResult<Option<String>> {
        if self.closed.is_set() {
            return Err(MotionError::TransportClosed);
        }
        let mut guard = self.reader.lock().await;
        let LineReader { stream, pending } = &mut *guard;
        let stream = stream.as_mut().ok_or(MotionError::TransportClosed)?;

        let read = tokio::select! {
            () = self.closed.cancelled() => return Err(MotionError::TransportClosed),
            read = tokio::time::timeout(timeout, stream.read_until(b'\n', pending)) => read,
        };

        match read {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(MotionError::SerialUnexpectedEof),
            Ok(Ok(_)) => {
                let line = String::from_utf8_lossy(pending)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                pending.clear();
                trace!(port = %self.label, line = %line, "rx");
                Ok(Some(line))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn reset_input_buffer(&self) -> AppResult<()> {
        let mut guard = self.reader.lock().await;
        let LineReader { stream, pending } = &mut *guard;
        pending.clear();
        if let Some(stream) = stream.as_mut() {
            let discarded = drain_serial_buffer(stream, DRAIN_WINDOW).await;
            if discarded > 0 {
                debug!(port = %self.label, discarded, "Discarded stale input");
            }
        }
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        if self.closed.is_set() {
            return Ok(());
        }
        self.closed.set();

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = tokio::time::timeout(self.write_timeout, writer.shutdown()).await;
        }
        self.reader.lock().await.stream.take();
        debug!(port = %self.label, "Serial transport closed");
        Ok(())
    }
}

/// Open a serial port on a blocking thread.
async fn open_serial_async(config: &SerialConfig) -> AppResult<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let port = config.port.clone();
    let baud_rate = config.baud_rate;
    let read_timeout = config.read_timeout;
    let stop_bits = match config.stop_bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => {
            return Err(MotionError::Configuration(format!(
                "serial.stop_bits must be 1 or 2, got {other}"
            )))
        }
    };

    tokio::task::spawn_blocking(move || {
        tokio_serial::new(&port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(read_timeout)
            .open_native_async()
            .map_err(|e| MotionError::SerialOpen {
                port: port.clone(),
                message: e.to_string(),
            })
    })
    .await?
}

/// Names of the serial ports present on this machine.
pub fn available_ports() -> AppResult<Vec<String>> {
    let ports = serialport::available_ports().map_err(std::io::Error::from)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Read and discard until no more data arrives within `window`.
///
/// Returns the number of bytes discarded.
async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let mut total_discarded = 0usize;

    loop {
        match tokio::time::timeout(window, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break, // quiet
        }
    }

    total_discarded
}
