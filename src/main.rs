//! CLI Entry Point for disc-motion
//!
//! Bench front end for the disc motor:
//! - `spin`: ramped continuous rotation, until Ctrl-C or for a fixed time
//! - `oscillate`: back-and-forth angle motion
//! - `move`: one relative positional move
//! - `status`: print telemetry samples
//! - `ports`: list serial ports
//! - `config`: print the effective configuration
//! - `encoder`: poll a legacy encoder counter
//!
//! # Usage
//!
//! ```bash
//! disc-motion spin --direction CW --rpm 300 --seconds 20
//! disc-motion --config config/disc_motion.toml oscillate --angle 30 --speed 50 --cycles 10
//! disc-motion move --angle 720 --velocity-hz 800 --timeout 10
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use disc_motion::config::AppConfig;
use disc_motion::control::ramp::Direction;
use disc_motion::hardware::encoder::EncoderReader;
use disc_motion::hardware::serial_transport::available_ports;
use disc_motion::hardware::{LineTransport, MoveRequest, SerialTransport, StepperDriver};
use disc_motion::logging;
use disc_motion::session::{MotorSession, SessionReport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "disc-motion")]
#[command(about = "Disc motor control over the stepper controller serial link", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/disc_motion.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ramped continuous rotation
    Spin {
        /// CW or CCW
        #[arg(long, default_value = "CW")]
        direction: String,

        /// Target speed in RPM
        #[arg(long)]
        rpm: f64,

        /// Stop after this many seconds (otherwise run until Ctrl-C)
        #[arg(long)]
        seconds: Option<f64>,
    },

    /// Back-and-forth angle oscillation
    Oscillate {
        /// Amplitude in degrees
        #[arg(long)]
        angle: f64,

        /// Speed as percent of the configured maximum RPM
        #[arg(long, default_value = "50")]
        speed: f64,

        /// Number of cycles (otherwise run until Ctrl-C)
        #[arg(long)]
        cycles: Option<u32>,
    },

    /// Relative positional move, waiting until it settles
    Move {
        /// Angle in degrees (sign gives direction)
        #[arg(long, allow_negative_numbers = true)]
        angle: f64,

        /// Step rate for this move
        #[arg(long)]
        velocity_hz: Option<f64>,

        /// Give up waiting for the move to settle after this many seconds
        #[arg(long)]
        timeout: Option<f64>,
    },

    /// Print telemetry samples
    Status {
        /// Number of samples
        #[arg(long, default_value = "10")]
        samples: u32,

        /// Milliseconds between samples
        #[arg(long, default_value = "200")]
        interval_ms: u64,
    },

    /// Poll a legacy encoder counter with GET
    Encoder {
        /// Number of readings
        #[arg(long, default_value = "20")]
        samples: u32,
    },

    /// List serial ports
    Ports,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Ports => {
            for port in available_ports()? {
                println!("{port}");
            }
            return Ok(());
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            return Ok(());
        }
        Commands::Encoder { samples } => return read_encoder(&config, samples).await,
        _ => {}
    }

    let driver = Arc::new(
        StepperDriver::open(&config)
            .await
            .with_context(|| format!("opening stepper controller on {}", config.serial.port))?,
    );
    let result = run(cli.command, driver.clone(), config).await;
    driver.close().await?;
    result
}

async fn run(command: Commands, driver: Arc<StepperDriver>, config: AppConfig) -> Result<()> {
    let session = MotorSession::new(driver, config);
    let stop = session.stop_signal();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping");
                stop.set();
            }
        }
    });

    match command {
        Commands::Spin {
            direction,
            rpm,
            seconds,
        } => {
            let direction: Direction = direction.parse()?;
            match seconds {
                Some(s) => session.spin_for(direction, rpm, seconds_arg("--seconds", s)?)?,
                None => session.start_spin(direction, rpm)?,
            }
            print_report(session.join().await?);
        }
        Commands::Oscillate {
            angle,
            speed,
            cycles,
        } => {
            match cycles {
                Some(n) => session.oscillate_cycles(angle, speed, n)?,
                None => session.oscillate(angle, speed)?,
            }
            print_report(session.join().await?);
        }
        Commands::Move {
            angle,
            velocity_hz,
            timeout,
        } => {
            let timeout = timeout.map(|t| seconds_arg("--timeout", t)).transpose()?;
            let mut request = MoveRequest::new(angle).wait_settled(timeout);
            if let Some(hz) = velocity_hz {
                request = request.with_velocity(hz);
            }
            let done = session.move_degrees(request).await?;
            println!("move {angle}°: {}", if done { "settled" } else { "not confirmed" });
        }
        Commands::Status {
            samples,
            interval_ms,
        } => {
            for _ in 0..samples {
                let sample = session.status();
                match sample.received_at {
                    Some(at) => println!(
                        "{}  pos {:>9.2}°  rpm {:>8.2}",
                        at.format("%H:%M:%S%.3f"),
                        sample.pos_deg,
                        sample.rpm
                    ),
                    None => println!("no telemetry yet"),
                }
                if stop.sleep(Duration::from_millis(interval_ms)).await {
                    break;
                }
            }
        }
        Commands::Ports | Commands::Config | Commands::Encoder { .. } => {}
    }
    Ok(())
}

async fn read_encoder(config: &AppConfig, samples: u32) -> Result<()> {
    let transport = Arc::new(SerialTransport::open(&config.serial).await?);
    let mut reader = EncoderReader::new(
        transport.clone(),
        &config.encoder,
        config.serial.read_timeout,
    );
    let mut ticker = tokio::time::interval(config.encoder.ts);

    for _ in 0..samples {
        ticker.tick().await;
        match reader.read().await {
            Ok(Some(reading)) => println!(
                "rpm {:>8.2}  counter {:>8}  {:?}",
                reading.rpm, reading.counter, reading.direction
            ),
            Ok(None) => println!("no answer"),
            Err(e) => warn!(error = %e, "Bad encoder line"),
        }
    }
    transport.close().await?;
    Ok(())
}

fn seconds_arg(flag: &str, seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .with_context(|| format!("{flag} must be a non-negative number of seconds, got {seconds}"))
}

fn print_report(report: Option<SessionReport>) {
    match report {
        Some(SessionReport::Spin(outcome)) => println!(
            "spin ended ({:?}) after {} ticks, {} unacknowledged, stop acknowledged: {}",
            outcome.reason, outcome.ticks, outcome.ack_failures, outcome.stop_acknowledged
        ),
        Some(SessionReport::Oscillation(run)) => println!(
            "oscillation ±{:.1}° at {:.0} Hz ran {:.2}s{}",
            run.angle_deg,
            run.speed_hz,
            run.elapsed.as_secs_f64(),
            if run.cancelled { " (cancelled)" } else { "" }
        ),
        None => println!("nothing was running"),
    }
}
