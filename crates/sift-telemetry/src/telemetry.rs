use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use fastrace::collector::{Config, ConsoleReporter, Reporter, SpanRecord};
use log::debug;
use sift_common::config::TelemetryConfig;

use crate::error::{TelemetryError, TelemetryResult};
use crate::logger::TracingLogger;

enum TelemetryStatus {
    Uninitialized,
    Initialized,
    Failed,
    Finalized,
}

static TELEMETRY_STATUS: Mutex<TelemetryStatus> = Mutex::new(TelemetryStatus::Uninitialized);

/// Installs the global logger and trace reporter.
/// This can only succeed once per process.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryResult<()> {
    let mut status = TELEMETRY_STATUS
        .lock()
        .map_err(|e| TelemetryError::internal(e.to_string()))?;

    match *status {
        TelemetryStatus::Uninitialized => {
            match init_traces(config).and_then(|()| init_logs(config)) {
                Ok(()) => {
                    debug!("telemetry initialized");
                    *status = TelemetryStatus::Initialized;
                    Ok(())
                }
                Err(e) => {
                    *status = TelemetryStatus::Failed;
                    Err(e)
                }
            }
        }
        TelemetryStatus::Initialized => {
            Err(TelemetryError::internal("telemetry already initialized"))
        }
        TelemetryStatus::Failed => Err(TelemetryError::internal(
            "telemetry failed to initialize previously",
        )),
        TelemetryStatus::Finalized => Err(TelemetryError::internal(
            "telemetry has been finalized and cannot be re-initialized",
        )),
    }
}

pub fn shutdown_telemetry() {
    debug!("shutting down telemetry");
    fastrace::flush();
    if let Ok(mut status) = TELEMETRY_STATUS.lock() {
        if let TelemetryStatus::Initialized = *status {
            *status = TelemetryStatus::Finalized;
        }
    }
}

fn init_traces(config: &TelemetryConfig) -> TelemetryResult<()> {
    if config.console_traces {
        fastrace::set_reporter(ConsoleReporter, Config::default());
    } else {
        let reporter_config = Config::default().report_interval(Duration::MAX);
        fastrace::set_reporter(NoOpReporter, reporter_config);
    }
    Ok(())
}

fn init_logs(config: &TelemetryConfig) -> TelemetryResult<()> {
    let filter = parse_log_level(&config.log_level)?;
    let primary =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
            .format(move |buf, record| {
                let level = record.level();
                let target = record.target();
                let style = buf.default_level_style(level);
                let timestamp = buf.timestamp();
                let args = record.args();
                writeln!(buf, "[{timestamp} {style}{level}{style:#} {target}] {args}")
            })
            .build();
    let logger = TracingLogger::new(primary, config.console_traces);
    let max_level = logger.filter();
    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| TelemetryError::internal(e.to_string()))?;
    log::set_max_level(max_level);
    Ok(())
}

fn parse_log_level(level: &str) -> TelemetryResult<&str> {
    match level.to_ascii_lowercase().as_str() {
        "off" | "error" | "warn" | "info" | "debug" | "trace" => Ok(level),
        _ => Err(TelemetryError::invalid(format!("log level: {level}"))),
    }
}

/// A fastrace reporter that does nothing.
pub struct NoOpReporter;

impl Reporter for NoOpReporter {
    fn report(&mut self, _spans: Vec<SpanRecord>) {}
}
