//! A `log` backend that stamps every line with the simulated time.

use lecore::time::{Instant, Timer};
use log::{LevelFilter, Log, Metadata, Record};
use std::{
    io::{self, Write},
    sync::atomic::{AtomicU32, Ordering},
};

/// Simulated time in microseconds, shared by the radio, both timers and the logger.
static CLOCK: AtomicU32 = AtomicU32::new(0);

static LOGGER: StampedLogger = StampedLogger;

/// Advances the simulated clock to `to`. The clock never goes backwards.
pub fn advance(to: Instant) {
    let now = SimTimer.now();
    if to.is_after(now) {
        CLOCK.store(to.raw_micros(), Ordering::Relaxed);
    }
}

/// Timer reading the simulated clock.
pub struct SimTimer;

impl Timer for SimTimer {
    fn now(&self) -> Instant {
        Instant::from_raw_micros(CLOCK.load(Ordering::Relaxed))
    }
}

/// Prints records to stderr, prefixed with the simulated time.
struct StampedLogger;

impl Log for StampedLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            let stderr = io::stderr();
            let mut out = stderr.lock();
            // Nothing sensible to do if stderr is gone.
            let _ = writeln!(
                out,
                "{} - {:<5} - {}",
                SimTimer.now(),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Installs the logger. `LECORE_LOG=trace` enables the scheduler's trace output.
pub fn init() {
    let level = match std::env::var("LECORE_LOG").as_deref() {
        Ok("trace") => LevelFilter::Trace,
        Ok("debug") => LevelFilter::Debug,
        Ok("warn") => LevelFilter::Warn,
        _ => LevelFilter::Info,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
