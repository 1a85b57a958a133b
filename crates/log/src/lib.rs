//! Leveled process logging for the zcore crates.
//!
//! Records go to stderr as text or one JSON object per line. Tests can turn on an
//! in-memory capture ring to assert on emitted records.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    fn from_u8(raw: u8) -> Self {
        if raw == Self::Json as u8 {
            Self::Json
        } else {
            Self::Text
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
        }
    }
}

/// A record retained by the capture ring.
#[derive(Clone, Debug)]
pub struct CapturedLog {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub msg: String,
}

struct Capture {
    enabled: AtomicBool,
    capacity: AtomicUsize,
    lines: Mutex<VecDeque<CapturedLog>>,
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static STDERR: AtomicBool = AtomicBool::new(true);
static CAPTURE: OnceLock<Capture> = OnceLock::new();

pub fn init(config: LogConfig) {
    MAX_LEVEL.store(config.level as u8, Ordering::Relaxed);
    FORMAT.store(config.format as u8, Ordering::Relaxed);
    TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

pub fn set_stderr_enabled(enabled: bool) {
    STDERR.store(enabled, Ordering::Relaxed);
}

fn capture() -> &'static Capture {
    CAPTURE.get_or_init(|| Capture {
        enabled: AtomicBool::new(false),
        capacity: AtomicUsize::new(0),
        lines: Mutex::new(VecDeque::new()),
    })
}

/// Starts retaining the most recent `capacity` records. Zero disables capture.
pub fn enable_capture(capacity: usize) {
    let capture = capture();
    capture.capacity.store(capacity, Ordering::Relaxed);
    capture.enabled.store(capacity > 0, Ordering::Relaxed);
}

pub fn clear_captured_logs() {
    if let Ok(mut lines) = capture().lines.lock() {
        lines.clear();
    }
}

/// Returns up to `limit` of the newest captured records, oldest first.
pub fn capture_snapshot(limit: usize) -> Vec<CapturedLog> {
    let Ok(lines) = capture().lines.lock() else {
        return Vec::new();
    };
    let skip = lines.len().saturating_sub(limit);
    lines.iter().skip(skip).cloned().collect()
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    if !enabled(level) {
        return;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ts_ms: u64 = now.as_millis().try_into().unwrap_or(u64::MAX);
    let capture = capture();
    let capturing = capture.enabled.load(Ordering::Relaxed);
    let format = Format::from_u8(FORMAT.load(Ordering::Relaxed));

    let msg = match format {
        Format::Json => Some(args.to_string()),
        Format::Text if capturing => Some(args.to_string()),
        Format::Text => None,
    };

    if STDERR.load(Ordering::Relaxed) {
        let mut out = io::stderr().lock();
        let _ = match format {
            Format::Text => write_text(&mut out, now, level, target, args),
            Format::Json => writeln!(
                out,
                "{}",
                json!({
                    "ts_ms": ts_ms,
                    "level": level.as_str(),
                    "target": target,
                    "file": file,
                    "line": line,
                    "msg": msg.as_deref().unwrap_or_default(),
                })
            ),
        };
    }

    if capturing {
        let capacity = capture.capacity.load(Ordering::Relaxed);
        let Ok(mut lines) = capture.lines.lock() else {
            return;
        };
        lines.push_back(CapturedLog {
            ts_ms,
            level,
            target,
            msg: msg.unwrap_or_default(),
        });
        while lines.len() > capacity {
            lines.pop_front();
        }
    }
}

fn write_text(
    out: &mut impl Write,
    now: Duration,
    level: Level,
    target: &str,
    args: fmt::Arguments<'_>,
) -> io::Result<()> {
    if TIMESTAMPS.load(Ordering::Relaxed) {
        write!(out, "{} ", Timestamp(now))?;
    }
    writeln!(out, "{:<5} {target}: {args}", level.as_str())
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

/// UTC time rendered as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
struct Timestamp(Duration);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        let (year, month, day) = civil_date((secs / 86_400) as i64);
        let of_day = secs % 86_400;
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
            of_day / 3600,
            (of_day % 3600) / 60,
            of_day % 60,
            self.0.subsec_millis()
        )
    }
}

// Days since 1970-01-01 to a proleptic Gregorian date (Hinnant's algorithm).
fn civil_date(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level() {
        assert_eq!(Level::parse("info"), Some(Level::Info));
        assert_eq!(Level::parse("WARN"), Some(Level::Warn));
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse("trace"), Some(Level::Trace));
        assert_eq!(Level::parse("nope"), None);
    }

    #[test]
    fn parse_format() {
        assert_eq!(Format::parse("text"), Some(Format::Text));
        assert_eq!(Format::parse("JSON"), Some(Format::Json));
        assert_eq!(Format::parse("xml"), None);
    }

    #[test]
    fn timestamp_renders_utc() {
        let ts = Timestamp(Duration::from_millis(951_782_400_123));
        assert_eq!(ts.to_string(), "2000-02-29T00:00:00.123Z");
        assert_eq!(Timestamp(Duration::ZERO).to_string(), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn capture_keeps_newest_records() {
        set_stderr_enabled(false);
        enable_capture(2);
        clear_captured_logs();
        log_warn!("first");
        log_warn!("second {}", 2);
        log_warn!("third");
        let lines = capture_snapshot(10);
        let msgs: Vec<&str> = lines.iter().map(|line| line.msg.as_str()).collect();
        assert_eq!(msgs, vec!["second 2", "third"]);
        assert!(lines.iter().all(|line| line.level == Level::Warn));
    }
}
