//! Centralized logging configuration for the execution engine.
//!
//! # Architecture
//!
//! - **LogConfig**: Thread-safe global configuration using atomic operations
//! - **LogLevel**: Hierarchical log levels (Off < Error < Warn < Info < Debug < Trace)
//! - **LogCategory**: Engine areas (Cpu, Flags, Strings, Stack, Interrupts, TaskSwitch, Stubs)
//! - **log()**: Common logging function for all output with async file I/O
//!
//! Logging is non-blocking: file output goes through a channel to a
//! background thread, and a disabled category costs one atomic load.
//!
//! # Usage
//!
//! ```rust
//! use emu_x86::logging::{log, LogCategory, LogLevel};
//!
//! // Log with lazy evaluation (zero cost when disabled)
//! log(LogCategory::Interrupts, LogLevel::Debug, || {
//!     format!("INT {:02X} at {:04X}:{:04X}", 0x21, 0x1000, 0x0100)
//! });
//! ```
//!
//! Hosts can configure levels from a filter string such as
//! `"warn,interrupts=debug,taskswitch=info"`, or from the `EMU_X86_LOG`
//! environment variable through [`LogConfig::init_from_env`].

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Environment variable read by [`LogConfig::init_from_env`]
pub const LOG_ENV_VAR: &str = "EMU_X86_LOG";

/// A log filter directive that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogFilterError {
    #[error("unknown log level `{0}`")]
    UnknownLevel(String),
    #[error("unknown log category `{0}`")]
    UnknownCategory(String),
}

/// Log level for controlling verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Parse log level from string (case-insensitive)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn from_u8(val: u8) -> Self {
        match val {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Off,
        }
    }
}

/// Log category for different engine components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Instruction execution
    Cpu,
    /// Lazy flag evaluation
    Flags,
    /// REP string iteration
    Strings,
    /// Stack and far control transfers
    Stack,
    /// Interrupt and exception delivery
    Interrupts,
    /// Hardware task switches
    TaskSwitch,
    /// Unimplemented instructions
    Stubs,
}

impl LogCategory {
    pub const COUNT: usize = 7;

    pub const ALL: [LogCategory; Self::COUNT] = [
        LogCategory::Cpu,
        LogCategory::Flags,
        LogCategory::Strings,
        LogCategory::Stack,
        LogCategory::Interrupts,
        LogCategory::TaskSwitch,
        LogCategory::Stubs,
    ];

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }

    /// Lower-case name used in filter strings
    pub const fn name(self) -> &'static str {
        match self {
            LogCategory::Cpu => "cpu",
            LogCategory::Flags => "flags",
            LogCategory::Strings => "strings",
            LogCategory::Stack => "stack",
            LogCategory::Interrupts => "interrupts",
            LogCategory::TaskSwitch => "taskswitch",
            LogCategory::Stubs => "stubs",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        Self::ALL.into_iter().find(|category| category.name() == name)
    }
}

/// Recover the guard from a poisoned mutex; log state stays usable
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-category sliding-window state
#[derive(Default)]
struct Window {
    timestamps: VecDeque<Instant>,
    dropped: usize,
    last_drop_report: Option<Instant>,
}

/// Rate limiter for controlling log output frequency per category
///
/// Uses a sliding window algorithm to track log timestamps and enforce
/// a maximum rate of logs per second.
struct RateLimiter {
    max_logs_per_second: AtomicUsize,
    window_duration: Duration,
    windows: Mutex<[Window; LogCategory::COUNT]>,
}

impl RateLimiter {
    fn new(max_logs_per_second: usize) -> Self {
        Self {
            max_logs_per_second: AtomicUsize::new(max_logs_per_second),
            window_duration: Duration::from_secs(1),
            windows: Mutex::new(Default::default()),
        }
    }

    /// Returns (allowed, dropped_count) where dropped_count is Some(n) if
    /// the caller should report drops
    fn should_allow(&self, category: LogCategory) -> (bool, Option<usize>) {
        let now = Instant::now();
        let mut windows = lock(&self.windows);
        let window = &mut windows[category.index()];

        while let Some(&front) = window.timestamps.front() {
            if now.duration_since(front) > self.window_duration {
                window.timestamps.pop_front();
            } else {
                break;
            }
        }

        let max_logs = self.max_logs_per_second.load(Ordering::Relaxed);
        if window.timestamps.len() < max_logs {
            window.timestamps.push_back(now);
            if window.dropped > 0 {
                let dropped = std::mem::take(&mut window.dropped);
                window.last_drop_report = Some(now);
                return (true, Some(dropped));
            }
            return (true, None);
        }

        window.dropped += 1;
        let should_report = window
            .last_drop_report
            .map_or(true, |last| now.duration_since(last) >= Duration::from_secs(1));
        if should_report {
            let dropped = std::mem::take(&mut window.dropped);
            window.last_drop_report = Some(now);
            (false, Some(dropped))
        } else {
            (false, None)
        }
    }
}

/// Global logging configuration
pub struct LogConfig {
    /// Applies to every category whose own level is Off
    global_level: AtomicU8,
    levels: [AtomicU8; LogCategory::COUNT],
    log_sender: Mutex<Option<Sender<String>>>,
    file_logging_enabled: AtomicBool,
    rate_limiter: RateLimiter,
}

impl LogConfig {
    /// All logging disabled, 60 logs/second per category
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            levels: Default::default(),
            log_sender: Mutex::new(None),
            file_logging_enabled: AtomicBool::new(false),
            rate_limiter: RateLimiter::new(60),
        }
    }

    /// Get the global singleton instance
    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.levels[category.index()].store(level as u8, Ordering::Relaxed);
    }

    pub fn get_level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.levels[category.index()].load(Ordering::Relaxed))
    }

    /// A category's own level wins; Off falls back to the global level
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        let category_level = self.get_level(category);
        if category_level != LogLevel::Off {
            level <= category_level
        } else {
            level <= self.get_global_level()
        }
    }

    /// Reset all logging to Off
    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for category in LogCategory::ALL {
            self.set_level(category, LogLevel::Off);
        }
    }

    /// Apply a comma-separated filter of `level` and `category=level` items
    ///
    /// A bare level sets the global level. Nothing is applied unless the
    /// whole filter parses.
    pub fn apply_filter(&self, filter: &str) -> Result<(), LogFilterError> {
        let mut global = None;
        let mut per_category = Vec::new();
        for item in filter.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let parse_level = |text: &str| {
                LogLevel::from_str(text.trim())
                    .ok_or_else(|| LogFilterError::UnknownLevel(text.trim().to_string()))
            };
            match item.split_once('=') {
                Some((name, level)) => {
                    let category = LogCategory::from_name(name)
                        .ok_or_else(|| LogFilterError::UnknownCategory(name.trim().to_string()))?;
                    per_category.push((category, parse_level(level)?));
                }
                None => global = Some(parse_level(item)?),
            }
        }
        if let Some(level) = global {
            self.set_global_level(level);
        }
        for (category, level) in per_category {
            self.set_level(category, level);
        }
        Ok(())
    }

    /// Apply `EMU_X86_LOG` if it is set; returns whether a filter was applied
    pub fn init_from_env(&self) -> Result<bool, LogFilterError> {
        match std::env::var(LOG_ENV_VAR) {
            Ok(filter) => self.apply_filter(&filter).map(|()| true),
            Err(_) => Ok(false),
        }
    }

    /// Set the maximum logs per second per category
    pub fn set_rate_limit(&self, max_logs_per_second: usize) {
        self.rate_limiter
            .max_logs_per_second
            .store(max_logs_per_second, Ordering::Relaxed);
    }

    pub fn get_rate_limit(&self) -> usize {
        self.rate_limiter.max_logs_per_second.load(Ordering::Relaxed)
    }

    /// Send log output to a file through a background writer thread
    ///
    /// Replaces any previous log file.
    pub fn set_log_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = channel::<String>();

        thread::Builder::new()
            .name("x86-log-writer".to_string())
            .spawn(move || {
                let mut file = file;
                while let Ok(message) = receiver.recv() {
                    // Logging must never take the engine down
                    let _ = writeln!(file, "{}", message);
                    let _ = file.flush();
                }
            })?;

        *lock(&self.log_sender) = Some(sender);
        self.file_logging_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop logging to file; the writer thread exits when the sender drops
    pub fn clear_log_file(&self) {
        *lock(&self.log_sender) = None;
        self.file_logging_enabled.store(false, Ordering::Relaxed);
    }

    fn write_message(&self, message: &str) {
        if self.file_logging_enabled.load(Ordering::Relaxed) {
            let sender = lock(&self.log_sender);
            match sender.as_ref() {
                Some(sender) if sender.send(message.to_string()).is_ok() => {}
                _ => eprintln!("{}", message),
            }
        } else {
            eprintln!("{}", message);
        }
    }
}

/// Log a message with the specified category and level
///
/// The message closure only runs when the category/level is enabled and the
/// per-category rate limit allows it. Dropped messages are summarised once
/// per second.
pub fn log<F>(category: LogCategory, level: LogLevel, message_fn: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if !config.should_log(category, level) {
        return;
    }
    let (allowed, dropped_count) = config.rate_limiter.should_allow(category);

    if let Some(count) = dropped_count.filter(|&n| n > 0) {
        config.write_message(&format!(
            "[{:?}] WARNING: Rate limit exceeded, {} log message(s) dropped in the last second",
            category, count
        ));
    }

    if allowed {
        config.write_message(&format!("[{:?}] {}", category, message_fn()));
    }
}
