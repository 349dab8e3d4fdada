use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::config::LoggingConfig;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" | "trace" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Verbose => "VERBOSE",
        }
    }

    fn as_colored_str(self) -> &'static str {
        match self {
            Self::Error => "\x1b[31mERROR\x1b[0m",
            Self::Warn => "\x1b[33mWARN\x1b[0m",
            Self::Info => "\x1b[32mINFO\x1b[0m",
            Self::Debug => "\x1b[36mDEBUG\x1b[0m",
            Self::Verbose => "\x1b[35mVERBOSE\x1b[0m",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub human_friendly: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Debug,
            human_friendly: false,
        }
    }
}

pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

#[derive(Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

#[derive(Default)]
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&self, line: &str) {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{line}");
    }
}

/// Levelled line logger. The channel name is rendered as `<channel>` right
/// after the level.
pub struct Logger {
    config: LoggerConfig,
    channel: &'static str,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn named(channel: &'static str, config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            config,
            channel,
            sink,
        }
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn log(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<Value>,
    ) {
        if !self.should_log(level) {
            return;
        }

        let line = self.format_line(level, context, message, payload.as_ref());
        self.sink.write_line(&line);
    }

    pub fn should_log(&self, level: LogLevel) -> bool {
        level <= self.config.min_level
    }

    fn format_line(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<&Value>,
    ) -> String {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let rendered_level = if self.config.human_friendly {
            level.as_colored_str()
        } else {
            level.as_str()
        };

        let context_part = match context {
            Some(ctx) if !ctx.is_empty() => format!(" [{ctx}]"),
            _ => String::new(),
        };

        let payload_part = match payload {
            Some(value) => format!(" payload={value}"),
            None => String::new(),
        };

        format!(
            "{timestamp} [{rendered_level}] <{}>{context_part} {message}{payload_part}",
            self.channel
        )
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("channel", &self.channel)
            .field("sink", &"<dyn LogSink>")
            .finish()
    }
}

/// The three log channels a session worker reports to.
///
/// `internal` receives protocol breaches, interruptions and diagnostics,
/// `user` receives worker crashes and `security` receives authentication
/// failures only.
#[derive(Clone, Debug)]
pub struct LogChannels {
    pub internal: Arc<Logger>,
    pub user: Arc<Logger>,
    pub security: Arc<Logger>,
}

impl LogChannels {
    pub const INTERNAL: &'static str = "internal";
    pub const USER: &'static str = "user";
    pub const SECURITY: &'static str = "security";

    pub fn from_config(config: &LoggingConfig) -> Result<Self, LoggingSetupError> {
        let general = LoggerConfig {
            min_level: parse_level("logging.level", &config.level)?,
            human_friendly: config.human_friendly,
        };
        let security = LoggerConfig {
            min_level: parse_level("logging.security_level", &config.security_level)?,
            human_friendly: config.human_friendly,
        };
        let security_sink: Arc<dyn LogSink> = match config.security_sink.as_str() {
            "stdout" => Arc::new(StdoutSink),
            "stderr" => Arc::new(StderrSink),
            other => {
                return Err(LoggingSetupError::UnknownSink {
                    value: other.to_owned(),
                })
            }
        };

        let stdout: Arc<dyn LogSink> = Arc::new(StdoutSink);
        Ok(Self {
            internal: Arc::new(Logger::named(Self::INTERNAL, general.clone(), Arc::clone(&stdout))),
            user: Arc::new(Logger::named(Self::USER, general, stdout)),
            security: Arc::new(Logger::named(Self::SECURITY, security, security_sink)),
        })
    }

}

fn parse_level(key: &'static str, value: &str) -> Result<LogLevel, LoggingSetupError> {
    LogLevel::from_config_value(value).ok_or_else(|| LoggingSetupError::UnknownLevel {
        key,
        value: value.to_owned(),
    })
}

#[derive(Debug)]
pub enum LoggingSetupError {
    UnknownLevel { key: &'static str, value: String },
    UnknownSink { value: String },
}

impl fmt::Display for LoggingSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownLevel { key, value } => write!(
                f,
                "invalid {key} '{value}'. Allowed values: error, warn, info, debug, verbose"
            ),
            Self::UnknownSink { value } => write!(
                f,
                "invalid logging.security_sink '{value}'. Allowed values: stdout, stderr"
            ),
        }
    }
}

impl std::error::Error for LoggingSetupError {}
