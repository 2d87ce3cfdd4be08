//! Process-wide logger with category-tagged macros.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde_json::Value;

/// Environment variable naming the log file. An empty value disables file logging.
pub const LOG_PATH_ENV: &str = "DIFFUSION_ENGINE_LOG";
/// Environment variable holding the minimum level (`debug`, `info`, `warn`, `error`).
pub const LOG_LEVEL_ENV: &str = "DIFFUSION_ENGINE_LOG_LEVEL";

const DEFAULT_LOG_PATH: &str = "logs/diffusion_engine.log";

/// Argument keys that never reach the log verbatim.
const REDACTED_KEYS: [&str; 2] = ["prompt", "negative_prompt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            _ => None,
        }
    }
}

/// Line logger shared by the controller and the worker.
///
/// Every line goes to stderr as well as the log file: a worker's stdout
/// carries protocol frames, and its stderr is inherited by the controller.
pub struct Logger {
    file: Option<Mutex<File>>,
    min_level: Level,
}

impl Logger {
    pub fn new(log_path: &str, min_level: Level) -> std::io::Result<Self> {
        // Create logs directory if it doesn't exist
        if let Some(parent) = Path::new(log_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Ok(Logger {
            file: Some(Mutex::new(file)),
            min_level,
        })
    }

    pub fn stderr_only(min_level: Level) -> Self {
        Logger {
            file: None,
            min_level,
        }
    }

    pub fn from_env() -> Self {
        let min_level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|level| Level::parse(&level))
            .unwrap_or(Level::Info);
        let path = std::env::var(LOG_PATH_ENV).unwrap_or_else(|_| DEFAULT_LOG_PATH.to_string());

        if path.is_empty() {
            return Logger::stderr_only(min_level);
        }

        match Logger::new(&path, min_level) {
            Ok(logger) => logger,
            Err(e) => {
                eprintln!("[LOGGER] Cannot open {path}: {e}, logging to stderr only");
                Logger::stderr_only(min_level)
            }
        }
    }

    pub fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }

    pub fn format_line(level: Level, category: &str, message: &str) -> String {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        format!("[{timestamp}] [{}] [{category}] {message}\n", level.as_str())
    }

    pub fn log(&self, level: Level, category: &str, message: &str) {
        if !self.enabled(level) {
            return;
        }
        let log_line = Self::format_line(level, category, message);

        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(log_line.as_bytes());
                let _ = file.flush();
            }
        }
        let _ = std::io::stderr().write_all(log_line.as_bytes());
    }

    pub fn debug(&self, category: &str, message: &str) {
        self.log(Level::Debug, category, message);
    }

    pub fn info(&self, category: &str, message: &str) {
        self.log(Level::Info, category, message);
    }

    pub fn warn(&self, category: &str, message: &str) {
        self.log(Level::Warn, category, message);
    }

    pub fn error(&self, category: &str, message: &str) {
        self.log(Level::Error, category, message);
    }
}

/// Copy of a JSON argument object with prompt text masked.
pub fn redact(args: &Value) -> Value {
    match args {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    if REDACTED_KEYS.contains(&key.as_str()) && !value.is_null() {
                        (key.clone(), Value::String("***".to_string()))
                    } else {
                        (key.clone(), value.clone())
                    }
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

// Global logger instance
lazy_static::lazy_static! {
    pub static ref LOGGER: Logger = Logger::from_env();
}

#[macro_export]
macro_rules! log_debug {
    ($category:expr, $($arg:tt)*) => {
        $crate::logger::LOGGER.debug($category, &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_info {
    ($category:expr, $($arg:tt)*) => {
        $crate::logger::LOGGER.info($category, &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($category:expr, $($arg:tt)*) => {
        $crate::logger::LOGGER.warn($category, &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_error {
    ($category:expr, $($arg:tt)*) => {
        $crate::logger::LOGGER.error($category, &format!($($arg)*));
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_level_parse() {
        assert_eq!(Level::parse("debug"), Some(Level::Debug));
        assert_eq!(Level::parse(" WARNING "), Some(Level::Warn));
        assert_eq!(Level::parse("loud"), None);
        assert!(Level::Error > Level::Info);
    }

    #[test]
    fn test_format_line_has_level_and_category() {
        let line = Logger::format_line(Level::Warn, "supervisor", "worker slow to stop");
        assert!(line.contains("[WARN] [supervisor] worker slow to stop"));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_file_logger_respects_min_level() {
        let dir = std::env::temp_dir().join(format!("diffusion_engine_log_{}", uuid::Uuid::new_v4()));
        let path = dir.join("engine.log");
        let path_str = path.to_string_lossy().to_string();

        let logger = Logger::new(&path_str, Level::Info).unwrap();
        logger.debug("test", "hidden line");
        logger.info("test", "visible line");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("visible line"));
        assert!(!contents.contains("hidden line"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_redact_masks_prompts_only() {
        let args = json!({"prompt": "a cat", "negative_prompt": null, "width": 512});
        let redacted = redact(&args);
        assert_eq!(redacted["prompt"], "***");
        assert!(redacted["negative_prompt"].is_null());
        assert_eq!(redacted["width"], 512);
    }
}
