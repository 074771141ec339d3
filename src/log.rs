use chrono::Local;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    /// 解析配置中的日志等级，无法识别时回退为 info
    pub fn parse(s: &str) -> Level {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Level::Debug,
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }

    fn from_u8(v: u8) -> Level {
        match v {
            0 => Level::Debug,
            2 => Level::Warn,
            3 => Level::Error,
            _ => Level::Info,
        }
    }
}

static MIN_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// 设置全局最低日志等级
pub fn set_level(level: Level) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn level() -> Level {
    Level::from_u8(MIN_LEVEL.load(Ordering::Relaxed))
}

/// 统一日志输出函数
/// 格式: [Time] [LEVEL] [Target] Message
pub fn print(level: Level, target: &str, args: std::fmt::Arguments) {
    if level < self::level() {
        return;
    }

    let now = Local::now().format("%H:%M:%S");

    let gray = "\x1b[90m";
    let reset = "\x1b[0m";
    let cyan = "\x1b[36m";

    let (color, level_str) = match level {
        Level::Info => ("\x1b[32m", "INFO"),
        Level::Warn => ("\x1b[33m", "WARN"),
        Level::Error => ("\x1b[31m", "ERRO"),
        Level::Debug => ("\x1b[34m", "DEBG"),
    };

    // 警告与错误走 stderr，避免和控制台平台的输出混在一起
    if level >= Level::Warn {
        eprintln!(
            "{gray}[{now}] {color}[{level_str}] {reset}{cyan}[{target}]{reset} {args}"
        );
    } else {
        println!(
            "{gray}[{now}] {color}[{level_str}] {reset}{cyan}[{target}]{reset} {args}"
        );
    }
}

#[macro_export]
macro_rules! info {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Info, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Info, "Bridge", format_args!($($arg)+))
    );
}

#[macro_export]
macro_rules! warn {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Warn, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Warn, "Bridge", format_args!($($arg)+))
    );
}

#[macro_export]
macro_rules! error {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Error, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Error, "Bridge", format_args!($($arg)+))
    );
}

#[macro_export]
macro_rules! debug {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Debug, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Debug, "Bridge", format_args!($($arg)+))
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_names() {
        assert_eq!(Level::parse("DEBUG"), Level::Debug);
        assert_eq!(Level::parse("warning"), Level::Warn);
        assert_eq!(Level::parse("error"), Level::Error);
        assert_eq!(Level::parse("whatever"), Level::Info);
    }
}
