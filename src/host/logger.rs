// ============================================================================
// src/host/logger.rs - stderr logger for the host build
// ============================================================================
//!
//! ホスト用ロギング。`log` クレートのバックエンドとして標準エラーへ
//! 1行ずつ出力する。ターゲットではRTOS側のロガーを使う。
//!
//! ```ignore
//! streamnet::host::logger::init().ok();
//! log::info!("loopback up");
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// コンパイル時のログレベル（featureで変更可能）
#[cfg(feature = "verbose_logging")]
const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Trace;

#[cfg(not(feature = "verbose_logging"))]
const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Info;

static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// 現在のログレベル（実行時変更可能）
static CURRENT_LOG_LEVEL: AtomicU8 = AtomicU8::new(LevelFilter::Info as u8);

/// 行の混在を防ぐ
static OUTPUT_LOCK: Mutex<()> = Mutex::new(());

struct HostLogger;

impl HostLogger {
    fn level_prefix(level: Level) -> &'static str {
        match level {
            Level::Error => "[ERROR] ",
            Level::Warn  => "[WARN]  ",
            Level::Info  => "[INFO]  ",
            Level::Debug => "[DEBUG] ",
            Level::Trace => "[TRACE] ",
        }
    }
}

impl Log for HostLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= current_log_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _guard = OUTPUT_LOCK.lock();
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = write!(out, "{}", Self::level_prefix(record.level()));
        if let Some(module) = record.module_path() {
            let _ = write!(out, "[{}] ", module);
        }
        let _ = writeln!(out, "{}", record.args());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: HostLogger = HostLogger;

/// ロギングを初期化 (2回目以降はエラー)
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(MAX_LOG_LEVEL);
    CURRENT_LOG_LEVEL.store(MAX_LOG_LEVEL as u8, Ordering::SeqCst);
    LOGGER_INITIALIZED.store(true, Ordering::SeqCst);
    Ok(())
}

/// 実行時にログレベルを変更
pub fn set_log_level(level: LevelFilter) {
    CURRENT_LOG_LEVEL.store(level as u8, Ordering::SeqCst);
    log::set_max_level(level);
}

pub fn current_log_level() -> LevelFilter {
    LevelFilter::iter()
        .nth(CURRENT_LOG_LEVEL.load(Ordering::Relaxed) as usize)
        .unwrap_or(LevelFilter::Info)
}

pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_roundtrip() {
        for level in [LevelFilter::Off, LevelFilter::Warn, LevelFilter::Trace] {
            CURRENT_LOG_LEVEL.store(level as u8, Ordering::SeqCst);
            assert_eq!(current_log_level(), level);
        }
        CURRENT_LOG_LEVEL.store(MAX_LOG_LEVEL as u8, Ordering::SeqCst);
    }
}
