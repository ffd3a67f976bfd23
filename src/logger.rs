use std::path::{Path, PathBuf};

use log::LevelFilter;
use log4rs::{
    append::{
        console::ConsoleAppender,
        rolling_file::{
            policy::compound::{
                roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
            },
            RollingFileAppender,
        },
    },
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};

const LOG_FILE_NAME: &str = "epic-session.log";
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
const KEEP_ROLLED: u32 = 5;

fn log_file_path(logs_dir: &Path) -> PathBuf {
    logs_dir.join(LOG_FILE_NAME)
}

/// Rolling file log under `logs_dir`, plus stdout when `console` is set.
///
/// Calling this twice is harmless; the second call leaves the first logger in place.
pub fn init(logs_dir: &Path, level: LevelFilter, console: bool) -> Result<(), String> {
    std::fs::create_dir_all(logs_dir).map_err(|e| e.to_string())?;
    let log_file = log_file_path(logs_dir);

    // 10MB per file, keep 5 rolled files.
    let roller = FixedWindowRoller::builder()
        .build(
            &logs_dir
                .join("epic-session.{}.log")
                .to_string_lossy()
                .to_string(),
            KEEP_ROLLED,
        )
        .map_err(|e| e.to_string())?;
    let policy = CompoundPolicy::new(
        Box::new(SizeTrigger::new(MAX_LOG_BYTES)),
        Box::new(roller),
    );

    let file_appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} {M} - {m}{n}",
        )))
        .build(&log_file, Box::new(policy))
        .map_err(|e| e.to_string())?;

    let mut cfg_builder =
        Config::builder().appender(Appender::builder().build("file", Box::new(file_appender)));
    let mut root_builder = Root::builder().appender("file");

    if console {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new("[{l}] {t} - {m}{n}")))
            .build();
        cfg_builder = cfg_builder.appender(Appender::builder().build("stdout", Box::new(stdout)));
        root_builder = root_builder.appender("stdout");
    }

    let cfg = cfg_builder
        .build(root_builder.build(level))
        .map_err(|e| e.to_string())?;

    // Ignore error if already initialized.
    if log4rs::init_config(cfg).is_err() {
        return Ok(());
    }

    std::panic::set_hook(Box::new(|info| {
        log::error!("panic: {info}");
    }));

    log::info!("logger initialized");
    log::info!("log file: {}", log_file.to_string_lossy());
    Ok(())
}
