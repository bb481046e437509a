use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt::writer::MakeWriterExt};

use crate::config::{Config, LogDest};

/// Installs the global subscriber from the log_* config keys. The returned
/// guard must outlive the process body or buffered file output is lost.
///
/// `RUST_LOG` overrides the configured level. Rotation is daily and bounded
/// by `log_maxfiles`; `log_size` is accepted for config compatibility but the
/// rotation trigger is time-based.
pub fn init(cfg: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.level_directive()));

    let file_appender = match cfg.log_dest {
        LogDest::Terminal => None,
        LogDest::File | LogDest::Both => {
            match RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("relayd")
                .filename_suffix("log")
                .max_log_files(cfg.log_maxfiles)
                .build(&cfg.log_dir)
            {
                Ok(appender) => Some(appender),
                Err(e) => {
                    eprintln!(
                        "relayd: cannot open log dir {}: {e}; logging to terminal",
                        cfg.log_dir.display()
                    );
                    None
                }
            }
        }
    };

    match (file_appender, cfg.log_dest) {
        (Some(appender), LogDest::Both) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer.and(std::io::stdout))
                .with_ansi(false)
                .init();
            Some(guard)
        }
        (Some(appender), _) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        (None, _) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
