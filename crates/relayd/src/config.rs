use std::{fs, path::Path, path::PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::dispatch::DispatcherKind;

/// Hard ceiling on `max_packet_size`; also the size of the per-thread stack
/// scratch the receive paths read into.
pub const MAX_PACKET_CEILING: usize = 65536;

pub const DEFAULT_RINGQUEUE_LENGTH: usize = 8_192_000;
pub const DEFAULT_WORKER_NUM: usize = 4;
pub const DEFAULT_BIND_FILE: &str = "./conf/bind.txt";
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 8196;
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 8196;
pub const DEFAULT_MAX_PACKET_SIZE: usize = 8196;
pub const DEFAULT_LOG_DIR: &str = "./log";
pub const DEFAULT_LOG_LEVEL: u32 = 7;
pub const DEFAULT_LOG_MAXFILES: usize = 10;
pub const DEFAULT_LOG_SIZE: u64 = 104_857_600;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    #[default]
    Foreground,
    Background,
}

/// Where log output goes; numeric values match the classic config files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogDest {
    Terminal = 1,
    File = 2,
    #[default]
    Both = 3,
}

/// Server configuration, `key=value` per line, `#` comments. Every key has a
/// default so a missing file only fails when explicitly requested.
#[derive(Clone, Debug)]
pub struct Config {
    pub ringqueue_length: usize,
    pub worker_num: usize,
    pub bind_file: PathBuf,
    pub recv_buffer: usize,
    pub send_buffer: usize,
    pub max_packet_size: usize,
    pub run_mode: RunMode,
    pub dispatcher: DispatcherKind,
    pub log_dir: PathBuf,
    pub log_level: u32,
    pub log_maxfiles: usize,
    pub log_size: u64,
    pub log_dest: LogDest,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ringqueue_length: DEFAULT_RINGQUEUE_LENGTH,
            worker_num: DEFAULT_WORKER_NUM,
            bind_file: DEFAULT_BIND_FILE.into(),
            recv_buffer: DEFAULT_RECV_BUFFER_SIZE,
            send_buffer: DEFAULT_SEND_BUFFER_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            run_mode: RunMode::default(),
            dispatcher: DispatcherKind::default(),
            log_dir: DEFAULT_LOG_DIR.into(),
            log_level: DEFAULT_LOG_LEVEL,
            log_maxfiles: DEFAULT_LOG_MAXFILES,
            log_size: DEFAULT_LOG_SIZE,
            log_dest: LogDest::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut cfg = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line, "config line without '='");
                continue;
            };
            cfg.apply(key.trim(), value.trim());
        }
        cfg.clamp();
        cfg
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "ringqueue_length" => set_num(&mut self.ringqueue_length, key, value),
            "worker_num" => set_num(&mut self.worker_num, key, value),
            "bind_file" => self.bind_file = value.into(),
            "recv_buffer" => set_num(&mut self.recv_buffer, key, value),
            "send_buffer" => set_num(&mut self.send_buffer, key, value),
            "max_packet_size" => set_num(&mut self.max_packet_size, key, value),
            "run_mode" => {
                self.run_mode = match value {
                    "background" => RunMode::Background,
                    "foreground" => RunMode::Foreground,
                    other => {
                        warn!(run_mode = other, "unknown run_mode, staying in foreground");
                        RunMode::Foreground
                    }
                }
            }
            "dispatcher" => self.dispatcher = crate::dispatch::parse_dispatcher_kind(value),
            "log_dir" => self.log_dir = value.into(),
            "log_level" => set_num(&mut self.log_level, key, value),
            "log_maxfiles" => set_num(&mut self.log_maxfiles, key, value),
            "log_size" => set_num(&mut self.log_size, key, value),
            "log_dest" => {
                self.log_dest = match value {
                    "1" => LogDest::Terminal,
                    "2" => LogDest::File,
                    "3" => LogDest::Both,
                    other => {
                        warn!(log_dest = other, "unknown log_dest, using both");
                        LogDest::Both
                    }
                }
            }
            other => warn!(key = other, "unknown config key"),
        }
    }

    fn clamp(&mut self) {
        if self.max_packet_size > MAX_PACKET_CEILING {
            warn!(
                requested = self.max_packet_size,
                ceiling = MAX_PACKET_CEILING,
                "max_packet_size clamped"
            );
            self.max_packet_size = MAX_PACKET_CEILING;
        }
        if self.worker_num == 0 {
            warn!("worker_num 0 is not runnable, using 1");
            self.worker_num = 1;
        }
    }

    /// Level filter directive for the subscriber; accepts the classic numeric
    /// severities as well as textual tracing levels.
    pub fn level_directive(&self) -> &'static str {
        match self.log_level {
            0..=3 => "error",
            4 => "warn",
            5 | 6 => "info",
            7 => "debug",
            _ => "trace",
        }
    }
}

fn set_num<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse() {
        Ok(v) => *slot = v,
        Err(_) => warn!(key, value, "ignoring unparsable numeric value"),
    }
}
