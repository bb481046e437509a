use std::{fs, net::Ipv4Addr, path::Path, str::FromStr};

use thiserror::Error;
use tracing::warn;

use crate::client::ClientFlags;

/// One `IP PORT TYPE IDLE_TIMEOUT_SECS` record from the bind file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindEntry {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub proto: BindProto,
    pub idle_timeout_secs: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindProto {
    Tcp,
    Udp,
}

impl BindEntry {
    /// Flag bits a listener entry derives from its protocol token.
    pub fn flags(&self) -> ClientFlags {
        match self.proto {
            BindProto::Tcp => ClientFlags::VALID | ClientFlags::LISTENER,
            BindProto::Udp => ClientFlags::VALID | ClientFlags::LISTENER | ClientFlags::UDP,
        }
    }

    pub fn addr(&self) -> std::net::SocketAddrV4 {
        std::net::SocketAddrV4::new(self.ip, self.port)
    }
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to read bind file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bind file {0} holds no usable entries")]
    Empty(String),
}

/// Parses the bind file: line-oriented, `#` comments, blank lines skipped,
/// unknown protocol tokens logged and skipped. Malformed fields skip the line.
pub fn parse_bind_file(path: &Path) -> Result<Vec<BindEntry>, BindError> {
    let text = fs::read_to_string(path).map_err(|source| BindError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let mut entries = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Some(entry) => entries.push(entry),
            None => warn!(lineno = lineno + 1, line, "skipping unusable bind line"),
        }
    }

    if entries.is_empty() {
        return Err(BindError::Empty(path.display().to_string()));
    }
    Ok(entries)
}

fn parse_line(line: &str) -> Option<BindEntry> {
    let mut fields = line.split_whitespace();
    let ip = Ipv4Addr::from_str(fields.next()?).ok()?;
    let port = fields.next()?.parse().ok()?;
    let proto = match fields.next()? {
        "tcp" => BindProto::Tcp,
        "udp" => BindProto::Udp,
        other => {
            warn!(proto = other, "unsupported protocol in bind file");
            return None;
        }
    };
    let idle_timeout_secs = fields.next()?.parse().ok()?;
    Some(BindEntry { ip, port, proto, idle_timeout_secs })
}
