//! Upload wire protocol
//!
//! The uploader sends request lines (`CONFIG`, `UPLOAD`, `RUN`), the
//! receiver answers with reply lines. Payload bytes follow `CONFIG` and
//! `UPLOAD` directly on the link.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// File name of the archive on both ends
pub const ARCHIVE_NAME: &str = "__upload__.tar.gz";

/// Payload chunk size on both ends
pub const CHUNK_SIZE: usize = 16384;

/// Request sent by the uploader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `CONFIG <size>`, followed by `size` bytes of JSON
    Config { size: usize },
    /// `UPLOAD <size> <sha256> <name>`, followed by the archive after `OK`
    Upload {
        size: u64,
        sha256: String,
        name: String,
    },
    /// `RUN`
    Run,
    /// Anything else; ignored by the receiver
    Unknown(String),
}

/// A request header that names a known command but cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("Bad CONFIG header: {0}")]
    Config(String),
    #[error("Bad UPLOAD header: {0}")]
    Upload(String),
}

impl HeaderError {
    /// Reply the receiver sends for this header
    pub fn reply(&self) -> Reply {
        match self {
            HeaderError::Config(_) => Reply::ErrConfigHeader,
            HeaderError::Upload(_) => Reply::ErrHeader,
        }
    }
}

impl Request {
    /// Parse a request line
    pub fn parse(line: &str) -> Result<Self, HeaderError> {
        let line = line.trim();
        let mut fields = line.split_whitespace();

        match fields.next() {
            Some("CONFIG") => {
                let size = fields
                    .next()
                    .and_then(|s| s.parse().ok())
                    .filter(|_| fields.next().is_none())
                    .ok_or_else(|| HeaderError::Config(line.to_string()))?;
                Ok(Request::Config { size })
            }
            Some("UPLOAD") => {
                let bad = || HeaderError::Upload(line.to_string());
                let (_, rest) = split_field(line).ok_or_else(bad)?;
                let (size, rest) = split_field(rest).ok_or_else(bad)?;
                let (sha256, rest) = split_field(rest).ok_or_else(bad)?;
                // The name is the remainder and may contain spaces
                let name = rest.trim();
                if name.is_empty() {
                    return Err(bad());
                }
                let size = size.parse().map_err(|_| bad())?;
                Ok(Request::Upload {
                    size,
                    sha256: sha256.to_string(),
                    name: name.to_string(),
                })
            }
            Some("RUN") if fields.next().is_none() => Ok(Request::Run),
            _ => Ok(Request::Unknown(line.to_string())),
        }
    }
}

/// Split the first whitespace-delimited field off `s`
fn split_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(i) => Some((&s[..i], &s[i..])),
        None => Some((s, "")),
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Config { size } => write!(f, "CONFIG {}", size),
            Request::Upload { size, sha256, name } => {
                write!(f, "UPLOAD {} {} {}", size, sha256, name)
            }
            Request::Run => write!(f, "RUN"),
            Request::Unknown(line) => write!(f, "{}", line),
        }
    }
}

/// Reply line sent by the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    OkConfig,
    Ok,
    Progress(u64),
    Done,
    Running,
    Exit(i32),
    ErrConfigHeader,
    ErrConfigParse,
    ErrNoConfig,
    ErrHeader,
    ErrChecksum(String),
    ErrNoSpace(u64),
    ErrRun(String),
    ErrStream(String),
    /// Any other `ERR...` line
    Err(String),
    /// Application output relayed during `RUN`
    Output(String),
}

impl Reply {
    /// Parse a reply line
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (head, rest) = match line.split_once(' ') {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };

        match (head, rest) {
            ("OK_CONFIG", "") => Reply::OkConfig,
            ("OK", "") => Reply::Ok,
            ("DONE", "") => Reply::Done,
            ("RUNNING", "") => Reply::Running,
            ("ERR_CONFIG_HEADER", "") => Reply::ErrConfigHeader,
            ("ERR_CONFIG_PARSE", "") => Reply::ErrConfigParse,
            ("ERR_NO_CONFIG", "") => Reply::ErrNoConfig,
            ("ERR_HEADER", "") => Reply::ErrHeader,
            ("PROGRESS", n) if n.parse::<u64>().is_ok() => {
                Reply::Progress(n.parse().unwrap_or_default())
            }
            ("EXIT", n) if n.parse::<i32>().is_ok() => Reply::Exit(n.parse().unwrap_or_default()),
            ("ERR_NO_SPACE", n) if n.parse::<u64>().is_ok() => {
                Reply::ErrNoSpace(n.parse().unwrap_or_default())
            }
            ("ERR_CHECKSUM", actual) => Reply::ErrChecksum(actual.to_string()),
            ("ERR_RUN", msg) => Reply::ErrRun(msg.to_string()),
            ("ERR_STREAM", msg) => Reply::ErrStream(msg.to_string()),
            _ if line.starts_with("ERR") => Reply::Err(line.to_string()),
            _ => Reply::Output(line.to_string()),
        }
    }

    /// Whether the receiver reported a failure
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Reply::ErrConfigHeader
                | Reply::ErrConfigParse
                | Reply::ErrNoConfig
                | Reply::ErrHeader
                | Reply::ErrChecksum(_)
                | Reply::ErrNoSpace(_)
                | Reply::ErrRun(_)
                | Reply::ErrStream(_)
                | Reply::Err(_)
        )
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::OkConfig => write!(f, "OK_CONFIG"),
            Reply::Ok => write!(f, "OK"),
            Reply::Progress(n) => write!(f, "PROGRESS {}", n),
            Reply::Done => write!(f, "DONE"),
            Reply::Running => write!(f, "RUNNING"),
            Reply::Exit(code) => write!(f, "EXIT {}", code),
            Reply::ErrConfigHeader => write!(f, "ERR_CONFIG_HEADER"),
            Reply::ErrConfigParse => write!(f, "ERR_CONFIG_PARSE"),
            Reply::ErrNoConfig => write!(f, "ERR_NO_CONFIG"),
            Reply::ErrHeader => write!(f, "ERR_HEADER"),
            Reply::ErrChecksum(actual) => write!(f, "ERR_CHECKSUM {}", actual),
            Reply::ErrNoSpace(free) => write!(f, "ERR_NO_SPACE {}", free),
            Reply::ErrRun(msg) => write!(f, "ERR_RUN {}", msg),
            Reply::ErrStream(msg) => write!(f, "ERR_STREAM {}", msg),
            Reply::Err(line) | Reply::Output(line) => write!(f, "{}", line),
        }
    }
}

/// Transfer failures
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("serial I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("receiver rejected {stage}: {reply}")]
    Rejected { stage: &'static str, reply: String },

    #[error("checksum mismatch, receiver computed {0}")]
    Checksum(String),

    #[error("refusing to replace dangerous path: {}", .0.display())]
    DangerousPath(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_header() {
        assert_eq!(Request::parse("CONFIG 42"), Ok(Request::Config { size: 42 }));
        assert_eq!(
            Request::parse("CONFIG"),
            Err(HeaderError::Config("CONFIG".to_string()))
        );
        assert_eq!(
            Request::parse("CONFIG abc").unwrap_err().reply(),
            Reply::ErrConfigHeader
        );
    }

    #[test]
    fn test_parse_upload_header() {
        let sha = "ab".repeat(32);
        let req = Request::parse(&format!("UPLOAD 1024 {} my project.tar.gz", sha)).unwrap();
        assert_eq!(
            req,
            Request::Upload {
                size: 1024,
                sha256: sha.clone(),
                name: "my project.tar.gz".to_string(),
            }
        );
        assert_eq!(req.to_string(), format!("UPLOAD 1024 {} my project.tar.gz", sha));
    }

    #[test]
    fn test_parse_bad_upload_header() {
        let sha = "cd".repeat(32);
        for line in [
            "UPLOAD".to_string(),
            "UPLOAD 10".to_string(),
            format!("UPLOAD 10 {}", sha),
            format!("UPLOAD ten {} a.tar.gz", sha),
        ] {
            let err = Request::parse(&line).unwrap_err();
            assert_eq!(err.reply(), Reply::ErrHeader, "{}", line);
        }
    }

    #[test]
    fn test_parse_run_and_unknown() {
        assert_eq!(Request::parse("RUN"), Ok(Request::Run));
        assert_eq!(
            Request::parse("RUN now"),
            Ok(Request::Unknown("RUN now".to_string()))
        );
        assert_eq!(
            Request::parse("HELLO"),
            Ok(Request::Unknown("HELLO".to_string()))
        );
    }

    #[test]
    fn test_parse_replies() {
        assert_eq!(Reply::parse("OK_CONFIG"), Reply::OkConfig);
        assert_eq!(Reply::parse("OK\r"), Reply::Ok);
        assert_eq!(Reply::parse("PROGRESS 65536"), Reply::Progress(65536));
        assert_eq!(Reply::parse("EXIT -1"), Reply::Exit(-1));
        assert_eq!(
            Reply::parse("ERR_CHECKSUM deadbeef"),
            Reply::ErrChecksum("deadbeef".to_string())
        );
        assert_eq!(
            Reply::parse("ERR_RUN main not found: /home/pi/app/main.py"),
            Reply::ErrRun("main not found: /home/pi/app/main.py".to_string())
        );
        assert_eq!(Reply::parse("ERR_WHATEVER"), Reply::Err("ERR_WHATEVER".to_string()));
        assert_eq!(
            Reply::parse("PROGRESS soon"),
            Reply::Output("PROGRESS soon".to_string())
        );
        assert_eq!(Reply::parse("hello from app"), Reply::Output("hello from app".to_string()));
    }

    #[test]
    fn test_error_classification() {
        assert!(Reply::ErrNoConfig.is_error());
        assert!(Reply::Err("ERR_X".to_string()).is_error());
        assert!(!Reply::Progress(1).is_error());
        assert!(!Reply::Output("ERRATA".to_string()).is_error());
    }

    #[test]
    fn test_reply_wire_format() {
        assert_eq!(Reply::ErrNoSpace(4096).to_string(), "ERR_NO_SPACE 4096");
        assert_eq!(Reply::Exit(3).to_string(), "EXIT 3");
        assert_eq!(Reply::parse(&Reply::ErrStream("broken pipe".into()).to_string()),
            Reply::ErrStream("broken pipe".into()));
    }
}
