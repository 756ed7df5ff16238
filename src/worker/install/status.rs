// src/worker/install/status.rs

//! Status-channel line protocol
//!
//! The install child reports progress on a dedicated descriptor, one line
//! per event:
//!
//! ```text
//! pmstatus:<package>:<percent>[.<fraction>]:<detail>
//! pmerror:<package>:<percent>:<message>
//! pmconffile:<conffile>:<percent>:'<old path>' '<new path>' ...
//! ```
//!
//! The detail is free text and may itself contain `:`, so everything after
//! the third separator is rejoined. Decoding is pure: [`StatusDecoder`]
//! only buffers bytes and yields events.

use crate::error::{Error, Result};

/// A decoded status-channel event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Per-package progress
    Progress {
        package: String,
        percent: u32,
        detail: String,
    },
    /// A package failed; the message goes to the error-detail log
    Error {
        package: String,
        percent: u32,
        message: String,
    },
    /// A configuration file differs from the packaged version
    ConfigFile {
        package: String,
        percent: u32,
        old_path: String,
        new_path: String,
    },
    /// Tag this supervisor does not act on
    Other { tag: String, line: String },
}

/// Parse one status line (without the trailing newline)
pub fn parse_line(line: &str) -> Result<StatusEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut fields = line.splitn(4, ':');
    let tag = fields.next().unwrap_or_default();
    let (Some(package), Some(percent), Some(detail)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(Error::ParseError(format!("truncated status line: {:?}", line)));
    };

    let percent = parse_percent(percent)
        .ok_or_else(|| Error::ParseError(format!("bad percentage in status line: {:?}", line)))?;
    let package = package.to_string();

    match tag {
        "pmstatus" => Ok(StatusEvent::Progress {
            package,
            percent,
            detail: detail.to_string(),
        }),
        "pmerror" => Ok(StatusEvent::Error {
            package,
            percent,
            message: detail.to_string(),
        }),
        "pmconffile" => {
            let mut paths = quoted_fields(detail);
            match (paths.next(), paths.next()) {
                (Some(old_path), Some(new_path)) => Ok(StatusEvent::ConfigFile {
                    package,
                    percent,
                    old_path,
                    new_path,
                }),
                _ => Err(Error::ParseError(format!(
                    "pmconffile without two quoted paths: {:?}",
                    line
                ))),
            }
        }
        other => Ok(StatusEvent::Other {
            tag: other.to_string(),
            line: line.to_string(),
        }),
    }
}

/// Integer part of `45` or `45.5`, clamped to 100
fn parse_percent(text: &str) -> Option<u32> {
    let value: f64 = text.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value.floor() as u32).min(100))
}

/// Yield the contents of each `'...'` segment in order
fn quoted_fields(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split('\'')
        .skip(1)
        .step_by(2)
        .map(str::to_string)
}

/// Incremental line splitter for the status channel
#[derive(Debug, Default)]
pub struct StatusDecoder {
    buffer: Vec<u8>,
}

impl StatusDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every complete line decoded
    ///
    /// Malformed lines come back as errors in place, so one bad line never
    /// hides the ones after it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<StatusEvent>> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            if line.trim().is_empty() {
                continue;
            }
            events.push(parse_line(&line));
        }
        events
    }

    /// Decode a final unterminated line, if any
    pub fn finish(&mut self) -> Option<Result<StatusEvent>> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        Some(parse_line(&String::from_utf8_lossy(&raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pmstatus_with_fraction() {
        let event = parse_line("pmstatus:foo:45.5:Installing foo").unwrap();
        assert_eq!(
            event,
            StatusEvent::Progress {
                package: "foo".to_string(),
                percent: 45,
                detail: "Installing foo".to_string(),
            }
        );
    }

    #[test]
    fn test_detail_keeps_colons() {
        let event = parse_line("pmstatus:foo:10:note: a:b").unwrap();
        let StatusEvent::Progress { detail, percent, .. } = event else {
            panic!("expected progress");
        };
        assert_eq!(percent, 10);
        assert_eq!(detail, "note: a:b");
    }

    #[test]
    fn test_pmerror() {
        let event = parse_line("pmerror:bar:60:subprocess post-installation script returned error exit status 1").unwrap();
        assert!(matches!(
            event,
            StatusEvent::Error { ref package, percent: 60, ref message }
                if package == "bar" && message.contains("exit status 1")
        ));
    }

    #[test]
    fn test_pmconffile() {
        let event = parse_line(
            "pmconffile:/etc/foo.conf:30.0:'/etc/foo.conf' '/etc/foo.conf.dpkg-new' 1 1",
        )
        .unwrap();
        assert_eq!(
            event,
            StatusEvent::ConfigFile {
                package: "/etc/foo.conf".to_string(),
                percent: 30,
                old_path: "/etc/foo.conf".to_string(),
                new_path: "/etc/foo.conf.dpkg-new".to_string(),
            }
        );
        assert!(parse_line("pmconffile:/etc/a:30:'/etc/a'").is_err());
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse_line("pmstatus:foo").is_err());
        assert!(parse_line("pmstatus:foo:abc:detail").is_err());
        assert!(matches!(
            parse_line("dlstatus:1:20:Retrieving file 1 of 3").unwrap(),
            StatusEvent::Other { ref tag, .. } if tag == "dlstatus"
        ));
    }

    #[test]
    fn test_decoder_splits_partial_reads() {
        let mut decoder = StatusDecoder::new();
        assert!(decoder.feed(b"pmstatus:foo:1").is_empty());
        let events = decoder.feed(b"0:Unpacking foo\npmstatus:bar:20:Removing bar\npmst");
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            StatusEvent::Progress { package, percent: 10, .. } if package == "foo"
        ));

        let tail = decoder.finish().unwrap().unwrap_err();
        assert!(matches!(tail, Error::ParseError(_)));
        assert!(decoder.finish().is_none());
    }
}
