// src/client/http.rs

//! Minimal HTTP/1.1 over a blocking Unix stream
//!
//! The daemon speaks plain HTTP on its socket. Requests are written by hand
//! with `Connection: close`; responses are read as a head followed by a
//! body that is either length-delimited, chunked, or read to EOF. Event
//! streams reuse the same body reader and are split into SSE events.

use crate::{Error, Result};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// Status line and headers of a response
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status_code: u16,
    /// Lower-cased names
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// A complete response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub head: ResponseHead,
    pub body: String,
}

pub type BodyReader = Box<dyn Read + Send>;

/// Send a request and return the response head plus a reader for the body
///
/// `timeout` applies to every read and write; `None` blocks indefinitely,
/// which event streams need between keepalives.
pub fn send(
    socket_path: &Path,
    timeout: Option<Duration>,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> Result<(ResponseHead, BodyReader)> {
    let mut stream = UnixStream::connect(socket_path).map_err(|e| {
        Error::DaemonError(format!(
            "Cannot connect to daemon at {}: {}",
            socket_path.display(),
            e
        ))
    })?;
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;

    let content_length = body.map(str::len).unwrap_or(0);
    let mut request = format!(
        "{} {} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Accept: application/json, text/event-stream\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        method, path, content_length
    );
    if let Some(body) = body {
        request.push_str(body);
    }
    stream.write_all(request.as_bytes())?;

    let mut reader = BufReader::new(stream);
    let head = read_head(&mut reader)?;
    let body = body_reader(reader, &head);
    Ok((head, body))
}

/// Send a request and read the whole response
pub fn request(
    socket_path: &Path,
    timeout: Duration,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> Result<HttpResponse> {
    let (head, mut reader) = send(socket_path, Some(timeout), method, path, body)?;
    let mut body = String::new();
    reader.read_to_string(&mut body)?;
    Ok(HttpResponse { head, body })
}

/// Parse the status line and headers
pub fn read_head<R: BufRead>(reader: &mut R) -> Result<ResponseHead> {
    let mut status_line = String::new();
    if reader.read_line(&mut status_line)? == 0 {
        return Err(Error::DaemonError("Empty response from daemon".to_string()));
    }

    let status_code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::ParseError(format!("Bad status line: {}", status_line.trim())))?;

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_lowercase(), value.trim().to_string()));
        }
    }

    Ok(ResponseHead {
        status_code,
        headers,
    })
}

fn body_reader<R: BufRead + Send + 'static>(reader: R, head: &ResponseHead) -> BodyReader {
    let chunked = head
        .header("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
    if chunked {
        return Box::new(ChunkedReader::new(reader));
    }
    match head.header("content-length").and_then(|v| v.parse::<u64>().ok()) {
        Some(len) => Box::new(reader.take(len)),
        None => Box::new(reader),
    }
}

/// Decodes `Transfer-Encoding: chunked`
pub struct ChunkedReader<R> {
    inner: R,
    /// Bytes left in the current chunk
    remaining: usize,
    done: bool,
}

impl<R: BufRead> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            done: false,
        }
    }

    fn next_chunk(&mut self) -> io::Result<()> {
        let mut line = String::new();
        if self.inner.read_line(&mut line)? == 0 {
            self.done = true;
            return Ok(());
        }
        let size = line.trim().split(';').next().unwrap_or("");
        let size = usize::from_str_radix(size, 16).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad chunk size line: {:?}", line.trim()),
            )
        })?;
        if size == 0 {
            self.done = true;
        }
        self.remaining = size;
        Ok(())
    }
}

impl<R: BufRead> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.remaining == 0 {
            if self.done {
                return Ok(0);
            }
            self.next_chunk()?;
        }

        let want = buf.len().min(self.remaining);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside a chunk",
            ));
        }
        self.remaining -= n;
        if self.remaining == 0 {
            // CRLF after the chunk data
            let mut crlf = String::new();
            self.inner.read_line(&mut crlf)?;
        }
        Ok(n)
    }
}

/// One server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `message` when the server named none
    pub event: String,
    pub data: String,
}

/// Iterator over the events of an SSE body
///
/// Comment lines (keepalives) are skipped. Ends at EOF.
pub struct EventStream {
    lines: BufReader<BodyReader>,
}

impl EventStream {
    pub fn new(body: BodyReader) -> Self {
        Self {
            lines: BufReader::new(body),
        }
    }

    fn read_event(&mut self) -> Result<Option<SseEvent>> {
        let mut event = String::new();
        let mut data: Vec<String> = Vec::new();

        loop {
            let mut line = String::new();
            if self.lines.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if data.is_empty() && event.is_empty() {
                    continue;
                }
                let event = if event.is_empty() {
                    "message".to_string()
                } else {
                    event
                };
                return Ok(Some(SseEvent {
                    event,
                    data: data.join("\n"),
                }));
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => event = value.to_string(),
                "data" => data.push(value.to_string()),
                _ => {}
            }
        }
    }
}

impl Iterator for EventStream {
    type Item = Result<SseEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_event().transpose()
    }
}
