// src/worker/fetcher.rs

//! Fetch engine
//!
//! [`HttpFetcher`] downloads an ordered list of [`AcquireItem`]s into their
//! destinations and drives an [`AcquireProgress`] while doing so. A failed
//! item is reported and skipped; only cancellation (or a refused medium)
//! stops the run.
//!
//! Supported locators:
//! - `http://` and `https://`, through the transaction's proxy if set
//! - `file://` for local mirrors
//! - `cdrom:[Label]/path` for removable media mounted at the configured
//!   mount point

use crate::error::{Error, Result};
use crate::progress::DownloadStatus;
use crate::worker::acquire::{AcquireItem, AcquireProgress, AcquireStats};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Buffer size for streaming downloads
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Fetch engine settings
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Interval between progress pulses
    pub pulse_interval: Duration,
    /// Connection setup timeout (transfers themselves never time out)
    pub connect_timeout: Duration,
    /// Mount point for `cdrom:` locators
    pub cdrom_mount: PathBuf,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            pulse_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(30),
            cdrom_mount: PathBuf::from("/media/cdrom"),
            user_agent: format!("pkgworker/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Counts for a completed run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub fetched: usize,
    pub hits: usize,
    pub failed: usize,
}

/// Why a single item failed
struct ItemFailure {
    status: DownloadStatus,
    message: String,
}

impl ItemFailure {
    fn new(status: DownloadStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Outcome of a single item
enum ItemResult {
    Fetched,
    Failed(ItemFailure),
    Aborted(Error),
}

/// Running counters for pulses
struct Counters {
    started: Instant,
    last_pulse: Instant,
    stats: AcquireStats,
    /// Bytes transferred this run (excludes hits), for the speed
    transferred: u64,
}

impl Counters {
    fn cps(&self) -> u64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs < 0.001 {
            0
        } else {
            (self.transferred as f64 / secs) as u64
        }
    }

    fn snapshot(&mut self) -> AcquireStats {
        self.stats.current_cps = self.cps();
        self.stats
    }
}

/// Blocking downloader
pub struct HttpFetcher {
    client: Client,
    settings: FetchSettings,
}

impl HttpFetcher {
    /// Create a fetcher; `proxy` may be empty
    pub fn new(settings: FetchSettings, proxy: &str) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(None::<Duration>)
            .user_agent(settings.user_agent.clone());
        if !proxy.is_empty() {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| Error::ConfigError(format!("Invalid proxy {}: {e}", proxy)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| Error::DownloadError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, settings })
    }

    /// Fetch every item, driving `progress`
    pub fn fetch(
        &self,
        items: &mut [AcquireItem],
        progress: &mut dyn AcquireProgress,
    ) -> Result<FetchSummary> {
        let now = Instant::now();
        let mut counters = Counters {
            started: now,
            last_pulse: now,
            stats: AcquireStats {
                total_bytes: items.iter().map(|i| i.total_size).sum(),
                total_items: items.len() as u64,
                ..Default::default()
            },
            transferred: 0,
        };
        let mut summary = FetchSummary::default();

        progress.start();
        info!("Fetching {} items ({} bytes)", items.len(), counters.stats.total_bytes);

        for item in items.iter_mut() {
            if is_current(item) {
                progress.ims_hit(item);
                item.status = DownloadStatus::Done;
                counters.stats.current_bytes += item.total_size;
                counters.stats.current_items += 1;
                summary.hits += 1;
                continue;
            }

            progress.fetch(item);
            let bytes_before = counters.stats.current_bytes;
            let result = self.fetch_item(item, &mut counters, progress);
            // Replace partial accounting with the item's final size
            counters.stats.current_bytes = bytes_before + item.fetched_size;
            counters.stats.current_items += 1;

            match result {
                ItemResult::Fetched => {
                    item.status = DownloadStatus::Done;
                    progress.done(item);
                    summary.fetched += 1;
                }
                ItemResult::Failed(failure) => {
                    item.status = failure.status;
                    item.error = failure.message;
                    progress.fail(item);
                    summary.failed += 1;
                }
                ItemResult::Aborted(e) => {
                    progress.stop();
                    return Err(e);
                }
            }

            if !progress.pulse(&counters.snapshot()) {
                progress.stop();
                return Err(Error::Cancelled);
            }
            counters.last_pulse = Instant::now();
        }

        progress.stop();
        debug!("Fetch finished: {:?}", summary);
        Ok(summary)
    }

    fn fetch_item(
        &self,
        item: &mut AcquireItem,
        counters: &mut Counters,
        progress: &mut dyn AcquireProgress,
    ) -> ItemResult {
        if let Some(parent) = item.destination.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            return ItemResult::Failed(ItemFailure::new(
                DownloadStatus::Error,
                format!("Cannot create {}: {e}", parent.display()),
            ));
        }

        if let Some(rest) = item.uri.strip_prefix("cdrom:") {
            let rest = rest.to_string();
            return self.fetch_cdrom(item, &rest, counters, progress);
        }

        let url = match url::Url::parse(&item.uri) {
            Ok(url) => url,
            Err(e) => {
                return ItemResult::Failed(ItemFailure::new(
                    DownloadStatus::Error,
                    format!("Invalid locator: {e}"),
                ));
            }
        };

        match url.scheme() {
            "http" | "https" => self.fetch_http(item, counters, progress),
            "file" => match url.to_file_path() {
                Ok(path) => copy_local(&path, item, counters, progress, self.settings.pulse_interval),
                Err(()) => ItemResult::Failed(ItemFailure::new(
                    DownloadStatus::Error,
                    "Invalid file locator",
                )),
            },
            other => ItemResult::Failed(ItemFailure::new(
                DownloadStatus::Error,
                format!("Unsupported scheme {}", other),
            )),
        }
    }

    fn fetch_http(
        &self,
        item: &mut AcquireItem,
        counters: &mut Counters,
        progress: &mut dyn AcquireProgress,
    ) -> ItemResult {
        let response = match self.client.get(&item.uri).send() {
            Ok(response) => response,
            Err(e) => {
                return ItemResult::Failed(ItemFailure::new(DownloadStatus::NetworkError, e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let kind = match status.as_u16() {
                401 | 403 | 407 => DownloadStatus::AuthError,
                _ => DownloadStatus::Error,
            };
            return ItemResult::Failed(ItemFailure::new(kind, format!("HTTP {}", status)));
        }

        if item.total_size == 0
            && let Some(length) = response.content_length()
        {
            // Totals grow mid-run; the translator reports this as indeterminate
            item.total_size = length;
            counters.stats.total_bytes += length;
        }

        stream_to_destination(response, item, counters, progress, self.settings.pulse_interval)
    }

    fn fetch_cdrom(
        &self,
        item: &mut AcquireItem,
        locator: &str,
        counters: &mut Counters,
        progress: &mut dyn AcquireProgress,
    ) -> ItemResult {
        let Some((label, path)) = parse_cdrom(locator) else {
            return ItemResult::Failed(ItemFailure::new(
                DownloadStatus::Error,
                format!("Malformed cdrom locator {}", item.uri),
            ));
        };
        let mount = &self.settings.cdrom_mount;
        let source = mount.join(path.trim_start_matches('/'));

        while !source.exists() {
            if !progress.media_change(label, &mount.to_string_lossy()) {
                return ItemResult::Aborted(Error::DownloadError(format!(
                    "Medium '{}' was not provided",
                    label
                )));
            }
        }
        copy_local(&source, item, counters, progress, self.settings.pulse_interval)
    }
}

/// Destination already holds the expected bytes
fn is_current(item: &AcquireItem) -> bool {
    item.total_size > 0
        && fs::metadata(&item.destination)
            .map(|m| m.is_file() && m.len() == item.total_size)
            .unwrap_or(false)
}

/// Split `[Label]/path`
fn parse_cdrom(locator: &str) -> Option<(&str, &str)> {
    let rest = locator.strip_prefix('[')?;
    let (label, path) = rest.split_once(']')?;
    Some((label, path))
}

fn copy_local(
    source: &Path,
    item: &mut AcquireItem,
    counters: &mut Counters,
    progress: &mut dyn AcquireProgress,
    pulse_interval: Duration,
) -> ItemResult {
    match File::open(source) {
        Ok(file) => {
            if item.total_size == 0
                && let Ok(meta) = file.metadata()
            {
                item.total_size = meta.len();
                counters.stats.total_bytes += meta.len();
            }
            stream_to_destination(file, item, counters, progress, pulse_interval)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => ItemResult::Failed(ItemFailure::new(
            DownloadStatus::Error,
            format!("{} not found", source.display()),
        )),
        Err(e) => ItemResult::Failed(ItemFailure::new(DownloadStatus::Error, e.to_string())),
    }
}

/// Stream into `<destination>.partial`, then rename into place
fn stream_to_destination<R: Read>(
    mut reader: R,
    item: &mut AcquireItem,
    counters: &mut Counters,
    progress: &mut dyn AcquireProgress,
    pulse_interval: Duration,
) -> ItemResult {
    let partial = partial_path(&item.destination);
    let mut file = match File::create(&partial) {
        Ok(file) => file,
        Err(e) => {
            return ItemResult::Failed(ItemFailure::new(
                DownloadStatus::Error,
                format!("Cannot write {}: {e}", partial.display()),
            ));
        }
    };

    let base_bytes = counters.stats.current_bytes;
    let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];
    item.fetched_size = 0;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return ItemResult::Failed(ItemFailure::new(DownloadStatus::NetworkError, e.to_string()));
            }
        };
        if let Err(e) = file.write_all(&buffer[..n]) {
            let _ = fs::remove_file(&partial);
            return ItemResult::Failed(ItemFailure::new(DownloadStatus::Error, e.to_string()));
        }

        item.fetched_size += n as u64;
        counters.transferred += n as u64;
        counters.stats.current_bytes = base_bytes + item.fetched_size;

        if counters.last_pulse.elapsed() >= pulse_interval {
            counters.last_pulse = Instant::now();
            if !progress.pulse(&counters.snapshot()) {
                let _ = fs::remove_file(&partial);
                return ItemResult::Aborted(Error::Cancelled);
            }
        }
    }

    if item.total_size > 0 && item.fetched_size != item.total_size {
        let _ = fs::remove_file(&partial);
        return ItemResult::Failed(ItemFailure::new(
            DownloadStatus::Error,
            format!("Size mismatch: expected {}, got {}", item.total_size, item.fetched_size),
        ));
    }

    if let Err(e) = file.sync_all().and_then(|()| fs::rename(&partial, &item.destination)) {
        let _ = fs::remove_file(&partial);
        return ItemResult::Failed(ItemFailure::new(DownloadStatus::Error, e.to_string()));
    }
    ItemResult::Fetched
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;
    use tempfile::TempDir;

    /// Records callbacks; aborts pulses once `cancel_after` pulses ran
    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        pulses: usize,
        cancel_after: Option<usize>,
        media_answer: bool,
    }

    impl AcquireProgress for Recorder {
        fn start(&mut self) {
            self.calls.push("start".into());
        }
        fn ims_hit(&mut self, item: &AcquireItem) {
            self.calls.push(format!("hit {}", item.short_desc));
        }
        fn fetch(&mut self, item: &AcquireItem) {
            self.calls.push(format!("fetch {}", item.short_desc));
        }
        fn done(&mut self, item: &AcquireItem) {
            self.calls.push(format!("done {}", item.short_desc));
        }
        fn fail(&mut self, item: &AcquireItem) {
            self.calls.push(format!("fail {} {:?}", item.short_desc, item.status));
        }
        fn pulse(&mut self, _stats: &AcquireStats) -> bool {
            self.pulses += 1;
            self.cancel_after.is_none_or(|n| self.pulses < n)
        }
        fn media_change(&mut self, label: &str, _mount_point: &str) -> bool {
            self.calls.push(format!("media {}", label));
            self.media_answer
        }
        fn stop(&mut self) {
            self.calls.push("stop".into());
        }
    }

    fn file_item(dir: &TempDir, name: &str, content: Option<&[u8]>) -> AcquireItem {
        let source = dir.path().join("mirror").join(name);
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        if let Some(content) = content {
            fs::write(&source, content).unwrap();
        }
        let uri = url::Url::from_file_path(&source).unwrap().to_string();
        AcquireItem::new(uri, dir.path().join("archives").join(name)).with_short_desc(name)
    }

    #[test]
    fn test_failed_item_does_not_abort() {
        let dir = TempDir::new().unwrap();
        let mut items = vec![
            file_item(&dir, "foo.deb", Some(b"foo contents")),
            file_item(&dir, "missing.deb", None),
            file_item(&dir, "bar.deb", Some(b"bar")),
        ];

        let fetcher = HttpFetcher::new(FetchSettings::default(), "").unwrap();
        let mut recorder = Recorder::default();
        let summary = fetcher.fetch(&mut items, &mut recorder).unwrap();

        assert_eq!(summary, FetchSummary { fetched: 2, hits: 0, failed: 1 });
        assert_eq!(fs::read(dir.path().join("archives/foo.deb")).unwrap(), b"foo contents");
        assert!(recorder.calls.contains(&"fail missing.deb Error".to_string()));
        assert_eq!(recorder.calls.first().unwrap(), "start");
        assert_eq!(recorder.calls.last().unwrap(), "stop");
        assert!(!dir.path().join("archives/missing.deb.partial").exists());
    }

    #[test]
    fn test_current_file_is_a_hit() {
        let dir = TempDir::new().unwrap();
        let mut item = file_item(&dir, "foo.deb", Some(b"12345"));
        fs::create_dir_all(dir.path().join("archives")).unwrap();
        fs::write(&item.destination, b"12345").unwrap();
        item.total_size = 5;

        let fetcher = HttpFetcher::new(FetchSettings::default(), "").unwrap();
        let mut recorder = Recorder::default();
        let summary = fetcher.fetch(std::slice::from_mut(&mut item), &mut recorder).unwrap();
        assert_eq!(summary.hits, 1);
        assert!(recorder.calls.contains(&"hit foo.deb".to_string()));
    }

    #[test]
    fn test_cancel_stops_run() {
        let dir = TempDir::new().unwrap();
        let mut items = vec![
            file_item(&dir, "a.deb", Some(b"a")),
            file_item(&dir, "b.deb", Some(b"b")),
        ];
        let fetcher = HttpFetcher::new(FetchSettings::default(), "").unwrap();
        let mut recorder = Recorder {
            cancel_after: Some(1),
            ..Default::default()
        };
        assert!(matches!(fetcher.fetch(&mut items, &mut recorder), Err(Error::Cancelled)));
        assert!(!recorder.calls.contains(&"fetch b.deb".to_string()));
    }

    #[test]
    fn test_cdrom_medium_refused() {
        let dir = TempDir::new().unwrap();
        let settings = FetchSettings {
            cdrom_mount: dir.path().join("cdrom"),
            ..Default::default()
        };
        let mut items = vec![
            AcquireItem::new("cdrom:[Disc 1]/pool/foo.deb", dir.path().join("foo.deb"))
                .with_short_desc("foo"),
        ];
        let fetcher = HttpFetcher::new(settings, "").unwrap();
        let mut recorder = Recorder::default();
        let result = fetcher.fetch(&mut items, &mut recorder);
        assert!(matches!(result, Err(Error::DownloadError(_))));
        assert!(recorder.calls.contains(&"media Disc 1".to_string()));
    }

    #[test]
    fn test_cdrom_present() {
        let dir = TempDir::new().unwrap();
        let mount = dir.path().join("cdrom");
        fs::create_dir_all(mount.join("pool")).unwrap();
        fs::write(mount.join("pool/foo.deb"), b"from disc").unwrap();

        let settings = FetchSettings {
            cdrom_mount: mount,
            ..Default::default()
        };
        let mut items = vec![AcquireItem::new("cdrom:[Disc 1]/pool/foo.deb", dir.path().join("out/foo.deb"))];
        let fetcher = HttpFetcher::new(settings, "").unwrap();
        let summary = fetcher.fetch(&mut items, &mut Recorder::default()).unwrap();
        assert_eq!(summary.fetched, 1);
        assert_eq!(fs::read(dir.path().join("out/foo.deb")).unwrap(), b"from disc");
    }

    /// Serve `responses` in order, one per connection
    fn serve(responses: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = io::BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                    line.clear();
                }
                stream.write_all(response.as_bytes()).unwrap();
            }
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_http_download_and_errors() {
        let base = serve(vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            "HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ]);
        let dir = TempDir::new().unwrap();
        let mut items = vec![
            AcquireItem::new(format!("{}/a", base), dir.path().join("a")).with_short_desc("a"),
            AcquireItem::new(format!("{}/b", base), dir.path().join("b")).with_short_desc("b"),
            AcquireItem::new(format!("{}/c", base), dir.path().join("c")).with_short_desc("c"),
        ];

        let fetcher = HttpFetcher::new(FetchSettings::default(), "").unwrap();
        let mut recorder = Recorder::default();
        let summary = fetcher.fetch(&mut items, &mut recorder).unwrap();

        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(fs::read(dir.path().join("a")).unwrap(), b"hello");
        assert_eq!(items[0].total_size, 5);
        assert_eq!(items[1].status, DownloadStatus::Error);
        assert_eq!(items[2].status, DownloadStatus::AuthError);
    }

    #[test]
    fn test_parse_cdrom() {
        assert_eq!(parse_cdrom("[Disc 1]/pool/a.deb"), Some(("Disc 1", "/pool/a.deb")));
        assert_eq!(parse_cdrom("Disc 1/pool"), None);
    }
}
