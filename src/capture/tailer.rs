//! Log tailer: resolves the target file, follows appended lines, survives rotation,
//! truncation and undecodable bytes. Runs on its own OS thread; never busy-spins.
//!
//! Event mode waits on filesystem notifications with a periodic fallback read.
//! Polling mode re-reads on a fixed interval and compares file identity and size.

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crossbeam_channel as cb;
use notify::{EventKind, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use super::encoding::{self, TextEncoding};
use super::{DecodePolicy, LogSource, MonitorMode};
use crate::state_machine::{TailerState, TailerStateMachine};

/// Well-known log name pinned by polling mode when the target is a directory.
pub const LATEST_LOG_NAME: &str = "latest.log";

const READ_CHUNK_BYTES: usize = 64 * 1024;
const OPEN_RETRY: Duration = Duration::from_secs(2);
const RESOLVE_RETRY: Duration = Duration::from_secs(5);
const MISSING_FILE_WAIT: Duration = Duration::from_millis(500);
const EVENT_FALLBACK_TICK: Duration = Duration::from_secs(2);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// A partial line longer than this is flushed lossy instead of buffered further.
const MAX_PENDING_BYTES: usize = 1024 * 1024;

// --- Errors ---

#[derive(Debug)]
pub enum TailError {
    /// The stop signal fired; not a failure.
    Stopped,
    Io(io::Error),
    Watch(notify::Error),
}

impl std::fmt::Display for TailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TailError::Stopped => write!(f, "tailer stopped"),
            TailError::Io(e) => write!(f, "log I/O error: {}", e),
            TailError::Watch(e) => write!(f, "file watch error: {}", e),
        }
    }
}

impl std::error::Error for TailError {}

impl From<io::Error> for TailError {
    fn from(e: io::Error) -> Self {
        TailError::Io(e)
    }
}

impl From<notify::Error> for TailError {
    fn from(e: notify::Error) -> Self {
        TailError::Watch(e)
    }
}

/// Where to position the read cursor after opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    /// Skip existing history (initial open).
    End,
    /// Read everything after the BOM (rotation recovery, newly created log).
    Start,
}

/// Inode-equivalent identity used to notice a replaced file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity(u64, u64);

#[cfg(unix)]
fn file_identity(meta: &Metadata) -> FileIdentity {
    use std::os::unix::fs::MetadataExt;
    FileIdentity(meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn file_identity(meta: &Metadata) -> FileIdentity {
    let created = meta
        .created()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    FileIdentity(0, created)
}

enum Recovery {
    /// Decode the same bytes again under the relaxed policy.
    RetryLine,
    /// Pending bytes were dropped and the cursor moved to EOF.
    SkippedToEnd,
}

/// Single-source tailer. Not `Sync`; owned by the `log-tailer` thread.
pub struct LogTailer {
    source: LogSource,
    file: Option<File>,
    offset: u64,
    last_size: u64,
    identity: Option<FileIdentity>,
    opened_at: Option<SystemTime>,
    pending: Vec<u8>,
    line_no: u64,
    fallback: TextEncoding,
    poll_interval: Duration,
    state: Arc<TailerStateMachine>,
    stop: cb::Receiver<()>,
}

impl LogTailer {
    pub fn new(source: LogSource, poll_interval: Duration, stop: cb::Receiver<()>) -> Self {
        Self {
            source,
            file: None,
            offset: 0,
            last_size: 0,
            identity: None,
            opened_at: None,
            pending: Vec::new(),
            line_no: 0,
            fallback: encoding::locale_fallback(),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            state: Arc::new(TailerStateMachine::new()),
            stop,
        }
    }

    /// Override the locale-derived fallback codepage.
    pub fn with_fallback_encoding(mut self, fallback: TextEncoding) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn source(&self) -> &LogSource {
        &self.source
    }

    pub fn state(&self) -> Arc<TailerStateMachine> {
        self.state.clone()
    }

    /// Run until stopped. A stop request is reported as `Ok(())`.
    pub fn run(&mut self, sink: &mut dyn FnMut(String)) -> Result<(), TailError> {
        let result = match self.source.monitor_mode {
            MonitorMode::Polling => self.run_polling(sink),
            MonitorMode::Event => self.run_event_driven(sink),
        };
        self.close();
        match result {
            Err(TailError::Stopped) | Ok(()) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // --- Resolving ---

    /// Locate the file to tail, canonicalized. `None` when nothing exists yet.
    pub fn resolve_target(&self) -> Option<PathBuf> {
        let target = &self.source.path_or_directory;
        let found = if target.is_dir() {
            match self.source.monitor_mode {
                MonitorMode::Event => newest_log_in(target),
                MonitorMode::Polling => {
                    let latest = target.join(LATEST_LOG_NAME);
                    latest.is_file().then_some(latest)
                }
            }
        } else if target.is_file() {
            Some(target.clone())
        } else {
            None
        };
        found.map(|path| canonical(&path))
    }

    fn wait_for_target(&mut self) -> Result<PathBuf, TailError> {
        let mut announced = false;
        loop {
            if let Some(path) = self.resolve_target() {
                return Ok(path);
            }
            if !announced {
                info!(
                    target = %self.source.path_or_directory.display(),
                    retry_secs = RESOLVE_RETRY.as_secs(),
                    "no log file yet, waiting"
                );
                announced = true;
            }
            self.sleep(RESOLVE_RETRY)?;
        }
    }

    // --- Open ---

    /// Resolve and open the target, retrying on a fixed backoff until it succeeds or stop fires.
    pub fn open(&mut self, start: StartAt) -> Result<(), TailError> {
        self.open_with(|_| start)
    }

    /// Like [`open`](Self::open), with the cursor position chosen per resolved path.
    fn open_with(&mut self, start_for: impl Fn(&Path) -> StartAt) -> Result<(), TailError> {
        self.enter(TailerState::Resolving);
        loop {
            let path = self.wait_for_target()?;
            match self.open_file(&path, start_for(&path)) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        retry_secs = OPEN_RETRY.as_secs(),
                        "log open failed, retrying"
                    );
                    self.sleep(OPEN_RETRY)?;
                }
            }
        }
    }

    fn open_file(&mut self, path: &Path, start: StartAt) -> io::Result<()> {
        let path = canonical(path);
        let mut file = File::open(&path)?;
        let meta = file.metadata()?;

        let encoding = match self.source.user_encoding {
            Some(enc) => enc,
            None => encoding::sniff_file(&path),
        };

        let offset = match start {
            StartAt::End => meta.len(),
            StartAt::Start => {
                let bom = encoding.bom();
                let mut head = [0u8; 4];
                let n = file.read(&mut head)?;
                if !bom.is_empty() && head[..n].starts_with(bom) {
                    bom.len() as u64
                } else {
                    0
                }
            }
        };
        file.seek(SeekFrom::Start(offset))?;

        self.file = Some(file);
        self.offset = offset;
        self.last_size = meta.len();
        self.identity = Some(file_identity(&meta));
        self.opened_at = Some(SystemTime::now());
        self.pending.clear();
        self.line_no = 0;
        self.source.resolved_current_file = Some(path.clone());
        self.source.resolved_encoding = encoding;
        self.source.decode_error_policy = DecodePolicy::Strict;
        self.enter(TailerState::Open);

        info!(
            path = %path.display(),
            encoding = %encoding,
            offset,
            from = ?start,
            "log opened"
        );
        Ok(())
    }

    /// Drop the file handle.
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            debug!(path = ?self.source.resolved_current_file, "log closed");
        }
        self.pending.clear();
        self.enter(TailerState::Closed);
    }

    // --- ReadingLine ---

    /// Drain every complete line currently available. Returns the number of lines emitted.
    pub fn read_available(&mut self, sink: &mut dyn FnMut(String)) -> Result<usize, TailError> {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        let mut emitted = 0;
        loop {
            let n = match self.file.as_mut() {
                Some(file) => match file.read(&mut buf) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                },
                None => return Ok(emitted),
            };
            if n == 0 {
                break;
            }
            self.offset += n as u64;
            self.last_size = self.last_size.max(self.offset);
            self.pending.extend_from_slice(&buf[..n]);
            self.enter(TailerState::ReadingLine);
            emitted += self.drain_lines(sink)?;
            if self.pending.len() > MAX_PENDING_BYTES {
                emitted += self.flush_oversized_line(sink);
            }
        }
        if self.state.current() == TailerState::ReadingLine {
            self.enter(TailerState::Open);
        }
        Ok(emitted)
    }

    fn drain_lines(&mut self, sink: &mut dyn FnMut(String)) -> Result<usize, TailError> {
        let mut start = 0;
        let mut emitted = 0;
        loop {
            let encoding = self.source.resolved_encoding;
            let newline = encoding.newline();
            let Some(pos) = find_unit(&self.pending[start..], newline, encoding.unit_width()) else {
                break;
            };
            let end = start + pos;
            let decoded =
                encoding.decode_line(&self.pending[start..end], self.source.decode_error_policy);
            match decoded {
                Ok(text) => {
                    self.line_no += 1;
                    sink(text.trim_end_matches('\r').to_string());
                    emitted += 1;
                    start = end + newline.len();
                }
                Err(e) => {
                    warn!(
                        path = ?self.source.resolved_current_file,
                        offset = self.offset - (self.pending.len() - start) as u64,
                        line = self.line_no + 1,
                        encoding = %e.encoding,
                        policy = %self.source.decode_error_policy,
                        error = %e,
                        "line decode failed"
                    );
                    self.enter(TailerState::DecodeError);
                    match self.recover_from_decode_error()? {
                        Recovery::RetryLine => {
                            self.enter(TailerState::Open);
                            self.enter(TailerState::ReadingLine);
                        }
                        Recovery::SkippedToEnd => return Ok(emitted),
                    }
                }
            }
        }
        self.pending.drain(..start);
        Ok(emitted)
    }

    /// Emit the unterminated buffer as one lossy line, keeping any trailing partial code unit.
    fn flush_oversized_line(&mut self, sink: &mut dyn FnMut(String)) -> usize {
        let encoding = self.source.resolved_encoding;
        let cut = self.pending.len() - self.pending.len() % encoding.unit_width();
        warn!(
            path = ?self.source.resolved_current_file,
            offset = self.offset,
            pending_bytes = self.pending.len(),
            limit = MAX_PENDING_BYTES,
            encoding = %encoding,
            "line exceeds buffer limit, flushing lossy"
        );
        let bytes: Vec<u8> = self.pending.drain(..cut).collect();
        match encoding.decode_line(&bytes, DecodePolicy::Replace) {
            Ok(text) => {
                self.line_no += 1;
                sink(text);
                1
            }
            Err(e) => {
                warn!(error = %e, "oversized line dropped");
                0
            }
        }
    }

    /// Escalation: a pinned encoding goes lossy; otherwise switch to the locale fallback
    /// at EOF; a failing fallback goes lossy.
    fn recover_from_decode_error(&mut self) -> Result<Recovery, TailError> {
        let current = self.source.resolved_encoding;
        let policy = self.source.decode_error_policy;

        if policy == DecodePolicy::Replace {
            // Lossy decoding cannot fail; guard against looping on the same bytes.
            return self.skip_to_end();
        }

        if self.source.user_encoding.is_some() || current == self.fallback {
            self.source.decode_error_policy = DecodePolicy::Replace;
            info!(encoding = %current, "decode errors will be replaced");
            return Ok(Recovery::RetryLine);
        }

        self.source.resolved_encoding = self.fallback;
        self.source.decode_error_policy = DecodePolicy::Strict;
        info!(from = %current, to = %self.fallback, "switching to locale fallback encoding");
        self.skip_to_end()
    }

    fn skip_to_end(&mut self) -> Result<Recovery, TailError> {
        self.pending.clear();
        if let Some(file) = self.file.as_mut() {
            let end = file.seek(SeekFrom::End(0))?;
            self.offset = end;
            self.last_size = end;
        }
        self.enter(TailerState::Open);
        Ok(Recovery::SkippedToEnd)
    }

    // --- Rotation ---

    /// Returns `true` when the file was replaced, truncated or recreated and has been reopened.
    pub fn check_rotation(&mut self) -> Result<bool, TailError> {
        let Some(path) = self.source.resolved_current_file.clone() else {
            return Ok(false);
        };
        match fs::metadata(&path) {
            Ok(meta) => {
                let size = meta.len();
                let replaced = Some(file_identity(&meta)) != self.identity;
                let shrunk = size < self.offset || size < self.last_size;
                if !(replaced || shrunk) {
                    self.last_size = size;
                    return Ok(false);
                }
                info!(
                    path = %path.display(),
                    replaced,
                    old_offset = self.offset,
                    new_size = size,
                    "log rotation detected"
                );
                let opened_at = self.opened_at.unwrap_or_else(SystemTime::now);
                self.enter(TailerState::Rotated);
                self.open_with(|candidate| start_after_vanish(candidate, &path, opened_at))?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "log file disappeared, waiting for it to return");
                let opened_at = self.opened_at.unwrap_or_else(SystemTime::now);
                self.file = None;
                self.pending.clear();
                self.enter(TailerState::Resolving);
                self.sleep(MISSING_FILE_WAIT)?;
                self.open_with(|candidate| start_after_vanish(candidate, &path, opened_at))?;
                Ok(true)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "log stat failed");
                Ok(false)
            }
        }
    }

    /// One polling step: read growth, then check for rotation and read the new file.
    pub fn poll_once(&mut self, sink: &mut dyn FnMut(String)) -> Result<usize, TailError> {
        let mut emitted = self.read_available(sink)?;
        if self.check_rotation()? {
            emitted += self.read_available(sink)?;
        }
        Ok(emitted)
    }

    /// Absorb an I/O failure from one loop step: drop the handle, back off, reopen and
    /// resume at the last line boundary if the same file comes back. Stop passes through.
    fn recover_io<T>(&mut self, step: Result<T, TailError>) -> Result<(), TailError> {
        let e = match step {
            Ok(_) => return Ok(()),
            Err(TailError::Io(e)) => e,
            Err(other) => return Err(other),
        };
        let path = self.source.resolved_current_file.clone();
        let identity = self.identity;
        let resume_at = self.offset.saturating_sub(self.pending.len() as u64);
        let encoding = self.source.resolved_encoding;
        let policy = self.source.decode_error_policy;
        warn!(
            path = ?path,
            offset = resume_at,
            encoding = %encoding,
            error = %e,
            retry_secs = OPEN_RETRY.as_secs(),
            "log read failed, reopening"
        );
        self.file = None;
        self.pending.clear();
        self.enter(TailerState::Resolving);
        self.sleep(OPEN_RETRY)?;
        self.open(StartAt::End)?;

        let same_file = self.source.resolved_current_file == path && self.identity == identity;
        if same_file && resume_at <= self.last_size {
            if let Some(file) = self.file.as_mut() {
                if file.seek(SeekFrom::Start(resume_at)).is_ok() {
                    self.offset = resume_at;
                    self.source.resolved_encoding = encoding;
                    self.source.decode_error_policy = policy;
                    debug!(offset = resume_at, "resumed after read failure");
                }
            }
        }
        Ok(())
    }

    // --- Loops ---

    fn run_polling(&mut self, sink: &mut dyn FnMut(String)) -> Result<(), TailError> {
        self.open(StartAt::End)?;
        info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            "polling tailer running"
        );
        self.run_polling_opened(sink)
    }

    fn run_event_driven(&mut self, sink: &mut dyn FnMut(String)) -> Result<(), TailError> {
        self.open(StartAt::End)?;

        let (event_tx, event_rx) = cb::unbounded();
        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = event_tx.send(res);
        }) {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "file watcher unavailable, falling back to polling");
                return self.run_polling_opened(sink);
            }
        };
        let watch_dir = self.watch_dir();
        if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
            warn!(dir = %watch_dir.display(), error = %e, "watch failed, falling back to polling");
            return self.run_polling_opened(sink);
        }
        info!(dir = %watch_dir.display(), "event tailer running");

        let stop = self.stop.clone();
        loop {
            cb::select! {
                recv(stop) -> _ => return Err(TailError::Stopped),
                recv(event_rx) -> msg => match msg {
                    Ok(Ok(event)) => {
                        let step = self.on_fs_event(event, sink);
                        self.recover_io(step)?;
                    }
                    Ok(Err(e)) => warn!(error = %e, "file watch event error"),
                    Err(_) => {
                        warn!("file watcher stopped, falling back to polling");
                        return self.run_polling_opened(sink);
                    }
                },
                default(EVENT_FALLBACK_TICK) => {
                    let step = self.poll_once(sink);
                    self.recover_io(step)?;
                }
            }
        }
    }

    fn run_polling_opened(&mut self, sink: &mut dyn FnMut(String)) -> Result<(), TailError> {
        loop {
            let step = self.poll_once(sink);
            self.recover_io(step)?;
            self.sleep(self.poll_interval)?;
        }
    }

    fn on_fs_event(
        &mut self,
        event: notify::Event,
        sink: &mut dyn FnMut(String),
    ) -> Result<(), TailError> {
        match event.kind {
            EventKind::Create(_) => {
                let created_log = event.paths.iter().any(|p| is_log_file(p));
                if created_log && self.follows_latest() {
                    if let Some(newest) = self.resolve_target() {
                        if Some(&newest) != self.source.resolved_current_file.as_ref() {
                            // finish the old file before switching
                            self.read_available(sink)?;
                            info!(path = %newest.display(), "newer log created, switching");
                            if let Err(e) = self.open_file(&newest, StartAt::Start) {
                                warn!(path = %newest.display(), error = %e, "switch failed, re-resolving");
                                self.file = None;
                                self.pending.clear();
                                self.sleep(OPEN_RETRY)?;
                                self.open(StartAt::Start)?;
                            }
                        }
                    }
                }
                self.poll_once(sink)?;
            }
            EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any => {
                let touches_current = match self.source.resolved_current_file.as_deref() {
                    Some(current) => {
                        event.paths.is_empty()
                            || event.paths.iter().any(|p| canonical(p) == current)
                    }
                    None => true,
                };
                if touches_current {
                    self.poll_once(sink)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn follows_latest(&self) -> bool {
        self.source.monitor_mode == MonitorMode::Event && self.source.path_or_directory.is_dir()
    }

    fn watch_dir(&self) -> PathBuf {
        let target = canonical(&self.source.path_or_directory);
        if target.is_dir() {
            return target;
        }
        target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    // --- Helpers ---

    /// Sleep that wakes early on stop. Disconnect of the stop sender also counts as stop.
    fn sleep(&self, dur: Duration) -> Result<(), TailError> {
        match self.stop.recv_timeout(dur) {
            Err(cb::RecvTimeoutError::Timeout) => Ok(()),
            _ => Err(TailError::Stopped),
        }
    }

    fn enter(&self, next: TailerState) {
        let _ = self.state.transition(next);
    }
}

/// Find the first `needle` aligned to `width` bytes.
fn find_unit(hay: &[u8], needle: &[u8], width: usize) -> Option<usize> {
    if width <= 1 && needle.len() == 1 {
        return hay.iter().position(|&b| b == needle[0]);
    }
    (0..hay.len())
        .step_by(width.max(1))
        .find(|&i| hay[i..].starts_with(needle))
}

/// Absolute form with symlinks and `.`/`..` resolved; the input itself when it does not exist.
fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Cursor for the file that replaces a vanished one. The same path coming back, or a log
/// created after the vanished file was opened, is read from the start; any other log
/// already existed and only its new lines are followed.
fn start_after_vanish(candidate: &Path, vanished: &Path, vanished_opened_at: SystemTime) -> StartAt {
    if candidate == vanished {
        return StartAt::Start;
    }
    match fs::metadata(candidate).and_then(|meta| meta.created()) {
        Ok(created) if created > vanished_opened_at => StartAt::Start,
        _ => StartAt::End,
    }
}

fn is_log_file(path: &Path) -> bool {
    path.extension().map(|ext| ext.eq_ignore_ascii_case("log")).unwrap_or(false)
}

/// Most recently modified `*.log` directly inside `dir`.
fn newest_log_in(dir: &Path) -> Option<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "read_dir failed");
            return None;
        }
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| is_log_file(&entry.path()))
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            meta.is_file()
                .then(|| (meta.modified().unwrap_or(SystemTime::UNIX_EPOCH), entry.path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path)
}

// --- Thread handle ---

/// Owns the `log-tailer` thread. Dropping the stop sender wakes every wait inside the tailer.
pub struct TailerHandle {
    stop_tx: Option<cb::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    state: Arc<TailerStateMachine>,
}

impl TailerHandle {
    pub fn state(&self) -> TailerState {
        self.state.current()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<TailerState> {
        self.state.subscribe()
    }

    /// Signal stop and wait for the thread to close its file and watcher.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("log tailer thread panicked");
            }
        }
    }
}

impl Drop for TailerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start tailing `source` on a dedicated thread. Each decoded line goes to `sink`.
pub fn spawn<F>(
    source: LogSource,
    poll_interval: Duration,
    mut sink: F,
) -> io::Result<TailerHandle>
where
    F: FnMut(String) + Send + 'static,
{
    let (stop_tx, stop_rx) = cb::bounded::<()>(1);
    let mut tailer = LogTailer::new(source, poll_interval, stop_rx);
    let state = tailer.state();

    let thread = std::thread::Builder::new()
        .name("log-tailer".into())
        .spawn(move || {
            let target = tailer.source().path_or_directory.clone();
            match tailer.run(&mut sink) {
                Ok(()) => info!(target = %target.display(), "log tailer stopped"),
                Err(e) => error!(target = %target.display(), error = %e, "log tailer failed"),
            }
        })?;

    Ok(TailerHandle {
        stop_tx: Some(stop_tx),
        thread: Some(thread),
        state,
    })
}
