use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::SupervisorError;

pub const LOG_MAX_BYTES: u64 = 8 * 1024 * 1024;
pub const LOG_KEEP_BYTES: u64 = 6 * 1024 * 1024;
pub const DEFAULT_TAIL_LINES: usize = 200;
const TRIM_INTERVAL: Duration = Duration::from_secs(2);
const STOP_POLL: Duration = Duration::from_millis(200);
const TAIL_BLOCK: usize = 16 * 1024;

/// The file the engine's stdout and stderr go to. Supervisor diagnostics
/// are written to it as well, tagged so they stand out.
#[derive(Debug, Clone)]
pub struct EngineLog {
    path: PathBuf,
}

impl EngineLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Empties the log and returns a handle for the engine's output.
    ///
    /// The handle is in append mode: every write lands at the current end of
    /// file, so it stays correct after the trimmer shortens the file.
    pub fn open_for_engine(&self) -> Result<File, SupervisorError> {
        File::create(&self.path).map_err(SupervisorError::Log)?;
        OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(SupervisorError::Log)
    }

    /// Once the file grows past `max_bytes`, keeps only its last
    /// `keep_bytes`. Returns whether it trimmed.
    pub fn trim(&self, keep_bytes: u64, max_bytes: u64) -> Result<bool, SupervisorError> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(false),
        };
        if len <= max_bytes {
            return Ok(false);
        }
        let mut kept = Vec::new();
        let mut file = File::open(&self.path).map_err(SupervisorError::Log)?;
        file.seek(SeekFrom::Start(len - keep_bytes.min(len)))
            .and_then(|_| file.read_to_end(&mut kept))
            .map_err(SupervisorError::Log)?;
        fs::write(&self.path, kept).map_err(SupervisorError::Log)?;
        Ok(true)
    }

    /// Keeps the log bounded until `stop` is set.
    pub fn spawn_trimmer(&self, stop: Arc<AtomicBool>) {
        let log = self.clone();
        thread::spawn(move || {
            let mut last_trim = Instant::now();
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(STOP_POLL);
                if last_trim.elapsed() < TRIM_INTERVAL {
                    continue;
                }
                if log.trim(LOG_KEEP_BYTES, LOG_MAX_BYTES).unwrap_or(false) {
                    debug!("trimmed {}", log.path.display());
                }
                last_trim = Instant::now();
            }
        });
    }

    pub fn note(&self, line: &str) {
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "[nextdesk] {line}"));
        if let Err(e) = written {
            debug!("cannot append to {}: {e}", self.path.display());
        }
    }

    /// The last `limit` lines, oldest first. Reads backwards block by block
    /// and stops as soon as enough line breaks have been seen.
    pub fn tail(&self, limit: usize) -> Result<Vec<String>, SupervisorError> {
        let limit = limit.max(1);
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SupervisorError::Log(e)),
        };
        let mut pos = file.metadata().map_err(SupervisorError::Log)?.len();

        let mut block = vec![0u8; TAIL_BLOCK];
        let mut tail: Vec<u8> = Vec::new();
        let mut breaks = 0;
        while pos > 0 && breaks <= limit {
            let step = pos.min(TAIL_BLOCK as u64);
            pos -= step;
            let chunk = &mut block[..step as usize];
            file.seek(SeekFrom::Start(pos))
                .and_then(|_| file.read_exact(chunk))
                .map_err(SupervisorError::Log)?;
            breaks += chunk.iter().filter(|byte| **byte == b'\n').count();
            tail.splice(0..0, chunk.iter().copied());
        }

        let text = String::from_utf8_lossy(&tail);
        let lines: Vec<&str> = text.lines().collect();
        let skip = lines.len().saturating_sub(limit);
        Ok(lines[skip..].iter().map(|line| line.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, EngineLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = EngineLog::new(dir.path().join("engine.log"));
        (dir, log)
    }

    #[test]
    fn tail_returns_last_lines_in_order() {
        let (_dir, log) = scratch();
        let body: String = (1..=5000).map(|n| format!("line {n}\n")).collect();
        fs::write(log.path(), body).unwrap();

        assert_eq!(log.tail(3).unwrap(), vec!["line 4998", "line 4999", "line 5000"]);
        let all = log.tail(10_000).unwrap();
        assert_eq!(all.len(), 5000);
        assert_eq!(all[0], "line 1");
    }

    #[test]
    fn tail_without_trailing_newline_keeps_last_line() {
        let (_dir, log) = scratch();
        fs::write(log.path(), "a\nb\nc").unwrap();
        assert_eq!(log.tail(2).unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn missing_log_has_no_lines() {
        let (_dir, log) = scratch();
        assert!(log.tail(10).unwrap().is_empty());
    }

    #[test]
    fn oversized_log_keeps_its_tail() {
        let (_dir, log) = scratch();
        fs::write(log.path(), b"0123456789").unwrap();

        assert!(!log.trim(4, 10).unwrap());
        fs::write(log.path(), b"0123456789ab").unwrap();
        assert!(log.trim(4, 10).unwrap());
        assert_eq!(fs::read(log.path()).unwrap(), b"89ab");
    }

    #[test]
    fn engine_writes_after_trim_land_at_the_new_end() {
        let (_dir, log) = scratch();
        fs::write(log.path(), b"stale output").unwrap();

        let mut engine = log.open_for_engine().unwrap();
        assert_eq!(fs::read(log.path()).unwrap(), b"");
        engine.write_all(b"0123456789ab").unwrap();
        assert!(log.trim(4, 10).unwrap());
        engine.write_all(b"NEW").unwrap();

        assert_eq!(fs::read(log.path()).unwrap(), b"89abNEW");
    }

    #[test]
    fn notes_are_tagged() {
        let (_dir, log) = scratch();
        log.note("binary not found");
        assert_eq!(log.tail(5).unwrap(), vec!["[nextdesk] binary not found"]);
    }
}
