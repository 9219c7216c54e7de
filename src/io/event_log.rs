//! JSONL event log - durable presence event store
//!
//! Events are written in JSONL format (one JSON object per line) to the
//! file specified in config. On open the existing file is replayed to
//! rebuild the in-memory index and continue the id sequence. Lines that do
//! not decode, including ones that are not UTF-8, are skipped.

use crate::domain::types::{NewPresenceEvent, PresenceEvent};
use crate::io::event_store::{newest_first, EventStore, StoreError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

struct LogState {
    file: File,
    events: Vec<PresenceEvent>,
    next_id: u64,
    /// File length covered by complete records
    committed_len: u64,
}

/// File-backed event store
pub struct JsonlEventStore {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl JsonlEventStore {
    /// Open (or create) the log at `path` and replay its contents
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| StoreError::Io { path: path.display().to_string(), source };

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let events = if path.exists() { Self::replay(&path).map_err(io_err)? } else { Vec::new() };
        let next_id = events.last().map_or(1, |e| e.id + 1);

        let mut file = OpenOptions::new().create(true).append(true).open(&path).map_err(io_err)?;
        Self::terminate_partial_line(&path, &mut file).map_err(io_err)?;
        let committed_len = file.metadata().map_err(io_err)?.len();

        info!(
            path = %path.display(),
            events = %events.len(),
            next_id = %next_id,
            "event_log_opened"
        );

        Ok(Self { path, state: Mutex::new(LogState { file, events, next_id, committed_len }) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().events.is_empty()
    }

    /// Read every well-formed record; ids must keep increasing
    fn replay(path: &Path) -> std::io::Result<Vec<PresenceEvent>> {
        let reader = BufReader::new(File::open(path)?);
        let mut events: Vec<PresenceEvent> = Vec::new();

        for (line_no, line) in reader.split(b'\n').enumerate() {
            let line = line?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<PresenceEvent>(&line) {
                Ok(event) if events.last().map_or(true, |last| event.id > last.id) => {
                    events.push(event)
                }
                Ok(event) => {
                    warn!(line = %(line_no + 1), id = %event.id, "event_log_id_out_of_order");
                }
                Err(e) => {
                    warn!(line = %(line_no + 1), error = %e, "event_log_line_skipped");
                }
            }
        }

        Ok(events)
    }

    /// A crash mid-write can leave a line without its newline; start the
    /// next record on a fresh line so it stays parseable.
    fn terminate_partial_line(path: &Path, file: &mut File) -> std::io::Result<()> {
        let mut reader = File::open(path)?;
        if reader.metadata()?.len() == 0 {
            return Ok(());
        }
        let mut last = [0u8; 1];
        reader.seek(SeekFrom::End(-1))?;
        reader.read_exact(&mut last)?;
        if last[0] != b'\n' {
            file.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Cut anything a failed write left past the last complete record
    fn truncate_torn_tail(file: &mut File, committed_len: u64) -> std::io::Result<()> {
        let len = file.metadata()?.len();
        if len > committed_len {
            warn!(torn_bytes = %(len - committed_len), "event_log_torn_tail_truncated");
            file.set_len(committed_len)?;
        }
        Ok(())
    }
}

impl EventStore for JsonlEventStore {
    fn append(&self, event: NewPresenceEvent) -> Result<PresenceEvent, StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let stored = PresenceEvent::from_new(state.next_id, event);

        let mut line = serde_json::to_string(&stored)?;
        line.push('\n');

        let written = Self::truncate_torn_tail(&mut state.file, state.committed_len)
            .and_then(|()| state.file.write_all(line.as_bytes()))
            .and_then(|()| state.file.flush());

        if let Err(source) = written {
            // Best effort now; the next append checks the tail again
            if let Err(e) = state.file.set_len(state.committed_len) {
                warn!(error = %e, "event_log_truncate_failed");
            }
            return Err(StoreError::Io { path: self.path.display().to_string(), source });
        }

        debug!(file = %self.path.display(), id = %stored.id, bytes = %line.len(), "event_log_written");

        state.committed_len += line.len() as u64;
        state.next_id += 1;
        state.events.push(stored.clone());
        Ok(stored)
    }

    fn fetch_recent(&self, limit: usize) -> Result<Vec<PresenceEvent>, StoreError> {
        Ok(newest_first(&self.state.lock().events, limit))
    }

    fn latest(&self) -> Result<Option<PresenceEvent>, StoreError> {
        Ok(self.state.lock().events.last().cloned())
    }
}
