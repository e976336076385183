//! Durable JSON-lines event store.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;
use crate::event::DomainEventMessage;
use crate::store::{EventStore, check_continuity};

/// File-backed [`EventStore`] writing one JSON object per line.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     streams/
///         <aggregate_id>.jsonl    -- one serialized DomainEventMessage per line
/// ```
///
/// Aggregate identifiers are escaped so that any string maps to a single
/// file name inside `streams/`. Each `append_events` call is validated under
/// a store-wide mutex and written per aggregate with a single `write_all`.
/// If writing any stream fails, every stream touched by the call is
/// truncated back to its previous length, so a failed call leaves no events
/// behind unless the process dies mid-write.
#[derive(Debug)]
pub struct JsonlEventStore<E> {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
    _marker: PhantomData<fn() -> E>,
}

impl<E> JsonlEventStore<E> {
    /// Open (or lazily create) a store rooted at `base_dir`.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Root directory for all event data. It does not need to
    ///   exist yet; it is created on the first append.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    /// Returns the root directory of this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the path of the stream file for `aggregate_id`.
    ///
    /// # Returns
    ///
    /// `<base_dir>/streams/<escaped aggregate_id>.jsonl`
    pub fn stream_path(&self, aggregate_id: &str) -> PathBuf {
        self.base_dir
            .join("streams")
            .join(format!("{}.jsonl", escape_id(aggregate_id)))
    }

    /// Lists all aggregate identifiers that have a stream file, sorted.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if reading the directory fails for a reason other
    /// than the directory not existing.
    pub fn list_streams(&self) -> io::Result<Vec<String>> {
        let dir = self.base_dir.join("streams");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| {
                let name = entry.ok()?.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".jsonl").and_then(unescape_id)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl<E> JsonlEventStore<E>
where
    E: DeserializeOwned,
{
    fn read_stream(&self, aggregate_id: &str) -> Result<Option<Vec<DomainEventMessage<E>>>, StoreError> {
        let file = match fs::File::open(self.stream_path(aggregate_id)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(Some(events))
    }
}

impl<E> EventStore<E> for JsonlEventStore<E>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn append_events(&self, events: &[DomainEventMessage<E>]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        check_continuity(events, |id| self.last_sequence_number(id))?;

        // Encode everything before touching the disk so that a serialization
        // failure leaves every stream untouched.
        let mut batches: Vec<(&str, String)> = Vec::new();
        for event in events {
            let line = serde_json::to_string(event)?;
            match batches.iter_mut().find(|(id, _)| *id == event.aggregate_id) {
                Some((_, buf)) => {
                    buf.push_str(&line);
                    buf.push('\n');
                }
                None => batches.push((event.aggregate_id.as_str(), format!("{line}\n"))),
            }
        }
        let batches: Vec<(PathBuf, String)> = batches
            .into_iter()
            .map(|(id, buf)| (self.stream_path(id), buf))
            .collect();

        fs::create_dir_all(self.base_dir.join("streams"))?;
        write_batches(&batches)?;
        Ok(())
    }

    fn read_events_range(
        &self,
        aggregate_id: &str,
        first: u64,
        last: u64,
    ) -> Result<Vec<DomainEventMessage<E>>, StoreError> {
        let events = self
            .read_stream(aggregate_id)?
            .filter(|events| !events.is_empty())
            .ok_or_else(|| StoreError::AggregateNotFound {
                aggregate_id: aggregate_id.to_owned(),
            })?;
        Ok(events
            .into_iter()
            .filter(|e| (first..=last).contains(&e.sequence_number))
            .collect())
    }

    fn last_sequence_number(&self, aggregate_id: &str) -> Result<Option<u64>, StoreError> {
        Ok(self
            .read_stream(aggregate_id)?
            .and_then(|events| events.last().map(|e| e.sequence_number)))
    }
}

/// A stream file opened for appending and its length before the append.
struct Touched {
    path: PathBuf,
    file: fs::File,
    len: u64,
}

/// Append each buffer to its file, all or nothing.
///
/// On failure every file already touched is truncated to its previous
/// length; files created by this call are removed again.
fn write_batches(batches: &[(PathBuf, String)]) -> io::Result<()> {
    let mut touched: Vec<Touched> = Vec::with_capacity(batches.len());
    for (path, buf) in batches {
        if let Err(e) = append_batch(path, buf, &mut touched) {
            undo(touched);
            return Err(e);
        }
    }
    for entry in &touched {
        entry.file.sync_data()?;
    }
    Ok(())
}

fn append_batch(path: &Path, buf: &str, touched: &mut Vec<Touched>) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    let written = file.write_all(buf.as_bytes());
    touched.push(Touched {
        path: path.to_owned(),
        file,
        len,
    });
    written
}

fn undo(touched: Vec<Touched>) {
    for Touched { path, file, len } in touched {
        let result = if len == 0 {
            drop(file);
            fs::remove_file(&path)
        } else {
            file.set_len(len)
        };
        if let Err(e) = result {
            tracing::error!(path = %path.display(), error = %e, "failed to undo partial append");
        }
    }
}

/// Escape an aggregate identifier into a portable file stem.
///
/// ASCII alphanumerics, `-` and `.` pass through; every other byte becomes
/// `_XX` (uppercase hex).
fn escape_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{b:02X}"));
        }
    }
    out
}

fn unescape_id(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
