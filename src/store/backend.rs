/// Durable backends for the event store.
///
/// The store is an append-only log of records. Each record is one frame:
///
/// ```text
/// [4-byte big-endian length][JSON record]
/// ```
///
/// Replaying the frames in order rebuilds every index exactly. A frame is
/// written and synced before the in-memory indices change, so a crash leaves
/// at worst a torn trailing frame, which `load` truncates away.
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::events::ids::{ConversationId, EventId};
use crate::events::Event;
use crate::state::snapshot::StateDelta;
use crate::store::StoreError;

/// Hard cap on a single frame; a larger length prefix means corruption.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// File name of the log inside the data directory.
pub const LOG_FILE_NAME: &str = "events.log";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    /// An event entered the graph, accepted or rejected.
    ///
    /// The state at its parents is `state_delta` applied to the state after
    /// `state_base`, or to empty state when there is no base.
    Persisted {
        event: Event,
        stream_ordering: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rejection: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_base: Option<EventId>,
        #[serde(default)]
        state_delta: StateDelta,
    },
    /// An event is held waiting on dependencies.
    Pending { event: Event },
    /// A held event was evicted to respect the pending bound.
    PendingEvicted {
        conversation_id: ConversationId,
        event_id: EventId,
    },
    /// Every held event of a conversation was dropped.
    PendingDiscarded { conversation_id: ConversationId },
}

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

pub fn encode_frame(record: &LogRecord) -> Result<Vec<u8>, StoreError> {
    let body = serde_json::to_vec(record).map_err(|e| StoreError::Encode(e.to_string()))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(StoreError::Encode(format!(
            "record is {} bytes, exceeds max of {}",
            body.len(),
            MAX_FRAME_BYTES
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode every complete frame in `data`.
///
/// Returns the records and the length of the valid prefix. An incomplete or
/// undecodable *final* frame ends the valid prefix; an undecodable frame
/// followed by more data is corruption.
pub fn decode_frames(data: &[u8]) -> Result<(Vec<LogRecord>, usize), StoreError> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset + 4 <= data.len() {
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[offset..offset + 4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        let body_start = offset + 4;

        if len > MAX_FRAME_BYTES {
            return Err(StoreError::Corrupt {
                offset,
                reason: format!("frame length {} exceeds max of {}", len, MAX_FRAME_BYTES),
            });
        }

        if body_start + len > data.len() {
            // Torn write at the tail.
            break;
        }

        match serde_json::from_slice::<LogRecord>(&data[body_start..body_start + len]) {
            Ok(record) => records.push(record),
            Err(_) if body_start + len == data.len() => break,
            Err(e) => {
                return Err(StoreError::Corrupt {
                    offset,
                    reason: e.to_string(),
                })
            }
        }
        offset = body_start + len;
    }

    Ok((records, offset))
}

// ---------------------------------------------------------------------------
// StorageBackend
// ---------------------------------------------------------------------------

/// Durable home of the record log.
///
/// `append` must either make the whole record durable or leave the log as it
/// was; `load` returns every durable record in append order.
pub trait StorageBackend: Send + Sync {
    fn append(&mut self, record: &LogRecord) -> Result<(), StoreError>;

    fn load(&mut self) -> Result<Vec<LogRecord>, StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

/// In-memory log. Clones share the same buffer, so a clone handed to a
/// second store simulates a restart.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    buffer: Arc<Mutex<Vec<u8>>>,
    fail_appends: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    /// Make every subsequent append fail with an I/O error.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Raw log bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.buffer.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

impl StorageBackend for MemoryBackend {
    fn append(&mut self, record: &LogRecord) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "append disabled",
            )));
        }
        let frame = encode_frame(record)?;
        let mut buffer = self.buffer.lock().map_err(|_| StoreError::Poisoned)?;
        buffer.extend_from_slice(&frame);
        Ok(())
    }

    fn load(&mut self) -> Result<Vec<LogRecord>, StoreError> {
        let mut buffer = self.buffer.lock().map_err(|_| StoreError::Poisoned)?;
        let (records, valid) = decode_frames(&buffer)?;
        buffer.truncate(valid);
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// FileBackend
// ---------------------------------------------------------------------------

/// Append-only log file, synced after every record.
pub struct FileBackend {
    path: PathBuf,
    file: File,
    /// Length of the durable, well-formed prefix.
    len: u64,
}

impl FileBackend {
    /// Open (or create) `dir/events.log`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        Ok(FileBackend { path, file, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn append(&mut self, record: &LogRecord) -> Result<(), StoreError> {
        let frame = encode_frame(record)?;
        let written = self
            .file
            .write_all(&frame)
            .and_then(|_| self.file.sync_data());
        if let Err(e) = written {
            // Drop any partial frame so later appends stay well-formed.
            if let Err(trunc) = self.file.set_len(self.len) {
                log::error!("Failed to roll back partial frame in {}: {}", self.path.display(), trunc);
            }
            return Err(StoreError::Io(e));
        }
        self.len += frame.len() as u64;
        Ok(())
    }

    fn load(&mut self) -> Result<Vec<LogRecord>, StoreError> {
        let data = fs::read(&self.path)?;
        let (records, valid) = decode_frames(&data)?;
        if valid < data.len() {
            log::warn!(
                "Truncating torn tail of {}: {} bytes",
                self.path.display(),
                data.len() - valid
            );
            self.file.set_len(valid as u64)?;
            self.file.sync_all()?;
        }
        self.len = valid as u64;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discarded(n: u32) -> LogRecord {
        LogRecord::PendingDiscarded {
            conversation_id: ConversationId::parse(&format!("!c{}:a.example", n)).unwrap(),
        }
    }

    fn conv_of(record: &LogRecord) -> String {
        match record {
            LogRecord::PendingDiscarded { conversation_id } => conversation_id.to_string(),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let mut data = encode_frame(&discarded(1)).unwrap();
        data.extend(encode_frame(&discarded(2)).unwrap());
        let full = data.len();
        let second = encode_frame(&discarded(3)).unwrap();
        data.extend_from_slice(&second[..second.len() - 3]);

        let (records, valid) = decode_frames(&data).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(valid, full);
        assert_eq!(conv_of(&records[1]), "!c2:a.example");
    }

    #[test]
    fn test_corrupt_middle_frame_is_error() {
        let mut data = encode_frame(&discarded(1)).unwrap();
        let mut bad = encode_frame(&discarded(2)).unwrap();
        bad[6] = b'#';
        data.extend(bad);
        data.extend(encode_frame(&discarded(3)).unwrap());
        assert!(matches!(
            decode_frames(&data),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_oversized_length_is_corrupt() {
        let data = (MAX_FRAME_BYTES as u32 + 1).to_be_bytes().to_vec();
        assert!(matches!(
            decode_frames(&data),
            Err(StoreError::Corrupt { offset: 0, .. })
        ));
    }

    #[test]
    fn test_memory_backend_shared_between_clones() {
        let mut a = MemoryBackend::new();
        a.append(&discarded(1)).unwrap();
        let mut b = a.clone();
        assert_eq!(b.load().unwrap().len(), 1);

        a.set_fail_appends(true);
        assert!(matches!(a.append(&discarded(2)), Err(StoreError::Io(_))));
        assert_eq!(b.load().unwrap().len(), 1);
    }

    #[test]
    fn test_file_backend_truncates_torn_tail_on_load() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut backend = FileBackend::open(dir.path()).unwrap();
            backend.append(&discarded(1)).unwrap();
            backend.append(&discarded(2)).unwrap();
        }
        let path = dir.path().join(LOG_FILE_NAME);
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0, 0, 1, 0, b'{']).unwrap();
        }

        let mut backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.load().unwrap().len(), 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        backend.append(&discarded(3)).unwrap();
        let mut reopened = FileBackend::open(dir.path()).unwrap();
        assert_eq!(reopened.load().unwrap().len(), 3);
    }

    #[test]
    fn test_evicted_record_shape() {
        let record = LogRecord::PendingEvicted {
            conversation_id: ConversationId::parse("!c:a.example").unwrap(),
            event_id: EventId::parse("$e").unwrap(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "pending_evicted");
    }
}
