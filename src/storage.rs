//! Persistent flow store: append-only flow log with sequential replay
//!
//! A `FlowStore` handle is opened either `WriteOnly` (append) or `ReadOnly`
//! (sequential read). Each file starts with a small header carrying the type
//! registry manifest it was written with; opening the log again checks that
//! manifest against the current registry so positional TIDs cannot be
//! silently misread.

use crate::error::{HubError, Result};
use crate::flow::{read_header, FlowItem, Position, RecordHeader};
use crate::registry::{PersistentData, Pooled, TypeRegistry};
use bytes::BytesMut;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File magic at the start of every flow log
pub const MAGIC: &[u8; 8] = b"A3SFLOW1";

/// Largest manifest accepted in a log header (1 MiB)
const MAX_MANIFEST_LEN: u32 = 1024 * 1024;

/// Open mode of a store handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenMode::ReadOnly => write!(f, "read-only"),
            OpenMode::WriteOnly => write!(f, "write-only"),
        }
    }
}

struct LogReader {
    inner: BufReader<File>,
    /// Byte offset of the next unread record
    offset: u64,
    /// Number of types in the file manifest
    types: usize,
}

struct LogWriter {
    out: BufWriter<File>,
    /// Number of types in the file manifest; higher TIDs cannot be written
    types: usize,
}

enum Handle {
    Unopened,
    Reader(LogReader),
    Writer(LogWriter),
    Closed,
}

impl Handle {
    fn describe(&self) -> String {
        match self {
            Handle::Unopened => "unopened".to_string(),
            Handle::Reader(_) => OpenMode::ReadOnly.to_string(),
            Handle::Writer(_) => OpenMode::WriteOnly.to_string(),
            Handle::Closed => "closed".to_string(),
        }
    }
}

/// File-backed flow log
pub struct FlowStore {
    path: PathBuf,
    registry: Arc<TypeRegistry>,
    handle: Handle,
    scratch: BytesMut,
}

impl FlowStore {
    /// Create an unopened store for `path`
    pub fn new(path: impl Into<PathBuf>, registry: Arc<TypeRegistry>) -> Self {
        Self {
            path: path.into(),
            registry,
            handle: Handle::Unopened,
            scratch: BytesMut::new(),
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current open mode, if any
    pub fn mode(&self) -> Option<OpenMode> {
        match self.handle {
            Handle::Reader(_) => Some(OpenMode::ReadOnly),
            Handle::Writer(_) => Some(OpenMode::WriteOnly),
            _ => None,
        }
    }

    /// Acquire the underlying file in the given mode
    ///
    /// `ReadOnly` requires an existing log. `WriteOnly` creates the log (and
    /// its parent directories) or appends to an existing one.
    pub fn open(&mut self, mode: OpenMode) -> Result<()> {
        if matches!(self.handle, Handle::Reader(_) | Handle::Writer(_)) {
            return Err(HubError::InvalidMode {
                operation: "open",
                mode: self.handle.describe(),
            });
        }

        self.handle = match mode {
            OpenMode::ReadOnly => {
                let file = File::open(&self.path)?;
                let mut inner = BufReader::new(file);
                let (offset, types) = self.read_file_header(&mut inner)?;
                Handle::Reader(LogReader {
                    inner,
                    offset,
                    types,
                })
            }
            OpenMode::WriteOnly => {
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }

                let mut file = OpenOptions::new()
                    .read(true)
                    .append(true)
                    .create(true)
                    .open(&self.path)?;

                let types = if file.metadata()?.len() == 0 {
                    self.write_file_header(&mut file)?
                } else {
                    let mut reader = BufReader::new(&file);
                    self.read_file_header(&mut reader)?.1
                };
                Handle::Writer(LogWriter {
                    out: BufWriter::new(file),
                    types,
                })
            }
        };

        tracing::debug!(path = %self.path.display(), mode = %mode, "Flow store opened");
        Ok(())
    }

    /// Append one item
    ///
    /// Types registered after the log was created are rejected: the file
    /// manifest does not name them, so their TIDs would be ambiguous on replay.
    pub fn write<T: PersistentData>(&mut self, item: &FlowItem<T>) -> Result<()> {
        let types = match &self.handle {
            Handle::Writer(w) => w.types,
            Handle::Closed => return Err(HubError::Closed),
            other => {
                return Err(HubError::InvalidMode {
                    operation: "write",
                    mode: other.describe(),
                })
            }
        };
        if let Some(tid) = self.registry.tid_of::<T>() {
            if tid.0 as usize >= types {
                return Err(self.mismatch(format!(
                    "{} (tid {}) is not in the log manifest of {} types",
                    std::any::type_name::<T>(),
                    tid,
                    types
                )));
            }
        }

        self.scratch.clear();
        item.encode(&self.registry, &mut self.scratch)?;
        if let Handle::Writer(w) = &mut self.handle {
            w.out.write_all(&self.scratch)?;
        }
        Ok(())
    }

    /// Force buffered writes to durable storage; no-op outside write mode
    pub fn flush(&mut self) -> Result<()> {
        if let Handle::Writer(w) = &mut self.handle {
            w.out.flush()?;
            w.out.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Read the next record
    ///
    /// Returns [`HubError::EndOfLog`] once the log is exhausted. A torn record
    /// at the tail (a writer mid-flush) also reports `EndOfLog` and is re-read
    /// in full by a later call.
    pub fn read(&mut self) -> Result<FlowItem<Pooled>> {
        let reader = self.reader("read")?;
        let start = reader.offset;

        let header = match read_header(&mut reader.inner) {
            Ok(header) => header,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return rewind(reader, start),
            Err(e) => return Err(e.into()),
        };

        let mut payload = vec![0u8; header.len as usize];
        match reader.inner.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return rewind(reader, start),
            Err(e) => return Err(e.into()),
        }
        reader.offset = start + header_size(&header) + header.len as u64;
        let types = reader.types;

        if header.tid.0 as usize >= types {
            return Err(self.mismatch(format!(
                "record {} has tid {} outside the log manifest of {} types",
                header.position, header.tid, types
            )));
        }
        let mut data = self.registry.new_instance(header.tid)?;
        data.deserialize(&payload)?;
        Ok(FlowItem::at(header.position, data))
    }

    /// Skip the next record, returning only its header
    pub fn skip(&mut self) -> Result<RecordHeader> {
        let reader = self.reader("skip")?;
        let start = reader.offset;

        let header = match read_header(&mut reader.inner) {
            Ok(header) => header,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return rewind(reader, start),
            Err(e) => return Err(e.into()),
        };

        let skipped = std::io::copy(
            &mut (&mut reader.inner).take(header.len as u64),
            &mut std::io::sink(),
        )?;
        if skipped < header.len as u64 {
            return rewind(reader, start);
        }
        reader.offset = start + header_size(&header) + header.len as u64;
        Ok(header)
    }

    /// Release the file; written data is flushed and synced first
    pub fn close(&mut self) -> Result<()> {
        let result = self.flush();
        self.handle = Handle::Closed;
        tracing::debug!(path = %self.path.display(), "Flow store closed");
        result
    }

    /// Position of the last complete record in an existing log
    pub fn tail(path: impl AsRef<Path>, registry: Arc<TypeRegistry>) -> Result<Option<Position>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }

        let mut store = FlowStore::new(path, registry);
        store.open(OpenMode::ReadOnly)?;

        let mut last = None;
        loop {
            match store.skip() {
                Ok(header) => last = Some(header.position),
                Err(HubError::EndOfLog) => break,
                Err(e) => return Err(e),
            }
        }
        store.close()?;
        Ok(last)
    }

    fn reader(&mut self, operation: &'static str) -> Result<&mut LogReader> {
        match &mut self.handle {
            Handle::Reader(r) => Ok(r),
            Handle::Closed => Err(HubError::Closed),
            other => Err(HubError::InvalidMode {
                operation,
                mode: other.describe(),
            }),
        }
    }

    /// Write the header for a new log, returning the number of types it names
    fn write_file_header(&self, file: &mut File) -> Result<usize> {
        let names = self.registry.type_names();
        let manifest = serde_json::to_vec(&names)?;
        let mut header = Vec::with_capacity(MAGIC.len() + 4 + manifest.len());
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&(manifest.len() as u32).to_le_bytes());
        header.extend_from_slice(&manifest);
        file.write_all(&header)?;
        file.sync_data()?;
        Ok(names.len())
    }

    /// Read and validate the file header
    ///
    /// Returns the offset of the first record and the number of manifest types.
    fn read_file_header<R: Read>(&self, reader: &mut R) -> Result<(u64, usize)> {
        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .map_err(|e| self.mismatch(format!("missing header: {}", e)))?;
        if &magic != MAGIC {
            return Err(self.mismatch("bad magic".to_string()));
        }

        let mut len = [0u8; 4];
        reader
            .read_exact(&mut len)
            .map_err(|e| self.mismatch(format!("missing manifest length: {}", e)))?;
        let len = u32::from_le_bytes(len);
        if len > MAX_MANIFEST_LEN {
            return Err(self.mismatch(format!("manifest too large: {} bytes", len)));
        }

        let mut manifest = vec![0u8; len as usize];
        reader
            .read_exact(&mut manifest)
            .map_err(|e| self.mismatch(format!("truncated manifest: {}", e)))?;
        let written: Vec<String> = serde_json::from_slice(&manifest)?;

        let current = self.registry.type_names();
        if written.len() > current.len() || written[..] != current[..written.len()] {
            return Err(self.mismatch(format!(
                "log registered {:?}, process registered {:?}",
                written, current
            )));
        }

        Ok(((MAGIC.len() + 4 + manifest.len()) as u64, written.len()))
    }

    fn mismatch(&self, reason: String) -> HubError {
        HubError::SchemaMismatch {
            path: self.path.display().to_string(),
            reason,
        }
    }
}

impl fmt::Debug for FlowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowStore")
            .field("path", &self.path)
            .field("handle", &self.handle.describe())
            .finish()
    }
}

fn rewind<T>(reader: &mut LogReader, start: u64) -> Result<T> {
    reader.inner.seek(SeekFrom::Start(start))?;
    reader.offset = start;
    Err(HubError::EndOfLog)
}

fn header_size(header: &RecordHeader) -> u64 {
    let mut tid_len = 1;
    let mut tid = header.tid.0 >> 7;
    while tid > 0 {
        tid_len += 1;
        tid >>= 7;
    }
    (crate::flow::FIXED_HEADER_LEN + tid_len + 4) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Tid;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Tick(u64);

    impl PersistentData for Tick {
        fn serialize(&self) -> Vec<u8> {
            self.0.to_le_bytes().to_vec()
        }

        fn deserialize(&mut self, data: &[u8]) -> Result<()> {
            let bytes: [u8; 8] = data
                .try_into()
                .map_err(|_| HubError::Decode(format!("expected 8 bytes, got {}", data.len())))?;
            self.0 = u64::from_le_bytes(bytes);
            Ok(())
        }
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Other;

    impl PersistentData for Other {
        fn serialize(&self) -> Vec<u8> {
            Vec::new()
        }

        fn deserialize(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> Arc<TypeRegistry> {
        let reg = TypeRegistry::new();
        reg.register_default::<Tick>().unwrap();
        Arc::new(reg)
    }

    fn write_ticks(path: &Path, reg: &Arc<TypeRegistry>, range: std::ops::RangeInclusive<u64>) {
        let mut store = FlowStore::new(path, reg.clone());
        store.open(OpenMode::WriteOnly).unwrap();
        for seq in range {
            store.write(&FlowItem::new(0, seq, Tick(seq * 10))).unwrap();
        }
        store.close().unwrap();
    }

    #[test]
    fn test_write_requires_write_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.flow");
        let reg = registry();
        write_ticks(&path, &reg, 1..=1);

        let mut store = FlowStore::new(&path, reg);
        let err = store.write(&FlowItem::new(0, 2, Tick(1))).unwrap_err();
        assert!(matches!(err, HubError::InvalidMode { operation: "write", .. }));

        store.open(OpenMode::ReadOnly).unwrap();
        let err = store.write(&FlowItem::new(0, 2, Tick(1))).unwrap_err();
        assert!(matches!(err, HubError::InvalidMode { .. }));
    }

    #[test]
    fn test_read_requires_read_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlowStore::new(dir.path().join("t.flow"), registry());
        store.open(OpenMode::WriteOnly).unwrap();
        assert!(matches!(store.read().unwrap_err(), HubError::InvalidMode { .. }));
    }

    #[test]
    fn test_open_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlowStore::new(dir.path().join("missing.flow"), registry());
        assert!(matches!(store.open(OpenMode::ReadOnly).unwrap_err(), HubError::Io(_)));
    }

    #[test]
    fn test_closed_handle_rejects_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.flow");
        let reg = registry();
        write_ticks(&path, &reg, 1..=2);

        let mut store = FlowStore::new(&path, reg);
        store.open(OpenMode::ReadOnly).unwrap();
        store.close().unwrap();
        assert!(matches!(store.read().unwrap_err(), HubError::Closed));
        assert!(matches!(
            store.write(&FlowItem::new(0, 3, Tick(0))).unwrap_err(),
            HubError::Closed
        ));
    }

    #[test]
    fn test_double_open_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlowStore::new(dir.path().join("t.flow"), registry());
        store.open(OpenMode::WriteOnly).unwrap();
        assert!(store.open(OpenMode::ReadOnly).is_err());
    }

    #[test]
    fn test_append_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("t.flow");
        let reg = registry();
        write_ticks(&path, &reg, 1..=2);
        write_ticks(&path, &reg, 3..=4);

        let mut store = FlowStore::new(&path, reg);
        store.open(OpenMode::ReadOnly).unwrap();
        for seq in 1..=4 {
            let item = store.read().unwrap();
            assert_eq!(item.sequence, seq);
            assert_eq!(item.data.downcast_ref::<Tick>(), Some(&Tick(seq * 10)));
        }
        assert!(store.read().unwrap_err().is_end_of_log());
    }

    #[test]
    fn test_tail_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.flow");
        let reg = registry();

        assert_eq!(FlowStore::tail(&path, reg.clone()).unwrap(), None);
        write_ticks(&path, &reg, 1..=5);
        assert_eq!(
            FlowStore::tail(&path, reg).unwrap(),
            Some(Position::new(0, 5))
        );
    }

    #[test]
    fn test_torn_tail_is_end_of_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.flow");
        let reg = registry();
        write_ticks(&path, &reg, 1..=2);

        // Chop the last record in half
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();

        let mut store = FlowStore::new(&path, reg.clone());
        store.open(OpenMode::ReadOnly).unwrap();
        assert_eq!(store.read().unwrap().sequence, 1);
        assert!(store.read().unwrap_err().is_end_of_log());
        assert!(store.read().unwrap_err().is_end_of_log());
        assert_eq!(FlowStore::tail(&path, reg).unwrap(), Some(Position::new(0, 1)));
    }

    #[test]
    fn test_reader_sees_later_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.flow");
        let reg = registry();

        let mut writer = FlowStore::new(&path, reg.clone());
        writer.open(OpenMode::WriteOnly).unwrap();
        writer.write(&FlowItem::new(0, 1, Tick(1))).unwrap();
        writer.flush().unwrap();

        let mut reader = FlowStore::new(&path, reg);
        reader.open(OpenMode::ReadOnly).unwrap();
        assert_eq!(reader.read().unwrap().sequence, 1);
        assert!(reader.read().unwrap_err().is_end_of_log());

        writer.write(&FlowItem::new(0, 2, Tick(2))).unwrap();
        writer.flush().unwrap();
        assert_eq!(reader.read().unwrap().sequence, 2);
    }

    #[test]
    fn test_schema_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.flow");
        write_ticks(&path, &registry(), 1..=1);

        // Same types, different registration order
        let reordered = TypeRegistry::new();
        reordered.register_default::<Other>().unwrap();
        reordered.register_default::<Tick>().unwrap();

        let mut store = FlowStore::new(&path, Arc::new(reordered));
        let err = store.open(OpenMode::ReadOnly).unwrap_err();
        assert!(matches!(err, HubError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_manifest_prefix_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.flow");
        write_ticks(&path, &registry(), 1..=1);

        // Registering more kinds afterwards keeps old TIDs valid
        let extended = registry();
        assert_eq!(extended.register_default::<Other>().unwrap(), Tid(1));

        let mut store = FlowStore::new(&path, extended);
        store.open(OpenMode::ReadOnly).unwrap();
        assert_eq!(store.read().unwrap().sequence, 1);
    }

    #[test]
    fn test_type_outside_manifest_rejected_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.flow");
        write_ticks(&path, &registry(), 1..=1);

        let extended = registry();
        extended.register_default::<Other>().unwrap();

        let mut store = FlowStore::new(&path, extended.clone());
        store.open(OpenMode::WriteOnly).unwrap();
        let err = store.write(&FlowItem::new(0, 2, Other::default())).unwrap_err();
        assert!(matches!(err, HubError::SchemaMismatch { .. }));

        // Types named by the manifest still append
        store.write(&FlowItem::new(0, 2, Tick(2))).unwrap();
        store.close().unwrap();

        let mut reader = FlowStore::new(&path, extended);
        reader.open(OpenMode::ReadOnly).unwrap();
        assert_eq!(reader.read().unwrap().sequence, 1);
        assert_eq!(reader.read().unwrap().sequence, 2);
        assert!(reader.read().unwrap_err().is_end_of_log());
    }
}
