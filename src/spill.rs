//! Spill store: sorted runs persisted to temporary files.
//!
//! Every run is written to its own file inside a temporary directory owned by the store.
//! The directory is created on the first spill, so a sort that never overflows its page
//! does not touch the file system at all. A spill file is an 8 byte header followed by
//! length-prefixed frames, one per record:
//!
//! ```text
//! +----------+-------------+-----------------+-------------+-----------------+-----
//! | magic(8) | len(u32 le) | payload(len)    | len(u32 le) | payload(len)    | ...
//! +----------+-------------+-----------------+-------------+-----------------+-----
//! ```
//!
//! The payload encoding is defined by a [`SpillFormat`], MessagePack by default.

use std::error::Error;
use std::fmt::{self, Display};
use std::fs;
use std::io::{self, prelude::*};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Boxed error returned by spill formats.
pub type BoxError = Box<dyn Error + Send + Sync>;

const SPILL_MAGIC: &[u8; 8] = b"FSORTRN1";
const FRAME_HEADER_LEN: u64 = 4;

/// Record serialization used for spill files.
pub trait SpillFormat<T> {
    /// Appends the encoded record to `buf`.
    fn encode(item: &T, buf: &mut Vec<u8>) -> Result<(), BoxError>;

    /// Decodes a record from a complete frame payload.
    fn decode(bytes: &[u8]) -> Result<T, BoxError>;
}

/// RMP (Rust MessagePack) spill format.
/// For more information see https://msgpack.org/.
pub struct RmpFormat;

impl<T> SpillFormat<T> for RmpFormat
where
    T: serde::ser::Serialize + serde::de::DeserializeOwned,
{
    fn encode(item: &T, buf: &mut Vec<u8>) -> Result<(), BoxError> {
        rmp_serde::encode::write(buf, item)?;
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<T, BoxError> {
        Ok(rmp_serde::decode::from_slice(bytes)?)
    }
}

/// Spill store error.
#[derive(Debug)]
pub enum SpillError {
    /// Temporary directory creation error.
    TempDir(io::Error),
    /// Spill file I/O error.
    IO(io::Error),
    /// Record serialization error.
    Encode(BoxError),
    /// Spill file is truncated or its content is structurally invalid.
    Decode(BoxError),
}

impl Error for SpillError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        let source: &(dyn Error + 'static) = match self {
            SpillError::TempDir(err) => err,
            SpillError::IO(err) => err,
            SpillError::Encode(err) => err.as_ref(),
            SpillError::Decode(err) => err.as_ref(),
        };
        Some(source)
    }
}

impl Display for SpillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SpillError::TempDir(err) => write!(f, "temporary directory not created: {}", err),
            SpillError::IO(err) => write!(f, "spill file I/O failed: {}", err),
            SpillError::Encode(err) => write!(f, "record serialization error: {}", err),
            SpillError::Decode(err) => write!(f, "spill file decoding error: {}", err),
        }
    }
}

impl From<io::Error> for SpillError {
    fn from(err: io::Error) -> Self {
        SpillError::IO(err)
    }
}

/// Reference to a run persisted by a [`SpillStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillHandle {
    path: PathBuf,
    records: u64,
    size: u64,
}

impl SpillHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records in the run.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Spill file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Store of spilled runs.
///
/// The store keeps track of every file it created. [`SpillStore::close`], also invoked on drop,
/// deletes all of them together with the temporary directory.
pub struct SpillStore<T, C = RmpFormat> {
    /// Directory the temporary directory is created in.
    tmp_path: Option<PathBuf>,
    /// Temporary directory, created on first spill.
    dir: Option<tempfile::TempDir>,
    /// Spill file read/write buffer size.
    rw_buf_size: Option<usize>,
    next_id: usize,
    /// Files created and not yet disposed.
    live: Vec<PathBuf>,

    format: PhantomData<fn() -> (T, C)>,
}

impl<T, C> SpillStore<T, C> {
    /// Creates a store.
    ///
    /// # Arguments
    /// * `tmp_path` - Directory to create the temporary directory in. If the parameter is [`None`]
    ///   default OS temporary directory will be used.
    /// * `rw_buf_size` - Spill files read/write buffer size.
    pub fn new(tmp_path: Option<&Path>, rw_buf_size: Option<usize>) -> Self {
        SpillStore {
            tmp_path: tmp_path.map(Path::to_path_buf),
            dir: None,
            rw_buf_size,
            next_id: 0,
            live: Vec::new(),
            format: PhantomData,
        }
    }

    /// Temporary directory path, if any run has been spilled yet.
    pub fn dir_path(&self) -> Option<&Path> {
        self.dir.as_ref().map(|dir| dir.path())
    }

    /// Number of spill files on disk.
    pub fn live_files(&self) -> usize {
        self.live.len()
    }

    /// Deletes the spill file. Disposing of an already deleted file is a no-op.
    /// Any reader of the file should be dropped first.
    pub fn dispose(&mut self, handle: &SpillHandle) -> io::Result<()> {
        self.remove(&handle.path)
    }

    /// Deletes every spill file created by the store. All files are attempted, the first
    /// failure is returned.
    pub fn dispose_all(&mut self) -> io::Result<()> {
        let mut result = Ok(());
        for path in std::mem::take(&mut self.live) {
            if let Err(err) = remove_spill_file(&path) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        return result;
    }

    /// Deletes every spill file and the temporary directory. Safe to call more than once.
    pub fn close(&mut self) -> io::Result<()> {
        let disposed = self.dispose_all();
        if let Some(dir) = self.dir.take() {
            log::debug!("removing temporary directory {}", dir.path().display());
            dir.close()?;
        }

        return disposed;
    }

    fn remove(&mut self, path: &Path) -> io::Result<()> {
        remove_spill_file(path)?;
        self.live.retain(|live| live != path);

        return Ok(());
    }

    fn ensure_dir(&mut self) -> io::Result<PathBuf> {
        let dir = match self.dir.take() {
            Some(dir) => dir,
            None => {
                let mut builder = tempfile::Builder::new();
                builder.prefix("feature-sort-");
                let dir = match &self.tmp_path {
                    Some(tmp_path) => builder.tempdir_in(tmp_path),
                    None => builder.tempdir(),
                }?;
                log::info!("using {} as a temporary directory", dir.path().display());
                dir
            }
        };
        let path = dir.path().to_path_buf();
        self.dir = Some(dir);

        return Ok(path);
    }
}

impl<T, C> SpillStore<T, C>
where
    C: SpillFormat<T>,
{
    /// Persists a sorted run. On failure the partially written file is deleted.
    pub fn write(&mut self, items: impl IntoIterator<Item = T>) -> Result<SpillHandle, SpillError> {
        let dir = self.ensure_dir().map_err(SpillError::TempDir)?;
        let path = dir.join(format!("run-{:06}.spill", self.next_id));
        self.next_id += 1;

        let file = fs::OpenOptions::new().write(true).create_new(true).open(&path)?;
        self.live.push(path.clone());

        match Self::dump(file, items, self.rw_buf_size) {
            Ok((records, size)) => {
                log::debug!("spilled {} records ({} bytes) to {}", records, size, path.display());
                Ok(SpillHandle { path, records, size })
            }
            Err(err) => {
                if let Err(remove_err) = self.remove(&path) {
                    log::warn!("partial spill file {} not removed: {}", path.display(), remove_err);
                }
                Err(err)
            }
        }
    }

    /// Opens a forward-only reader yielding the run records in the order they were written.
    pub fn open_reader(&self, handle: &SpillHandle) -> Result<SpillReader<T, C>, SpillError> {
        let file = fs::File::open(&handle.path)?;
        let file_len = file.metadata()?.len();
        if file_len != handle.size {
            return Err(SpillError::Decode(
                format!(
                    "spill file {} is {} bytes long, {} expected",
                    handle.path.display(),
                    file_len,
                    handle.size
                )
                .into(),
            ));
        }

        let mut reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        let mut magic = [0u8; SPILL_MAGIC.len()];
        reader.read_exact(&mut magic).map_err(read_error)?;
        if &magic != SPILL_MAGIC {
            return Err(SpillError::Decode(
                format!("spill file {} has an unknown header", handle.path.display()).into(),
            ));
        }

        return Ok(SpillReader {
            reader: Some(reader),
            path: handle.path.clone(),
            remaining: handle.records,
            unread: handle.size.saturating_sub(SPILL_MAGIC.len() as u64),
            frame: Vec::new(),
            dispose_on_exhaust: false,
            format: PhantomData,
        });
    }

    fn dump(
        file: fs::File,
        items: impl IntoIterator<Item = T>,
        buf_size: Option<usize>,
    ) -> Result<(u64, u64), SpillError> {
        let mut writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        writer.write_all(SPILL_MAGIC)?;
        let mut size = SPILL_MAGIC.len() as u64;
        let mut records = 0;

        let mut frame = Vec::new();
        for item in items.into_iter() {
            frame.clear();
            C::encode(&item, &mut frame).map_err(SpillError::Encode)?;
            let frame_len = u32::try_from(frame.len()).map_err(|_| {
                SpillError::Encode(format!("record of {} bytes does not fit in a frame", frame.len()).into())
            })?;

            writer.write_all(&frame_len.to_le_bytes())?;
            writer.write_all(&frame)?;
            size += FRAME_HEADER_LEN + frame.len() as u64;
            records += 1;
        }

        writer.flush()?;

        return Ok((records, size));
    }
}

impl<T, C> Drop for SpillStore<T, C> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("spill files cleanup failed: {}", err);
        }
    }
}

/// Forward-only reader of a spilled run.
///
/// The reader is fused: after an error or exhaustion it yields `None`.
pub struct SpillReader<T, C = RmpFormat> {
    reader: Option<io::BufReader<fs::File>>,
    path: PathBuf,
    remaining: u64,
    /// Bytes of frames not read yet.
    unread: u64,
    frame: Vec<u8>,
    dispose_on_exhaust: bool,

    format: PhantomData<fn() -> (T, C)>,
}

impl<T, C> SpillReader<T, C> {
    /// Makes the reader delete its file as soon as the last record has been read.
    pub fn dispose_on_exhaust(mut self) -> Self {
        self.dispose_on_exhaust = true;
        return self;
    }

    /// Number of records not read yet.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn finish(&mut self) {
        if self.reader.take().is_some() && self.dispose_on_exhaust {
            match remove_spill_file(&self.path) {
                Ok(()) => log::trace!("spill file {} consumed and removed", self.path.display()),
                Err(err) => log::warn!("consumed spill file {} not removed: {}", self.path.display(), err),
            }
        }
    }
}

impl<T, C> Iterator for SpillReader<T, C>
where
    C: SpillFormat<T>,
{
    type Item = Result<T, SpillError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            self.finish();
            return None;
        }

        let reader = self.reader.as_mut()?;
        let result = read_frame(reader, &mut self.frame, &mut self.unread).and_then(|_| C::decode(&self.frame).map_err(SpillError::Decode));
        match result {
            Ok(item) => {
                self.remaining -= 1;
                Some(Ok(item))
            }
            Err(err) => {
                self.reader = None;
                Some(Err(err))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.reader.is_some() { self.remaining as usize } else { 0 };
        (0, Some(remaining))
    }
}

/// Reads one frame. A frame longer than the `unread` bytes left in the file is rejected
/// before its payload buffer is allocated.
fn read_frame(reader: &mut impl Read, frame: &mut Vec<u8>, unread: &mut u64) -> Result<(), SpillError> {
    if *unread < FRAME_HEADER_LEN {
        return Err(SpillError::Decode("spill file truncated".into()));
    }
    let mut len_buf = [0u8; FRAME_HEADER_LEN as usize];
    reader.read_exact(&mut len_buf).map_err(read_error)?;
    *unread -= FRAME_HEADER_LEN;

    let frame_len = u64::from(u32::from_le_bytes(len_buf));
    if frame_len > *unread {
        return Err(SpillError::Decode(
            format!("frame of {} bytes overruns the {} bytes left in the spill file", frame_len, unread).into(),
        ));
    }

    frame.clear();
    frame.resize(frame_len as usize, 0);
    reader.read_exact(frame.as_mut_slice()).map_err(read_error)?;
    *unread -= frame_len;

    return Ok(());
}

fn read_error(err: io::Error) -> SpillError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => SpillError::Decode("spill file truncated".into()),
        _ => SpillError::IO(err),
    }
}

fn remove_spill_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            log::trace!("spill file {} removed", path.display());
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::{prelude::*, SeekFrom};
    use std::path::Path;

    use rstest::*;

    use super::{BoxError, SpillError, SpillFormat, SpillStore};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn dir_entries(dir: &tempfile::TempDir) -> usize {
        fs::read_dir(dir.path()).unwrap().count()
    }

    #[rstest]
    fn test_rmp_spill(tmp_dir: tempfile::TempDir) {
        let saved = Vec::from_iter(0..100);

        let mut store: SpillStore<i32> = SpillStore::new(Some(tmp_dir.path()), None);
        let handle = store.write(saved.clone()).unwrap();
        assert_eq!(handle.records(), 100);

        let restored: Result<Vec<i32>, SpillError> = store.open_reader(&handle).unwrap().collect();
        let restored = restored.unwrap();

        assert_eq!(restored, saved);
    }

    #[rstest]
    fn test_variable_size_records(tmp_dir: tempfile::TempDir) {
        let saved = vec![
            (String::from("a"), None, vec![]),
            (String::from("a much longer string value"), Some(-42i64), vec![1.5, 2.5]),
            (String::new(), Some(7), vec![0.0; 64]),
        ];

        let mut store: SpillStore<(String, Option<i64>, Vec<f64>)> = SpillStore::new(Some(tmp_dir.path()), Some(16));
        let handle = store.write(saved.clone()).unwrap();

        let restored: Result<Vec<_>, SpillError> = store.open_reader(&handle).unwrap().collect();
        assert_eq!(restored.unwrap(), saved);
    }

    #[rstest]
    fn test_empty_run(tmp_dir: tempfile::TempDir) {
        let mut store: SpillStore<i32> = SpillStore::new(Some(tmp_dir.path()), None);
        let handle = store.write(Vec::new()).unwrap();

        assert_eq!(handle.records(), 0);
        assert_eq!(store.open_reader(&handle).unwrap().count(), 0);
    }

    #[rstest]
    fn test_directory_created_lazily(tmp_dir: tempfile::TempDir) {
        let mut store: SpillStore<i32> = SpillStore::new(Some(tmp_dir.path()), None);
        assert!(store.dir_path().is_none());
        assert_eq!(dir_entries(&tmp_dir), 0);

        store.write(vec![1, 2, 3]).unwrap();
        assert!(store.dir_path().is_some());
        assert_eq!(dir_entries(&tmp_dir), 1);
    }

    #[rstest]
    fn test_truncated_file(tmp_dir: tempfile::TempDir) {
        let mut store: SpillStore<String> = SpillStore::new(Some(tmp_dir.path()), None);
        let handle = store.write(vec![String::from("first"), String::from("second")]).unwrap();

        let file = fs::OpenOptions::new().write(true).open(handle.path()).unwrap();
        file.set_len(handle.size() - 3).unwrap();

        match store.open_reader(&handle) {
            Err(SpillError::Decode(_)) => {}
            other => panic!("decode error expected, got {:?}", other.map(|_| ())),
        }
    }

    #[rstest]
    fn test_corrupted_payload(tmp_dir: tempfile::TempDir) {
        let mut store: SpillStore<String> = SpillStore::new(Some(tmp_dir.path()), None);
        let handle = store.write(vec![String::from("first"), String::from("second")]).unwrap();

        // 0xc1 is a reserved MessagePack marker
        let mut file = fs::OpenOptions::new().write(true).open(handle.path()).unwrap();
        file.seek(SeekFrom::Start(12)).unwrap();
        file.write_all(&[0xc1]).unwrap();
        drop(file);

        let mut reader = store.open_reader(&handle).unwrap();
        assert!(matches!(reader.next(), Some(Err(SpillError::Decode(_)))));
        assert!(reader.next().is_none());
    }

    #[rstest]
    #[case(0x7fff_fff0)]
    #[case(u32::MAX)]
    #[case(5)]
    fn test_corrupted_frame_length(tmp_dir: tempfile::TempDir, #[case] frame_len: u32) {
        let mut store: SpillStore<i32> = SpillStore::new(Some(tmp_dir.path()), None);
        let handle = store.write(vec![7]).unwrap();
        assert_eq!(handle.size(), 13);

        let mut file = fs::OpenOptions::new().write(true).open(handle.path()).unwrap();
        file.seek(SeekFrom::Start(8)).unwrap();
        file.write_all(&frame_len.to_le_bytes()).unwrap();
        drop(file);

        let mut reader = store.open_reader(&handle).unwrap();
        match reader.next() {
            Some(Err(SpillError::Decode(err))) => assert!(err.to_string().contains("overruns"), "{}", err),
            other => panic!("decode error expected, got {:?}", other.map(|_| ())),
        }
        assert!(reader.next().is_none());
        assert!(reader.frame.capacity() < 16);
    }

    #[rstest]
    fn test_corrupted_header(tmp_dir: tempfile::TempDir) {
        let mut store: SpillStore<i32> = SpillStore::new(Some(tmp_dir.path()), None);
        let handle = store.write(vec![1]).unwrap();

        let mut file = fs::OpenOptions::new().write(true).open(handle.path()).unwrap();
        file.write_all(b"garbage!").unwrap();
        drop(file);

        assert!(matches!(store.open_reader(&handle), Err(SpillError::Decode(_))));
    }

    #[rstest]
    fn test_dispose_is_idempotent(tmp_dir: tempfile::TempDir) {
        let mut store: SpillStore<i32> = SpillStore::new(Some(tmp_dir.path()), None);
        let handle = store.write(vec![1, 2, 3]).unwrap();

        let mut reader = store.open_reader(&handle).unwrap();
        assert_eq!(reader.next().unwrap().unwrap(), 1);
        drop(reader);

        store.dispose(&handle).unwrap();
        assert!(!handle.path().exists());
        assert_eq!(store.live_files(), 0);

        store.dispose(&handle).unwrap();
        store.dispose_all().unwrap();
    }

    #[rstest]
    fn test_dispose_on_exhaust(tmp_dir: tempfile::TempDir) {
        let mut store: SpillStore<i32> = SpillStore::new(Some(tmp_dir.path()), None);
        let handle = store.write(vec![1, 2]).unwrap();

        let mut reader = store.open_reader(&handle).unwrap().dispose_on_exhaust();
        assert_eq!(reader.remaining(), 2);
        assert_eq!(reader.next().unwrap().unwrap(), 1);
        assert!(handle.path().exists());
        assert_eq!(reader.next().unwrap().unwrap(), 2);
        assert!(reader.next().is_none());
        assert!(!handle.path().exists());

        store.close().unwrap();
    }

    #[rstest]
    fn test_close_removes_everything(tmp_dir: tempfile::TempDir) {
        let mut store: SpillStore<i32> = SpillStore::new(Some(tmp_dir.path()), None);
        for chunk in (0..30).collect::<Vec<_>>().chunks(10) {
            store.write(chunk.to_vec()).unwrap();
        }
        assert_eq!(store.live_files(), 3);

        store.close().unwrap();
        store.close().unwrap();
        assert_eq!(store.live_files(), 0);
        assert_eq!(dir_entries(&tmp_dir), 0);
    }

    #[rstest]
    fn test_drop_removes_everything(tmp_dir: tempfile::TempDir) {
        let mut store: SpillStore<i32> = SpillStore::new(Some(tmp_dir.path()), None);
        store.write(vec![3, 2, 1]).unwrap();
        drop(store);

        assert_eq!(dir_entries(&tmp_dir), 0);
    }

    struct FailingFormat;

    impl SpillFormat<i32> for FailingFormat {
        fn encode(item: &i32, buf: &mut Vec<u8>) -> Result<(), BoxError> {
            if *item == 3 {
                return Err("unsupported value".into());
            }
            buf.extend_from_slice(&item.to_le_bytes());
            Ok(())
        }

        fn decode(bytes: &[u8]) -> Result<i32, BoxError> {
            let bytes: [u8; 4] = bytes.try_into()?;
            Ok(i32::from_le_bytes(bytes))
        }
    }

    #[rstest]
    fn test_failed_write_leaves_nothing(tmp_dir: tempfile::TempDir) {
        let mut store: SpillStore<i32, FailingFormat> = SpillStore::new(Some(tmp_dir.path()), None);

        let handle = store.write(vec![1, 2]).unwrap();
        store.dispose(&handle).unwrap();

        assert!(matches!(store.write(vec![1, 2, 3, 4]), Err(SpillError::Encode(_))));
        assert_eq!(store.live_files(), 0);
        assert_eq!(fs::read_dir(store.dir_path().unwrap()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_tmp_dir() {
        let mut store: SpillStore<i32> = SpillStore::new(Some(Path::new("./does/not/exist")), None);
        assert!(matches!(store.write(vec![1]), Err(SpillError::TempDir(_))));
    }
}
