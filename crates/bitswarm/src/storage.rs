//! Byte range storage over the logical concatenation of a torrent's files.
//!
//! The piece store never opens files itself, it reads and writes absolute
//! offsets through a [`Storage`]. A range that touches a file which does
//! not exist (or is too short) reads as `None`, the data is simply not
//! there yet.
use std::{future::Future, io::SeekFrom, ops::Range, path::PathBuf};

use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::debug;

use crate::{error::Error, metainfo::FileEntry};

pub trait Storage: Send + Sync + 'static {
    /// Read `len` bytes at the absolute `offset`.
    fn read(
        &self,
        offset: u64,
        len: usize,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Error>> + Send;

    /// Write `data` at the absolute `offset`, creating files on demand.
    fn write(
        &self,
        offset: u64,
        data: &[u8],
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// One piece of a range that falls inside a single file.
#[derive(Debug, PartialEq, Eq)]
struct Segment {
    /// Index of the file.
    file: usize,
    /// Offset inside the file.
    file_offset: u64,
    /// Where the bytes live in the caller's buffer.
    buf: Range<usize>,
}

/// Split the range `offset..offset + len` on file boundaries. `None` if the
/// range goes past the end of the content.
fn segments(files: &[FileEntry], offset: u64, len: usize) -> Option<Vec<Segment>> {
    let end = offset + len as u64;
    let total = files.last().map(|f| f.offset + f.length).unwrap_or(0);
    if end > total {
        return None;
    }

    let mut segments = Vec::new();
    for (i, file) in files.iter().enumerate() {
        let file_end = file.offset + file.length;
        if file_end <= offset || file.offset >= end {
            continue;
        }
        let start = offset.max(file.offset);
        let stop = end.min(file_end);
        segments.push(Segment {
            file: i,
            file_offset: start - file.offset,
            buf: (start - offset) as usize..(stop - offset) as usize,
        });
    }
    Some(segments)
}

struct DiskFile {
    entry: FileEntry,
    /// Held only while writing to this file.
    lock: Mutex<()>,
}

/// [`Storage`] backed by files under a download directory.
pub struct FileStorage {
    root: PathBuf,
    entries: Vec<FileEntry>,
    files: Vec<DiskFile>,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>, layout: Vec<FileEntry>) -> Self {
        let files = layout
            .iter()
            .cloned()
            .map(|entry| DiskFile { entry, lock: Mutex::new(()) })
            .collect();
        Self { root: root.into(), entries: layout, files }
    }

    fn path(&self, file: usize) -> PathBuf {
        self.root.join(&self.files[file].entry.path)
    }
}

impl Storage for FileStorage {
    async fn read(&self, offset: u64, len: usize) -> Result<Option<Vec<u8>>, Error> {
        let Some(segments) = segments(&self.entries, offset, len) else {
            return Ok(None);
        };

        let mut buf = vec![0u8; len];
        for segment in segments {
            let path = self.path(segment.file);
            let mut file = match File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            file.seek(SeekFrom::Start(segment.file_offset)).await?;
            match file.read_exact(&mut buf[segment.buf]).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Some(buf))
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let segments = segments(&self.entries, offset, data.len())
            .ok_or(Error::OffsetOutOfRange { offset, len: data.len() })?;

        for segment in segments {
            let path = self.path(segment.file);
            let _guard = self.files[segment.file].lock.lock().await;

            if let Some(parent) = path.parent() {
                create_dir_all(parent).await?;
            }

            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await?;

            debug!(
                "writing {} bytes to {path:?} at {}",
                segment.buf.len(),
                segment.file_offset
            );

            file.seek(SeekFrom::Start(segment.file_offset)).await?;
            file.write_all(&data[segment.buf]).await?;
            file.flush().await?;
        }

        Ok(())
    }
}

/// [`Storage`] kept in memory, files that were never written don't exist.
pub struct MemoryStorage {
    entries: Vec<FileEntry>,
    files: Mutex<Vec<Option<Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new(layout: Vec<FileEntry>) -> Self {
        let files = Mutex::new(vec![None; layout.len()]);
        Self { entries: layout, files }
    }

    /// Storage where every file is already present, holding `content`.
    pub fn with_content(layout: Vec<FileEntry>, content: &[u8]) -> Self {
        let files = layout
            .iter()
            .map(|f| {
                let start = (f.offset as usize).min(content.len());
                let end = ((f.offset + f.length) as usize).min(content.len());
                let mut bytes = content[start..end].to_vec();
                bytes.resize(f.length as usize, 0);
                Some(bytes)
            })
            .collect();
        Self { entries: layout, files: Mutex::new(files) }
    }
}

impl Storage for MemoryStorage {
    async fn read(&self, offset: u64, len: usize) -> Result<Option<Vec<u8>>, Error> {
        let Some(segments) = segments(&self.entries, offset, len) else {
            return Ok(None);
        };

        let files = self.files.lock().await;
        let mut buf = vec![0u8; len];
        for segment in segments {
            let Some(file) = &files[segment.file] else {
                return Ok(None);
            };
            let start = segment.file_offset as usize;
            let end = start + segment.buf.len();
            buf[segment.buf].copy_from_slice(&file[start..end]);
        }
        Ok(Some(buf))
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let segments = segments(&self.entries, offset, data.len())
            .ok_or(Error::OffsetOutOfRange { offset, len: data.len() })?;

        let mut files = self.files.lock().await;
        for segment in segments {
            let length = self.entries[segment.file].length as usize;
            let file = files[segment.file].get_or_insert_with(|| vec![0; length]);
            let start = segment.file_offset as usize;
            let end = start + segment.buf.len();
            file[start..end].copy_from_slice(&data[segment.buf]);
        }
        Ok(())
    }
}
