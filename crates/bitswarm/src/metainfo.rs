//! Metainfo of a torrent, the content of a `.torrent` file.
use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use bendy::{
    decoding::{self, FromBencode, Object, ResultExt},
    encoding::{self, AsString, SingleItemEncoder, ToBencode},
};
use sha1_smol::Sha1;
use speedy::{Readable, Writable};

use crate::error::Error;

/// SHA-1 of the bencoded info dictionary, identifies a torrent.
#[derive(Clone, Default, PartialEq, Eq, Hash, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct MetaInfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<u64>,
    pub info: Info,
    /// Computed from the raw bytes of the info dictionary when decoding,
    /// so keys this client doesn't know about are still part of the hash.
    pub info_hash: InfoHash,
}

impl MetaInfo {
    /// Wrap a locally built [`Info`].
    pub fn new(announce: impl Into<String>, info: Info) -> Result<Self, Error> {
        let info_hash = info.info_hash()?;
        Ok(Self {
            announce: announce.into(),
            created_by: Some(concat!("bitswarm/", env!("CARGO_PKG_VERSION")).into()),
            info,
            info_hash,
            ..Default::default()
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let metainfo = Self::from_bencode(bytes)?;
        metainfo.info.validate()?;
        Ok(metainfo)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let bytes = tokio::fs::read(path).await?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(self.to_bencode()?)
    }
}

/// File related information.
///
/// In a single file torrent `name` is the name of the file and `length` is
/// set. In a multi file torrent `name` is the name of the root directory
/// and `files` is set instead.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    /// Number of bytes in a piece, the last piece may be smaller.
    pub piece_length: u32,
    /// Concatenation of all 20-byte SHA1 hash values, one per piece.
    pub pieces: Vec<u8>,
    pub name: String,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: bool,
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

/// Where a file lives in the logical concatenation of all files.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FileEntry {
    /// Relative to the download directory.
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

impl Info {
    pub fn info_hash(&self) -> Result<InfoHash, Error> {
        let bytes = self.to_bencode()?;
        Ok(InfoHash(Sha1::from(&bytes).digest().bytes()))
    }

    pub fn total_size(&self) -> u64 {
        match &self.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.length.unwrap_or(0),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    pub fn piece_hash(&self, piece: usize) -> Option<[u8; 20]> {
        let hash = self.pieces.get(piece * 20..piece * 20 + 20)?;
        let mut buf = [0u8; 20];
        buf.copy_from_slice(hash);
        Some(buf)
    }

    /// Byte ranges of each file, in the order they are concatenated.
    pub fn file_layout(&self) -> Vec<FileEntry> {
        let Some(files) = &self.files else {
            return vec![FileEntry {
                path: PathBuf::from(&self.name),
                length: self.length.unwrap_or(0),
                offset: 0,
            }];
        };

        let mut offset = 0;
        files
            .iter()
            .map(|file| {
                let mut path = PathBuf::from(&self.name);
                path.extend(&file.path);
                let entry = FileEntry { path, length: file.length, offset };
                offset += file.length;
                entry
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::MissingField("name"));
        }
        match (&self.files, self.length) {
            (None, None) => return Err(Error::MissingField("length")),
            (Some(files), _) if files.is_empty() => return Err(Error::NoFiles),
            _ => {}
        }
        if self.piece_length == 0 || self.pieces.len() % 20 != 0 {
            return Err(Error::PieceHashes);
        }
        let total = self.total_size();
        if total == 0 {
            return Err(Error::NoFiles);
        }
        let expected = total.div_ceil(self.piece_length as u64) as usize;
        if expected != self.piece_count() {
            return Err(Error::PieceHashes);
        }
        Ok(())
    }

    /// Build the info of a local file or directory, hashing its content.
    /// Hidden files are skipped.
    pub fn from_path(path: &Path, piece_length: u32) -> Result<Self, Error> {
        if piece_length == 0 {
            return Err(Error::PieceHashes);
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(Error::PathInvalid)?
            .to_owned();

        let mut sources = Vec::new();
        let is_dir = path.is_dir();
        if is_dir {
            collect_files(path, path, &mut sources)?;
            sources.sort();
        } else {
            sources.push(PathBuf::new());
        }

        let mut hasher = PieceHasher::new(piece_length as usize);
        let mut files = Vec::with_capacity(sources.len());

        for relative in sources {
            let full = if is_dir { path.join(&relative) } else { path.to_owned() };
            let bytes = std::fs::read(&full)?;
            hasher.update(&bytes);
            let components = relative
                .components()
                .map(|c| c.as_os_str().to_str().map(String::from))
                .collect::<Option<Vec<String>>>()
                .ok_or(Error::PathInvalid)?;
            files.push(File { length: bytes.len() as u64, path: components });
        }

        let info = if is_dir {
            Info {
                piece_length,
                pieces: hasher.finish(),
                name,
                length: None,
                files: Some(files),
                private: false,
            }
        } else {
            Info {
                piece_length,
                pieces: hasher.finish(),
                name,
                length: files.first().map(|f| f.length),
                files: None,
                private: false,
            }
        };

        info.validate()?;
        Ok(info)
    }
}

fn collect_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<PathBuf>,
) -> Result<(), Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let relative =
                path.strip_prefix(root).map_err(|_| Error::PathInvalid)?;
            out.push(relative.to_owned());
        }
    }
    Ok(())
}

struct PieceHasher {
    piece_length: usize,
    buf: Vec<u8>,
    pieces: Vec<u8>,
}

impl PieceHasher {
    fn new(piece_length: usize) -> Self {
        Self { piece_length, buf: Vec::with_capacity(piece_length), pieces: Vec::new() }
    }

    fn update(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let take = (self.piece_length - self.buf.len()).min(bytes.len());
            self.buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.buf.len() == self.piece_length {
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        let hash = Sha1::from(&self.buf).digest().bytes();
        self.pieces.extend_from_slice(&hash);
        self.buf.clear();
    }

    fn finish(mut self) -> Vec<u8> {
        if !self.buf.is_empty() {
            self.flush();
        }
        self.pieces
    }
}

impl ToBencode for File {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", self.length)?;
            e.emit_pair(b"path", &self.path)
        })?;
        Ok(())
    }
}

impl FromBencode for File {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut dict_dec = object.try_into_dictionary()?;
        let mut length = None;
        let mut path = None;

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"length", value) => {
                    length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"path", value) => {
                    path = Vec::<String>::decode_bencode_object(value)
                        .context("path")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let length =
            length.ok_or_else(|| decoding::Error::missing_field("length"))?;
        let path = path.ok_or_else(|| decoding::Error::missing_field("path"))?;

        Ok(Self { length, path })
    }
}

impl ToBencode for Info {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(files) = &self.files {
                e.emit_pair(b"files", files)?;
            }
            if let Some(length) = self.length {
                e.emit_pair(b"length", length)?;
            }
            e.emit_pair(b"name", &self.name)?;
            e.emit_pair(b"piece length", self.piece_length)?;
            e.emit_pair(b"pieces", AsString(&self.pieces))?;
            if self.private {
                e.emit_pair(b"private", 1)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut files = None;
        let mut length = None;
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;
        let mut private = false;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"files", value) => {
                    files = Vec::<File>::decode_bencode_object(value)
                        .context("files")
                        .map(Some)?;
                }
                (b"length", value) => {
                    length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value)
                        .context("name")
                        .map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length = u32::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = AsString::decode_bencode_object(value)
                        .context("pieces")
                        .map(|bytes| Some(bytes.0))?;
                }
                (b"private", value) => {
                    private =
                        u8::decode_bencode_object(value).context("private")? == 1;
                }
                _ => {}
            }
        }

        let name = name.ok_or_else(|| decoding::Error::missing_field("name"))?;
        let piece_length = piece_length
            .ok_or_else(|| decoding::Error::missing_field("piece length"))?;
        let pieces =
            pieces.ok_or_else(|| decoding::Error::missing_field("pieces"))?;

        Ok(Info { piece_length, pieces, name, length, files, private })
    }
}

impl ToBencode for MetaInfo {
    const MAX_DEPTH: usize = 6;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"announce", &self.announce)?;
            if let Some(announce_list) = &self.announce_list {
                e.emit_pair(b"announce-list", announce_list)?;
            }
            if let Some(comment) = &self.comment {
                e.emit_pair(b"comment", comment)?;
            }
            if let Some(created_by) = &self.created_by {
                e.emit_pair(b"created by", created_by)?;
            }
            if let Some(creation_date) = self.creation_date {
                e.emit_pair(b"creation date", creation_date)?;
            }
            e.emit_pair(b"info", &self.info)
        })?;
        Ok(())
    }
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut announce = None;
        let mut announce_list = None;
        let mut comment = None;
        let mut created_by = None;
        let mut creation_date = None;
        let mut info = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"announce", value) => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?;
                }
                (b"announce-list", value) => {
                    announce_list = Vec::decode_bencode_object(value)
                        .context("announce_list")
                        .map(Some)?;
                }
                (b"comment", value) => {
                    comment = String::decode_bencode_object(value)
                        .context("comment")
                        .map(Some)?;
                }
                (b"created by", value) => {
                    created_by = String::decode_bencode_object(value)
                        .context("created_by")
                        .map(Some)?;
                }
                (b"creation date", value) => {
                    creation_date = u64::decode_bencode_object(value)
                        .context("creation_date")
                        .map(Some)?;
                }
                (b"info", value) => {
                    let raw = value.try_into_dictionary()?.into_raw()?;
                    let hash = Sha1::from(raw).digest().bytes();
                    let decoded = Info::from_bencode(raw).context("info")?;
                    info = Some((decoded, InfoHash(hash)));
                }
                _ => {}
            }
        }

        let announce = announce
            .ok_or_else(|| decoding::Error::missing_field("announce"))?;
        let (info, info_hash) =
            info.ok_or_else(|| decoding::Error::missing_field("info"))?;

        Ok(MetaInfo {
            announce,
            announce_list,
            comment,
            created_by,
            creation_date,
            info,
            info_hash,
        })
    }
}
