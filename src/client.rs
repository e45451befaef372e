//! Store and retrieve whole files as content-addressed chunks.

use std::{
    fmt::Write as _,
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

use bytes::Bytes;
use tracing::{debug, info};

use crate::{
    common::{Id, InvalidIdError},
    dht::{Dht, DhtError},
};

/// Largest chunk a file is split into.
pub const MAX_CHUNK_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A stored chunk: its id and its size in bytes.
pub struct ChunkRef {
    pub id: Id,
    pub size: usize,
}

#[derive(Debug, Clone)]
/// Splits data into chunks stored on the network through a [Dht] node,
/// and reassembles them.
pub struct ChunkClient {
    dht: Dht,
}

impl ChunkClient {
    pub fn new(dht: Dht) -> Self {
        Self { dht }
    }

    pub fn dht(&self) -> &Dht {
        &self.dht
    }

    /// Store `data` as chunks of at most [MAX_CHUNK_SIZE] bytes, in order.
    pub fn store(&self, data: &[u8]) -> Result<Vec<ChunkRef>, ClientError> {
        data.chunks(MAX_CHUNK_SIZE)
            .map(|chunk| self.store_chunk(Bytes::copy_from_slice(chunk)))
            .collect()
    }

    /// Same as [Self::store], reading from a file one chunk at a time.
    pub fn store_file<P: AsRef<Path>>(&self, path: P) -> Result<Vec<ChunkRef>, ClientError> {
        let mut file = File::open(path.as_ref())?;
        let mut chunks = vec![];

        loop {
            let mut chunk = Vec::with_capacity(MAX_CHUNK_SIZE);
            (&mut file)
                .take(MAX_CHUNK_SIZE as u64)
                .read_to_end(&mut chunk)?;

            if chunk.is_empty() {
                break;
            }

            chunks.push(self.store_chunk(chunk.into())?);
        }

        info!(path = ?path.as_ref(), chunks = chunks.len(), "Stored file");

        Ok(chunks)
    }

    /// Fetch every chunk in order and concatenate them.
    pub fn retrieve(&self, chunks: &[ChunkRef]) -> Result<Vec<u8>, ClientError> {
        // Sizes may come from an untrusted hash file, only check them against fetched chunks.
        let mut data = Vec::new();

        for chunk in chunks {
            data.extend_from_slice(&self.retrieve_chunk(chunk)?);
        }

        Ok(data)
    }

    /// Same as [Self::retrieve], writing chunks to a file as they arrive.
    pub fn retrieve_to_file<P: AsRef<Path>>(
        &self,
        chunks: &[ChunkRef],
        path: P,
    ) -> Result<(), ClientError> {
        let mut file = File::create(path.as_ref())?;

        for chunk in chunks {
            file.write_all(&self.retrieve_chunk(chunk)?)?;
        }

        file.flush()?;

        info!(path = ?path.as_ref(), chunks = chunks.len(), "Retrieved file");

        Ok(())
    }

    // === Private Methods ===

    fn store_chunk(&self, chunk: Bytes) -> Result<ChunkRef, ClientError> {
        let id = Id::hash(&chunk);
        let size = chunk.len();

        let stored_at = self.dht.store_value(id, chunk)?;

        debug!(?id, size, replicas = stored_at.len(), "Stored chunk");

        Ok(ChunkRef { id, size })
    }

    fn retrieve_chunk(&self, chunk: &ChunkRef) -> Result<Bytes, ClientError> {
        let data = self.dht.get_value(chunk.id, None)?;

        if data.len() != chunk.size {
            return Err(ClientError::SizeMismatch {
                id: chunk.id,
                expected: chunk.size,
                actual: data.len(),
            });
        }

        Ok(data)
    }
}

/// Render chunks in the hash file format: `hash$size|` per chunk.
pub fn format_hashes(chunks: &[ChunkRef]) -> String {
    let mut out = String::new();

    for chunk in chunks {
        let _ = write!(out, "{}${}|", chunk.id, chunk.size);
    }

    out
}

/// Parse the hash file format, ignoring empty entries.
pub fn parse_hashes(contents: &str) -> Result<Vec<ChunkRef>, HashFileError> {
    contents
        .trim()
        .split('|')
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, size) = entry
                .split_once('$')
                .ok_or_else(|| HashFileError::MissingSize(entry.to_string()))?;

            Ok(ChunkRef {
                id: id.parse()?,
                size: size
                    .parse()
                    .map_err(|_| HashFileError::InvalidSize(size.to_string()))?,
            })
        })
        .collect()
}

/// Write chunks to a hash file.
pub fn write_hashfile<P: AsRef<Path>>(path: P, chunks: &[ChunkRef]) -> Result<(), io::Error> {
    std::fs::write(path, format_hashes(chunks))
}

/// Read chunks from a hash file.
pub fn read_hashfile<P: AsRef<Path>>(path: P) -> Result<Vec<ChunkRef>, ClientError> {
    Ok(parse_hashes(&std::fs::read_to_string(path)?)?)
}

#[derive(thiserror::Error, Debug)]
/// Errors parsing a hash file.
pub enum HashFileError {
    #[error("Missing chunk size in {0:?}")]
    MissingSize(String),

    #[error("Invalid chunk size {0:?}")]
    InvalidSize(String),

    #[error(transparent)]
    InvalidId(#[from] InvalidIdError),
}

#[derive(thiserror::Error, Debug)]
/// Errors storing or retrieving files.
pub enum ClientError {
    #[error(transparent)]
    Dht(#[from] DhtError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    HashFile(#[from] HashFileError),

    #[error("Chunk {id} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        id: Id,
        expected: usize,
        actual: usize,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hashfile_format() {
        let chunks = vec![
            ChunkRef {
                id: Id::hash(b"a"),
                size: MAX_CHUNK_SIZE,
            },
            ChunkRef {
                id: Id::hash(b"b"),
                size: 17,
            },
        ];

        let formatted = format_hashes(&chunks);

        assert_eq!(
            formatted,
            format!("{}$1048576|{}$17|", Id::hash(b"a"), Id::hash(b"b"))
        );
        assert_eq!(parse_hashes(&formatted).unwrap(), chunks);
    }

    #[test]
    fn parse_uppercase_hashes() {
        let chunks = parse_hashes(
            "CA978112CA1BBDCAFAC231B39A23DC4DA786EFF8147C4E72B9807785AFEE48BB$764787|",
        )
        .unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, Id::hash(b"a"));
        assert_eq!(chunks[0].size, 764787);
    }

    #[test]
    fn malformed_hashfile() {
        assert!(matches!(
            parse_hashes("abcd|"),
            Err(HashFileError::MissingSize(_))
        ));
        assert!(matches!(
            parse_hashes(&format!("{}$big|", Id::random())),
            Err(HashFileError::InvalidSize(_))
        ));
        assert!(matches!(
            parse_hashes("abcd$12|"),
            Err(HashFileError::InvalidId(_))
        ));
        assert!(parse_hashes("").unwrap().is_empty());
    }

    #[test]
    fn store_retrieve_standalone() {
        let client = ChunkClient::new(Dht::builder().build().unwrap());

        let data: Vec<u8> = (0..(MAX_CHUNK_SIZE * 2 + 1000))
            .map(|i| (i % 251) as u8)
            .collect();

        let chunks = client.store(&data).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].size, MAX_CHUNK_SIZE);
        assert_eq!(chunks[2].size, 1000);

        assert_eq!(client.retrieve(&chunks).unwrap(), data);
    }

    #[test]
    fn store_retrieve_file() {
        let dir = tempfile::tempdir().unwrap();
        let client = ChunkClient::new(Dht::builder().build().unwrap());

        let source = dir.path().join("source");
        let data: Vec<u8> = (0..(MAX_CHUNK_SIZE + 3)).map(|i| (i % 7) as u8).collect();
        std::fs::write(&source, &data).unwrap();

        let chunks = client.store_file(&source).unwrap();
        assert_eq!(chunks.len(), 2);

        let hashfile = dir.path().join("hashes");
        write_hashfile(&hashfile, &chunks).unwrap();
        let read_back = read_hashfile(&hashfile).unwrap();
        assert_eq!(read_back, chunks);

        let destination = dir.path().join("destination");
        client.retrieve_to_file(&read_back, &destination).unwrap();

        assert_eq!(std::fs::read(destination).unwrap(), data);
    }

    #[test]
    fn retrieve_with_absurd_size() {
        let client = ChunkClient::new(Dht::builder().build().unwrap());

        let chunks = client.store(b"tiny").unwrap();
        let id = chunks[0].id;

        let forged = parse_hashes(&format!("{id}${}|{id}${}|", usize::MAX, usize::MAX)).unwrap();

        assert!(matches!(
            client.retrieve(&forged),
            Err(ClientError::SizeMismatch { expected, actual: 4, .. }) if expected == usize::MAX
        ));
    }

    #[test]
    fn empty_file_has_no_chunks() {
        let client = ChunkClient::new(Dht::builder().build().unwrap());

        assert!(client.store(&[]).unwrap().is_empty());
        assert!(client.retrieve(&[]).unwrap().is_empty());
    }
}
