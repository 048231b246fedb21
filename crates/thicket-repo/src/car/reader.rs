//! CAR container reading
//!
//! [`CarReader`] works over any [`std::io::Read`], [`AsyncCarReader`] over any
//! tokio [`AsyncRead`]. Both read the header eagerly and then yield one block
//! per call, never holding more than the current section in memory.
//!
//! Byte-at-a-time varint reads go straight to the underlying reader, so wrap
//! unbuffered sources (files, sockets) in a `BufReader`.

use super::{
    Block, CarHeader, CarOptions, MAX_SECTION_CID, SectionFraming, max_v1_section,
    split_v1_section,
};
use crate::error::{ContainerError, RepoError, Result};
use crate::storage::BlockStore;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::Path;
use thicket_common::varint::VarintAccumulator;
use thicket_common::{IpldCid, parse_cid_bytes, verify_cid};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

type ContainerResult<T> = std::result::Result<T, ContainerError>;

fn header_len(len: u64, options: &CarOptions) -> ContainerResult<usize> {
    if len == 0 {
        return Err(ContainerError::Header("empty header".into()));
    }
    if len > options.max_header_size as u64 {
        return Err(ContainerError::HeaderTooLarge {
            size: len,
            max: options.max_header_size,
        });
    }
    Ok(len as usize)
}

fn truncated_or(e: io::Error, offset: u64) -> ContainerError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ContainerError::Truncated { offset }
    } else {
        ContainerError::Io(e)
    }
}

fn block_too_large(offset: u64, size: u64, options: &CarOptions) -> ContainerError {
    ContainerError::BlockTooLarge {
        offset,
        size,
        max: options.max_block_size,
    }
}

/// Streaming reader over a synchronous byte source
///
/// Also an [`Iterator`] of blocks. Iteration ends after the first error that
/// is not [recoverable](ContainerError::is_recoverable).
#[derive(Debug)]
pub struct CarReader<R> {
    inner: R,
    header: CarHeader,
    options: CarOptions,
    offset: u64,
    done: bool,
}

impl<R: Read> CarReader<R> {
    /// Read the header with default options
    pub fn open(inner: R) -> ContainerResult<Self> {
        Self::with_options(inner, CarOptions::default())
    }

    /// Read the header
    pub fn with_options(inner: R, options: CarOptions) -> ContainerResult<Self> {
        let mut reader = Self {
            inner,
            header: CarHeader::new(Vec::new()),
            options,
            offset: 0,
            done: false,
        };
        let len = reader
            .read_varint()?
            .ok_or(ContainerError::Truncated { offset: 0 })?;
        let len = header_len(len, &reader.options)?;
        let bytes = reader.read_vec(len)?;
        reader.header = CarHeader::decode(&bytes)?;
        Ok(reader)
    }

    /// The container header
    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    /// Options in effect
    pub fn options(&self) -> &CarOptions {
        &self.options
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Give back the underlying reader
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next block
    ///
    /// Returns `Ok(None)` at a clean end of stream. After a recoverable error
    /// the reader is positioned at the next section and may be called again.
    pub fn next_block(&mut self) -> ContainerResult<Option<Block>> {
        let start = self.offset;
        match self.options.framing {
            SectionFraming::CarV1 => {
                let Some(len) = self.read_varint()? else {
                    return Ok(None);
                };
                if len > max_v1_section(&self.options) {
                    self.skip(len)?;
                    return Err(block_too_large(start, len, &self.options));
                }
                let body = self.read_vec(len as usize)?;
                split_v1_section(Bytes::from(body), start, &self.options).map(Some)
            }
            SectionFraming::Split => {
                let Some(cid_len) = self.read_varint()? else {
                    return Ok(None);
                };
                let cid = if cid_len > MAX_SECTION_CID as u64 {
                    self.skip(cid_len)?;
                    Err(ContainerError::CidTooLong {
                        offset: start,
                        len: cid_len,
                    })
                } else {
                    let raw = self.read_vec(cid_len as usize)?;
                    parse_cid_bytes(&raw).map_err(|source| ContainerError::InvalidCid {
                        offset: start,
                        source,
                    })
                };

                let block_len = self.read_varint()?.ok_or(ContainerError::Truncated {
                    offset: self.offset,
                })?;
                if block_len > self.options.max_block_size as u64 {
                    self.skip(block_len)?;
                    cid?;
                    return Err(block_too_large(start, block_len, &self.options));
                }
                let data = self.read_vec(block_len as usize)?;
                Ok(Some(Block::new(cid?, Bytes::from(data))))
            }
        }
    }

    fn read_varint(&mut self) -> ContainerResult<Option<u64>> {
        let start = self.offset;
        let mut acc = VarintAccumulator::new();
        let mut byte = [0u8; 1];
        loop {
            let n = match self.inner.read(&mut byte) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return if acc.is_empty() {
                    Ok(None)
                } else {
                    Err(ContainerError::Truncated {
                        offset: self.offset,
                    })
                };
            }
            self.offset += 1;
            match acc.push(byte[0]) {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(_) => return Err(ContainerError::Varint { offset: start }),
            }
        }
    }

    fn read_vec(&mut self, len: usize) -> ContainerResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .map_err(|e| truncated_or(e, self.offset))?;
        self.offset += len as u64;
        Ok(buf)
    }

    fn skip(&mut self, len: u64) -> ContainerResult<()> {
        let copied = io::copy(&mut self.inner.by_ref().take(len), &mut io::sink())?;
        self.offset += copied;
        if copied < len {
            return Err(ContainerError::Truncated {
                offset: self.offset,
            });
        }
        Ok(())
    }
}

impl<R: Read> Iterator for CarReader<R> {
    type Item = ContainerResult<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_block() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = !e.is_recoverable();
                Some(Err(e))
            }
        }
    }
}

/// Streaming reader over a tokio byte source
///
/// Same contract as [`CarReader`].
#[derive(Debug)]
pub struct AsyncCarReader<R> {
    inner: R,
    header: CarHeader,
    options: CarOptions,
    offset: u64,
}

impl<R: AsyncRead + Unpin> AsyncCarReader<R> {
    /// Read the header with default options
    pub async fn open(inner: R) -> ContainerResult<Self> {
        Self::with_options(inner, CarOptions::default()).await
    }

    /// Read the header
    pub async fn with_options(inner: R, options: CarOptions) -> ContainerResult<Self> {
        let mut reader = Self {
            inner,
            header: CarHeader::new(Vec::new()),
            options,
            offset: 0,
        };
        let len = reader
            .read_varint()
            .await?
            .ok_or(ContainerError::Truncated { offset: 0 })?;
        let len = header_len(len, &reader.options)?;
        let bytes = reader.read_vec(len).await?;
        reader.header = CarHeader::decode(&bytes)?;
        Ok(reader)
    }

    /// The container header
    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    /// Options in effect
    pub fn options(&self) -> &CarOptions {
        &self.options
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Give back the underlying reader
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next block
    ///
    /// Returns `Ok(None)` at a clean end of stream. After a recoverable error
    /// the reader is positioned at the next section and may be called again.
    pub async fn next_block(&mut self) -> ContainerResult<Option<Block>> {
        let start = self.offset;
        match self.options.framing {
            SectionFraming::CarV1 => {
                let Some(len) = self.read_varint().await? else {
                    return Ok(None);
                };
                if len > max_v1_section(&self.options) {
                    self.skip(len).await?;
                    return Err(block_too_large(start, len, &self.options));
                }
                let body = self.read_vec(len as usize).await?;
                split_v1_section(Bytes::from(body), start, &self.options).map(Some)
            }
            SectionFraming::Split => {
                let Some(cid_len) = self.read_varint().await? else {
                    return Ok(None);
                };
                let cid = if cid_len > MAX_SECTION_CID as u64 {
                    self.skip(cid_len).await?;
                    Err(ContainerError::CidTooLong {
                        offset: start,
                        len: cid_len,
                    })
                } else {
                    let raw = self.read_vec(cid_len as usize).await?;
                    parse_cid_bytes(&raw).map_err(|source| ContainerError::InvalidCid {
                        offset: start,
                        source,
                    })
                };

                let block_len = self.read_varint().await?.ok_or(ContainerError::Truncated {
                    offset: self.offset,
                })?;
                if block_len > self.options.max_block_size as u64 {
                    self.skip(block_len).await?;
                    cid?;
                    return Err(block_too_large(start, block_len, &self.options));
                }
                let data = self.read_vec(block_len as usize).await?;
                Ok(Some(Block::new(cid?, Bytes::from(data))))
            }
        }
    }

    async fn read_varint(&mut self) -> ContainerResult<Option<u64>> {
        let start = self.offset;
        let mut acc = VarintAccumulator::new();
        let mut byte = [0u8; 1];
        loop {
            if self.inner.read(&mut byte).await? == 0 {
                return if acc.is_empty() {
                    Ok(None)
                } else {
                    Err(ContainerError::Truncated {
                        offset: self.offset,
                    })
                };
            }
            self.offset += 1;
            match acc.push(byte[0]) {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(_) => return Err(ContainerError::Varint { offset: start }),
            }
        }
    }

    async fn read_vec(&mut self, len: usize) -> ContainerResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(|e| truncated_or(e, self.offset))?;
        self.offset += len as u64;
        Ok(buf)
    }

    async fn skip(&mut self, len: u64) -> ContainerResult<()> {
        let mut limited = (&mut self.inner).take(len);
        let copied = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        self.offset += copied;
        if copied < len {
            return Err(ContainerError::Truncated {
                offset: self.offset,
            });
        }
        Ok(())
    }
}

/// Fully parsed in-memory container
#[derive(Debug, Clone)]
pub struct ParsedCar {
    /// The container header
    pub header: CarHeader,
    /// All blocks, keyed by CID
    pub blocks: BTreeMap<IpldCid, Bytes>,
}

impl ParsedCar {
    /// First root, usually the commit
    pub fn root(&self) -> Option<&IpldCid> {
        self.header.roots.first()
    }

    /// All roots
    pub fn roots(&self) -> &[IpldCid] {
        &self.header.roots
    }
}

/// Parse complete container bytes into header and block map
///
/// Strict: any section error fails the parse. Block CIDs are not verified;
/// use [`load_car_into`] or the walker for that.
pub fn parse_car_bytes(data: &[u8]) -> Result<ParsedCar> {
    parse_car_bytes_with(data, CarOptions::default())
}

/// [`parse_car_bytes`] with explicit options
pub fn parse_car_bytes_with(data: &[u8], options: CarOptions) -> Result<ParsedCar> {
    let mut reader = CarReader::with_options(data, options)?;
    let mut blocks = BTreeMap::new();
    while let Some(block) = reader.next_block()? {
        blocks.insert(block.cid, block.data);
    }
    Ok(ParsedCar {
        header: reader.header,
        blocks,
    })
}

/// Read an entire container file into memory
pub async fn read_car(path: impl AsRef<Path>) -> Result<ParsedCar> {
    let file = File::open(path).await.map_err(RepoError::io)?;
    let mut reader = AsyncCarReader::open(BufReader::new(file)).await?;

    let mut blocks = BTreeMap::new();
    while let Some(block) = reader.next_block().await? {
        blocks.insert(block.cid, block.data);
    }

    Ok(ParsedCar {
        header: reader.header,
        blocks,
    })
}

/// Read only the header of a container file
///
/// Useful for checking roots without loading all blocks.
pub async fn read_car_header(path: impl AsRef<Path>) -> Result<CarHeader> {
    let file = File::open(path).await.map_err(RepoError::io)?;
    let reader = AsyncCarReader::open(BufReader::new(file)).await?;
    Ok(reader.header)
}

/// Stream a container into a block store, verifying every block's CID
///
/// Stops at the first error. Blocks stored before the error stay stored;
/// they are content-addressed, so a partial load never corrupts the store.
pub fn load_car_into<S: BlockStore, R: Read>(storage: &S, reader: R) -> Result<CarHeader> {
    load_car_into_with(storage, reader, CarOptions::default())
}

/// [`load_car_into`] with explicit options
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(framing = ?options.framing)))]
pub fn load_car_into_with<S: BlockStore, R: Read>(
    storage: &S,
    reader: R,
    options: CarOptions,
) -> Result<CarHeader> {
    let mut reader = CarReader::with_options(reader, options)?;
    while let Some(block) = reader.next_block()? {
        if !verify_cid(&block.cid, &block.data) {
            return Err(RepoError::cid_mismatch(&block.cid));
        }
        storage.put(block.cid, block.data)?;
    }
    #[cfg(feature = "tracing")]
    tracing::debug!(bytes = reader.offset(), roots = reader.header.roots.len(), "loaded container");
    Ok(reader.header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::writer::{CarWriter, write_car_bytes};
    use crate::error::RepoErrorKind;
    use crate::storage::MemoryBlockStore;
    use thicket_common::compute_cid;
    use thicket_common::varint::encode_uvarint;

    fn block(n: u8) -> Block {
        let data = Bytes::from(vec![n; 3]);
        Block::new(compute_cid(&data).unwrap(), data)
    }

    fn container(framing: SectionFraming, blocks: &[Block]) -> Vec<u8> {
        let options = CarOptions::new().framing(framing).build();
        let roots = blocks.first().map(|b| vec![b.cid]).unwrap_or_default();
        let mut writer = CarWriter::with_options(Vec::new(), CarHeader::new(roots), options).unwrap();
        for b in blocks {
            writer.write_block(&b.cid, &b.data).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn reads_blocks_in_order() {
        let blocks = [block(1), block(2), block(3)];
        for framing in [SectionFraming::CarV1, SectionFraming::Split] {
            let bytes = container(framing, &blocks);
            let options = CarOptions::new().framing(framing).build();
            let reader = CarReader::with_options(bytes.as_slice(), options).unwrap();
            assert_eq!(reader.header().roots, vec![blocks[0].cid]);
            let read: Vec<Block> = reader.map(|b| b.unwrap()).collect();
            assert_eq!(read, blocks);
        }
    }

    #[test]
    fn empty_input_is_truncated() {
        assert!(matches!(
            CarReader::open(&[][..]),
            Err(ContainerError::Truncated { offset: 0 })
        ));
    }

    #[test]
    fn oversized_header_rejected_before_read() {
        let mut bytes = Vec::new();
        encode_uvarint(1 << 40, &mut bytes);
        assert!(matches!(
            CarReader::open(bytes.as_slice()),
            Err(ContainerError::HeaderTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_section_is_fatal() {
        let mut bytes = container(SectionFraming::CarV1, &[block(1)]);
        bytes.truncate(bytes.len() - 1);
        let mut reader = CarReader::open(bytes.as_slice()).unwrap();
        let err = reader.next_block().unwrap_err();
        assert!(matches!(err, ContainerError::Truncated { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn bad_cid_section_is_skipped() {
        let good = block(7);
        let mut bytes = container(SectionFraming::CarV1, &[]);
        // a section whose "CID" claims version 2
        encode_uvarint(4, &mut bytes);
        bytes.extend_from_slice(&[0x02, 0x71, 0x12, 0x00]);
        encode_section_into(&good, &mut bytes);

        let mut reader = CarReader::open(bytes.as_slice()).unwrap();
        let err = reader.next_block().unwrap_err();
        assert!(matches!(err, ContainerError::InvalidCid { .. }));
        assert!(err.is_recoverable());
        assert_eq!(reader.next_block().unwrap(), Some(good));
        assert_eq!(reader.next_block().unwrap(), None);
    }

    fn encode_section_into(b: &Block, out: &mut Vec<u8>) {
        crate::car::encode_section(&b.cid, &b.data, SectionFraming::CarV1, out);
    }

    #[test]
    fn oversized_block_is_skipped() {
        let big = Block::encode(&thicket_common::Value::bytes(vec![0u8; 64])).unwrap();
        let small = block(1);
        let bytes = container(SectionFraming::Split, &[big, small.clone()]);

        let options = CarOptions::new()
            .framing(SectionFraming::Split)
            .max_block_size(16)
            .build();
        let mut reader = CarReader::with_options(bytes.as_slice(), options).unwrap();
        let err = reader.next_block().unwrap_err();
        assert!(matches!(err, ContainerError::BlockTooLarge { size: 66, max: 16, .. }));
        assert_eq!(reader.next_block().unwrap(), Some(small));
    }

    #[test]
    fn parse_car_bytes_collects_blocks() {
        let a = block(1);
        let b = block(2);
        let bytes = write_car_bytes(vec![a.cid], [(a.cid, a.data.clone()), (b.cid, b.data.clone())])
            .unwrap();
        let parsed = parse_car_bytes(&bytes).unwrap();
        assert_eq!(parsed.root(), Some(&a.cid));
        assert_eq!(parsed.blocks.len(), 2);
        assert_eq!(parsed.blocks[&b.cid], b.data);
    }

    #[test]
    fn load_rejects_tampered_block() {
        let a = block(1);
        let tampered = Block::new(a.cid, Bytes::from_static(b"not the same"));
        let bytes = container(SectionFraming::CarV1, &[tampered]);

        let storage = MemoryBlockStore::new();
        let err = load_car_into(&storage, bytes.as_slice()).unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::Integrity);
        assert!(storage.is_empty());
    }

    #[test]
    fn load_stores_verified_blocks() {
        let blocks = [block(1), block(2)];
        let bytes = container(SectionFraming::CarV1, &blocks);
        let storage = MemoryBlockStore::new();
        let header = load_car_into(&storage, bytes.as_slice()).unwrap();
        assert_eq!(header.roots, vec![blocks[0].cid]);
        assert_eq!(storage.len(), 2);
    }

    #[tokio::test]
    async fn async_reader_matches_sync() {
        let blocks = [block(4), block(5)];
        let bytes = container(SectionFraming::CarV1, &blocks);

        let mut reader = AsyncCarReader::open(bytes.as_slice()).await.unwrap();
        assert_eq!(reader.header().roots, vec![blocks[0].cid]);
        assert_eq!(reader.next_block().await.unwrap(), Some(blocks[0].clone()));
        assert_eq!(reader.next_block().await.unwrap(), Some(blocks[1].clone()));
        assert_eq!(reader.next_block().await.unwrap(), None);
        assert_eq!(reader.offset(), bytes.len() as u64);
    }

    #[tokio::test]
    async fn read_car_from_file() {
        let blocks = [block(1), block(2)];
        let bytes = container(SectionFraming::CarV1, &blocks);
        let temp = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(temp.path(), &bytes).await.unwrap();

        let parsed = read_car(temp.path()).await.unwrap();
        assert_eq!(parsed.blocks.len(), 2);
        let header = read_car_header(temp.path()).await.unwrap();
        assert_eq!(header.roots, vec![blocks[0].cid]);
    }
}
