//! CAR container writing

use super::{CarHeader, CarOptions, encode_section};
use crate::error::{ContainerError, RepoError, Result};
use bytes::Bytes;
use std::io::Write;
use std::path::Path;
use thicket_common::IpldCid;
use thicket_common::varint::encode_uvarint;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

fn check_block(data: &[u8], offset: u64, options: &CarOptions) -> Result<()> {
    if data.len() > options.max_block_size {
        return Err(ContainerError::BlockTooLarge {
            offset,
            size: data.len() as u64,
            max: options.max_block_size,
        }
        .into());
    }
    Ok(())
}

fn header_bytes(header: &CarHeader) -> Vec<u8> {
    let encoded = header.encode();
    let mut out = Vec::with_capacity(encoded.len() + 2);
    encode_uvarint(encoded.len() as u64, &mut out);
    out.extend_from_slice(&encoded);
    out
}

/// Streaming writer over a synchronous byte sink
///
/// The header is written on construction; blocks follow in the order they are
/// given. Blocks larger than `max_block_size` are refused so that everything
/// written can be read back with the same options.
#[derive(Debug)]
pub struct CarWriter<W: Write> {
    inner: W,
    options: CarOptions,
    offset: u64,
    blocks: usize,
    scratch: Vec<u8>,
}

impl<W: Write> CarWriter<W> {
    /// Write the header with default options
    pub fn new(inner: W, header: CarHeader) -> Result<Self> {
        Self::with_options(inner, header, CarOptions::default())
    }

    /// Write the header
    pub fn with_options(mut inner: W, header: CarHeader, options: CarOptions) -> Result<Self> {
        let bytes = header_bytes(&header);
        inner.write_all(&bytes).map_err(RepoError::io)?;
        Ok(Self {
            inner,
            options,
            offset: bytes.len() as u64,
            blocks: 0,
            scratch: Vec::new(),
        })
    }

    /// Append one block
    ///
    /// The CID is written as given; nothing is re-hashed.
    pub fn write_block(&mut self, cid: &IpldCid, data: &[u8]) -> Result<()> {
        check_block(data, self.offset, &self.options)?;
        self.scratch.clear();
        encode_section(cid, data, self.options.framing, &mut self.scratch);
        self.inner.write_all(&self.scratch).map_err(RepoError::io)?;
        self.offset += self.scratch.len() as u64;
        self.blocks += 1;
        Ok(())
    }

    /// Number of blocks written so far
    pub fn blocks_written(&self) -> usize {
        self.blocks
    }

    /// Bytes written so far, header included
    pub fn bytes_written(&self) -> u64 {
        self.offset
    }

    /// Flush and return the underlying writer
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush().map_err(RepoError::io)?;
        Ok(self.inner)
    }
}

/// Write a container to an in-memory buffer with default options
pub fn write_car_bytes(
    roots: Vec<IpldCid>,
    blocks: impl IntoIterator<Item = (IpldCid, Bytes)>,
) -> Result<Vec<u8>> {
    let mut writer = CarWriter::new(Vec::new(), CarHeader::new(roots))?;
    for (cid, data) in blocks {
        writer.write_block(&cid, &data)?;
    }
    writer.finish()
}

/// Write a container file with default options
///
/// Blocks are written in iteration order.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
pub async fn write_car(
    path: impl AsRef<Path>,
    roots: Vec<IpldCid>,
    blocks: impl IntoIterator<Item = (IpldCid, Bytes)>,
) -> Result<()> {
    let options = CarOptions::default();
    let file = File::create(path).await.map_err(RepoError::io)?;
    let mut out = BufWriter::new(file);

    let header = header_bytes(&CarHeader::new(roots));
    out.write_all(&header).await.map_err(RepoError::io)?;

    let mut offset = header.len() as u64;
    let mut section = Vec::new();
    for (cid, data) in blocks {
        check_block(&data, offset, &options)?;
        section.clear();
        encode_section(&cid, &data, options.framing, &mut section);
        out.write_all(&section).await.map_err(RepoError::io)?;
        offset += section.len() as u64;
    }

    out.flush().await.map_err(RepoError::io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::reader::{CarReader, read_car};
    use crate::car::{Block, SectionFraming};
    use crate::error::RepoErrorKind;
    use thicket_common::compute_cid;

    fn block(n: u8) -> Block {
        let data = Bytes::from(vec![n, n]);
        Block::new(compute_cid(&data).unwrap(), data)
    }

    #[test]
    fn counts_blocks_and_bytes() {
        let a = block(1);
        let mut writer = CarWriter::new(Vec::new(), CarHeader::new(vec![a.cid])).unwrap();
        let header_len = writer.bytes_written();
        writer.write_block(&a.cid, &a.data).unwrap();
        assert_eq!(writer.blocks_written(), 1);
        // varint(38) + 36-byte CID + 2 data bytes
        assert_eq!(writer.bytes_written(), header_len + 1 + 36 + 2);
        let bytes = writer.finish().unwrap();
        assert_eq!(bytes.len() as u64, header_len + 39);
    }

    #[test]
    fn refuses_oversized_blocks() {
        let a = block(1);
        let options = CarOptions::new().max_block_size(1).build();
        let mut writer =
            CarWriter::with_options(Vec::new(), CarHeader::new(vec![]), options).unwrap();
        let err = writer.write_block(&a.cid, &a.data).unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::Container);
        assert_eq!(writer.blocks_written(), 0);
    }

    #[test]
    fn split_framing_round_trips() {
        let blocks = [block(1), block(2)];
        let options = CarOptions::new().framing(SectionFraming::Split).build();
        let mut writer =
            CarWriter::with_options(Vec::new(), CarHeader::new(vec![]), options.clone()).unwrap();
        for b in &blocks {
            writer.write_block(&b.cid, &b.data).unwrap();
        }
        let bytes = writer.finish().unwrap();

        let reader = CarReader::with_options(bytes.as_slice(), options).unwrap();
        let read: Vec<_> = reader.collect::<std::result::Result<_, _>>().unwrap();
        assert_eq!(read, blocks);
    }

    #[tokio::test]
    async fn write_car_file() {
        let blocks = [block(3), block(4)];
        let temp = tempfile::NamedTempFile::new().unwrap();
        write_car(
            temp.path(),
            vec![blocks[0].cid],
            blocks.iter().cloned().map(Into::into),
        )
        .await
        .unwrap();

        let parsed = read_car(temp.path()).await.unwrap();
        assert_eq!(parsed.root(), Some(&blocks[0].cid));
        assert_eq!(parsed.blocks.len(), 2);
        assert_eq!(parsed.blocks[&blocks[1].cid], blocks[1].data);

        // file and in-memory writers agree byte for byte
        let on_disk = tokio::fs::read(temp.path()).await.unwrap();
        let in_memory =
            write_car_bytes(vec![blocks[0].cid], blocks.iter().cloned().map(Into::into)).unwrap();
        assert_eq!(on_disk, in_memory);
    }
}
