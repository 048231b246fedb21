//! Container files through the tokio readers and writers

use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use thicket_common::{IpldCid, Value, compute_cid, encode};
use thicket_repo::car::{AsyncCarReader, read_car, read_car_header, write_car};
use thicket_repo::commit::Revision;
use thicket_repo::error::BlockFault;
use thicket_repo::repo::{RecordWrite, Repository};
use thicket_repo::storage::MemoryBlockStore;
use thicket_repo::walk::{Visitor, WalkedBlock, Walker};
use tokio::io::BufReader;

fn record(n: u64) -> (IpldCid, Bytes) {
    let data = Bytes::from(encode(&Value::map([("n", Value::Unsigned(n))])));
    (compute_cid(&data).unwrap(), data)
}

#[derive(Default)]
struct Count {
    blocks: usize,
    faults: usize,
}

impl Visitor for Count {
    fn block(&mut self, _block: WalkedBlock) -> ControlFlow<()> {
        self.blocks += 1;
        ControlFlow::Continue(())
    }

    fn fault(&mut self, _fault: BlockFault) -> ControlFlow<()> {
        self.faults += 1;
        ControlFlow::Continue(())
    }
}

#[tokio::test]
async fn write_then_read_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blocks.car");
    let blocks: Vec<_> = (0..12).map(record).collect();

    write_car(&path, vec![blocks[3].0], blocks.clone()).await.unwrap();

    let header = read_car_header(&path).await.unwrap();
    assert_eq!(header.roots, vec![blocks[3].0]);

    let parsed = read_car(&path).await.unwrap();
    assert_eq!(parsed.blocks.len(), 12);
    for (cid, data) in &blocks {
        assert_eq!(parsed.blocks.get(cid), Some(data));
    }
}

#[tokio::test]
async fn async_reader_yields_blocks_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ordered.car");
    let blocks: Vec<_> = (0..8).map(record).collect();
    write_car(&path, vec![], blocks.clone()).await.unwrap();

    let file = tokio::fs::File::open(&path).await.unwrap();
    let mut reader = AsyncCarReader::open(BufReader::new(file)).await.unwrap();
    let mut read = Vec::new();
    while let Some(block) = reader.next_block().await.unwrap() {
        read.push((block.cid, block.data));
    }
    assert_eq!(read, blocks);
}

#[tokio::test]
async fn walk_exported_repository_file() {
    let key = k256::ecdsa::SigningKey::from_slice(&[8u8; 32]).unwrap();
    let storage = Arc::new(MemoryBlockStore::new());
    let mut repo = Repository::create(storage, "did:plc:async", Revision::new("3jzfcijpj2z2a"), &key).unwrap();
    let writes: Vec<_> = (0..20)
        .map(|i| RecordWrite::Create {
            key: format!("app.bsky.feed.post/{:04}", i).into(),
            record: Value::map([("$type", Value::text("app.bsky.feed.post")), ("i", Value::Unsigned(i))]),
        })
        .collect();
    repo.apply_writes(&writes, Revision::new("3jzfcijpj2z2b"), &key).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repo.car");
    repo.export_car_file(&path).await.unwrap();

    let file = tokio::fs::File::open(&path).await.unwrap();
    let mut count = Count::default();
    let stats = Walker::default()
        .walk_async(BufReader::new(file), &mut count)
        .await
        .unwrap();

    assert_eq!(count.faults, 0);
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.records, 20);
    assert_eq!(count.blocks, stats.blocks);
    assert!(stats.unresolved_roots.is_empty());
}
