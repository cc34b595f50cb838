//! EC Integration Tests
//!
//! Erasure-coded chunks end to end: coding through the codec port,
//! rebuilding lost fragments with the map builder.

mod common;

use assert_matches::assert_matches;
use bytes::Bytes;

use chunkmap::adapters::{digest, ReedSolomonChunkCodec};
use chunkmap::domain::{BucketId, ChunkCodec, ChunkCoderConfig, FragIndex};
use chunkmap::ec::FragCoder;
use chunkmap::{Error, MapBuilder};

use common::*;

// =============================================================================
// Codec Tests
// =============================================================================

#[test]
fn test_codec_rebuilds_from_any_k_frags() {
    let codec = ReedSolomonChunkCodec::new();
    let coder = ChunkCoderConfig::erasure(4, 2, 1);
    let data = payload(31, 10_000);

    let encoded = codec.encode(&coder, &data).unwrap();
    assert_eq!(encoded.frags.len(), 6);
    assert_eq!(encoded.digest, digest(&data));

    // lose one data and one parity frag
    let available: Vec<(FragIndex, Bytes)> = encoded
        .frags
        .iter()
        .filter(|f| f.index != FragIndex::Data(1) && f.index != FragIndex::Parity(0))
        .map(|f| (f.index, f.data.clone()))
        .collect();
    let rebuilt = codec
        .reconstruct(&coder, data.len() as u64, available)
        .unwrap();

    assert_eq!(rebuilt.data.as_ref(), data.as_slice());
    for frag in &encoded.frags {
        let same = rebuilt.frags.iter().find(|f| f.index == frag.index).unwrap();
        assert_eq!(same.data, frag.data);
        assert_eq!(same.digest, frag.digest);
    }
}

#[test]
fn test_codec_rejects_too_few_frags() {
    let codec = ReedSolomonChunkCodec::new();
    let coder = ChunkCoderConfig::erasure(4, 2, 1);
    let encoded = codec.encode(&coder, &payload(32, 4096)).unwrap();

    let available: Vec<(FragIndex, Bytes)> = encoded
        .frags
        .iter()
        .take(3)
        .map(|f| (f.index, f.data.clone()))
        .collect();

    assert_matches!(
        codec.reconstruct(&coder, 4096, available),
        Err(Error::InsufficientShards { available: 3, required: 4 })
    );
}

#[test]
fn test_encoding_becomes_unmapped_chunk() {
    let codec = ReedSolomonChunkCodec::new();
    let coder = ChunkCoderConfig::erasure(2, 1, 1);
    let data = payload(33, 5000);
    let encoded = codec.encode(&coder, &data).unwrap();

    let chunk = encoded.to_new_chunk(BucketId::new(), coder);

    assert!(chunk.is_new());
    assert_eq!(chunk.size, 5000);
    assert_eq!(chunk.frag_size, encoded.frag_size);
    assert_eq!(chunk.digest.as_deref(), Some(encoded.digest.as_str()));
    for frag in &encoded.frags {
        let mapped = chunk.frags.iter().find(|f| f.index == frag.index).unwrap();
        assert_eq!(mapped.data.as_ref(), Some(&frag.data));
        assert_eq!(mapped.digest.as_deref(), Some(frag.digest.as_str()));
    }
}

#[test]
fn test_frag_coder_matches_codec_layout() {
    let coder = ChunkCoderConfig::erasure(3, 2, 1);
    let frag_coder = FragCoder::for_chunk(&coder).unwrap();
    let data = payload(34, 3001);

    let frags = frag_coder.encode(&data).unwrap();
    let encoded = ReedSolomonChunkCodec::new().encode(&coder, &data).unwrap();

    assert_eq!(frags.len(), frag_coder.total_frags());
    assert_eq!(encoded.frag_size as usize, frag_coder.frag_size(data.len()));
    assert_eq!(frags[0].as_slice(), encoded.frags[0].data.as_ref());
}

// =============================================================================
// Rebuild Tests
// =============================================================================

mod rebuild_tests {
    use super::*;

    fn erasure_cluster(nodes: usize) -> Harness {
        Harness::new(Setup {
            coder: ChunkCoderConfig::erasure(2, 1, 1),
            hot_nodes: nodes,
            cold_tier: false,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_lost_data_frag_is_rebuilt() {
        let h = erasure_cluster(4);
        let data = payload(41, 64 * 1024);
        let id = h.upload_one(&data).await;

        let record = h.md.chunk(&id).unwrap();
        let d0 = record
            .frags
            .iter()
            .find(|f| f.index == FragIndex::Data(0))
            .unwrap()
            .id;
        let lost = h
            .live_blocks(&id)
            .into_iter()
            .find(|b| b.frag_id == d0)
            .unwrap();
        h.allocator.fail_node(&lost.node_id);

        MapBuilder::new(&h.ctx).run(&[id]).await.unwrap();

        let rebuilt = h
            .live_blocks(&id)
            .into_iter()
            .find(|b| b.frag_id == d0)
            .unwrap();
        assert_ne!(rebuilt.node_id, lost.node_id);
        let expected = h.ctx.codec.encode(&h.hot.coder, &data).unwrap();
        let frag = expected
            .frags
            .iter()
            .find(|f| f.index == FragIndex::Data(0))
            .unwrap();
        assert_eq!(h.blocks.block_data(&rebuilt.id).unwrap(), frag.data);
        assert_eq!(h.live_blocks(&id).len(), 3);
        assert!(h.md.deleted_block_ids().contains(&lost.id));
    }

    #[tokio::test]
    async fn test_too_many_lost_frags_fail_the_build() {
        let h = erasure_cluster(5);
        let id = h.upload_one(&payload(42, 16 * 1024)).await;
        let blocks = h.live_blocks(&id);
        h.allocator.fail_node(&blocks[0].node_id);
        h.allocator.fail_node(&blocks[1].node_id);

        let result = MapBuilder::new(&h.ctx).run(&[id]).await;

        assert_matches!(result, Err(Error::BuildIncomplete { failed }) if failed.len() == 1);
        assert!(h.md.deleted_block_ids().is_empty());
        assert!(h.events.count_of_type("ChunkBuildFailed") >= 1);
    }
}
