//! Reed-Solomon Chunk Codec
//!
//! Implements the `ChunkCodec` port on top of [`FragCoder`], with SHA-256
//! digests for chunks and fragments.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::domain::model::{ChunkCoderConfig, FragIndex};
use crate::domain::ports::{ChunkCodec, EncodedChunk, EncodedFrag};
use crate::ec::FragCoder;
use crate::error::{Error, Result};

/// Hex SHA-256 of a buffer.
pub fn digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Chunk codec with one cached coder per fragment layout.
#[derive(Default)]
pub struct ReedSolomonChunkCodec {
    coders: DashMap<(u32, u32, u32), Arc<FragCoder>>,
}

impl std::fmt::Debug for ReedSolomonChunkCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReedSolomonChunkCodec")
            .field("layouts", &self.coders.len())
            .finish()
    }
}

impl ReedSolomonChunkCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn coder(&self, config: &ChunkCoderConfig) -> Result<Arc<FragCoder>> {
        let key = (config.data_frags, config.parity_frags, config.lrc_frags);
        if let Some(coder) = self.coders.get(&key) {
            return Ok(coder.clone());
        }
        let coder = Arc::new(FragCoder::for_chunk(config)?);
        self.coders.insert(key, coder.clone());
        Ok(coder)
    }

    fn assemble(
        config: &ChunkCoderConfig,
        data: Vec<u8>,
        frags: Vec<Vec<u8>>,
    ) -> EncodedChunk {
        let frag_size = frags.first().map(|f| f.len() as u64).unwrap_or(0);
        let frags = config
            .frag_indexes()
            .into_iter()
            .zip(frags)
            .map(|(index, frag)| EncodedFrag {
                index,
                digest: digest(&frag),
                data: Bytes::from(frag),
            })
            .collect();
        EncodedChunk {
            digest: digest(&data),
            data: Bytes::from(data),
            frag_size,
            frags,
        }
    }
}

impl ChunkCodec for ReedSolomonChunkCodec {
    fn encode(&self, config: &ChunkCoderConfig, data: &[u8]) -> Result<EncodedChunk> {
        let frags = self.coder(config)?.encode(data)?;
        Ok(Self::assemble(config, data.to_vec(), frags))
    }

    fn reconstruct(
        &self,
        config: &ChunkCoderConfig,
        size: u64,
        available: Vec<(FragIndex, Bytes)>,
    ) -> Result<EncodedChunk> {
        let coder = self.coder(config)?;
        let mut frags: Vec<Option<Vec<u8>>> = vec![None; coder.total_frags()];
        for (index, data) in available {
            let position = index.shard_position(config).ok_or_else(|| {
                Error::EcReconstructionFailed(format!("frag {} is outside the coding", index))
            })?;
            frags[position] = Some(data.to_vec());
        }

        coder.reconstruct(&mut frags)?;
        let data = coder.join(&frags, size as usize)?;
        let frags = frags.into_iter().flatten().collect();
        Ok(Self::assemble(config, data, frags))
    }
}
