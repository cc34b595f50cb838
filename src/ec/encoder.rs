//! Fragment Coder
//!
//! Splits a chunk buffer into `data_frags` equally sized fragments and, when
//! the coding has parity, computes Reed-Solomon parity fragments over them
//! using the `reed-solomon-erasure` crate.

use std::sync::Arc;

use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::{debug, instrument};

use crate::domain::model::ChunkCoderConfig;
use crate::error::{Error, Result};

// =============================================================================
// Frag Coder
// =============================================================================

/// Coder for one `data + parity` layout.
pub struct FragCoder {
    /// Absent for layouts without parity
    rs: Option<Arc<ReedSolomon>>,
    data_frags: usize,
    parity_frags: usize,
}

impl std::fmt::Debug for FragCoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragCoder")
            .field("data_frags", &self.data_frags)
            .field("parity_frags", &self.parity_frags)
            .finish()
    }
}

impl FragCoder {
    pub fn new(data_frags: usize, parity_frags: usize) -> Result<Self> {
        if data_frags == 0 {
            return Err(Error::InvalidEcConfig(
                "data_frags must be greater than 0".to_string(),
            ));
        }

        let rs = if parity_frags == 0 {
            None
        } else {
            let rs = ReedSolomon::new(data_frags, parity_frags).map_err(|e| {
                Error::InvalidEcConfig(format!("Failed to create Reed-Solomon codec: {}", e))
            })?;
            Some(Arc::new(rs))
        };

        Ok(Self {
            rs,
            data_frags,
            parity_frags,
        })
    }

    /// Coder for the layout of a chunk. LRC frags are not supported.
    pub fn for_chunk(coder: &ChunkCoderConfig) -> Result<Self> {
        if coder.lrc_frags > 0 {
            return Err(Error::InvalidEcConfig(format!(
                "LRC coding is not supported ({} lrc frags)",
                coder.lrc_frags
            )));
        }
        Self::new(coder.data_frags as usize, coder.parity_frags as usize)
    }

    pub fn data_frags(&self) -> usize {
        self.data_frags
    }

    pub fn parity_frags(&self) -> usize {
        self.parity_frags
    }

    pub fn total_frags(&self) -> usize {
        self.data_frags + self.parity_frags
    }

    /// Size of every fragment of a chunk of `size` bytes.
    pub fn frag_size(&self, size: usize) -> usize {
        size.div_ceil(self.data_frags).max(1)
    }

    /// Split `data` into padded data fragments followed by parity fragments.
    #[instrument(skip(self, data), fields(data_len = data.len()))]
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if data.is_empty() {
            return Err(Error::EcEncodingFailed("cannot encode an empty chunk".to_string()));
        }
        let frag_size = self.frag_size(data.len());

        let mut frags: Vec<Vec<u8>> = data
            .chunks(frag_size)
            .map(|c| {
                let mut frag = c.to_vec();
                frag.resize(frag_size, 0);
                frag
            })
            .collect();
        frags.resize(self.total_frags(), vec![0u8; frag_size]);

        if let Some(rs) = &self.rs {
            rs.encode(&mut frags)
                .map_err(|e| Error::EcEncodingFailed(format!("Reed-Solomon encoding failed: {}", e)))?;
        }

        debug!(frags = frags.len(), frag_size, "Encoded chunk");
        Ok(frags)
    }

    /// Fill every missing fragment in place.
    ///
    /// `frags` is indexed data first, then parity.
    pub fn reconstruct(&self, frags: &mut [Option<Vec<u8>>]) -> Result<()> {
        if frags.len() != self.total_frags() {
            return Err(Error::InvalidEcConfig(format!(
                "Expected {} frags, got {}",
                self.total_frags(),
                frags.len()
            )));
        }

        let available = frags.iter().filter(|f| f.is_some()).count();
        let required = match self.rs {
            Some(_) => self.data_frags,
            None => self.total_frags(),
        };
        if available < required {
            return Err(Error::InsufficientShards {
                available,
                required,
            });
        }

        if let Some(rs) = &self.rs {
            rs.reconstruct(frags)
                .map_err(|e| Error::EcReconstructionFailed(format!("Reed-Solomon: {}", e)))?;
        }
        Ok(())
    }

    /// Concatenate the data fragments and drop the padding.
    pub fn join(&self, frags: &[Option<Vec<u8>>], size: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(size);
        for (i, frag) in frags.iter().take(self.data_frags).enumerate() {
            let frag = frag
                .as_ref()
                .ok_or_else(|| Error::EcReconstructionFailed(format!("data frag {} missing", i)))?;
            data.extend_from_slice(frag);
        }
        if data.len() < size {
            return Err(Error::EcReconstructionFailed(format!(
                "joined {} bytes, expected {}",
                data.len(),
                size
            )));
        }
        data.truncate(size);
        Ok(data)
    }
}
