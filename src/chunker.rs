//! Content-defined chunking of file streams, a thin wrapper over FastCDC.
//! Identical input streams produce byte-identical chunk boundaries, which
//! is what makes deduplication by content address work.

use std::io::Read;

use fastcdc::v2020::StreamCDC;

use crate::config::ChunkingConfig;
use crate::error::Result;

/// A single content-defined chunk: its offset in the source stream and
/// its bytes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct Chunker {
    min_size: u32,
    normal_size: u32,
    max_size: u32,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            min_size: config.min_size as u32,
            normal_size: config.normal_size as u32,
            max_size: config.max_size as u32,
        }
    }

    /// Lazily split `source` into chunks whose sizes lie in `[min, max]`
    /// with an expected value near `normal`. An empty source yields zero
    /// chunks.
    pub fn chunks<R: Read>(&self, source: R) -> ChunkStream<R> {
        ChunkStream {
            inner: StreamCDC::new(source, self.min_size, self.normal_size, self.max_size),
        }
    }
}

pub struct ChunkStream<R: Read> {
    inner: StreamCDC<R>,
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok(chunk) => Some(Ok(Chunk {
                offset: chunk.offset,
                data: chunk.data,
            })),
            Err(e) => Some(Err(e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn config(min: u64, normal: u64, max: u64) -> ChunkingConfig {
        ChunkingConfig {
            algorithm: crate::config::CHUNKING_ALGORITHM.to_string(),
            min_size: min,
            normal_size: normal,
            max_size: max,
        }
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        (0..len).map(|_| rng.gen()).collect()
    }

    #[test]
    fn empty_input_yields_zero_chunks() {
        let chunker = Chunker::new(&config(256, 1024, 4096));
        let chunks: Vec<_> = chunker.chunks(&[][..]).collect();
        assert!(chunks.is_empty());
    }

    #[test]
    fn boundaries_are_deterministic() {
        let data = random_bytes(256 * 1024);
        let chunker = Chunker::new(&config(1024, 4096, 16384));

        let first: Vec<Chunk> = chunker.chunks(&data[..]).map(|c| c.unwrap()).collect();
        let second: Vec<Chunk> = chunker.chunks(&data[..]).map(|c| c.unwrap()).collect();
        assert_eq!(first, second);
        assert!(first.len() > 1);
    }

    #[test]
    fn sizes_stay_within_bounds_and_reassemble() {
        let data = random_bytes(512 * 1024);
        let chunker = Chunker::new(&config(1024, 4096, 16384));

        let mut reassembled = Vec::new();
        let mut expected_offset = 0u64;
        for (i, chunk) in chunker.chunks(&data[..]).enumerate() {
            let chunk = chunk.unwrap();
            assert_eq!(chunk.offset, expected_offset, "chunk {i} offset");
            assert!(chunk.data.len() <= 16384);
            expected_offset += chunk.data.len() as u64;
            reassembled.extend_from_slice(&chunk.data);
        }
        assert_eq!(reassembled, data);
    }
}
