//! Chunk negotiation and enumeration (4.6.1).

pub const MIN_CHUNK_SIZE: usize = 4 * 1024;
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    pub bytes: Vec<u8>,
}

/// `agreed = clamp(min(proposed, peer_max), MIN, MAX)`. An invalid proposal
/// (zero, or outside the closed interval before clamping makes it moot) is
/// replaced by the default before clamping.
pub fn negotiate_chunk_size(proposed: usize, peer_max: usize) -> usize {
    let proposed = if proposed == 0 { DEFAULT_CHUNK_SIZE } else { proposed };
    let peer_max = if peer_max == 0 { DEFAULT_CHUNK_SIZE } else { peer_max };
    proposed.min(peer_max).clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Enumerate `(index, bytes)` pairs over `data` at `chunk_size`. The final
/// chunk may be shorter than `chunk_size`.
pub fn chunk_bytes(data: &[u8], chunk_size: usize) -> Vec<Chunk> {
    data.chunks(chunk_size)
        .enumerate()
        .map(|(index, bytes)| Chunk { index, bytes: bytes.to_vec() })
        .collect()
}

/// Reassemble chunks into a contiguous byte buffer. Chunks may arrive out of
/// order; a gap in the index range (a missing index below the maximum seen)
/// is fatal - the caller has not received a complete transfer.
pub fn reassemble(mut chunks: Vec<Chunk>) -> Option<Vec<u8>> {
    if chunks.is_empty() {
        return Some(Vec::new());
    }
    chunks.sort_by_key(|c| c.index);
    for (expected, chunk) in chunks.iter().enumerate() {
        if chunk.index != expected {
            return None;
        }
    }
    let mut out = Vec::new();
    for chunk in chunks {
        out.extend_from_slice(&chunk.bytes);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_clamps_to_bounds() {
        assert_eq!(negotiate_chunk_size(1, 1_000_000), MIN_CHUNK_SIZE);
        assert_eq!(negotiate_chunk_size(1_000_000, 1_000_000), MAX_CHUNK_SIZE);
        assert_eq!(negotiate_chunk_size(0, 0), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn negotiate_takes_the_smaller_proposal() {
        assert_eq!(negotiate_chunk_size(32 * 1024, 8 * 1024), 8 * 1024);
    }

    #[test]
    fn property_6_chunker_round_trip() {
        for size in [MIN_CHUNK_SIZE, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE] {
            let data: Vec<u8> = (0..(size * 3 + 17)).map(|i| (i % 256) as u8).collect();
            let chunks = chunk_bytes(&data, size);
            let restored = reassemble(chunks).unwrap();
            assert_eq!(restored, data);
        }
    }

    #[test]
    fn reassemble_detects_gaps() {
        let chunks = vec![Chunk { index: 0, bytes: vec![1] }, Chunk { index: 2, bytes: vec![3] }];
        assert!(reassemble(chunks).is_none());
    }
}
