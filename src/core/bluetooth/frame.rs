//! Outbound frame chunking

use crate::core::bluetooth::error::LinkError;

/// Split `payload` into ordered, contiguous chunks of at most `max_chunk_size`
/// bytes. The last chunk may be shorter; an empty payload yields no chunks.
pub fn chunk(payload: &[u8], max_chunk_size: usize) -> Result<Vec<Vec<u8>>, LinkError> {
    if max_chunk_size == 0 {
        return Err(LinkError::InvalidChunkSize);
    }
    Ok(payload
        .chunks(max_chunk_size)
        .map(|c| c.to_vec())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{FRAME_CHUNK_SIZE, STATUS_REQUEST_FRAME};

    #[test]
    fn empty_payload_has_no_chunks() {
        assert!(chunk(&[], FRAME_CHUNK_SIZE).unwrap().is_empty());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert_eq!(chunk(&[1, 2, 3], 0), Err(LinkError::InvalidChunkSize));
    }

    #[test]
    fn status_frame_fits_in_one_chunk() {
        let chunks = chunk(&STATUS_REQUEST_FRAME, FRAME_CHUNK_SIZE).unwrap();
        assert_eq!(chunks, vec![STATUS_REQUEST_FRAME.to_vec()]);
    }

    #[test]
    fn chunk_count_and_sizes_follow_payload_length() {
        let payload: Vec<u8> = (0..=255u8).collect();
        for size in [1usize, 7, 20, 64, 255, 256, 1000] {
            let chunks = chunk(&payload, size).unwrap();
            assert_eq!(chunks.len(), payload.len().div_ceil(size), "size {size}");
            assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= size));
            assert_eq!(chunks.concat(), payload);
        }
    }

    #[test]
    fn last_chunk_carries_the_remainder() {
        let payload = vec![0xAB; 45];
        let chunks = chunk(&payload, 20).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![20, 20, 5]);
    }
}
