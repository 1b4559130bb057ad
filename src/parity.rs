//! Pure arithmetic and hashing primitives: stripe parity, missing-block
//! reconstruction, and SHA-256 block checksums.
//!
//! None of these functions touch disk or the network — they never suspend.
//! XOR is commutative and associative, so callers are free to reduce blocks
//! in any order (including in parallel).

use sha2::{Digest, Sha256};

use crate::error::ParityError;

/// Computes the stripe parity block: the byte-wise XOR of `data_blocks`,
/// zero-padded to the length of the longest member. The last stripe of a
/// file is usually partial, so zero-padding short blocks is mandatory rather
/// than an edge case.
///
/// # Examples
///
/// ```
/// # use raidframe::parity::compute_parity;
/// let a = vec![0b1010_1010, 0b0000_1111];
/// let b = vec![0b0101_0101];
/// let parity = compute_parity(&[a, b]).unwrap();
/// assert_eq!(parity, vec![0b1111_1111, 0b0000_1111]);
/// ```
pub fn compute_parity(data_blocks: &[Vec<u8>]) -> Result<Vec<u8>, ParityError> {
    if data_blocks.is_empty() {
        return Err(ParityError::InvalidInput(
            "computeParity requires at least one data block".into(),
        ));
    }

    let max_len = data_blocks.iter().map(|b| b.len()).max().unwrap_or(0);
    let mut parity = vec![0u8; max_len];

    for block in data_blocks {
        for (i, byte) in block.iter().enumerate() {
            parity[i] ^= byte;
        }
    }

    Ok(parity)
}

/// Reconstructs a missing stripe member from its surviving siblings and the
/// stripe's parity block: `parity XOR (XOR of surviving data blocks)`,
/// truncated/zero-padded to the parity length.
///
/// Precondition: `surviving_data_blocks` holds exactly D-1 of the stripe's D
/// data members (the caller already excluded `missing_position`). Violating
/// this silently produces an incorrect result — this function has no way to
/// detect it.
///
/// # Examples
///
/// ```
/// # use raidframe::parity::{compute_parity, recover_block};
/// let blocks = vec![vec![1u8, 2, 3], vec![4u8, 5], vec![9u8, 9, 9, 9]];
/// let parity = compute_parity(&blocks).unwrap();
/// let surviving: Vec<Vec<u8>> = blocks
///     .iter()
///     .enumerate()
///     .filter(|(i, _)| *i != 1)
///     .map(|(_, b)| b.clone())
///     .collect();
/// let recovered = recover_block(&surviving, &parity, 1).unwrap();
/// assert_eq!(&recovered[..blocks[1].len()], &blocks[1][..]);
/// ```
pub fn recover_block(
    surviving_data_blocks: &[Vec<u8>],
    parity: &[u8],
    _missing_position: usize,
) -> Result<Vec<u8>, ParityError> {
    if parity.is_empty() && surviving_data_blocks.iter().all(|b| b.is_empty()) {
        return Err(ParityError::InvalidInput(
            "recoverBlock requires a non-empty parity block".into(),
        ));
    }

    let mut recovered = parity.to_vec();
    for block in surviving_data_blocks {
        for (i, byte) in block.iter().enumerate() {
            if i < recovered.len() {
                recovered[i] ^= byte;
            }
        }
    }

    Ok(recovered)
}

/// SHA-256 of `bytes`, rendered as lowercase hex. Stable across calls.
///
/// # Examples
///
/// ```
/// # use raidframe::parity::checksum;
/// let a = checksum(b"blockframe");
/// let b = checksum(b"blockframe");
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Case-insensitive comparison of `checksum(bytes)` to `expected`.
///
/// # Examples
///
/// ```
/// # use raidframe::parity::{checksum, verify_checksum};
/// let bytes = b"a stripe member".to_vec();
/// let expected = checksum(&bytes);
/// assert!(verify_checksum(&bytes, &expected));
/// assert!(verify_checksum(&bytes, &expected.to_uppercase()));
/// assert!(!verify_checksum(b"different", &expected));
/// ```
pub fn verify_checksum(bytes: &[u8], expected: &str) -> bool {
    checksum(bytes).eq_ignore_ascii_case(expected)
}

/// True iff `compute_parity(data_blocks)` equals `parity` byte-for-byte.
///
/// # Examples
///
/// ```
/// # use raidframe::parity::{compute_parity, verify_parity};
/// let blocks = vec![vec![1u8, 2], vec![3u8, 4]];
/// let parity = compute_parity(&blocks).unwrap();
/// assert!(verify_parity(&blocks, &parity));
/// assert!(!verify_parity(&blocks, &[0, 0]));
/// ```
pub fn verify_parity(data_blocks: &[Vec<u8>], parity: &[u8]) -> bool {
    match compute_parity(data_blocks) {
        Ok(computed) => computed == parity,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_parity_empty_input_is_invalid() {
        let result = compute_parity(&[]);
        assert!(result.is_err());
    }

    #[test]
    fn recover_block_roundtrips_for_any_removed_member() {
        let blocks: Vec<Vec<u8>> = vec![
            b"the quick brown fox".to_vec(),
            b"jumps".to_vec(),
            b"over the lazy dog, very long tail indeed".to_vec(),
        ];
        let parity = compute_parity(&blocks).unwrap();

        for missing in 0..blocks.len() {
            let surviving: Vec<Vec<u8>> = blocks
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != missing)
                .map(|(_, b)| b.clone())
                .collect();
            let recovered = recover_block(&surviving, &parity, missing).unwrap();
            let expected = &blocks[missing];
            assert_eq!(&recovered[..expected.len()], &expected[..]);
        }
    }

    #[test]
    fn verify_checksum_flips_on_single_bit_change() {
        let mut bytes = vec![0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let original = checksum(&bytes);
        assert!(verify_checksum(&bytes, &original));

        bytes[0] ^= 0b0000_0001;
        assert!(!verify_checksum(&bytes, &original));
    }

    #[test]
    fn parity_is_order_independent() {
        let blocks = vec![vec![5u8, 10, 15], vec![1u8, 2, 3], vec![255u8, 0, 128]];
        let forward = compute_parity(&blocks).unwrap();
        let mut reversed = blocks.clone();
        reversed.reverse();
        let backward = compute_parity(&reversed).unwrap();
        assert_eq!(forward, backward);
    }
}
