/// Payload obfuscation: a precomputed pool of byte-substitution alphabets
/// ("swaps"), random padding for short payloads, and the translate-table
/// involution that both encrypts and decrypts a chunk.
use rand::{Rng, RngCore};
use std::collections::BTreeSet;

use crate::config::{MAX_PADDING_LENGTH, MIN_PADDING_LENGTH, SWAPS_ADD_LENGTH};

/// Number of precomputed swap alphabets; one is chosen at random per message.
const POOL_SIZE: usize = 1000;

/// A pool of swap alphabets, generated once at process startup from a shared
/// token and held for the life of the process.
#[derive(Debug)]
pub struct SwapsPool {
    swaps: Vec<Vec<u8>>,
}

impl SwapsPool {
    pub fn new(token: &str) -> Self {
        let mut rng = rand::thread_rng();
        let swaps = (0..POOL_SIZE).map(|_| make_swap(token, &mut rng)).collect();
        Self { swaps }
    }

    pub fn random(&self) -> &[u8] {
        let idx = rand::thread_rng().next_u32() as usize % self.swaps.len();
        &self.swaps[idx]
    }
}

/// Build one swap alphabet: `aeiou` + token bytes + random bytes, deduplicated
/// while preserving first-seen order so the resulting alphabet has no
/// repeated bytes (a prerequisite for the translate table being involutive).
fn make_swap(token: &str, rng: &mut impl RngCore) -> Vec<u8> {
    let mut raw = Vec::with_capacity(5 + token.len() + SWAPS_ADD_LENGTH);
    raw.extend_from_slice(b"aeiou");
    raw.extend_from_slice(token.as_bytes());
    let mut extra = vec![0u8; SWAPS_ADD_LENGTH];
    rng.fill_bytes(&mut extra);
    raw.extend_from_slice(&extra);

    let mut seen = BTreeSet::new();
    raw.into_iter().filter(|b| seen.insert(*b)).collect()
}

/// Build the involutive translate table for a swap alphabet: `swaps[i]` maps
/// to `swaps[len - 1 - i]` and vice versa; every other byte is identity.
fn translate_table(swaps: &[u8]) -> [u8; 256] {
    let mut table: [u8; 256] = std::array::from_fn(|i| i as u8);
    let len = swaps.len();
    for i in 0..len {
        table[swaps[i] as usize] = swaps[len - 1 - i];
    }
    table
}

fn translate(table: &[u8; 256], data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| table[*b as usize]).collect()
}

/// Result of obfuscating a payload: the chosen alphabet, the padding length
/// prepended before encryption, and the obfuscated bytes.
pub struct Obfuscated {
    pub swaps: Vec<u8>,
    pub padding: u32,
    pub data_obfs: Vec<u8>,
}

/// Obfuscate `data`. Empty input yields an empty, un-padded result — control
/// messages with no body never pay the padding cost.
pub fn obfs(data: &[u8], pool: &SwapsPool) -> Obfuscated {
    if data.is_empty() {
        return Obfuscated {
            swaps: Vec::new(),
            padding: 0,
            data_obfs: Vec::new(),
        };
    }

    let swaps = pool.random().to_vec();
    let table = translate_table(&swaps);

    let mut prefixed;
    let padding;
    if data.len() < MIN_PADDING_LENGTH {
        let mut rng = rand::thread_rng();
        let target = rng.gen_range(MIN_PADDING_LENGTH..=MAX_PADDING_LENGTH);
        let pad_len = target - data.len();
        let mut pad = vec![0u8; pad_len];
        rng.fill_bytes(&mut pad);
        padding = pad_len as u32;
        prefixed = pad;
        prefixed.extend_from_slice(data);
    } else {
        padding = 0;
        prefixed = data.to_vec();
    }

    let data_obfs = translate(&table, &prefixed);
    Obfuscated {
        swaps,
        padding,
        data_obfs,
    }
}

/// Reverse `obfs`: rebuild the translate table from `swaps`, undo the
/// substitution, then drop the leading `padding` bytes.
pub fn deobfs(data_obfs: &[u8], swaps: &[u8], padding: u32) -> Vec<u8> {
    if data_obfs.is_empty() {
        return Vec::new();
    }
    let plain = if swaps.is_empty() {
        data_obfs.to_vec()
    } else {
        let table = translate_table(swaps);
        translate(&table, data_obfs)
    };
    let padding = padding as usize;
    if padding >= plain.len() {
        Vec::new()
    } else {
        plain[padding..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_alphabet_has_no_duplicates() {
        let pool = SwapsPool::new("LzHAxq0KtWM");
        for swap in &pool.swaps {
            let unique: BTreeSet<_> = swap.iter().collect();
            assert_eq!(unique.len(), swap.len());
        }
    }

    #[test]
    fn translate_table_is_involution() {
        let pool = SwapsPool::new("LzHAxq0KtWM");
        let swaps = pool.random();
        let table = translate_table(swaps);
        for b in 0..=255u8 {
            let once = table[b as usize];
            let twice = table[once as usize];
            assert_eq!(twice, b, "translate table must be an involution");
        }
    }

    #[test]
    fn obfs_deobfs_roundtrip_short_payload() {
        let pool = SwapsPool::new("LzHAxq0KtWM");
        let data = b"hello world";
        let obfuscated = obfs(data, &pool);
        assert!(obfuscated.padding as usize + data.len() >= MIN_PADDING_LENGTH);
        let back = deobfs(&obfuscated.data_obfs, &obfuscated.swaps, obfuscated.padding);
        assert_eq!(back, data);
    }

    #[test]
    fn obfs_deobfs_roundtrip_long_payload_no_padding() {
        let pool = SwapsPool::new("LzHAxq0KtWM");
        let data = vec![7u8; MIN_PADDING_LENGTH + 50];
        let obfuscated = obfs(&data, &pool);
        assert_eq!(obfuscated.padding, 0);
        let back = deobfs(&obfuscated.data_obfs, &obfuscated.swaps, obfuscated.padding);
        assert_eq!(back, data);
    }

    #[test]
    fn empty_payload_stays_empty() {
        let pool = SwapsPool::new("LzHAxq0KtWM");
        let obfuscated = obfs(b"", &pool);
        assert!(obfuscated.swaps.is_empty());
        assert!(obfuscated.data_obfs.is_empty());
        assert_eq!(obfuscated.padding, 0);
    }
}
