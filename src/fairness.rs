//! Commit-reveal randomness for winner selection.
//!
//! Flow per round:
//! - Commit at betting entry: a fresh 32-byte seed is drawn from the OS RNG and
//!   only `SHA-256(seed)` is published.
//! - Reveal at settlement: the hex seed is published alongside the result.
//! - Selection: winners are a pure function of `(seed, sorted participants,
//!   winner_count)`, so anyone holding the revealed seed can recompute them.

use crate::common::types::{RoundRecord, UserId};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;

pub const SEED_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FairnessError {
    #[error("Invalid seed hex: {0}")]
    InvalidSeedHex(String),

    #[error("Seed must be {SEED_LEN} bytes, got {0}")]
    InvalidSeedLength(usize),

    #[error("Round {0} has not been revealed")]
    NotRevealed(String),
}

/// Server-side seed plus its published hash.
///
/// The seed never leaves memory before reveal; `Debug` omits it.
#[derive(Clone, PartialEq, Eq)]
pub struct SeedCommitment {
    seed: [u8; SEED_LEN],
    hash: String,
}

impl SeedCommitment {
    /// Draw a fresh seed from the OS RNG
    pub fn generate() -> Self {
        let mut seed = [0u8; SEED_LEN];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; SEED_LEN]) -> Self {
        let hash = hash_seed(&seed);
        Self { seed, hash }
    }

    /// Hex `SHA-256(seed)`; safe to publish before the outcome is fixed
    pub fn commitment_hash(&self) -> &str {
        &self.hash
    }

    /// Hex seed; publish only at settlement
    pub fn reveal(&self) -> String {
        hex::encode(self.seed)
    }

    pub fn select_winners(&self, participants: &[UserId], winner_count: usize) -> Vec<UserId> {
        select_winners(&self.seed, participants, winner_count)
    }
}

impl fmt::Debug for SeedCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedCommitment")
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

pub fn hash_seed(seed: &[u8]) -> String {
    hex::encode(Sha256::digest(seed))
}

pub fn decode_seed(reveal_hex: &str) -> Result<[u8; SEED_LEN], FairnessError> {
    let bytes = hex::decode(reveal_hex).map_err(|e| FairnessError::InvalidSeedHex(e.to_string()))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| FairnessError::InvalidSeedLength(len))
}

/// `SHA-256(revealed_seed) == commitment`
pub fn verify_commitment(reveal_hex: &str, commit_hash: &str) -> Result<bool, FairnessError> {
    let seed = decode_seed(reveal_hex)?;
    Ok(hash_seed(&seed).eq_ignore_ascii_case(commit_hash))
}

/// Pseudo-random stream of `SHA-256(seed || counter)` draws.
/// Each draw re-hashes with a fresh counter, so the stream is not bounded by a
/// single digest.
struct SeedStream<'a> {
    seed: &'a [u8],
    counter: u64,
}

impl<'a> SeedStream<'a> {
    fn new(seed: &'a [u8]) -> Self {
        Self { seed, counter: 0 }
    }

    fn next_u64(&mut self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(self.counter.to_be_bytes());
        self.counter += 1;
        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(word)
    }

    /// Uniform-enough index in `0..bound`; bound is always small relative to 2^64
    fn next_index(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }
}

/// Deterministic winner subset.
///
/// Participants are sorted first so callers may pass them in any order. When
/// `winner_count >= participants` everyone wins; otherwise a partial
/// Fisher-Yates shuffle fixes the first `winner_count` positions.
pub fn select_winners(seed: &[u8], participants: &[UserId], winner_count: usize) -> Vec<UserId> {
    let mut ids: Vec<UserId> = participants.to_vec();
    ids.sort();

    if winner_count >= ids.len() {
        return ids;
    }

    let mut stream = SeedStream::new(seed);
    let n = ids.len();
    for i in 0..winner_count {
        let j = i + stream.next_index(n - i);
        ids.swap(i, j);
    }
    ids.truncate(winner_count);
    ids
}

/// Re-derive a settled round's outcome from its revealed seed
pub fn verify_round(round: &RoundRecord, winner_count: usize) -> Result<bool, FairnessError> {
    let reveal = round
        .reveal_seed
        .as_deref()
        .ok_or_else(|| FairnessError::NotRevealed(round.round_id.clone()))?;
    if !verify_commitment(reveal, &round.commit_hash)? {
        return Ok(false);
    }
    let seed = decode_seed(reveal)?;
    let expected = select_winners(&seed, &round.participants, winner_count);
    Ok(round.winners.as_deref() == Some(expected.as_slice()))
}
