use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{Error, Result};
use crate::models::{sha256_hex, LocalGroup};

/// Reed-Solomon erasure codec with Local Reconstruction Codes on top.
///
/// Encoding a buffer of N bytes produces `k` data chunks of
/// `ceil(N / k)` bytes (the last one zero-padded), `m` RS parity chunks,
/// and one XOR symbol per LRC group of data chunks. Any `k` of the first
/// `k + m` chunks suffice to decode; a single missing data chunk in a group
/// can instead be recovered from the group's surviving members plus its
/// XOR symbol, without touching RS parity at all.
pub struct ErasureCodec {
    k: usize,
    m: usize,
    group_size: usize,
}

/// Output of a successful encode.
pub struct EncodedFile {
    /// All chunks in index order: data, parity, then LRC symbols.
    pub chunks: Vec<Vec<u8>>,
    /// Size of every chunk in bytes.
    pub chunk_size: usize,
    pub groups: Vec<LocalGroup>,
    /// SHA-256 of each chunk, same order as `chunks`.
    pub chunk_hashes: Vec<String>,
}

impl ErasureCodec {
    pub fn new(k: usize, m: usize, group_size: usize) -> Result<Self> {
        if k < 1 {
            return Err(Error::ChunkEncoding("K must be at least 1".to_string()));
        }
        if k + m > 255 {
            return Err(Error::ChunkEncoding(format!(
                "K + M = {} exceeds the GF(2^8) limit of 255",
                k + m
            )));
        }
        if group_size < 1 {
            return Err(Error::ChunkEncoding("LRC group size must be at least 1".to_string()));
        }
        Ok(ErasureCodec { k, m, group_size })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn group_count(&self) -> usize {
        self.k.div_ceil(self.group_size)
    }

    pub fn total_chunks(&self) -> usize {
        self.k + self.m + self.group_count()
    }

    /// Partition of the data indices into contiguous LRC groups. Group `g`
    /// owns recovery index `k + m + g`.
    pub fn local_groups(&self) -> Vec<LocalGroup> {
        (0..self.group_count())
            .map(|g| {
                let start = g * self.group_size;
                let end = (start + self.group_size).min(self.k);
                LocalGroup {
                    group_id: g,
                    chunk_indices: (start..end).collect(),
                    recovery_idx: self.k + self.m + g,
                }
            })
            .collect()
    }

    pub fn encode(&self, data: &[u8]) -> Result<EncodedFile> {
        if data.is_empty() {
            return Err(Error::ChunkEncoding("cannot encode empty input".to_string()));
        }

        let chunk_size = data.len().div_ceil(self.k);

        // K data shards, last one zero-padded to chunk_size.
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.k + self.m);
        for i in 0..self.k {
            let start = (i * chunk_size).min(data.len());
            let end = ((i + 1) * chunk_size).min(data.len());
            let mut shard = data[start..end].to_vec();
            shard.resize(chunk_size, 0);
            shards.push(shard);
        }

        // M parity shards over GF(2^8).
        if self.m > 0 {
            shards.extend(std::iter::repeat_with(|| vec![0u8; chunk_size]).take(self.m));
            let rs = ReedSolomon::new(self.k, self.m)
                .map_err(|e| Error::ChunkEncoding(e.to_string()))?;
            rs.encode(&mut shards)
                .map_err(|e| Error::ChunkEncoding(e.to_string()))?;
        }

        // One XOR symbol per local group.
        let groups = self.local_groups();
        for group in &groups {
            let mut symbol = vec![0u8; chunk_size];
            for &idx in &group.chunk_indices {
                xor_into(&mut symbol, &shards[idx]);
            }
            shards.push(symbol);
        }

        let chunk_hashes = shards.iter().map(|c| sha256_hex(c)).collect();
        debug!(
            "encoded {} bytes into {} data + {} parity + {} lrc chunks of {} bytes",
            data.len(),
            self.k,
            self.m,
            groups.len(),
            chunk_size
        );

        Ok(EncodedFile {
            chunks: shards,
            chunk_size,
            groups,
            chunk_hashes,
        })
    }

    /// Reconstructs the original buffer from whatever subset of chunks is
    /// available.
    ///
    /// Chunks failing their recorded SHA-256 are treated as missing. LRC
    /// recovery runs first; RS erasure decoding is the fallback when a group
    /// cannot repair itself. The decoded buffer is truncated to
    /// `original_size` and checked against `content_hash`.
    pub fn decode(
        &self,
        available: &BTreeMap<usize, Vec<u8>>,
        chunk_hashes: &[String],
        original_size: u64,
        content_hash: &str,
    ) -> Result<Vec<u8>> {
        let mut held: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        for (&idx, chunk) in available {
            if idx >= self.total_chunks() {
                continue;
            }
            match chunk_hashes.get(idx) {
                Some(expected) if !expected.is_empty() && sha256_hex(chunk) != *expected => {
                    warn!("chunk {idx} failed hash validation, treating as missing");
                }
                _ => {
                    held.insert(idx, chunk.clone());
                }
            }
        }

        self.recover_via_lrc(&mut held);

        let data = if (0..self.k).all(|i| held.contains_key(&i)) {
            self.assemble(&held)
        } else {
            self.decode_rs(&mut held)?
        };

        let mut data = data;
        data.truncate(original_size as usize);

        let actual = sha256_hex(&data);
        if actual != content_hash {
            return Err(Error::ChunkDecoding(format!(
                "reconstructed content hash mismatch: expected {content_hash}, got {actual}"
            )));
        }
        Ok(data)
    }

    /// Whether the given set of chunk indices is enough to decode, after
    /// LRC repair is taken into account.
    pub fn can_decode(&self, held: &BTreeSet<usize>) -> bool {
        let mut held = held.clone();
        // LRC repair on index level: a group missing exactly one data chunk
        // is whole if its symbol and remaining members are present.
        for group in self.local_groups() {
            let missing: Vec<usize> = group
                .chunk_indices
                .iter()
                .copied()
                .filter(|i| !held.contains(i))
                .collect();
            if missing.len() == 1 && held.contains(&group.recovery_idx) {
                held.insert(missing[0]);
            }
        }
        if (0..self.k).all(|i| held.contains(&i)) {
            return true;
        }
        self.m > 0 && held.iter().filter(|&&i| i < self.k + self.m).count() >= self.k
    }

    /// Candidate chunk indices to fetch, cheapest recovery first: the
    /// missing data chunks themselves, then the LRC symbols of damaged
    /// groups, then RS parity as a last resort. The caller stops fetching
    /// as soon as `can_decode` holds.
    pub fn fetch_priority(&self, held: &BTreeSet<usize>) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.k).filter(|i| !held.contains(i)).collect();
        for group in self.local_groups() {
            let damaged = group.chunk_indices.iter().any(|i| !held.contains(i));
            if damaged && !held.contains(&group.recovery_idx) {
                order.push(group.recovery_idx);
            }
        }
        order.extend((self.k..self.k + self.m).filter(|i| !held.contains(i)));
        order
    }

    /// XOR-repairs every group missing exactly one data chunk in place.
    fn recover_via_lrc(&self, held: &mut BTreeMap<usize, Vec<u8>>) {
        for group in self.local_groups() {
            let missing: Vec<usize> = group
                .chunk_indices
                .iter()
                .copied()
                .filter(|i| !held.contains_key(i))
                .collect();
            if missing.len() != 1 {
                continue;
            }
            let Some(symbol) = held.get(&group.recovery_idx) else {
                continue;
            };
            let mut recovered = symbol.clone();
            let mut complete = true;
            for &idx in &group.chunk_indices {
                if idx == missing[0] {
                    continue;
                }
                match held.get(&idx) {
                    Some(chunk) => xor_into(&mut recovered, chunk),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                debug!("chunk {} recovered via LRC group {}", missing[0], group.group_id);
                held.insert(missing[0], recovered);
            }
        }
    }

    fn decode_rs(&self, held: &mut BTreeMap<usize, Vec<u8>>) -> Result<Vec<u8>> {
        let within_code = held.keys().filter(|&&i| i < self.k + self.m).count();
        if self.m == 0 || within_code < self.k {
            return Err(Error::InsufficientChunks {
                available: within_code,
                required: self.k,
            });
        }

        let chunk_size = held
            .values()
            .next()
            .map(|c| c.len())
            .ok_or(Error::InsufficientChunks {
                available: 0,
                required: self.k,
            })?;

        let mut shards: Vec<Option<Vec<u8>>> = (0..self.k + self.m)
            .map(|i| held.get(&i).cloned())
            .collect();
        // Uniform shard length is an RS precondition; a short chunk means
        // on-disk truncation and is treated as an erasure.
        for shard in shards.iter_mut() {
            if shard.as_ref().is_some_and(|s| s.len() != chunk_size) {
                *shard = None;
            }
        }

        let rs =
            ReedSolomon::new(self.k, self.m).map_err(|e| Error::ChunkDecoding(e.to_string()))?;
        rs.reconstruct(&mut shards).map_err(|e| match e {
            reed_solomon_erasure::Error::TooFewShardsPresent => Error::InsufficientChunks {
                available: within_code,
                required: self.k,
            },
            other => Error::ChunkDecoding(other.to_string()),
        })?;

        for (i, shard) in shards.into_iter().enumerate().take(self.k) {
            let shard = shard.ok_or_else(|| {
                Error::ChunkDecoding(format!("data shard {i} absent after reconstruction"))
            })?;
            held.insert(i, shard);
        }
        Ok(self.assemble(held))
    }

    fn assemble(&self, held: &BTreeMap<usize, Vec<u8>>) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..self.k {
            out.extend_from_slice(&held[&i]);
        }
        out
    }
}

fn xor_into(target: &mut [u8], source: &[u8]) {
    for (t, s) in target.iter_mut().zip(source) {
        *t ^= s;
    }
}
