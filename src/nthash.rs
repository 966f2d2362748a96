//! Canonical ntHash rolling hash over DNA sequences.
//!
//! Produces `hash_num` 64-bit hash values per k-mer position with O(1)
//! updates per shift. The first value is the canonical hash (minimum of the
//! forward and reverse-complement strand hashes); the remaining values are
//! derived from it, so a k-mer and its reverse complement always yield the
//! same hash vector. Windows containing non-ACGT bases are skipped.

const SEED_A: u64 = 0x3c8b_fbb3_95c6_0474;
const SEED_C: u64 = 0x3193_c185_62a0_2b4c;
const SEED_G: u64 = 0x2032_3ed0_8257_2324;
const SEED_T: u64 = 0x2955_49f5_4be2_4456;

const MULTI_SEED: u64 = 0x90b4_5d39_fb6d_a1fa;
const MULTI_SHIFT: u32 = 27;

/// Seeds of a base and of its complement, or None for non-ACGT bytes.
#[inline]
fn seeds(base: u8) -> Option<(u64, u64)> {
    match base {
        b'A' | b'a' => Some((SEED_A, SEED_T)),
        b'C' | b'c' => Some((SEED_C, SEED_G)),
        b'G' | b'g' => Some((SEED_G, SEED_C)),
        b'T' | b't' => Some((SEED_T, SEED_A)),
        _ => None,
    }
}

pub struct NtHash<'a> {
    seq: &'a [u8],
    k: usize,
    fwd: u64,
    rev: u64,
    /// Start of the current window. Meaningful only once `started`.
    pos: usize,
    started: bool,
    hashes: Vec<u64>,
}

impl<'a> NtHash<'a> {
    pub fn new(seq: &'a [u8], hash_num: u32, k: u32) -> Self {
        NtHash {
            seq,
            k: k as usize,
            fwd: 0,
            rev: 0,
            pos: 0,
            started: false,
            hashes: vec![0; hash_num as usize],
        }
    }

    /// Advance to the next k-mer. Returns false once the sequence is
    /// exhausted. After a `true` return, `hashes()` holds the hash vector of
    /// the window at `pos()`.
    pub fn roll(&mut self) -> bool {
        if self.k == 0 || self.k > self.seq.len() {
            return false;
        }
        if !self.started {
            if !self.init_from(0) {
                return false;
            }
            self.started = true;
            self.derive();
            return true;
        }

        let incoming = self.pos + self.k;
        if incoming >= self.seq.len() {
            return false;
        }
        let out = self.seq[self.pos];
        match (seeds(self.seq[incoming]), seeds(out)) {
            (Some((seed_in, rc_in)), Some((seed_out, rc_out))) => {
                self.fwd =
                    self.fwd.rotate_left(1) ^ seed_out.rotate_left(self.k as u32) ^ seed_in;
                self.rev = self.rev.rotate_right(1)
                    ^ rc_out.rotate_right(1)
                    ^ rc_in.rotate_left(self.k as u32 - 1);
                self.pos += 1;
            }
            _ => {
                // The incoming base is invalid: no window may cover it.
                if !self.init_from(incoming + 1) {
                    return false;
                }
            }
        }
        self.derive();
        true
    }

    pub fn hashes(&self) -> &[u64] {
        &self.hashes
    }

    /// Window start of the k-mer produced by the last successful roll.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Find the first window at or after `start` free of non-ACGT bases and
    /// compute its strand hashes from scratch.
    fn init_from(&mut self, mut start: usize) -> bool {
        'search: loop {
            if start + self.k > self.seq.len() {
                return false;
            }
            let mut fwd = 0u64;
            let mut rev = 0u64;
            for j in 0..self.k {
                match seeds(self.seq[start + j]) {
                    Some((f, r)) => {
                        fwd ^= f.rotate_left((self.k - 1 - j) as u32);
                        rev ^= r.rotate_left(j as u32);
                    }
                    None => {
                        start += j + 1;
                        continue 'search;
                    }
                }
            }
            self.fwd = fwd;
            self.rev = rev;
            self.pos = start;
            return true;
        }
    }

    /// Fill the hash vector from the canonical strand hash. With a zero
    /// hash count the vector stays empty; the Bloom filters reject that
    /// configuration up front.
    fn derive(&mut self) {
        let canonical = self.fwd.min(self.rev);
        if let Some(first) = self.hashes.first_mut() {
            *first = canonical;
        }
        for i in 1..self.hashes.len() {
            let mut t =
                canonical.wrapping_mul(i as u64 ^ (self.k as u64).wrapping_mul(MULTI_SEED));
            t ^= t >> MULTI_SHIFT;
            self.hashes[i] = t;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_hashes(seq: &[u8], hash_num: u32, k: u32) -> Vec<(usize, Vec<u64>)> {
        let mut nth = NtHash::new(seq, hash_num, k);
        let mut out = Vec::new();
        while nth.roll() {
            out.push((nth.pos(), nth.hashes().to_vec()));
        }
        out
    }

    #[test]
    fn rolls_every_position() {
        let seq = b"ACGTACGTTGCA";
        let hashes = all_hashes(seq, 4, 5);
        assert_eq!(hashes.len(), seq.len() - 5 + 1);
        let positions: Vec<usize> = hashes.iter().map(|(p, _)| *p).collect();
        assert_eq!(positions, (0..=seq.len() - 5).collect::<Vec<_>>());
    }

    #[test]
    fn roll_matches_fresh_init() {
        // Rolling across the sequence must agree with hashing each window
        // independently.
        let seq = b"GATTACAGATTACACCGGTT";
        let k = 7;
        let rolled = all_hashes(seq, 3, k);
        for (pos, hashes) in rolled {
            let window = &seq[pos..pos + k as usize];
            let fresh = all_hashes(window, 3, k);
            assert_eq!(fresh.len(), 1);
            assert_eq!(fresh[0].1, hashes, "window at {}", pos);
        }
    }

    #[test]
    fn reverse_complement_hashes_equal() {
        let seq = b"ACCGTTAGCAT";
        let rc: Vec<u8> = seq
            .iter()
            .rev()
            .map(|b| match b {
                b'A' => b'T',
                b'C' => b'G',
                b'G' => b'C',
                b'T' => b'A',
                _ => unreachable!(),
            })
            .collect();
        let k = 6;
        let fwd = all_hashes(seq, 2, k);
        let mut rev = all_hashes(&rc, 2, k);
        rev.reverse();
        let fwd_vals: Vec<&Vec<u64>> = fwd.iter().map(|(_, h)| h).collect();
        let rev_vals: Vec<&Vec<u64>> = rev.iter().map(|(_, h)| h).collect();
        assert_eq!(fwd_vals, rev_vals);
    }

    #[test]
    fn skips_windows_with_invalid_bases() {
        let seq = b"ACGTNACGTA";
        let hashes = all_hashes(seq, 2, 4);
        // Valid windows: 0 (ACGT) and 5..=6 (ACGT, CGTA).
        let positions: Vec<usize> = hashes.iter().map(|(p, _)| *p).collect();
        assert_eq!(positions, vec![0, 5, 6]);
    }

    #[test]
    fn sequence_shorter_than_k() {
        assert!(all_hashes(b"ACG", 2, 4).is_empty());
        assert!(all_hashes(b"", 2, 4).is_empty());
    }

    #[test]
    fn distinct_kmers_distinct_hashes() {
        let a = all_hashes(b"AAAAA", 1, 5);
        let b = all_hashes(b"ACGTC", 1, 5);
        assert_ne!(a[0].1, b[0].1);
    }

    #[test]
    fn zero_hash_num_yields_empty_hash_vector() {
        let mut nth = NtHash::new(b"ACGTA", 0, 4);
        assert!(nth.roll());
        assert!(nth.hashes().is_empty());
    }
}
