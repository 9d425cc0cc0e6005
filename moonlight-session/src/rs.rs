//! Reed-Solomon erasure codec over GF(2^8), grounded in `nanors/rs.c`.
//!
//! The original keeps the field arithmetic (`axpy`/`scal`) as free functions
//! over raw byte buffers and builds a Cauchy-style generator matrix once per
//! `(data_shards, parity_shards)` shape; decoding inverts a square submatrix
//! of whichever shards survived. This keeps that structure but works over
//! owned `Vec<u8>` shards instead of raw pointers, per the "pure FEC kernels
//! behind a single lock" design note (the lock itself lives in the queues
//! that own a `ReedSolomon` instance, not here).

use std::sync::OnceLock;

const POLY: u16 = 0x11d;

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255usize {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= POLY;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        Tables { exp, log }
    })
}

/// `a * b` in GF(2^8).
pub fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = tables();
    let sum = t.log[a as usize] as usize + t.log[b as usize] as usize;
    t.exp[sum]
}

/// Multiplicative inverse of a nonzero element of GF(2^8).
pub fn gf_inv(a: u8) -> u8 {
    assert!(a != 0, "zero has no inverse in GF(2^8)");
    let t = tables();
    t.exp[255 - t.log[a as usize] as usize]
}

/// `a / b` in GF(2^8), `b` nonzero.
pub fn gf_div(a: u8, b: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    gf_mul(a, gf_inv(b))
}

/// `dst[i] ^= coeff * src[i]` for every byte. The GF(2^8) analogue of BLAS axpy.
pub fn axpy(dst: &mut [u8], src: &[u8], coeff: u8) {
    debug_assert_eq!(dst.len(), src.len());
    if coeff == 0 {
        return;
    }
    if coeff == 1 {
        for (d, s) in dst.iter_mut().zip(src) {
            *d ^= *s;
        }
        return;
    }
    let t = tables();
    let log_coeff = t.log[coeff as usize] as usize;
    for (d, s) in dst.iter_mut().zip(src) {
        if *s != 0 {
            *d ^= t.exp[log_coeff + t.log[*s as usize] as usize];
        }
    }
}

/// `buf[i] *= coeff` for every byte.
pub fn scal(buf: &mut [u8], coeff: u8) {
    if coeff == 1 {
        return;
    }
    if coeff == 0 {
        buf.fill(0);
        return;
    }
    let t = tables();
    let log_coeff = t.log[coeff as usize] as usize;
    for b in buf.iter_mut() {
        if *b != 0 {
            *b = t.exp[log_coeff + t.log[*b as usize] as usize];
        }
    }
}

type Matrix = Vec<Vec<u8>>;

fn invert(rows: &[Vec<u8>]) -> Option<Matrix> {
    let n = rows.len();
    let mut aug: Matrix = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut r = row.clone();
            r.resize(2 * n, 0);
            r[n + i] = 1;
            r
        })
        .collect();

    for col in 0..n {
        if aug[col][col] == 0 {
            let pivot = (col + 1..n).find(|&r| aug[r][col] != 0)?;
            aug.swap(col, pivot);
        }
        let inv = gf_inv(aug[col][col]);
        scal(&mut aug[col], inv);
        for row in 0..n {
            if row != col && aug[row][col] != 0 {
                let factor = aug[row][col];
                let pivot_row = aug[col].clone();
                axpy(&mut aug[row], &pivot_row, factor);
            }
        }
    }

    Some(aug.into_iter().map(|row| row[n..].to_vec()).collect())
}

#[derive(Debug)]
pub struct ShapeMismatch;

/// A fixed-shape `(data_shards, parity_shards)` Reed-Solomon coder.
///
/// `matrix` is `(data_shards + parity_shards) x data_shards`: the first
/// `data_shards` rows are the identity (each data shard is its own output),
/// the remaining `parity_shards` rows are a Cauchy-derived generator that
/// guarantees any `data_shards` rows of the full matrix are invertible.
pub struct ReedSolomon {
    data_shards: usize,
    parity_shards: usize,
    matrix: Matrix,
}

impl ReedSolomon {
    pub fn new(data_shards: usize, parity_shards: usize) -> Self {
        assert!(data_shards > 0 && parity_shards > 0);
        assert!(data_shards + parity_shards <= 255);

        let total = data_shards + parity_shards;
        let mut matrix = vec![vec![0u8; data_shards]; total];
        for i in 0..data_shards {
            matrix[i][i] = 1;
        }
        // Cauchy matrix: row i (parity), col j (data) -> 1 / ((data_shards + i) XOR j).
        // data_shards + i is always > j here, so the XOR is never zero.
        for i in 0..parity_shards {
            for j in 0..data_shards {
                let x = (data_shards + i) as u8 ^ j as u8;
                matrix[data_shards + i][j] = gf_inv(x);
            }
        }

        Self {
            data_shards,
            parity_shards,
            matrix,
        }
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Computes the parity shards for a full set of data shards (all equal length).
    pub fn encode(&self, data: &[&[u8]]) -> Result<Vec<Vec<u8>>, ShapeMismatch> {
        if data.len() != self.data_shards {
            return Err(ShapeMismatch);
        }
        let len = data[0].len();
        if data.iter().any(|d| d.len() != len) {
            return Err(ShapeMismatch);
        }

        let mut parity = vec![vec![0u8; len]; self.parity_shards];
        for (i, out) in parity.iter_mut().enumerate() {
            let row = &self.matrix[self.data_shards + i];
            for (j, shard) in data.iter().enumerate() {
                axpy(out, shard, row[j]);
            }
        }
        Ok(parity)
    }

    /// Reconstructs every shard given at least `data_shards` of the `total_shards` entries.
    ///
    /// `shards` has one slot per shard index (data shards first, then parity); `None` marks a
    /// missing shard. On success, every `Some` is left untouched and every previously-`None` data
    /// slot is filled in. Missing parity slots are left as `None` since callers never need them
    /// (the queues only ever reconstruct missing *data* shards).
    pub fn reconstruct_data(&self, shards: &mut [Option<Vec<u8>>]) -> Option<()> {
        if shards.len() != self.total_shards() {
            return None;
        }

        let present: Vec<usize> = (0..shards.len()).filter(|&i| shards[i].is_some()).collect();
        if present.len() < self.data_shards {
            return None;
        }

        if (0..self.data_shards).all(|i| shards[i].is_some()) {
            return Some(());
        }

        let chosen = &present[..self.data_shards];
        let shard_len = shards[chosen[0]].as_ref().unwrap().len();

        let sub_rows: Vec<Vec<u8>> = chosen.iter().map(|&i| self.matrix[i].clone()).collect();
        let inverse = invert(&sub_rows)?;

        let mut recovered = vec![vec![0u8; shard_len]; self.data_shards];
        for (out_idx, recovered_row) in recovered.iter_mut().enumerate() {
            for (k, &src_idx) in chosen.iter().enumerate() {
                let coeff = inverse[out_idx][k];
                let src = shards[src_idx].as_ref().unwrap();
                axpy(recovered_row, src, coeff);
            }
        }

        for (i, slot) in recovered.into_iter().enumerate() {
            if shards[i].is_none() {
                shards[i] = Some(slot);
            }
        }

        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gf_mul_and_inv_are_consistent() {
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1);
        }
    }

    #[test]
    fn axpy_with_identity_is_xor() {
        let mut dst = vec![0b1010u8, 0b0101];
        let src = vec![0b1111u8, 0b1111];
        axpy(&mut dst, &src, 1);
        assert_eq!(dst, vec![0b0101, 0b1010]);
    }

    #[test]
    fn rs_4_2_recovers_two_missing_data_shards() {
        let rs = ReedSolomon::new(4, 2);
        let data: Vec<Vec<u8>> = (0..4).map(|i| vec![i as u8 + 1; 8]).collect();
        let data_refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let parity = rs.encode(&data_refs).unwrap();

        let mut shards: Vec<Option<Vec<u8>>> = data
            .iter()
            .cloned()
            .map(Some)
            .chain(parity.iter().cloned().map(Some))
            .collect();

        // Lose two data shards; both parity shards survive.
        shards[1] = None;
        shards[3] = None;

        rs.reconstruct_data(&mut shards).expect("reconstruction must succeed");

        assert_eq!(shards[1].as_ref().unwrap(), &data[1]);
        assert_eq!(shards[3].as_ref().unwrap(), &data[3]);
    }

    #[test]
    fn rs_single_data_shard_with_surplus_parity() {
        // 1 data shard, 2 parity: a single-packet video frame with 200% FEC.
        let rs = ReedSolomon::new(1, 2);
        let data = vec![vec![0xABu8; 4]];
        let data_refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let parity = rs.encode(&data_refs).unwrap();

        let mut shards = vec![None, Some(parity[0].clone()), Some(parity[1].clone())];
        rs.reconstruct_data(&mut shards).expect("must recover from parity alone");
        assert_eq!(shards[0].as_ref().unwrap(), &data[0]);
    }

    #[test]
    fn reconstruct_fails_with_insufficient_shards() {
        let rs = ReedSolomon::new(4, 2);
        let mut shards: Vec<Option<Vec<u8>>> = vec![Some(vec![1; 4]), None, None, None, Some(vec![2; 4]), None];
        assert!(rs.reconstruct_data(&mut shards).is_none());
    }
}
