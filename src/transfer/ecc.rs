//! Reed-Solomon GF(2^8) forward error correction (4.6.3).
//!
//! No crate in this stack performs blind, position-unknown symbol error
//! correction (the available `reed-solomon-erasure` crate only recovers
//! shards at already-known-missing positions), so this is a hand-rolled
//! classical syndrome-decoder: generator 2, primitive polynomial 0x11D,
//! Berlekamp-Massey error location, Forney error-value correction.

use std::sync::OnceLock;

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

type Blake2b128 = Blake2b<U16>;

const PRIMITIVE_POLY: u16 = 0x11D;
const GENERATOR: u8 = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EccConfig {
    pub data_block_size: usize,
    pub ecc_symbols: usize,
}

impl EccConfig {
    pub fn validate(&self) -> Result<()> {
        if self.data_block_size + self.ecc_symbols > 255 {
            return Err(Error::validation("ecc data_block_size + ecc_symbols must be <= 255"));
        }
        if !(2..=128).contains(&self.ecc_symbols) {
            return Err(Error::validation("ecc_symbols must be in [2, 128]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EccBlock {
    pub block_id: usize,
    pub original: Vec<u8>,
    pub encoded: Vec<u8>,
    pub checksum: [u8; 16],
    pub ecc_symbols: usize,
}

impl EccBlock {
    pub fn encode(block_id: usize, original: Vec<u8>, config: &EccConfig) -> Result<Self> {
        config.validate()?;
        if original.len() > config.data_block_size {
            return Err(Error::validation("ecc data block exceeds configured block size"));
        }
        let checksum = checksum128(&original);
        let encoded = rs_encode(&original, config.ecc_symbols);
        Ok(Self { block_id, original, encoded, checksum, ecc_symbols: config.ecc_symbols })
    }

    /// Attempt recovery from `received` (a possibly-corrupted copy of
    /// `encoded`), correcting up to `ecc_symbols / 2` symbol errors and
    /// verifying the recovered bytes against the stored checksum. Returns
    /// the recovered original bytes, or an error when the block is beyond
    /// recovery.
    pub fn recover(&self, received: &[u8]) -> Result<Vec<u8>> {
        let recovered = rs_decode(received, self.ecc_symbols)
            .map_err(|_| Error::transfer("reed-solomon recovery failed: too many symbol errors"))?;
        if checksum128(&recovered) != self.checksum {
            return Err(Error::transfer("reed-solomon recovery produced a checksum mismatch"));
        }
        Ok(recovered)
    }
}

fn checksum128(data: &[u8]) -> [u8; 16] {
    let mut hasher = Blake2b128::new();
    hasher.update(data);
    hasher.finalize().into()
}

struct GfTables {
    exp: [u8; 512],
    log: [u8; 256],
}

static GF_TABLES: OnceLock<GfTables> = OnceLock::new();

fn tables() -> &'static GfTables {
    GF_TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255usize {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= PRIMITIVE_POLY;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        GfTables { exp, log }
    })
}

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = tables();
    let sum = t.log[a as usize] as usize + t.log[b as usize] as usize;
    t.exp[sum]
}

fn gf_pow(base: u8, power: i32) -> u8 {
    if base == 0 {
        return if power == 0 { 1 } else { 0 };
    }
    let t = tables();
    let log_base = t.log[base as usize] as i64;
    let mut e = (log_base * power as i64).rem_euclid(255);
    if e < 0 {
        e += 255;
    }
    t.exp[e as usize]
}

fn gf_inverse(a: u8) -> u8 {
    gf_pow(a, -1)
}

fn gf_div(a: u8, b: u8) -> u8 {
    if a == 0 {
        0
    } else {
        gf_mul(a, gf_inverse(b))
    }
}

fn gf_poly_eval(poly: &[u8], x: u8) -> u8 {
    let mut y = poly[0];
    for &coef in &poly[1..] {
        y = gf_mul(y, x) ^ coef;
    }
    y
}

fn gf_poly_mul(p: &[u8], q: &[u8]) -> Vec<u8> {
    let mut r = vec![0u8; p.len() + q.len() - 1];
    for (j, &qj) in q.iter().enumerate() {
        if qj == 0 {
            continue;
        }
        for (i, &pi) in p.iter().enumerate() {
            r[i + j] ^= gf_mul(pi, qj);
        }
    }
    r
}

fn gf_poly_add(p: &[u8], q: &[u8]) -> Vec<u8> {
    let len = p.len().max(q.len());
    let mut r = vec![0u8; len];
    for (i, &pi) in p.iter().enumerate() {
        r[i + len - p.len()] = pi;
    }
    for (i, &qi) in q.iter().enumerate() {
        r[i + len - q.len()] ^= qi;
    }
    r
}

fn gf_poly_scale(p: &[u8], x: u8) -> Vec<u8> {
    p.iter().map(|&c| gf_mul(c, x)).collect()
}

fn gf_poly_div(dividend: &[u8], divisor: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut out = dividend.to_vec();
    for i in 0..=(dividend.len().saturating_sub(divisor.len())) {
        let coef = out[i];
        if coef != 0 {
            for (j, &dv) in divisor.iter().enumerate().skip(1) {
                if dv != 0 {
                    out[i + j] ^= gf_mul(dv, coef);
                }
            }
        }
    }
    let separator = dividend.len() - (divisor.len() - 1);
    let quotient = out[..separator].to_vec();
    let remainder = out[separator..].to_vec();
    (quotient, remainder)
}

fn rs_generator_poly(nsym: usize) -> Vec<u8> {
    let mut g = vec![1u8];
    for i in 0..nsym {
        g = gf_poly_mul(&g, &[1, gf_pow(GENERATOR, i as i32)]);
    }
    g
}

/// Systematic encode: returns `data` followed by `nsym` parity symbols.
fn rs_encode(data: &[u8], nsym: usize) -> Vec<u8> {
    let gen = rs_generator_poly(nsym);
    let mut msg_out = data.to_vec();
    msg_out.extend(std::iter::repeat(0u8).take(nsym));
    for i in 0..data.len() {
        let coef = msg_out[i];
        if coef != 0 {
            for (j, &g) in gen.iter().enumerate() {
                msg_out[i + j] ^= gf_mul(g, coef);
            }
        }
    }
    let parity = msg_out[data.len()..].to_vec();
    let mut codeword = data.to_vec();
    codeword.extend(parity);
    codeword
}

fn rs_calc_syndromes(msg: &[u8], nsym: usize) -> Vec<u8> {
    let mut synd = vec![0u8; nsym + 1];
    for i in 0..nsym {
        synd[i + 1] = gf_poly_eval(msg, gf_pow(GENERATOR, i as i32));
    }
    synd
}

fn rs_find_error_locator(synd: &[u8], nsym: usize) -> std::result::Result<Vec<u8>, ()> {
    let mut err_loc = vec![1u8];
    let mut old_loc = vec![1u8];
    for i in 0..nsym {
        let k = i + 1;
        let mut delta = synd[k];
        for j in 1..err_loc.len() {
            delta ^= gf_mul(err_loc[err_loc.len() - 1 - j], synd[k - j]);
        }
        old_loc.push(0);
        if delta != 0 {
            if old_loc.len() > err_loc.len() {
                let new_loc = gf_poly_scale(&old_loc, delta);
                old_loc = gf_poly_scale(&err_loc, gf_inverse(delta));
                err_loc = new_loc;
            }
            err_loc = gf_poly_add(&err_loc, &gf_poly_scale(&old_loc, delta));
        }
    }
    let first_nonzero = err_loc.iter().position(|&x| x != 0).unwrap_or(err_loc.len());
    let err_loc = err_loc[first_nonzero..].to_vec();
    let errs = err_loc.len().saturating_sub(1);
    if errs * 2 > nsym {
        return Err(());
    }
    Ok(err_loc)
}

fn rs_find_errors(err_loc: &[u8], nmess: usize) -> Option<Vec<usize>> {
    let errs = err_loc.len().saturating_sub(1);
    let mut err_pos = Vec::new();
    for i in 0..nmess {
        if gf_poly_eval(err_loc, gf_pow(GENERATOR, i as i32)) == 0 {
            err_pos.push(nmess - 1 - i);
        }
    }
    if err_pos.len() != errs {
        return None;
    }
    Some(err_pos)
}

fn rs_find_errata_locator(coef_pos: &[usize]) -> Vec<u8> {
    let mut e_loc = vec![1u8];
    for &i in coef_pos {
        let term = gf_poly_add(&[1], &[gf_pow(GENERATOR, i as i32), 0]);
        e_loc = gf_poly_mul(&e_loc, &term);
    }
    e_loc
}

fn rs_find_error_evaluator(synd: &[u8], err_loc: &[u8], nsym: usize) -> Vec<u8> {
    let product = gf_poly_mul(synd, err_loc);
    let mut divisor = vec![0u8; nsym + 2];
    divisor[0] = 1;
    let (_, remainder) = gf_poly_div(&product, &divisor);
    remainder
}

fn rs_correct_errata(msg: &[u8], synd: &[u8], err_pos: &[usize]) -> Option<Vec<u8>> {
    let coef_pos: Vec<usize> = err_pos.iter().map(|&p| msg.len() - 1 - p).collect();
    let err_loc = rs_find_errata_locator(&coef_pos);

    let mut synd_rev = synd.to_vec();
    synd_rev.reverse();
    let mut err_eval_rev = rs_find_error_evaluator(&synd_rev, &err_loc, err_loc.len() - 1);
    err_eval_rev.reverse();
    let err_eval = err_eval_rev;

    let x: Vec<u8> = coef_pos.iter().map(|&cp| gf_pow(GENERATOR, 255 - cp as i32)).collect();

    let mut e = vec![0u8; msg.len()];
    for (i, &xi) in x.iter().enumerate() {
        let xi_inv = gf_inverse(xi);
        let mut err_loc_prime = 1u8;
        for (j, &xj) in x.iter().enumerate() {
            if j != i {
                err_loc_prime = gf_mul(err_loc_prime, 1 ^ gf_mul(xi_inv, xj));
            }
        }
        if err_loc_prime == 0 {
            return None;
        }
        let mut err_eval_rev2 = err_eval.clone();
        err_eval_rev2.reverse();
        let y = gf_mul(xi, gf_poly_eval(&err_eval_rev2, xi_inv));
        e[err_pos[i]] = gf_div(y, err_loc_prime);
    }
    Some(gf_poly_add(msg, &e))
}

/// Decode a received codeword of `data_len + nsym` bytes, correcting up to
/// `nsym / 2` symbol errors at unknown positions, and return the recovered
/// `data_len`-byte payload.
fn rs_decode(received: &[u8], nsym: usize) -> std::result::Result<Vec<u8>, ()> {
    if nsym == 0 {
        return Ok(received.to_vec());
    }
    let synd = rs_calc_syndromes(received, nsym);
    if synd[1..].iter().all(|&s| s == 0) {
        return Ok(received[..received.len() - nsym].to_vec());
    }

    let err_loc = rs_find_error_locator(&synd, nsym)?;
    let err_pos = rs_find_errors(&err_loc, received.len()).ok_or(())?;
    let corrected = rs_correct_errata(received, &synd, &err_pos).ok_or(())?;

    let post = rs_calc_syndromes(&corrected, nsym);
    if !post[1..].iter().all(|&s| s == 0) {
        return Err(());
    }
    Ok(corrected[..corrected.len() - nsym].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EccConfig {
        EccConfig { data_block_size: 32, ecc_symbols: 10 }
    }

    #[test]
    fn property_9_recovery_of_unmodified_block_is_identity() {
        let cfg = config();
        let data = b"the quick brown fox jumps over".to_vec();
        let block = EccBlock::encode(0, data.clone(), &cfg).unwrap();
        assert_eq!(block.recover(&block.encoded).unwrap(), data);
    }

    #[test]
    fn property_9_recovers_up_to_half_ecc_symbol_errors() {
        let cfg = config();
        let data = b"0123456789abcdefghijklmnopqrstu".to_vec();
        let block = EccBlock::encode(1, data.clone(), &cfg).unwrap();

        let max_correctable = cfg.ecc_symbols / 2;
        let mut corrupted = block.encoded.clone();
        for i in 0..max_correctable {
            corrupted[i] ^= 0xFF;
        }
        assert_eq!(block.recover(&corrupted).unwrap(), data);
    }

    #[test]
    fn property_9_fails_cleanly_beyond_correction_capacity() {
        let cfg = config();
        let data = b"0123456789abcdefghijklmnopqrstu".to_vec();
        let block = EccBlock::encode(2, data, &cfg).unwrap();

        let too_many = cfg.ecc_symbols / 2 + 2;
        let mut corrupted = block.encoded.clone();
        for i in 0..too_many {
            corrupted[i] ^= 0xFF;
        }
        assert!(block.recover(&corrupted).is_err());
    }

    #[test]
    fn config_rejects_oversized_blocks() {
        let cfg = EccConfig { data_block_size: 250, ecc_symbols: 10 };
        assert!(cfg.validate().is_err());
    }
}
