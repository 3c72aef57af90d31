/*! Reed-Solomon codec over GF(256).

Shared by the FX.25 and IL2P envelopes. The Galois field is defined by
the reducing polynomial x^8+x^4+x^3+x^2+1 (0x11d), generator element 2,
first consecutive root 1. Systematic encoding: the codeword is the data
followed by `nroots` parity symbols, correcting up to `nroots/2` symbol
errors.

Decoding is the usual chain: syndromes, Berlekamp-Massey for the error
locator, Chien search for its roots, Forney for the magnitudes, and a
final syndrome re-check so a mis-correction can't slip out as success.
 */
use std::sync::OnceLock;

use crate::{Error, Result};

const GF_POLY: u16 = 0x11d;

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
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= GF_POLY;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        Tables { exp, log }
    })
}

impl Tables {
    fn mul(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        self.exp[self.log[a as usize] as usize + self.log[b as usize] as usize]
    }

    fn div(&self, a: u8, b: u8) -> u8 {
        debug_assert_ne!(b, 0);
        if a == 0 {
            return 0;
        }
        let d = 255 + self.log[a as usize] as usize - self.log[b as usize] as usize;
        self.exp[d % 255]
    }

    /// alpha^n for n possibly >= 255.
    fn alpha(&self, n: usize) -> u8 {
        self.exp[n % 255]
    }
}

/// A Reed-Solomon code with a given number of parity symbols.
pub struct ReedSolomon {
    nroots: usize,
    fcr: usize,
    /// Generator polynomial, ascending powers, leading coefficient 1.
    genpoly: Vec<u8>,
}

impl ReedSolomon {
    /// Create a code with `nroots` parity symbols (max correctable
    /// errors is `nroots / 2`).
    #[must_use]
    pub fn new(nroots: usize) -> Self {
        assert!(nroots > 0 && nroots < 255);
        let gf = tables();
        let fcr = 1;
        let mut g = vec![1u8];
        for i in 0..nroots {
            let root = gf.alpha(fcr + i);
            let mut ng = vec![0u8; g.len() + 1];
            for (j, &c) in g.iter().enumerate() {
                ng[j] ^= gf.mul(c, root);
                ng[j + 1] ^= c;
            }
            g = ng;
        }
        Self {
            nroots,
            fcr,
            genpoly: g,
        }
    }

    /// Number of parity symbols.
    #[must_use]
    pub fn nroots(&self) -> usize {
        self.nroots
    }

    /// Parity symbols for a data block. `data.len() + nroots` must not
    /// exceed 255.
    #[must_use]
    pub fn parity(&self, data: &[u8]) -> Vec<u8> {
        assert!(data.len() + self.nroots <= 255);
        let gf = tables();
        let mut par = vec![0u8; self.nroots];
        for &d in data {
            let fb = d ^ par[0];
            par.rotate_left(1);
            par[self.nroots - 1] = 0;
            if fb != 0 {
                for (j, p) in par.iter_mut().enumerate() {
                    *p ^= gf.mul(fb, self.genpoly[self.nroots - 1 - j]);
                }
            }
        }
        par
    }

    /// Systematic encode: data followed by parity.
    #[must_use]
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        out.extend(self.parity(data));
        out
    }

    fn syndromes(&self, cw: &[u8]) -> Vec<u8> {
        let gf = tables();
        (0..self.nroots)
            .map(|j| {
                let a = gf.alpha(self.fcr + j);
                cw.iter().fold(0u8, |s, &c| gf.mul(s, a) ^ c)
            })
            .collect()
    }

    /// Correct a codeword in place. Returns the number of symbol errors
    /// corrected, or an error when the block is uncorrectable.
    pub fn decode(&self, cw: &mut [u8]) -> Result<usize> {
        let gf = tables();
        let nn = cw.len();
        let s = self.syndromes(cw);
        if s.iter().all(|&x| x == 0) {
            return Ok(0);
        }

        // Berlekamp-Massey.
        let mut c = vec![0u8; self.nroots + 1];
        let mut b = vec![0u8; self.nroots + 1];
        c[0] = 1;
        b[0] = 1;
        let mut l = 0usize;
        let mut m = 1usize;
        let mut bb = 1u8;
        for n in 0..self.nroots {
            let mut d = s[n];
            for i in 1..=l {
                d ^= gf.mul(c[i], s[n - i]);
            }
            if d == 0 {
                m += 1;
            } else if 2 * l <= n {
                let t = c.clone();
                let coef = gf.div(d, bb);
                for i in 0..=self.nroots - m {
                    c[i + m] ^= gf.mul(coef, b[i]);
                }
                l = n + 1 - l;
                b = t;
                bb = d;
                m = 1;
            } else {
                let coef = gf.div(d, bb);
                for i in 0..=self.nroots - m {
                    c[i + m] ^= gf.mul(coef, b[i]);
                }
                m += 1;
            }
        }

        // Chien search: error at degree l when sigma(alpha^-l) == 0.
        let mut errpos = Vec::new();
        for loc in 0..nn {
            let xinv = gf.alpha(255 - (loc % 255));
            let mut v = 0u8;
            let mut xp = 1u8;
            for &ci in c.iter().take(l + 1) {
                v ^= gf.mul(ci, xp);
                xp = gf.mul(xp, xinv);
            }
            if v == 0 {
                errpos.push(loc);
            }
        }
        if errpos.len() != l {
            return Err(Error::Fec(format!(
                "locator degree {l} but {} roots",
                errpos.len()
            )));
        }

        // Forney. omega = s * c mod x^nroots.
        let mut omega = vec![0u8; self.nroots];
        for (i, o) in omega.iter_mut().enumerate() {
            let mut v = 0u8;
            for j in 0..=i {
                v ^= gf.mul(c[j], s[i - j]);
            }
            *o = v;
        }
        for &loc in &errpos {
            let xinv = gf.alpha(255 - (loc % 255));
            let mut num = 0u8;
            let mut xp = 1u8;
            for &o in &omega {
                num ^= gf.mul(o, xp);
                xp = gf.mul(xp, xinv);
            }
            let mut den = 0u8;
            let mut i = 1;
            while i <= l {
                // Derivative keeps only odd terms of sigma.
                let mut xp = 1u8;
                for _ in 0..i - 1 {
                    xp = gf.mul(xp, xinv);
                }
                den ^= gf.mul(c[i], xp);
                i += 2;
            }
            if den == 0 {
                return Err(Error::Fec("zero derivative in Forney".into()));
            }
            cw[nn - 1 - loc] ^= gf.div(num, den);
        }

        if self.syndromes(cw).iter().any(|&x| x != 0) {
            return Err(Error::Fec("residual syndrome after correction".into()));
        }
        Ok(errpos.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_codeword_decodes_to_zero_errors() -> Result<()> {
        let rs = ReedSolomon::new(16);
        let data: Vec<u8> = (0..100u8).collect();
        let mut cw = rs.encode(&data);
        assert_eq!(cw.len(), 116);
        assert_eq!(rs.decode(&mut cw)?, 0);
        assert_eq!(&cw[..100], &data[..]);
        Ok(())
    }

    #[test]
    fn corrects_up_to_capacity() -> Result<()> {
        let rs = ReedSolomon::new(16);
        let data: Vec<u8> = (0..120).map(|i| (i * 13 + 5) as u8).collect();
        let clean = rs.encode(&data);
        for nerr in 1..=8 {
            let mut cw = clean.clone();
            for e in 0..nerr {
                // Spread errors over data and parity.
                cw[e * 15 + 2] ^= (e + 1) as u8;
            }
            let fixed = rs.decode(&mut cw)?;
            assert_eq!(fixed, nerr, "nerr={nerr}");
            assert_eq!(cw, clean);
        }
        Ok(())
    }

    #[test]
    fn fails_beyond_capacity() {
        let rs = ReedSolomon::new(4);
        let data: Vec<u8> = (0..50u8).collect();
        let clean = rs.encode(&data);
        let mut cw = clean.clone();
        for e in 0..5 {
            cw[e * 9 + 1] ^= 0x5a;
        }
        // Either detected as uncorrectable, or "corrected" to something
        // that is not the original. Never the original.
        match rs.decode(&mut cw) {
            Err(_) => {}
            Ok(_) => assert_ne!(cw, clean),
        }
    }

    #[test]
    fn parity_count_parameterized() {
        for nroots in [2usize, 16, 32, 64] {
            let rs = ReedSolomon::new(nroots);
            let data = vec![0xa5u8; 64];
            assert_eq!(rs.encode(&data).len(), 64 + nroots);
        }
    }

    #[test]
    fn errors_in_parity_also_corrected() -> Result<()> {
        let rs = ReedSolomon::new(16);
        let data = b"The quick brown fox jumps over the lazy dog".to_vec();
        let clean = rs.encode(&data);
        let mut cw = clean.clone();
        let n = cw.len();
        cw[n - 1] ^= 0xff;
        cw[n - 7] ^= 0x01;
        assert_eq!(rs.decode(&mut cw)?, 2);
        assert_eq!(cw, clean);
        Ok(())
    }

    #[test]
    fn two_parity_symbols_fix_one_error() -> Result<()> {
        // The small code used for the IL2P header.
        let rs = ReedSolomon::new(2);
        let data = vec![1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];
        let clean = rs.encode(&data);
        assert_eq!(clean.len(), 15);
        let mut cw = clean.clone();
        cw[4] ^= 0x42;
        assert_eq!(rs.decode(&mut cw)?, 1);
        assert_eq!(cw, clean);
        Ok(())
    }
}
