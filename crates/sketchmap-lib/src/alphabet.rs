//! Nucleotide alphabet: 3N conversion and 2-bit k-mer encoding.
//!
//! A "3N" conversion collapses one base into another before encoding
//! (e.g. C -> T for bisulfite-converted reads), so that converted reads
//! and converted references produce identical features. Encoding is
//! A, C, G, T -> 0, 1, 2, 3; every other character (N, IUPAC ambiguity
//! codes, gaps) invalidates the k-mer currently being assembled.

use crate::types::Feature;
use thiserror::Error;

/// Error type for alphabet configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlphabetError {
    /// A conversion pair referenced a character outside A/C/G/T
    #[error("invalid conversion pair: '{0}' -> '{1}' (bases must be A, C, G or T)")]
    InvalidConversion(char, char),
}

/// A nucleotide conversion: every `orig` is treated as `repl`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Conversion {
    /// Base to be replaced (uppercase)
    pub orig: u8,
    /// Replacement base (uppercase)
    pub repl: u8,
}

impl Default for Conversion {
    /// C -> T, the bisulfite-sequencing conversion
    fn default() -> Self {
        Self { orig: b'C', repl: b'T' }
    }
}

impl Conversion {
    /// Create a conversion from two characters, validating the alphabet
    pub fn new(orig: char, repl: char) -> Result<Self, AlphabetError> {
        let o = orig.to_ascii_uppercase() as u8;
        let r = repl.to_ascii_uppercase() as u8;
        if !matches!(o, b'A' | b'C' | b'G' | b'T') || !matches!(r, b'A' | b'C' | b'G' | b'T') {
            return Err(AlphabetError::InvalidConversion(orig, repl));
        }
        Ok(Self { orig: o, repl: r })
    }

    /// Apply the conversion to a single (case-insensitive) base
    #[inline]
    pub fn apply(&self, base: u8) -> u8 {
        let b = base.to_ascii_uppercase();
        if b == self.orig {
            self.repl
        } else {
            b
        }
    }
}

/// Encode a single uppercase DNA base to 2 bits; `None` for anything
/// that is not a plain A/C/G/T.
#[inline]
pub const fn encode_base(base: u8) -> Option<u8> {
    match base {
        b'A' => Some(0b00),
        b'C' => Some(0b01),
        b'G' => Some(0b10),
        b'T' => Some(0b11),
        _ => None,
    }
}

/// Decode a 2-bit value back to an uppercase DNA base
#[inline]
pub const fn decode_base(bits: u8) -> u8 {
    match bits & 0b11 {
        0b00 => b'A',
        0b01 => b'C',
        0b10 => b'G',
        _ => b'T',
    }
}

/// Rolling 2-bit k-mer encoder over a converted sequence.
///
/// Push bases one at a time; once `k` consecutive valid bases have been
/// seen, every further push yields the encoding of the k-mer ending at
/// that base. An invalid base resets the encoder, which then skips
/// until `k` valid bases are buffered again.
#[derive(Clone, Debug)]
pub struct KmerEncoder {
    k: usize,
    mask: Feature,
    value: Feature,
    filled: usize,
    conv: Conversion,
}

impl KmerEncoder {
    /// Create an encoder for k-mers of length `k` (1 ..= `max_kmer_len()`)
    pub fn new(k: usize, conv: Conversion) -> Self {
        debug_assert!(k >= 1 && k <= crate::constants::max_kmer_len());
        let bits = 2 * k;
        let mask = if bits >= Feature::BITS as usize {
            Feature::MAX
        } else {
            (1 << bits) - 1
        };
        Self { k, mask, value: 0, filled: 0, conv }
    }

    /// Forget all buffered bases
    pub fn reset(&mut self) {
        self.value = 0;
        self.filled = 0;
    }

    /// Feed one base; returns the encoded k-mer ending here, if complete.
    #[inline]
    pub fn push(&mut self, base: u8) -> Option<Feature> {
        match encode_base(self.conv.apply(base)) {
            Some(code) => {
                self.value = ((self.value << 2) | code as Feature) & self.mask;
                if self.filled < self.k {
                    self.filled += 1;
                }
                if self.filled == self.k {
                    Some(self.value)
                } else {
                    None
                }
            }
            None => {
                self.reset();
                None
            }
        }
    }
}
