//! FEC-AL - Forward Error Correction at the Application Layer
//!
//! A Rust port of the FEC-AL library by Christopher A. Taylor.
//!
//! FEC-AL protects a fixed block of `K` equal-sized original symbols with an
//! unbounded stream of recovery symbols, each a GF(2^8) linear combination
//! of the originals. A receiver holding any `K` distinct symbols (originals
//! and/or recovery) can reconstruct every missing original with about 99%
//! probability on the first attempt; one or two extra recovery symbols
//! almost always close the gap.
//!
//! Unlike an MDS code, recovery symbols are generated on demand from
//! precomputed lane sums, so producing one costs roughly the same whether
//! the block holds 10 originals or 10,000.
//!
//! # Example
//!
//! ```rust
//! use fecal::{Encoder, Decoder};
//!
//! let originals: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 16]).collect();
//! let slices: Vec<&[u8]> = originals.iter().map(|v| v.as_slice()).collect();
//! let total_bytes = 64;
//!
//! let mut encoder = Encoder::new(&slices, total_bytes).unwrap();
//! let mut recovery = vec![0u8; encoder.params().symbol_bytes()];
//! encoder.encode(0, &mut recovery).unwrap();
//!
//! // Column 2 never arrives; the recovery symbol stands in for it
//! let mut decoder = Decoder::new(4, total_bytes).unwrap();
//! decoder.add_original(0, &originals[0]).unwrap();
//! decoder.add_original(1, &originals[1]).unwrap();
//! decoder.add_original(3, &originals[3]).unwrap();
//! decoder.add_recovery(0, &recovery).unwrap();
//!
//! match decoder.decode() {
//!     Ok(recovered) => {
//!         assert_eq!(recovered, vec![2]);
//!         assert_eq!(decoder.get(2).unwrap(), &originals[2][..]);
//!     }
//!     Err(fecal::Error::NeedMoreData) => { /* add more symbols, retry */ }
//!     Err(e) => panic!("decode failed: {e}"),
//! }
//! ```

use std::fmt;

mod decoder;
mod encoder;
mod generator;
mod gf;
mod matrix;


pub use decoder::Decoder;
pub use encoder::Encoder;
pub use gf::Gf256;

/// Error type for FEC-AL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A parameter or buffer size was invalid
    InvalidInput,
    /// More symbols are needed before this operation can succeed; non-fatal
    NeedMoreData,
    /// An internal allocation failed; the codec should be discarded
    OutOfMemory,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidInput => write!(f, "invalid input"),
            Error::NeedMoreData => write!(f, "more data needed"),
            Error::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for Error {}

/// Block parameters shared by the encoder and decoder, derived once from
/// `(input_count, total_bytes)`.
///
/// All columns hold `symbol_bytes` bytes except the last, which holds
/// `final_bytes`. The split always satisfies
/// `symbol_bytes * (input_count - 1) + final_bytes == total_bytes` with
/// `1 <= final_bytes <= symbol_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    input_count: usize,
    total_bytes: u64,
    symbol_bytes: usize,
    final_bytes: usize,
}

impl Params {
    /// Derive block parameters.
    ///
    /// Requires `1 <= input_count` and `total_bytes >= input_count` (every
    /// column carries at least one byte).
    pub fn new(input_count: usize, total_bytes: u64) -> Result<Params, Error> {
        if input_count < 1 || input_count > u32::MAX as usize {
            return Err(Error::InvalidInput);
        }
        if total_bytes < input_count as u64 {
            return Err(Error::InvalidInput);
        }

        let count = input_count as u64;
        let symbol_bytes = ((total_bytes + count - 1) / count) as usize;
        let mut final_bytes = (total_bytes % symbol_bytes as u64) as usize;
        if final_bytes == 0 {
            final_bytes = symbol_bytes;
        }
        debug_assert!(symbol_bytes >= final_bytes && final_bytes >= 1);

        Ok(Params {
            input_count,
            total_bytes,
            symbol_bytes,
            final_bytes,
        })
    }

    /// Number of original symbols in the block.
    #[inline]
    pub fn input_count(&self) -> usize {
        self.input_count
    }

    /// Total bytes across all original symbols.
    #[inline]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes per symbol; also the size of every recovery symbol.
    #[inline]
    pub fn symbol_bytes(&self) -> usize {
        self.symbol_bytes
    }

    /// Bytes in the final column.
    #[inline]
    pub fn final_bytes(&self) -> usize {
        self.final_bytes
    }

    #[inline]
    pub fn is_final_column(&self, column: usize) -> bool {
        column == self.input_count - 1
    }

    /// Bytes in the given column.
    #[inline]
    pub fn column_bytes(&self, column: usize) -> usize {
        if self.is_final_column(column) {
            self.final_bytes
        } else {
            self.symbol_bytes
        }
    }
}

#[cfg(test)]
mod params_tests {
    use super::*;

    #[test]
    fn test_params_split_invariant() {
        // total_bytes = input_count * symbol - shortfall, shortfall < symbol:
        // the shapes an application can actually hand over as buffers
        for input_count in [1usize, 2, 3, 10, 64, 65, 200] {
            for symbol in [1usize, 5, 16, 64, 1300] {
                for shortfall in [0usize, 1, symbol / 2, symbol.saturating_sub(1)] {
                    if shortfall >= symbol {
                        continue;
                    }
                    let total_bytes = (input_count * symbol - shortfall) as u64;
                    if total_bytes < input_count as u64 {
                        continue;
                    }

                    let params = Params::new(input_count, total_bytes).unwrap();
                    assert_eq!(
                        params.symbol_bytes() as u64 * (input_count as u64 - 1)
                            + params.final_bytes() as u64,
                        total_bytes
                    );
                    assert!(params.final_bytes() >= 1);
                    assert!(params.final_bytes() <= params.symbol_bytes());
                }
            }
        }
    }

    #[test]
    fn test_params_single_column() {
        let params = Params::new(1, 1000).unwrap();
        assert_eq!(params.symbol_bytes(), 1000);
        assert_eq!(params.final_bytes(), 1000);
        assert!(params.is_final_column(0));
    }

    #[test]
    fn test_params_rejects_invalid() {
        assert!(Params::new(0, 100).is_err());
        assert!(Params::new(10, 9).is_err());
        assert!(Params::new(10, 0).is_err());
    }

    #[test]
    fn test_column_bytes() {
        // 10 columns, 95 bytes: nine columns of 10 and a final of 5
        let params = Params::new(10, 95).unwrap();
        assert_eq!(params.symbol_bytes(), 10);
        assert_eq!(params.final_bytes(), 5);
        assert_eq!(params.column_bytes(0), 10);
        assert_eq!(params.column_bytes(8), 10);
        assert_eq!(params.column_bytes(9), 5);
    }
}
