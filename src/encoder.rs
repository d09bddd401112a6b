//! Encoder: precomputed lane sums plus per-row combination.
//!
//! Construction partitions the originals by `column % 8` and builds three
//! running sums per lane (parity, CX-weighted, CX^2-weighted). Producing a
//! recovery symbol then costs a handful of whole-symbol operations
//! regardless of how many originals are protected: a few pseudo-random
//! pair additions, the opcode-selected lane sums, and one multiply-add of
//! the product channel by the row multiplier.

use crate::generator::{
    column_value, pair_count, row_opcode, row_value, PcgRandom, LANE_COUNT, SUM_COUNT,
};
use crate::gf;
use crate::gf::XorSummer;
use crate::{Error, Params};

/// Copy a column into a full-width symbol buffer, zero-extending the tail
/// when the column is the short final one.
#[inline]
fn load_symbol(dst: &mut [u8], src: &[u8]) {
    dst[..src.len()].copy_from_slice(src);
    dst[src.len()..].fill(0);
}

/// Produces recovery symbols for a fixed block of original data.
///
/// The original buffers are borrowed for the life of the encoder and are
/// only read. Symbol `row` may be any `u32`; the stream of recovery symbols
/// is unbounded.
pub struct Encoder<'a> {
    params: Params,
    originals: Vec<&'a [u8]>,
    lane_sums: [[Vec<u8>; SUM_COUNT]; LANE_COUNT],
    product: Vec<u8>,
}

impl<'a> Encoder<'a> {
    /// Create an encoder over `input_data` totalling `total_bytes`.
    ///
    /// Every slice must be `params.symbol_bytes()` long except the last,
    /// which must be `params.final_bytes()` long.
    pub fn new(input_data: &[&'a [u8]], total_bytes: u64) -> Result<Encoder<'a>, Error> {
        let params = Params::new(input_data.len(), total_bytes)?;
        for (column, data) in input_data.iter().enumerate() {
            if data.len() != params.column_bytes(column) {
                return Err(Error::InvalidInput);
            }
        }

        let symbol_bytes = params.symbol_bytes();
        let input_count = params.input_count();
        let final_column = input_count - 1;

        let mut lane_sums: [[Vec<u8>; SUM_COUNT]; LANE_COUNT] =
            std::array::from_fn(|_| std::array::from_fn(|_| vec![0u8; symbol_bytes]));

        // Sum 0 per lane: parity of the lane's columns, folded in pairs.
        // The final column joins separately at its own length.
        for (lane, sums) in lane_sums.iter_mut().enumerate() {
            let mut summer = XorSummer::new(&mut sums[0]);
            let mut column = lane;
            while column < final_column {
                summer.add(input_data[column]);
                column += LANE_COUNT;
            }
            summer.finalize();

            if final_column % LANE_COUNT == lane {
                let final_data = input_data[final_column];
                gf::xor_mem(&mut sums[0][..final_data.len()], final_data);
            }
        }

        // Sums 1 and 2 per lane: CX- and CX^2-weighted.
        for (column, data) in input_data.iter().enumerate() {
            let lane = column % LANE_COUNT;
            let bytes = params.column_bytes(column);
            let cx = column_value(column);
            let cx2 = gf::sqr(cx);

            gf::muladd_mem(&mut lane_sums[lane][1][..bytes], cx, data);
            gf::muladd_mem(&mut lane_sums[lane][2][..bytes], cx2, data);
        }

        Ok(Encoder {
            params,
            originals: input_data.to_vec(),
            lane_sums,
            product: vec![0u8; symbol_bytes],
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Write recovery symbol `row` into `output`.
    ///
    /// `output` must be exactly `params().symbol_bytes()` long.
    pub fn encode(&mut self, row: u32, output: &mut [u8]) -> Result<(), Error> {
        let symbol_bytes = self.params.symbol_bytes();
        if output.len() != symbol_bytes {
            return Err(Error::InvalidInput);
        }

        let input_count = self.params.input_count();
        let final_column = input_count - 1;
        let final_bytes = self.params.final_bytes();

        let Encoder {
            originals,
            lane_sums,
            product,
            ..
        } = self;

        let mut prng = PcgRandom::seed(row as u64, input_count as u64);
        let pairs = pair_count(input_count);

        // First pair initializes both channels instead of XORing into them.
        {
            let element1 = (prng.next_u32() % input_count as u32) as usize;
            load_symbol(output, originals[element1]);

            let element_rx = (prng.next_u32() % input_count as u32) as usize;
            load_symbol(product, originals[element_rx]);
        }

        let mut sum = XorSummer::new(output);
        let mut prod = XorSummer::new(product);

        for _ in 1..pairs {
            let element1 = (prng.next_u32() % input_count as u32) as usize;
            if element1 == final_column {
                sum.add_now(originals[element1], final_bytes);
            } else {
                sum.add(originals[element1]);
            }

            let element_rx = (prng.next_u32() % input_count as u32) as usize;
            if element_rx == final_column {
                prod.add_now(originals[element_rx], final_bytes);
            } else {
                prod.add(originals[element_rx]);
            }
        }

        // Fold in the opcode-selected lane sums.
        for (lane, sums) in lane_sums.iter().enumerate() {
            let opcode = row_opcode(lane, row);

            let mut mask = 1u32;
            for sum_data in sums.iter().take(SUM_COUNT) {
                if opcode & mask != 0 {
                    sum.add(sum_data);
                }
                mask <<= 1;
            }
            for sum_data in sums.iter().take(SUM_COUNT) {
                if opcode & mask != 0 {
                    prod.add(sum_data);
                }
                mask <<= 1;
            }
        }

        sum.finalize();
        prod.finalize();

        // Sum += RX * Product
        gf::muladd_mem(output, row_value(row), product);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::PAIR_ADD_RATE;

    fn make_data(input_count: usize, total_bytes: u64, seed: u64) -> Vec<Vec<u8>> {
        let params = Params::new(input_count, total_bytes).unwrap();
        let mut prng = PcgRandom::seed(seed, total_bytes);
        (0..input_count)
            .map(|column| {
                (0..params.column_bytes(column))
                    .map(|_| prng.next_u32() as u8)
                    .collect()
            })
            .collect()
    }

    /// Recomputes the generator coefficient for (row, column) from the
    /// matrix-build rule: the dense opcode part plus the sparse pair part.
    fn coefficient(row: u32, column: usize, input_count: usize) -> u8 {
        let cx = column_value(column);
        let cx2 = gf::sqr(cx);
        let rx = row_value(row);
        let opcode = row_opcode(column % LANE_COUNT, row);

        let mut value = (opcode & 1) as u8;
        if opcode & 2 != 0 {
            value ^= cx;
        }
        if opcode & 4 != 0 {
            value ^= cx2;
        }
        if opcode & 8 != 0 {
            value ^= rx;
        }
        if opcode & 16 != 0 {
            value ^= gf::mul(cx, rx);
        }
        if opcode & 32 != 0 {
            value ^= gf::mul(cx2, rx);
        }

        let mut prng = PcgRandom::seed(row as u64, input_count as u64);
        for _ in 0..pair_count(input_count) {
            let element1 = (prng.next_u32() % input_count as u32) as usize;
            if element1 == column {
                value ^= 1;
            }
            let element_rx = (prng.next_u32() % input_count as u32) as usize;
            if element_rx == column {
                value ^= rx;
            }
        }

        value
    }

    /// Recovery symbols must be exactly the coefficient-weighted XOR of the
    /// originals, byte for byte, with the final column zero-extended.
    #[test]
    fn test_encode_matches_coefficient_function() {
        // A short final column and more columns than one pair covers
        let input_count = 2 * PAIR_ADD_RATE + 3;
        let total_bytes = (input_count as u64) * 24 - 11;
        let data = make_data(input_count, total_bytes, 0xfe0);
        let slices: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();

        let mut encoder = Encoder::new(&slices, total_bytes).unwrap();
        let symbol_bytes = encoder.params().symbol_bytes();

        for row in [0u32, 1, 2, 17, 255, 256, 1000] {
            let mut output = vec![0u8; symbol_bytes];
            encoder.encode(row, &mut output).unwrap();

            let mut expected = vec![0u8; symbol_bytes];
            for (column, original) in data.iter().enumerate() {
                let alpha = coefficient(row, column, input_count);
                let mut padded = vec![0u8; symbol_bytes];
                padded[..original.len()].copy_from_slice(original);
                gf::muladd_mem(&mut expected, alpha, &padded);
            }

            assert_eq!(output, expected, "row {row} diverged from its generator");
        }
    }

    #[test]
    fn test_single_column_block() {
        let data = make_data(1, 16, 7);
        let slices: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let mut encoder = Encoder::new(&slices, 16).unwrap();
        assert_eq!(encoder.params().symbol_bytes(), 16);
        assert_eq!(encoder.params().final_bytes(), 16);

        for row in 0..8u32 {
            let mut output = vec![0u8; 16];
            encoder.encode(row, &mut output).unwrap();

            let alpha = coefficient(row, 0, 1);
            let mut expected = data[0].clone();
            gf::mul_mem_inplace(&mut expected, alpha);
            assert_eq!(output, expected);
        }
    }

    #[test]
    fn test_lane_sums_match_reference() {
        let input_count = 20;
        let total_bytes = 20 * 32 - 5;
        let data = make_data(input_count, total_bytes, 99);
        let slices: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();

        let encoder = Encoder::new(&slices, total_bytes).unwrap();
        let symbol_bytes = encoder.params().symbol_bytes();

        for lane in 0..LANE_COUNT {
            for sum_index in 0..SUM_COUNT {
                let mut expected = vec![0u8; symbol_bytes];
                for (column, original) in data.iter().enumerate() {
                    if column % LANE_COUNT != lane {
                        continue;
                    }
                    let cx = column_value(column);
                    let weight = match sum_index {
                        0 => 1,
                        1 => cx,
                        _ => gf::sqr(cx),
                    };
                    gf::muladd_mem(&mut expected[..original.len()], weight, original);
                }
                assert_eq!(
                    encoder.lane_sums[lane][sum_index], expected,
                    "lane {lane} sum {sum_index}"
                );
            }
        }
    }

    #[test]
    fn test_encode_rejects_bad_sizes() {
        let data = make_data(4, 64, 1);
        let slices: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let mut encoder = Encoder::new(&slices, 64).unwrap();

        let mut short = vec![0u8; 15];
        assert_eq!(encoder.encode(0, &mut short), Err(Error::InvalidInput));

        // Wrong slice lengths at construction
        let bad: Vec<&[u8]> = vec![&data[0][..], &data[1][..3], &data[2][..], &data[3][..]];
        assert!(Encoder::new(&bad, 64).is_err());

        // Parameter validation
        assert!(Encoder::new(&[], 10).is_err());
        assert!(Encoder::new(&slices, 3).is_err());
    }
}
