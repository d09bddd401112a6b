//! Decoder: loss tracking, implicit-matrix sampling, and the solve pipeline.
//!
//! Data recovery proceeds in stages:
//!
//! 1. Collect original and recovery symbols until a solution may be possible.
//! 2. Sample the implicit generator matrix at the lost columns to build a
//!    small dense GF(2^8) matrix, one row per received recovery symbol.
//! 3. Put the matrix in upper-triangular form with Gaussian elimination.
//!    No symbol data has been touched yet, so a failed attempt is cheap; the
//!    elimination can resume later once more symbols arrive.
//! 4. Eliminate received original data from the recovery buffers, using
//!    lane sums over the received originals to batch the work.
//! 5. Replay the elimination on the recovery buffers, multiply through the
//!    lower triangle, and back-substitute. The recovery buffers then hold
//!    the missing original data.

use std::collections::HashSet;

use tracing::{debug, trace};

use crate::generator::{
    column_value, pair_count, row_opcode, row_value, PcgRandom, LANE_COUNT, SUM_COUNT,
};
use crate::gf;
use crate::gf::XorSummer;
use crate::matrix::GrowingByteMatrix;
use crate::{Error, Params};

/// Columns tracked per loss-bitmap subwindow.
const SUBWINDOW_SIZE: usize = LANE_COUNT * 8;

#[derive(Default)]
struct OriginalSlot {
    /// Present once the original arrived or was recovered.
    data: Option<Vec<u8>>,
    /// Matrix column assigned to this original while it is lost.
    matrix_column: usize,
}

struct RecoverySlot {
    data: Vec<u8>,
    row: u32,
    used_for_solution: bool,
}

#[derive(Default, Clone, Copy)]
struct Subwindow {
    got: u64,
    got_count: u32,
}

struct ColumnInfo {
    /// Lost original column this matrix column recovers.
    column: usize,
    cx: u8,
}

/// Matrix sampled from the generator at the lost columns, plus the pivot
/// indirection and resume bookkeeping. Rows are never physically swapped;
/// `pivots` maps logical pivot position to physical matrix row.
#[derive(Default)]
struct RecoveryMatrixState {
    columns: Vec<ColumnInfo>,
    matrix: GrowingByteMatrix,
    pivots: Vec<usize>,
    /// Pivot column where the previous attempt stalled on an all-zero column.
    ge_resume_pivot: usize,
    /// Physical rows already populated by earlier attempts.
    filled_rows: usize,
}

/// rem_row[pivot] becomes the elimination multiplier; the tail of the row is
/// reduced against the pivot row.
#[inline]
fn eliminate_row(ge_row: &[u8], rem_row: &mut [u8], pivot_i: usize, val_i: u8) {
    let val_j = rem_row[pivot_i];
    if val_j == 0 {
        return;
    }
    let y = gf::div(val_j, val_i);
    rem_row[pivot_i] = y;
    gf::muladd_mem(&mut rem_row[pivot_i + 1..], y, &ge_row[pivot_i + 1..]);
}

/// Disjoint borrows of two recovery buffers.
fn recovery_pair_mut(
    recovery: &mut [RecoverySlot],
    src: usize,
    dst: usize,
) -> (&[u8], &mut [u8]) {
    debug_assert!(src != dst);
    if src < dst {
        let (head, tail) = recovery.split_at_mut(dst);
        (&head[src].data[..], &mut tail[0].data[..])
    } else {
        let (head, tail) = recovery.split_at_mut(src);
        (&tail[0].data[..], &mut head[dst].data[..])
    }
}

impl RecoveryMatrixState {
    /// Attempt to put the matrix in upper-triangular form.
    ///
    /// Starts without the pivot indirection: the matrix is dense, so the
    /// natural row order usually gets far before a zero diagonal shows up,
    /// and only then does the scan fall back to pivoting. Returns false if
    /// a column has no usable pivot; the stall point is remembered so the
    /// next attempt resumes instead of restarting.
    fn gaussian_elimination(&mut self, recovery: &mut [RecoverySlot]) -> bool {
        if self.ge_resume_pivot > 0 {
            let start = self.ge_resume_pivot;
            return self.pivoted_elimination(start, recovery);
        }

        let columns = self.matrix.columns();
        let rows = self.matrix.rows();

        for pivot_i in 0..columns {
            let val_i = self.matrix.get(pivot_i, pivot_i);
            if val_i == 0 {
                return self.pivoted_elimination(pivot_i, recovery);
            }

            recovery[pivot_i].used_for_solution = true;

            for pivot_j in pivot_i + 1..rows {
                let (ge_row, rem_row) = self.matrix.row_pair_mut(pivot_i, pivot_j);
                eliminate_row(ge_row, rem_row, pivot_i, val_i);
            }
        }

        true
    }

    /// Elimination with the pivot indirection in play, entered either when
    /// the fast path hit a zero diagonal at `start` or when resuming a
    /// stalled attempt. In both cases logical row `start` is already known
    /// to have a zero in its column, so the first scan begins below it.
    fn pivoted_elimination(&mut self, start: usize, recovery: &mut [RecoverySlot]) -> bool {
        let columns = self.matrix.columns();
        let rows = self.matrix.rows();

        let mut first_column = true;
        for pivot_i in start..columns {
            let scan_from = if first_column { pivot_i + 1 } else { pivot_i };
            first_column = false;

            let mut selected = None;
            for pivot_j in scan_from..rows {
                let candidate = self.pivots[pivot_j];
                if self.matrix.get(candidate, pivot_i) != 0 {
                    selected = Some(pivot_j);
                    break;
                }
            }

            let Some(pivot_j) = selected else {
                self.ge_resume_pivot = pivot_i;
                return false;
            };

            if pivot_i != pivot_j {
                self.pivots.swap(pivot_i, pivot_j);
            }

            let matrix_row = self.pivots[pivot_i];
            recovery[matrix_row].used_for_solution = true;

            // Nothing below the last pivot needs eliminating
            if pivot_i >= columns - 1 {
                return true;
            }

            let val_i = self.matrix.get(matrix_row, pivot_i);
            for pivot_k in pivot_i + 1..rows {
                let rem = self.pivots[pivot_k];
                let (ge_row, rem_row) = self.matrix.row_pair_mut(matrix_row, rem);
                eliminate_row(ge_row, rem_row, pivot_i, val_i);
            }
        }

        true
    }

    /// Bring rows appended after a stalled attempt up to date: reduce them
    /// against every pivot the earlier attempts already resolved, in logical
    /// order, as if they had been present all along.
    fn resume_elimination(&mut self, old_rows: usize, rows: usize) {
        if old_rows >= rows {
            debug_assert!(old_rows == rows);
            return;
        }

        for pivot_i in 0..self.ge_resume_pivot {
            let src_row = self.pivots[pivot_i];
            let val_i = self.matrix.get(src_row, pivot_i);
            debug_assert!(val_i != 0);

            for new_row in old_rows..rows {
                debug_assert!(self.pivots[new_row] == new_row);
                let (ge_row, rem_row) = self.matrix.row_pair_mut(src_row, new_row);
                eliminate_row(ge_row, rem_row, pivot_i, val_i);
            }
        }
    }
}

/// Accumulates original and recovery symbols for one block and recovers
/// missing originals once enough symbols have arrived.
///
/// Submitted symbol data is copied into decoder-owned storage; recovered
/// originals reuse the recovery buffers they were solved into.
pub struct Decoder {
    params: Params,
    originals: Vec<OriginalSlot>,
    recovery: Vec<RecoverySlot>,
    subwindows: Vec<Subwindow>,
    original_got_count: usize,
    seen_rows: HashSet<u32>,
    matrix_state: RecoveryMatrixState,
    recovery_attempted: bool,
    lane_sums: [[Option<Vec<u8>>; SUM_COUNT]; LANE_COUNT],
    product: Vec<u8>,
}

impl Decoder {
    /// Create a decoder for a block of `input_count` originals totalling
    /// `total_bytes`.
    pub fn new(input_count: usize, total_bytes: u64) -> Result<Decoder, Error> {
        let params = Params::new(input_count, total_bytes)?;

        let subwindow_count = (input_count + SUBWINDOW_SIZE - 1) / SUBWINDOW_SIZE;
        let mut originals = Vec::with_capacity(input_count);
        originals.resize_with(input_count, OriginalSlot::default);

        Ok(Decoder {
            params,
            originals,
            recovery: Vec::with_capacity(input_count / 5 + 1),
            subwindows: vec![Subwindow::default(); subwindow_count],
            original_got_count: 0,
            seen_rows: HashSet::new(),
            matrix_state: RecoveryMatrixState::default(),
            recovery_attempted: false,
            lane_sums: Default::default(),
            product: Vec::new(),
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Submit original column data. Duplicates are ignored.
    ///
    /// `data` must be `params().column_bytes(column)` long.
    pub fn add_original(&mut self, column: usize, data: &[u8]) -> Result<(), Error> {
        if column >= self.params.input_count() || data.len() != self.params.column_bytes(column) {
            return Err(Error::InvalidInput);
        }

        // Already have this one; do not re-arm the solver
        if self.originals[column].data.is_some() {
            return Ok(());
        }

        self.originals[column].data = Some(data.to_vec());
        self.mark_got(column);
        self.original_got_count += 1;
        self.recovery_attempted = false;

        Ok(())
    }

    /// Submit recovery symbol data for `row`. Duplicate rows are ignored.
    ///
    /// `data` must be `params().symbol_bytes()` long.
    pub fn add_recovery(&mut self, row: u32, data: &[u8]) -> Result<(), Error> {
        if data.len() != self.params.symbol_bytes() {
            return Err(Error::InvalidInput);
        }

        if !self.seen_rows.insert(row) {
            return Ok(());
        }

        self.recovery.push(RecoverySlot {
            data: data.to_vec(),
            row,
            used_for_solution: false,
        });
        self.recovery_attempted = false;

        Ok(())
    }

    /// Original data for `column`, once present or recovered.
    pub fn get(&self, column: usize) -> Result<&[u8], Error> {
        if column >= self.params.input_count() {
            return Err(Error::InvalidInput);
        }
        match &self.originals[column].data {
            Some(data) => Ok(data),
            None => Err(Error::NeedMoreData),
        }
    }

    /// Attempt recovery. On success returns the recovered columns in
    /// ascending order; their bytes are available through [`Decoder::get`].
    ///
    /// `Error::NeedMoreData` is non-fatal: add more symbols and call again.
    /// The attempt state is kept, so a retry resumes the elimination rather
    /// than restarting it.
    pub fn decode(&mut self) -> Result<Vec<usize>, Error> {
        let input_count = self.params.input_count();

        // Nothing was lost
        if self.original_got_count >= input_count {
            return Ok(Vec::new());
        }

        // Not enough symbols for a solution to exist
        if self.original_got_count + self.recovery.len() < input_count {
            return Err(Error::NeedMoreData);
        }

        // No new symbols since the last failed attempt
        if self.recovery_attempted {
            return Err(Error::NeedMoreData);
        }
        self.recovery_attempted = true;

        debug!(
            input_count,
            got = self.original_got_count,
            recovery_rows = self.recovery.len(),
            "attempting recovery solve"
        );

        self.generate_matrix()?;

        if !self
            .matrix_state
            .gaussian_elimination(&mut self.recovery)
        {
            trace!(
                stalled_pivot = self.matrix_state.ge_resume_pivot,
                "elimination stalled on a zero column"
            );
            return Err(Error::NeedMoreData);
        }

        self.eliminate_original_data();
        self.multiply_lower_triangle();
        let recovered = self.back_substitution();

        debug!(recovered = recovered.len(), "recovery solve complete");

        Ok(recovered)
    }

    fn mark_got(&mut self, element: usize) {
        let subwindow = &mut self.subwindows[element / SUBWINDOW_SIZE];
        let mask = 1u64 << (element % SUBWINDOW_SIZE);
        debug_assert!(subwindow.got & mask == 0);
        subwindow.got |= mask;
        subwindow.got_count += 1;
    }

    /// Next lost column at or after `element_start`, or `input_count` if
    /// none. Subwindows with a full population count are skipped whole; the
    /// bit scan inside a subwindow cannot land past `input_count` because
    /// trailing never-arriving bits begin exactly at the block end.
    fn find_next_lost(&self, element_start: usize) -> usize {
        let input_count = self.params.input_count();
        if element_start >= input_count {
            return input_count;
        }

        let mut subwindow_index = element_start / SUBWINDOW_SIZE;
        let mut bit_index = element_start % SUBWINDOW_SIZE;

        while subwindow_index < self.subwindows.len() {
            let subwindow = &self.subwindows[subwindow_index];
            if (subwindow.got_count as usize) < SUBWINDOW_SIZE {
                let word = !subwindow.got >> bit_index;
                if word != 0 {
                    return subwindow_index * SUBWINDOW_SIZE
                        + bit_index
                        + word.trailing_zeros() as usize;
                }
            }
            bit_index = 0;
            subwindow_index += 1;
        }

        input_count
    }

    /// Assign matrix columns to the currently lost originals, left to right.
    fn populate_columns(&mut self, columns: usize) {
        self.matrix_state.columns.clear();
        self.matrix_state.columns.reserve(columns);

        let mut next_search = 0;
        for matrix_column in 0..columns {
            let lost = self.find_next_lost(next_search);
            if lost >= self.params.input_count() {
                debug_assert!(false, "fewer lost columns than expected");
                break;
            }
            next_search = lost + 1;

            self.matrix_state.columns.push(ColumnInfo {
                column: lost,
                cx: column_value(lost),
            });
            self.originals[lost].matrix_column = matrix_column;
        }
    }

    /// Build or extend the recovery matrix: sample the generator at every
    /// (recovery row, lost column) pair. The dense part comes from the
    /// opcode formula; the sparse part replays the row's PCG pair draws and
    /// lands only on columns that are still missing.
    fn generate_matrix(&mut self) -> Result<(), Error> {
        let input_count = self.params.input_count();
        let columns = input_count - self.original_got_count;
        let rows = self.recovery.len();
        debug_assert!(rows >= columns);

        if columns != self.matrix_state.columns.len() {
            // The lost set changed; rebuild from scratch
            self.populate_columns(columns);
            self.matrix_state.pivots.clear();
            self.matrix_state.ge_resume_pivot = 0;
            self.matrix_state.filled_rows = 0;
            self.matrix_state.matrix.initialize(rows, columns)?;
        } else {
            // Otherwise rows were appended
            debug_assert!(self.matrix_state.filled_rows < rows);
            self.matrix_state.matrix.resize(rows, columns)?;
        }

        for i in self.matrix_state.filled_rows..rows {
            let row = self.recovery[i].row;
            let rx = row_value(row);
            let row_data = self.matrix_state.matrix.row_mut(i);

            for (j, info) in self.matrix_state.columns.iter().enumerate() {
                let cx = info.cx;
                let cx2 = gf::sqr(cx);
                let opcode = row_opcode(info.column % LANE_COUNT, row);

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
                row_data[j] = value;
            }

            let mut prng = PcgRandom::seed(row as u64, input_count as u64);
            for _ in 0..pair_count(input_count) {
                let element1 = (prng.next_u32() % input_count as u32) as usize;
                if self.originals[element1].data.is_none() {
                    row_data[self.originals[element1].matrix_column] ^= 1;
                }

                let element_rx = (prng.next_u32() % input_count as u32) as usize;
                if self.originals[element_rx].data.is_none() {
                    row_data[self.originals[element_rx].matrix_column] ^= rx;
                }
            }
        }

        self.matrix_state.pivots.resize(rows, 0);
        for i in self.matrix_state.filled_rows..rows {
            self.matrix_state.pivots[i] = i;
        }

        if self.matrix_state.ge_resume_pivot > 0 {
            let old_rows = self.matrix_state.filled_rows;
            self.matrix_state.resume_elimination(old_rows, rows);
        }

        self.matrix_state.filled_rows = rows;

        Ok(())
    }

    /// Lane sum over the originals we actually received, built on first use
    /// and cached. The elimination phase runs at most once per decoder (it
    /// follows a successful elimination, which is terminal), so a cached sum
    /// can never go stale.
    fn build_lane_sum(&mut self, lane: usize, sum_index: usize) {
        if self.lane_sums[lane][sum_index].is_some() {
            return;
        }

        let symbol_bytes = self.params.symbol_bytes();
        let input_end = self.params.input_count() - 1;
        let mut sum = vec![0u8; symbol_bytes];

        if sum_index == 0 {
            let mut summer = XorSummer::new(&mut sum);
            let mut column = lane;
            while column < input_end {
                if let Some(data) = &self.originals[column].data {
                    summer.add(data);
                }
                column += LANE_COUNT;
            }
            summer.finalize();

            if input_end % LANE_COUNT == lane {
                if let Some(data) = &self.originals[input_end].data {
                    gf::xor_mem(&mut sum[..data.len()], data);
                }
            }
        } else {
            let mut column = lane;
            while column < input_end {
                if let Some(data) = &self.originals[column].data {
                    let mut weight = column_value(column);
                    if sum_index == 2 {
                        weight = gf::sqr(weight);
                    }
                    gf::muladd_mem(&mut sum, weight, data);
                }
                column += LANE_COUNT;
            }

            if input_end % LANE_COUNT == lane {
                if let Some(data) = &self.originals[input_end].data {
                    let mut weight = column_value(input_end);
                    if sum_index == 2 {
                        weight = gf::sqr(weight);
                    }
                    gf::muladd_mem(&mut sum[..data.len()], weight, data);
                }
            }
        }

        self.lane_sums[lane][sum_index] = Some(sum);
    }

    /// Remove every received original's contribution from the solution
    /// rows' buffers, so each buffer holds only the matrix-weighted XOR of
    /// the lost columns. Dense contributions cancel through the lane sums;
    /// sparse ones replay the pair draws for originals that are present.
    fn eliminate_original_data(&mut self) {
        let mut needed = [[false; SUM_COUNT]; LANE_COUNT];
        for slot in &self.recovery {
            if !slot.used_for_solution {
                continue;
            }
            for (lane, lane_needed) in needed.iter_mut().enumerate() {
                let opcode = row_opcode(lane, slot.row);
                for (sum_index, flag) in lane_needed.iter_mut().enumerate() {
                    let mask = (1u32 << sum_index) | (1u32 << (sum_index + SUM_COUNT));
                    if opcode & mask != 0 {
                        *flag = true;
                    }
                }
            }
        }
        for lane in 0..LANE_COUNT {
            for sum_index in 0..SUM_COUNT {
                if needed[lane][sum_index] {
                    self.build_lane_sum(lane, sum_index);
                }
            }
        }

        let symbol_bytes = self.params.symbol_bytes();
        self.product.resize(symbol_bytes, 0);

        let input_count = self.params.input_count();
        let final_column = input_count - 1;
        let final_bytes = self.params.final_bytes();

        let Decoder {
            originals,
            recovery,
            lane_sums,
            product,
            ..
        } = self;

        for slot in recovery.iter_mut() {
            if !slot.used_for_solution {
                continue;
            }

            product.fill(0);

            let mut summer1 = XorSummer::new(&mut slot.data);
            let mut summer_rx = XorSummer::new(product.as_mut_slice());

            for (lane, sums) in lane_sums.iter().enumerate() {
                let opcode = row_opcode(lane, slot.row);

                let mut mask = 1u32;
                for sum in sums.iter() {
                    if opcode & mask != 0 {
                        if let Some(data) = sum {
                            summer1.add(data);
                        }
                    }
                    mask <<= 1;
                }
                for sum in sums.iter() {
                    if opcode & mask != 0 {
                        if let Some(data) = sum {
                            summer_rx.add(data);
                        }
                    }
                    mask <<= 1;
                }
            }

            let mut prng = PcgRandom::seed(slot.row as u64, input_count as u64);
            for _ in 0..pair_count(input_count) {
                let element1 = (prng.next_u32() % input_count as u32) as usize;
                if let Some(data) = &originals[element1].data {
                    if element1 == final_column {
                        summer1.add_now(data, final_bytes);
                    } else {
                        summer1.add(data);
                    }
                }

                let element_rx = (prng.next_u32() % input_count as u32) as usize;
                if let Some(data) = &originals[element_rx].data {
                    if element_rx == final_column {
                        summer_rx.add_now(data, final_bytes);
                    } else {
                        summer_rx.add(data);
                    }
                }
            }

            summer1.finalize();
            summer_rx.finalize();

            gf::muladd_mem(&mut slot.data, row_value(slot.row), product);
        }
    }

    /// Replay the stored elimination multipliers on the recovery buffers in
    /// solution order, left to right.
    fn multiply_lower_triangle(&mut self) {
        let columns = self.matrix_state.columns.len();

        for col_i in 0..columns.saturating_sub(1) {
            let src_row = self.matrix_state.pivots[col_i];

            for col_j in col_i + 1..columns {
                let dst_row = self.matrix_state.pivots[col_j];
                let y = self.matrix_state.matrix.get(dst_row, col_i);
                if y == 0 {
                    continue;
                }

                let (src, dst) = recovery_pair_mut(&mut self.recovery, src_row, dst_row);
                gf::muladd_mem(dst, y, src);
            }
        }
    }

    /// Divide out the diagonal right to left, eliminate each solved column
    /// from the rows above it, and publish the solved buffers as originals.
    /// Only the first `column_bytes` of each buffer are meaningful; the tail
    /// past a short final column is never surfaced.
    fn back_substitution(&mut self) -> Vec<usize> {
        let columns = self.matrix_state.columns.len();
        let mut recovered = Vec::with_capacity(columns);

        for col_i in (0..columns).rev() {
            let matrix_row = self.matrix_state.pivots[col_i];
            let y = self.matrix_state.matrix.get(matrix_row, col_i);
            debug_assert!(y != 0);

            let original_column = self.matrix_state.columns[col_i].column;
            let original_bytes = self.params.column_bytes(original_column);

            if y != 0 {
                gf::div_mem_inplace(&mut self.recovery[matrix_row].data[..original_bytes], y);
            }

            for col_j in 0..col_i {
                let pivot_j = self.matrix_state.pivots[col_j];
                let x = self.matrix_state.matrix.get(pivot_j, col_i);
                if x == 0 {
                    continue;
                }

                let (src, dst) = recovery_pair_mut(&mut self.recovery, matrix_row, pivot_j);
                gf::muladd_mem(&mut dst[..original_bytes], x, &src[..original_bytes]);
            }
        }

        for col_i in 0..columns {
            let matrix_row = self.matrix_state.pivots[col_i];
            let original_column = self.matrix_state.columns[col_i].column;
            let original_bytes = self.params.column_bytes(original_column);

            let mut data = std::mem::take(&mut self.recovery[matrix_row].data);
            data.truncate(original_bytes);
            self.originals[original_column].data = Some(data);
            recovered.push(original_column);
        }

        recovered
    }
}
