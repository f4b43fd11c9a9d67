use std::fmt;

use super::word::MicroWord;
use super::StatusMap;

/// One piece of the piecewise-constant function: `word` holds for every
/// condition value up to and including `upper`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Piece {
    upper: usize,
    word: MicroWord,
}

/// One slot of the microprogram: a microinstruction word *conditional* on a
/// named status value.
///
/// The cell maps the range `[0..condition_max]` of a status value (looked up
/// by `condition` name at run time) onto microinstruction words, stored as
/// an ordered list of `(upper_bound, word)` pieces. Bounds are strictly
/// increasing and contiguous, the last bound always equals `condition_max`.
/// `condition_max == 0` means the cell is unconditional.
///
/// The assembler edits a cell through [`MicroCell::apply_range`], which
/// splits pieces as needed so a mutation touches exactly the requested
/// sub-range of condition values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroCell {
    condition: String,
    condition_max: usize,
    pieces: Vec<Piece>,
}

impl MicroCell {
    /// A cell conditional on `condition`, uniform over `[0..condition_max]`
    /// with the default (all zero) word.
    pub fn new(condition: impl Into<String>, condition_max: usize) -> Self {
        Self {
            condition: condition.into(),
            condition_max,
            pieces: vec![Piece {
                upper: condition_max,
                word: MicroWord::default(),
            }],
        }
    }

    /// An unconditional cell holding a single default word.
    pub fn unconditional() -> Self {
        Self::new("", 0)
    }

    /// Back to a fresh unconditional cell.
    pub fn reset(&mut self) {
        self.reset_conditional("", 0);
    }

    /// Back to a fresh cell as if constructed with `new(condition, max)`.
    pub fn reset_conditional(&mut self, condition: impl Into<String>, condition_max: usize) {
        self.condition = condition.into();
        self.condition_max = condition_max;
        self.pieces.clear();
        self.pieces.push(Piece {
            upper: condition_max,
            word: MicroWord::default(),
        });
    }

    /// The name of the status value this cell dispatches on.
    pub fn condition(&self) -> &str {
        &self.condition
    }

    /// The largest condition value this cell distinguishes (inclusive).
    pub fn condition_max(&self) -> usize {
        self.condition_max
    }

    /// How many pieces the cell currently consists of.
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// The `(upper_bound, word)` pieces in ascending bound order.
    pub fn pieces(&self) -> impl Iterator<Item = (usize, MicroWord)> + '_ {
        self.pieces.iter().map(|piece| (piece.upper, piece.word))
    }

    /// Apply `mutator` to the word for every condition value.
    pub fn apply<F: Fn(&mut MicroWord)>(&mut self, mutator: F) {
        let max = self.condition_max;
        self.apply_range(mutator, 0, max);
    }

    /// Apply `mutator` to the words for condition values in `[lo..hi]`
    /// (inclusive, `hi` clamped to `condition_max`), splitting pieces at the
    /// range edges so values outside `[lo..hi]` keep their previous word.
    pub fn apply_range<F: Fn(&mut MicroWord)>(&mut self, mutator: F, lo: usize, hi: usize) {
        let hi = hi.min(self.condition_max);
        if lo > hi {
            return;
        }

        // First piece reaching into the affected range. The last piece has
        // upper == condition_max >= hi >= lo, so one always exists.
        let mut index = 0;
        while self.pieces[index].upper < lo {
            index += 1;
        }

        // Make the piece boundary line up with lo - 1 so the mutation starts
        // exactly at lo.
        if lo > 0 {
            let needs_split = if index == 0 {
                true
            } else {
                self.pieces[index - 1].upper + 1 != lo
            };
            if needs_split {
                let word = self.pieces[index].word;
                self.pieces.insert(
                    index,
                    Piece {
                        upper: lo - 1,
                        word,
                    },
                );
                index += 1;
            }
        }

        // Mutate every piece entirely inside the range.
        while self.pieces[index].upper < hi {
            mutator(&mut self.pieces[index].word);
            index += 1;
        }

        // Piece ending exactly at hi: mutate it and we are done.
        if self.pieces[index].upper == hi {
            mutator(&mut self.pieces[index].word);
            return;
        }

        // Otherwise split: a new piece covers up to hi, the old one keeps
        // its word for the untouched tail.
        let word = self.pieces[index].word;
        self.pieces.insert(index, Piece { upper: hi, word });
        mutator(&mut self.pieces[index].word);
    }

    /// The word for the current status. The condition value is read from
    /// `status` (missing names count as 0) and clamped to `condition_max`.
    pub fn get(&self, status: &StatusMap) -> MicroWord {
        let condition = status
            .get(&self.condition)
            .copied()
            .unwrap_or(0)
            .min(self.condition_max);

        let mut index = 0;
        while self.pieces[index].upper < condition {
            index += 1;
        }
        self.pieces[index].word
    }
}

impl Default for MicroCell {
    fn default() -> Self {
        Self::unconditional()
    }
}

impl fmt::Display for MicroCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.condition_max == 0 {
            return write!(f, "unconditional microcode: {}", self.pieces[0].word);
        }

        if self.pieces.len() == 1 {
            return write!(
                f,
                "conditional microcode for {} up to max 0x{:X}: {}",
                self.condition, self.condition_max, self.pieces[0].word
            );
        }

        writeln!(
            f,
            "conditional microcode for {} up to max 0x{:X}:",
            self.condition, self.condition_max
        )?;
        for piece in &self.pieces {
            writeln!(f, "  up to 0x{:02X}: {}", piece.upper, piece.word)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::microprogram::word::AluOp;

    fn status(name: &str, value: usize) -> StatusMap {
        let mut map = StatusMap::default();
        map.insert(name.to_string(), value);
        map
    }

    /// Checks the structural invariants: strictly increasing contiguous
    /// bounds, last bound equal to the condition maximum.
    fn assert_invariants(cell: &MicroCell) {
        let bounds: Vec<usize> = cell.pieces().map(|(upper, _)| upper).collect();
        for window in bounds.windows(2) {
            assert!(
                window[0] < window[1],
                "piece bounds not strictly increasing: {bounds:?}"
            );
        }
        assert_eq!(
            *bounds.last().unwrap(),
            cell.condition_max(),
            "last bound must equal the condition maximum"
        );
    }

    #[test]
    fn fresh_cell_is_one_default_piece() {
        let cell = MicroCell::new("op_code", 255);
        assert_eq!(cell.piece_count(), 1);
        assert_eq!(cell.condition_max(), 255);
        assert_eq!(cell.get(&status("op_code", 0)), MicroWord::default());
        assert_eq!(cell.get(&status("op_code", 255)), MicroWord::default());
        assert_invariants(&cell);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut cell = MicroCell::new("op_code", 255);
        cell.apply_range(|word| word.set_next_address(7), 16, 31);

        cell.reset();
        let once = cell.clone();
        cell.reset();
        assert_eq!(cell, once);
        assert_eq!(cell, MicroCell::unconditional());
    }

    #[test]
    fn reset_conditional_acts_like_new() {
        let mut cell = MicroCell::unconditional();
        cell.apply(|word| word.set_memory_read());
        cell.reset_conditional("accumulator_negative", 1);
        assert_eq!(cell, MicroCell::new("accumulator_negative", 1));
    }

    #[test]
    fn apply_range_affects_exactly_the_range() {
        let mut cell = MicroCell::new("op_code", 255);
        cell.apply_range(|word| word.set_next_address(7), 16, 31);

        for value in 0..=255usize {
            let word = cell.get(&status("op_code", value));
            if (16..=31).contains(&value) {
                assert_eq!(word.next_address(), 7, "value {value} should be patched");
            } else {
                assert_eq!(word.next_address(), 0, "value {value} should be untouched");
            }
        }
        // [0..15], [16..31], [32..255]
        assert_eq!(cell.piece_count(), 3);
        assert_invariants(&cell);
    }

    #[test]
    fn apply_range_starting_at_zero_splits_once() {
        let mut cell = MicroCell::new("op_code", 255);
        cell.apply_range(|word| word.set_next_address(9), 0, 15);
        assert_eq!(cell.piece_count(), 2);
        assert_eq!(cell.get(&status("op_code", 0)).next_address(), 9);
        assert_eq!(cell.get(&status("op_code", 15)).next_address(), 9);
        assert_eq!(cell.get(&status("op_code", 16)).next_address(), 0);
        assert_invariants(&cell);
    }

    #[test]
    fn apply_range_ending_at_max_splits_once() {
        let mut cell = MicroCell::new("op_code", 255);
        cell.apply_range(|word| word.set_next_address(9), 64, 255);
        assert_eq!(cell.piece_count(), 2);
        assert_eq!(cell.get(&status("op_code", 63)).next_address(), 0);
        assert_eq!(cell.get(&status("op_code", 64)).next_address(), 9);
        assert_eq!(cell.get(&status("op_code", 255)).next_address(), 9);
        assert_invariants(&cell);
    }

    #[test]
    fn apply_range_reuses_existing_boundaries() {
        let mut cell = MicroCell::new("op_code", 255);
        cell.apply_range(|word| word.set_next_address(7), 16, 31);
        // same range again: no further splitting
        cell.apply_range(|word| word.set_memory_read(), 16, 31);
        assert_eq!(cell.piece_count(), 3);
        let word = cell.get(&status("op_code", 20));
        assert_eq!(word.next_address(), 7);
        assert!(word.is_reading_memory());
        assert!(!cell.get(&status("op_code", 15)).is_reading_memory());
        assert_invariants(&cell);
    }

    #[test]
    fn overlapping_ranges_compose() {
        let mut cell = MicroCell::new("op_code", 255);
        cell.apply_range(|word| word.set_next_address(7), 16, 31);
        cell.apply_range(|word| word.set_next_address(8), 24, 47);

        assert_eq!(cell.get(&status("op_code", 16)).next_address(), 7);
        assert_eq!(cell.get(&status("op_code", 23)).next_address(), 7);
        assert_eq!(cell.get(&status("op_code", 24)).next_address(), 8);
        assert_eq!(cell.get(&status("op_code", 47)).next_address(), 8);
        assert_eq!(cell.get(&status("op_code", 48)).next_address(), 0);
        assert_invariants(&cell);
    }

    #[test]
    fn ranges_covering_every_value_stay_contiguous() {
        let mut cell = MicroCell::new("op_code", 255);
        cell.apply_range(|word| word.set_next_address(1), 0, 15);
        cell.apply_range(|word| word.set_next_address(2), 16, 31);
        cell.apply_range(|word| word.set_next_address(3), 32, 47);
        cell.apply_range(|word| word.set_next_address(4), 48, 255);
        assert_eq!(cell.piece_count(), 4);
        assert_eq!(cell.get(&status("op_code", 15)).next_address(), 1);
        assert_eq!(cell.get(&status("op_code", 16)).next_address(), 2);
        assert_eq!(cell.get(&status("op_code", 47)).next_address(), 3);
        assert_eq!(cell.get(&status("op_code", 200)).next_address(), 4);
        assert_invariants(&cell);
    }

    #[test]
    fn upper_limit_is_clamped_to_condition_max() {
        let mut cell = MicroCell::new("op_code", 63);
        cell.apply_range(|word| word.set_next_address(5), 32, 10_000);
        assert_eq!(cell.get(&status("op_code", 63)).next_address(), 5);
        assert_eq!(cell.get(&status("op_code", 31)).next_address(), 0);
        assert_invariants(&cell);
    }

    #[test]
    fn empty_range_is_ignored() {
        let mut cell = MicroCell::new("op_code", 63);
        let before = cell.clone();
        // lo beyond the clamped hi
        cell.apply_range(|word| word.set_next_address(5), 100, 200);
        assert_eq!(cell, before);
    }

    #[test]
    fn unconditional_apply_hits_the_single_piece() {
        let mut cell = MicroCell::unconditional();
        cell.apply(|word| word.set_alu_op(AluOp::Add));
        cell.apply(|word| word.set_memory_read());
        assert_eq!(cell.piece_count(), 1);
        let word = cell.get(&StatusMap::default());
        assert_eq!(word.alu_op(), AluOp::Add);
        assert!(word.is_reading_memory());
    }

    #[test]
    fn get_defaults_missing_condition_to_zero() {
        let mut cell = MicroCell::new("op_code", 255);
        cell.apply_range(|word| word.set_next_address(7), 0, 0);
        cell.apply_range(|word| word.set_next_address(9), 1, 255);
        // empty status map: condition reads as 0
        assert_eq!(cell.get(&StatusMap::default()).next_address(), 7);
        // unrelated names don't count
        assert_eq!(cell.get(&status("something_else", 40)).next_address(), 7);
    }

    #[test]
    fn get_clamps_oversized_condition_values() {
        let mut cell = MicroCell::new("op_code", 15);
        cell.apply_range(|word| word.set_next_address(3), 15, 15);
        assert_eq!(cell.get(&status("op_code", 5000)).next_address(), 3);
    }
}
