/// Piecewise-conditional microprogram cells
pub mod cell;
/// The microassembler turning DSL text into a control store
pub mod compiler;
/// The bit-packed 28-bit microinstruction word
pub mod word;

use std::fmt::Write as _;
use std::sync::Arc;

use rustc_hash::FxHashMap;

pub use cell::MicroCell;
pub use compiler::{CompilerError, MicroAssembler};
pub use word::{AluOp, MicroWord};

/// Runtime status values the interpreter publishes each cycle, keyed by
/// condition name. Conditional microcells dispatch on these; names missing
/// from the map read as 0.
pub type StatusMap = FxHashMap<String, usize>;

/// Number of cells in the control store.
pub const MICROPROGRAM_SIZE: usize = 256;

/// Control store address reserved for halting. The cell at this address
/// jumps to itself for every status value, and the interpreter treats a
/// self-jump as halt.
pub const HALT_RESERVED: u8 = 0xFF;

/// A compiled microprogram: 256 conditional microcells, immutable once the
/// assembler hands it out.
///
/// Cloning is cheap (shared ownership), so one compiled program can drive
/// any number of machines.
#[derive(Debug, Clone)]
pub struct MicroProgram {
    cells: Arc<[MicroCell; MICROPROGRAM_SIZE]>,
}

impl MicroProgram {
    /// Seal a finished control store. Only the assembler builds these.
    pub(crate) fn new(cells: Box<[MicroCell; MICROPROGRAM_SIZE]>) -> Self {
        Self {
            cells: Arc::from(cells),
        }
    }

    /// The microinstruction word at `address` for the given status values.
    #[inline]
    pub fn get(&self, address: u8, status: &StatusMap) -> MicroWord {
        self.cells[address as usize].get(status)
    }

    /// Direct access to a cell, mainly for inspection and tests.
    pub fn cell(&self, address: u8) -> &MicroCell {
        &self.cells[address as usize]
    }

    /// Render the cells in `[lo..hi]` (inclusive) for inspection.
    pub fn dump(&self, lo: u8, hi: u8) -> String {
        let mut output = String::new();
        for address in lo..=hi {
            let _ = writeln!(output, "at 0x{:02X}: {}", address, self.cell(address));
        }
        output
    }
}
