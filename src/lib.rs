#![warn(clippy::all, rust_2018_idioms)]

/// The MiMa datapath, main memory and the cycle-accurate interpreter
pub mod machine;
/// The microprogram control store and the microassembler that fills it
pub mod microprogram;

pub use machine::{MainMemory, MemoryCell, MinimalMachine};
pub use microprogram::{
    AluOp, CompilerError, MicroAssembler, MicroCell, MicroProgram, MicroWord, StatusMap,
};
