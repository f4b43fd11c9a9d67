#![warn(clippy::all, rust_2018_idioms)]

//! Sandbox driver: compiles the canonical instruction decoder, flashes a
//! small MiMa program into main memory and emulates it to halt.

use mima_emulator::{MainMemory, MicroAssembler, MinimalMachine};
use tracing_subscriber::EnvFilter;

const DECODER: &str = include_str!("../microcode/decoder.mprog");

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let decoder = match MicroAssembler::compile(DECODER) {
        Ok(program) => program,
        Err(err) => {
            tracing::error!("failed to compile the instruction decoder: {err}");
            std::process::exit(1);
        }
    };

    // LDC 0xFF; ADD mem[0x20]; STV mem[0x21]; HALT -- with mem[0x20] = 3
    let mut memory = MainMemory::new();
    memory.flash(&[0x0000FF, 0x300020, 0x200021, 0xF00000], 0);
    memory.write(0x20, 0x000003);

    let mut mima = MinimalMachine::new(decoder, memory);
    println!("{mima}");

    mima.run(None);

    println!("{mima}");
    println!(
        "mem[0x21] = 0x{:06X} (expected 0x000102)",
        mima.memory().read(0x21)
    );
}
