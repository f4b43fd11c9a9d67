/// Sparse main memory with per-word debug tags
pub mod memory;

use std::fmt;

pub use memory::{MainMemory, MemoryCell};
use memory::{ADDRESS_MASK, DATA_MASK};

use crate::microprogram::{AluOp, MicroProgram, MicroWord, StatusMap};

/// What the memory port is asked to do this cycle, encoded from the two
/// memory strobes of the control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortDirection {
    Idle = 0,
    Write = 1,
    Read = 2,
    /// Read and write strobes set at once. Invalid; the cycle makes no
    /// memory commit.
    Both = 3,
}

impl PortDirection {
    fn from_word(word: &MicroWord) -> Self {
        match (word.is_reading_memory(), word.is_writing_memory()) {
            (false, false) => PortDirection::Idle,
            (false, true) => PortDirection::Write,
            (true, false) => PortDirection::Read,
            (true, true) => PortDirection::Both,
        }
    }
}

/// State of the multi-cycle main-memory port. An access commits on the
/// third consecutive cycle with the same address and direction.
#[derive(Debug, Clone, Copy)]
struct MemoryPort {
    address: u32,
    direction: PortDirection,
    steps: u32,
}

impl MemoryPort {
    fn new() -> Self {
        Self {
            address: 0,
            direction: PortDirection::Idle,
            steps: 0,
        }
    }
}

/// The MiMa: accumulator machine with a 24-bit data path, 20-bit addresses
/// and a microprogrammed instruction decoder.
///
/// The machine holds shared read-only ownership of its decoder microprogram
/// and exclusive ownership of its registers and main memory. It is driven
/// by the caller one clock cycle ([`MinimalMachine::micro_step`]), one
/// instruction ([`MinimalMachine::step`]) or one lifetime
/// ([`MinimalMachine::run`]) at a time.
pub struct MinimalMachine {
    decoder: MicroProgram,
    memory: MainMemory,

    /// Accumulator. Bit 23 doubles as the negative status bit.
    acc: u32,
    /// ALU operand registers
    x: u32,
    y: u32,
    /// ALU result register
    z: u32,
    /// Instruction register. The high 8 bits are the op-code, the low 20
    /// bits are the address operand.
    ir: u32,
    /// Storage data register, the memory port's data side
    sdr: u32,
    /// Instruction address register (20 bits)
    iar: u32,
    /// Storage address register, the memory port's address side (20 bits)
    sar: u32,

    running: bool,
    /// Address of the next microinstruction to execute
    microstate: u8,
    port: MemoryPort,
    status: StatusMap,
}

impl MinimalMachine {
    /// The constant-one register.
    const ONE: u32 = 1;

    pub fn new(decoder: MicroProgram, memory: MainMemory) -> Self {
        Self {
            decoder,
            memory,
            acc: 0,
            x: 0,
            y: 0,
            z: 0,
            ir: 0,
            sdr: 0,
            iar: 0,
            sar: 0,
            running: true,
            microstate: 0,
            port: MemoryPort::new(),
            status: StatusMap::default(),
        }
    }

    // --- register file access ---

    pub fn acc(&self) -> u32 {
        self.acc
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn z(&self) -> u32 {
        self.z
    }

    pub fn ir(&self) -> u32 {
        self.ir
    }

    pub fn sdr(&self) -> u32 {
        self.sdr
    }

    pub fn iar(&self) -> u32 {
        self.iar
    }

    pub fn sar(&self) -> u32 {
        self.sar
    }

    /// The op-code view of IR: its high 8 bits.
    pub fn op_code(&self) -> u8 {
        (self.ir >> 16) as u8
    }

    /// The negative view of the accumulator: its bit 23.
    pub fn acc_negative(&self) -> bool {
        self.acc & (1 << 23) != 0
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn microstate(&self) -> u8 {
        self.microstate
    }

    pub fn decoder(&self) -> &MicroProgram {
        &self.decoder
    }

    pub fn memory(&self) -> &MainMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MainMemory {
        &mut self.memory
    }

    // --- emulation ---

    /// One clock cycle: fetch the control word for the current microstate,
    /// drive the bus, run the ALU, step the memory port, pick the next
    /// microstate. A microinstruction jumping to its own address halts the
    /// machine.
    pub fn micro_step(&mut self) {
        let span = tracing::trace_span!("micro_step", microstate = self.microstate);
        let _guard = span.enter();

        self.update_status();
        let word = self.decoder.get(self.microstate, &self.status);

        // bus write phase: every enabled source is OR-merged onto the bus
        let mut bus: u32 = 0;
        if word.sdr_to_bus() {
            bus |= self.sdr;
        }
        if word.ir_to_bus() {
            bus |= self.ir;
        }
        if word.iar_to_bus() {
            bus |= self.iar;
        }
        if word.one_to_bus() {
            bus |= Self::ONE;
        }
        if word.z_to_bus() {
            bus |= self.z;
        }
        if word.acc_to_bus() {
            bus |= self.acc;
        }

        // bus read phase; the address registers only see 20 bits
        if word.sdr_from_bus() {
            self.sdr = bus;
        }
        if word.ir_from_bus() {
            self.ir = bus;
        }
        if word.x_from_bus() {
            self.x = bus;
        }
        if word.y_from_bus() {
            self.y = bus;
        }
        if word.acc_from_bus() {
            self.acc = bus;
        }
        if word.sar_from_bus() {
            self.sar = bus & ADDRESS_MASK;
        }
        if word.iar_from_bus() {
            self.iar = bus & ADDRESS_MASK;
        }

        self.step_alu(word.alu_op());
        self.step_memory_port(&word);

        let next = word.next_address();
        if next == self.microstate {
            tracing::debug!("microprogram self-loop at 0x{:02X}, halting", next);
            self.running = false;
        }
        self.microstate = next;
    }

    /// One instruction cycle: clock cycles until the decoder is back at
    /// microstate 0 (the canonical start of the next fetch) or the machine
    /// halted.
    pub fn step(&mut self) {
        let span = tracing::trace_span!("instruction_cycle");
        let _guard = span.enter();

        loop {
            self.micro_step();
            if self.microstate == 0 || !self.running {
                break;
            }
        }
    }

    /// Run until the machine halts, optionally bounded by an instruction
    /// step count.
    pub fn run(&mut self, max_steps: Option<usize>) {
        let span = tracing::debug_span!("run", max_steps);
        let _guard = span.enter();

        let mut steps: usize = 0;
        while self.running {
            if let Some(max) = max_steps {
                if steps >= max {
                    tracing::info!("reached maximum of {} instruction steps, stopping", max);
                    return;
                }
                steps += 1;
            }
            self.step();
        }
        tracing::info!("machine halted at microstate 0x{:02X}", self.microstate);
    }

    /// Publish the status values conditional microcells can dispatch on.
    fn update_status(&mut self) {
        let op_code = usize::from(self.op_code());
        let negative = usize::from(self.acc_negative());
        Self::set_status(&mut self.status, "op_code", op_code);
        Self::set_status(&mut self.status, "accumulator_negative", negative);
    }

    fn set_status(status: &mut StatusMap, name: &str, value: usize) {
        if let Some(slot) = status.get_mut(name) {
            *slot = value;
        } else {
            status.insert(name.to_string(), value);
        }
    }

    /// The ALU runs every cycle; `Pass` leaves Z alone, everything else is
    /// a pure function of (op, X, Y) masked to 24 bits.
    fn step_alu(&mut self, op: AluOp) {
        self.z = match op {
            AluOp::Pass => return,
            AluOp::Add => self.x.wrapping_add(self.y) & DATA_MASK,
            AluOp::RotateRight => (self.x >> 1) | ((self.x & 1) << 23),
            AluOp::And => self.x & self.y,
            AluOp::Or => self.x | self.y,
            AluOp::Xor => self.x ^ self.y,
            AluOp::Not => !self.x & DATA_MASK,
            AluOp::Equal => {
                if self.x == self.y {
                    DATA_MASK
                } else {
                    0
                }
            }
        };
        tracing::trace!(op = ?op, z = format!("0x{:06X}", self.z), "alu result");
    }

    /// Advance the memory port. Main memory takes three cycles: an access
    /// commits once the same address has been strobed in the same direction
    /// for three consecutive cycles, and not again until the port state
    /// changes.
    fn step_memory_port(&mut self, word: &MicroWord) {
        let direction = PortDirection::from_word(word);
        match direction {
            PortDirection::Idle => {
                self.port.steps = 0;
            }
            PortDirection::Both => {
                tracing::error!(
                    "memory read and write strobes set simultaneously at microstate 0x{:02X}, skipping memory access",
                    self.microstate
                );
            }
            PortDirection::Write | PortDirection::Read => {
                if self.sar != self.port.address {
                    self.port.address = self.sar;
                    self.port.steps = 0;
                }
                if self.port.direction != direction {
                    self.port.direction = direction;
                    self.port.steps = 1;
                } else {
                    self.port.steps += 1;
                    if self.port.steps == 3 {
                        if direction == PortDirection::Write {
                            tracing::trace!(
                                "memory[0x{:05X}] <- 0x{:06X}",
                                self.sar,
                                self.sdr
                            );
                            self.memory.write(self.sar, self.sdr);
                        } else {
                            self.sdr = self.memory.read(self.sar);
                            tracing::trace!(
                                "SDR <- memory[0x{:05X}] = 0x{:06X}",
                                self.sar,
                                self.sdr
                            );
                        }
                    }
                }
            }
        }
    }
}

impl fmt::Display for MinimalMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MinimalMachine state:")?;
        writeln!(f, "  running: {}", self.running)?;
        writeln!(f, "  microstate: 0x{:02X}", self.microstate)?;
        writeln!(
            f,
            "  ACC: 0x{:06X} (negative: {})",
            self.acc,
            self.acc_negative()
        )?;
        writeln!(f, "  IAR: 0x{:05X}", self.iar)?;
        writeln!(f, "  IR:  0x{:06X}", self.ir)?;
        writeln!(f, "  X:   0x{:06X}", self.x)?;
        writeln!(f, "  Y:   0x{:06X}", self.y)?;
        writeln!(f, "  Z:   0x{:06X}", self.z)?;
        writeln!(f, "  SAR: 0x{:05X}", self.sar)?;
        write!(f, "  SDR: 0x{:06X}", self.sdr)
    }
}
