//! Line compiler for the microprogram DSL.
//!
//! The assembler walks the source once, line by line. Labels patch earlier
//! cells through a queue of pending resolutions, which gives the same
//! observable behavior as a classic two-pass assembler without re-reading
//! the source. The assembler keeps internal mutable state and must not be
//! shared; compile one program per instance.

use std::fmt;
use std::fs;
use std::path::Path;

use rustc_hash::FxHashMap;

use super::cell::MicroCell;
use super::word::{AluOp, MicroWord};
use super::{MicroProgram, HALT_RESERVED, MICROPROGRAM_SIZE};

/// A failed compilation: what went wrong and on which 0-based source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerError {
    pub message: String,
    pub line: usize,
}

impl CompilerError {
    fn new(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for CompilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "microprogram line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for CompilerError {}

/// A jump whose target label is not known yet. Captures the cell it was
/// found in and the condition range it applies to; fired once the label is
/// registered.
#[derive(Debug, Clone)]
struct PendingJump {
    cell: u8,
    lo: usize,
    hi: usize,
}

impl PendingJump {
    /// Patch the captured cell range with the resolved address. Returns
    /// whether the resolver is spent and should be removed from the queue.
    fn resolve(&self, memory: &mut [MicroCell; MICROPROGRAM_SIZE], address: u8) -> bool {
        tracing::trace!(
            "resolved jump at 0x{:02X} [{}..{}] to 0x{:02X}",
            self.cell,
            self.lo,
            self.hi,
            address
        );
        memory[self.cell as usize].apply_range(|word| word.set_next_address(address), self.lo, self.hi);
        true
    }
}

/// Parser state of the assembler: how the current lines are translated into
/// microcell mutations.
#[derive(Debug, Clone)]
enum CompileMode {
    /// One cell per source line, built from register transfers, assignments
    /// and at most one jump.
    Default { fixed_jump: bool },
    /// The current cell is a piecewise function over a status value; each
    /// line patches one condition range with a jump target.
    Conditional {
        condition_max: usize,
        /// Ranges were applied since the cell was last finalized with `;`.
        open: bool,
    },
}

type WordMutator = fn(&mut MicroWord);

/// The control bit a register name drives the bus with (the left side of a
/// `LHS -> RHS` transfer). Unknown names map to `None`.
fn bus_source(identifier: &str) -> Option<WordMutator> {
    match identifier {
        "SDR" => Some(MicroWord::set_sdr_to_bus as WordMutator),
        "IR" => Some(MicroWord::set_ir_to_bus as WordMutator),
        "IAR" => Some(MicroWord::set_iar_to_bus as WordMutator),
        "ONE" => Some(MicroWord::set_one_to_bus as WordMutator),
        "Z" => Some(MicroWord::set_z_to_bus as WordMutator),
        "ACCU" => Some(MicroWord::set_acc_to_bus as WordMutator),
        _ => None,
    }
}

/// The control bit a register name loads from the bus with (the right side
/// of a `LHS -> RHS` transfer). Unknown names map to `None`.
fn bus_target(identifier: &str) -> Option<WordMutator> {
    match identifier {
        "SAR" => Some(MicroWord::set_sar_from_bus as WordMutator),
        "SDR" => Some(MicroWord::set_sdr_from_bus as WordMutator),
        "IR" => Some(MicroWord::set_ir_from_bus as WordMutator),
        "IAR" => Some(MicroWord::set_iar_from_bus as WordMutator),
        "X" => Some(MicroWord::set_x_from_bus as WordMutator),
        "Y" => Some(MicroWord::set_y_from_bus as WordMutator),
        "ACCU" => Some(MicroWord::set_acc_from_bus as WordMutator),
        _ => None,
    }
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A range bound in a conditional line: a decimal number or the literal
/// `max` standing in for the condition maximum.
fn parse_bound(token: &str, condition_max: usize) -> Option<usize> {
    if token == "max" {
        return Some(condition_max);
    }
    token.parse().ok()
}

/// Compiles microprogram DSL text into a [`MicroProgram`].
///
/// Use the [`MicroAssembler::compile`] family for whole sources, or feed
/// lines one at a time with [`MicroAssembler::add_line`] and seal the result
/// with [`MicroAssembler::finish`].
pub struct MicroAssembler {
    memory: Box<[MicroCell; MICROPROGRAM_SIZE]>,
    /// Address of the microcell currently being built.
    write_cursor: u8,
    labels: FxHashMap<String, u8>,
    pending_resolutions: FxHashMap<String, Vec<PendingJump>>,
    mode: CompileMode,
    warnings: Vec<String>,
    line_number: usize,
}

impl MicroAssembler {
    pub fn new() -> Self {
        let mut assembler = Self {
            memory: Box::new(std::array::from_fn(|_| MicroCell::unconditional())),
            write_cursor: 0,
            labels: FxHashMap::default(),
            pending_resolutions: FxHashMap::default(),
            mode: CompileMode::Default { fixed_jump: false },
            warnings: Vec::new(),
            line_number: 0,
        };

        // 0xFF is reserved for halt: bind the label and make the cell jump
        // to itself for every status value.
        assembler.labels.insert("halt".to_string(), HALT_RESERVED);
        assembler.memory[HALT_RESERVED as usize]
            .apply_range(|word| word.set_next_address(HALT_RESERVED), 0, 0xFF);

        tracing::debug!("initialized microassembler, 'halt' bound to 0x{:02X}", HALT_RESERVED);
        assembler
    }

    /// Compile a whole source string.
    pub fn compile(source: &str) -> Result<MicroProgram, CompilerError> {
        let span = tracing::info_span!("compile_microprogram", source_length = source.len());
        let _guard = span.enter();

        Self::compile_lines(source.lines())
    }

    /// Compile from any stream of source lines.
    pub fn compile_lines<'a, I>(lines: I) -> Result<MicroProgram, CompilerError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut assembler = Self::new();
        for line in lines {
            assembler.add_line(line)?;
        }
        Ok(assembler.finish())
    }

    /// Compile the contents of a file. A file that cannot be read turns
    /// into a [`CompilerError`].
    pub fn compile_file(path: impl AsRef<Path>) -> Result<MicroProgram, CompilerError> {
        let path = path.as_ref();
        tracing::info!("compiling microprogram from '{}'", path.display());

        let source = fs::read_to_string(path).map_err(|err| {
            CompilerError::new(
                format!("failed to open microprogram file '{}': {err}", path.display()),
                0,
            )
        })?;
        Self::compile(&source)
    }

    /// Feed one source line to the assembler. Comments (`//` to end of
    /// line) and blank lines are ignored; `!` directives switch the compile
    /// mode; everything else goes to the current mode.
    pub fn add_line(&mut self, line: &str) -> Result<(), CompilerError> {
        let line_number = self.line_number;
        self.line_number += 1;

        let code = line.split("//").next().unwrap_or("").trim();
        if code.is_empty() {
            return Ok(());
        }

        if let Some(directive) = code.strip_prefix('!') {
            return self.add_directive(directive.trim(), line_number);
        }

        if matches!(self.mode, CompileMode::Default { .. }) {
            self.add_default_line(code, line_number)
        } else {
            self.add_conditional_line(code, line_number)
        }
    }

    /// Warnings collected so far. Warnings never abort compilation.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Close the current mode, warn about every still-pending forward
    /// reference and seal the control store.
    pub fn finish(mut self) -> MicroProgram {
        self.close_mode();

        let mut unresolved: Vec<String> = self.pending_resolutions.keys().cloned().collect();
        unresolved.sort();
        for label in unresolved {
            let dangling = self.pending_resolutions[&label].len();
            self.warn(format!(
                "unresolved forward reference to '{label}' ({dangling} jump(s) left dangling)"
            ));
        }

        tracing::info!(
            "finished microprogram compilation at 0x{:02X} with {} warning(s)",
            self.write_cursor,
            self.warnings.len()
        );
        MicroProgram::new(self.memory)
    }

    // --- directives ---

    fn add_directive(&mut self, directive: &str, line_number: usize) -> Result<(), CompilerError> {
        let span = tracing::debug_span!("directive", directive, line = line_number);
        let _guard = span.enter();

        let Some((function, rest)) = directive.split_once('(') else {
            return Err(CompilerError::new(
                format!("unrecognized compiler directive '!{directive}'"),
                line_number,
            ));
        };
        let Some(arguments) = rest.strip_suffix(')') else {
            return Err(CompilerError::new(
                format!("missing ')' in compiler directive '!{directive}'"),
                line_number,
            ));
        };

        let function = function.trim();
        if function != "cm" {
            return Err(CompilerError::new(
                format!("unknown compiler directive function '{function}'"),
                line_number,
            ));
        }

        let arguments: Vec<&str> = arguments.split(',').map(str::trim).collect();
        match arguments.first().copied() {
            Some("default") => {
                if arguments.len() != 1 {
                    return Err(CompilerError::new(
                        format!("expected one argument for !cm(default), found {}", arguments.len()),
                        line_number,
                    ));
                }

                self.close_mode();
                self.mode = CompileMode::Default { fixed_jump: false };
                tracing::debug!("switched to default compile mode");
                Ok(())
            }
            Some("conditional") => {
                if arguments.len() != 3 {
                    return Err(CompilerError::new(
                        format!(
                            "expected three arguments for !cm(conditional, ..), found {}",
                            arguments.len()
                        ),
                        line_number,
                    ));
                }

                let condition = arguments[1];
                let condition_max: usize = arguments[2].parse().map_err(|_| {
                    CompilerError::new(
                        format!("can't use '{}' as a condition maximum", arguments[2]),
                        line_number,
                    )
                })?;

                self.close_mode();
                self.reset_current_cell(condition, condition_max);
                self.mode = CompileMode::Conditional {
                    condition_max,
                    open: false,
                };
                tracing::debug!(condition, condition_max, "switched to conditional compile mode");
                Ok(())
            }
            _ => Err(CompilerError::new(
                format!("unknown compile mode '{}'", arguments.first().copied().unwrap_or("")),
                line_number,
            )),
        }
    }

    // --- default mode ---

    fn add_default_line(&mut self, code: &str, line_number: usize) -> Result<(), CompilerError> {
        let span = tracing::debug_span!("default_line", line = line_number, cursor = self.write_cursor);
        let _guard = span.enter();

        let mut rest = code;
        if let Some((head, tail)) = code.split_once(':') {
            let head = head.trim();
            if is_identifier(head) {
                self.register_label(head);
                rest = tail;
            }
        }

        // instructions are ';'-terminated; anything after the last ';' is a
        // dangling fragment
        let mut fragments: Vec<&str> = rest.split(';').collect();
        let trailing = fragments.pop().unwrap_or("").trim();
        if !trailing.is_empty() {
            return Err(CompilerError::new(
                format!("unterminated instruction '{trailing}'"),
                line_number,
            ));
        }

        for instruction in fragments {
            let instruction = instruction.trim();
            if instruction.is_empty() {
                continue;
            }
            self.add_instruction(instruction, line_number)?;
        }

        self.end_default_line();
        Ok(())
    }

    fn add_instruction(&mut self, instruction: &str, line_number: usize) -> Result<(), CompilerError> {
        tracing::trace!(instruction, "compiling instruction");

        // jump: #label
        if let Some(label) = instruction.strip_prefix('#') {
            let label = label.trim();
            if matches!(self.mode, CompileMode::Default { fixed_jump: true }) {
                self.warn(format!(
                    "line {line_number}: fixed jump already set at 0x{:02X}, ignoring '#{label}'",
                    self.write_cursor
                ));
                return Ok(());
            }
            self.add_jump(label, 0, 0xFF);
            if let CompileMode::Default { fixed_jump } = &mut self.mode {
                *fixed_jump = true;
            }
            return Ok(());
        }

        // register transfer: LHS -> RHS (LHS drives the bus, RHS loads it)
        if let Some((lhs, rhs)) = instruction.split_once("->") {
            let lhs = lhs.trim();
            let rhs = rhs.trim();

            let drive = bus_source(lhs);
            if drive.is_none() {
                self.warn(format!(
                    "line {line_number}: unknown bus source '{lhs}', mapping to a no-op"
                ));
            }
            let load = bus_target(rhs);
            if load.is_none() {
                self.warn(format!(
                    "line {line_number}: unknown bus target '{rhs}', mapping to a no-op"
                ));
            }

            let drive = drive.unwrap_or(MicroWord::pass as WordMutator);
            let load = load.unwrap_or(MicroWord::pass as WordMutator);
            self.current_cell_apply(
                move |word| {
                    drive(word);
                    load(word);
                },
                0,
                0xFF,
            );
            return Ok(());
        }

        // assignment: R = 0|1, W = 0|1, ALU = <name>
        if let Some((lhs, rhs)) = instruction.split_once('=') {
            let lhs = lhs.trim();
            let rhs = rhs.trim();
            match lhs {
                "R" => match rhs {
                    "1" => self.current_cell_apply(|word| word.set_memory_read(), 0, 0xFF),
                    "0" => self.current_cell_apply(|word| word.clear_memory_read(), 0, 0xFF),
                    _ => self.warn(format!(
                        "line {line_number}: 'R' can only be assigned 0 or 1, ignoring '{rhs}'"
                    )),
                },
                "W" => match rhs {
                    "1" => self.current_cell_apply(|word| word.set_memory_write(), 0, 0xFF),
                    "0" => self.current_cell_apply(|word| word.clear_memory_write(), 0, 0xFF),
                    _ => self.warn(format!(
                        "line {line_number}: 'W' can only be assigned 0 or 1, ignoring '{rhs}'"
                    )),
                },
                "ALU" => {
                    let op = match AluOp::from_name(rhs) {
                        Some(op) => op,
                        None => {
                            self.warn(format!(
                                "line {line_number}: unknown ALU operation '{rhs}', mapping to a no-op"
                            ));
                            AluOp::Pass
                        }
                    };
                    self.current_cell_apply(move |word| word.set_alu_op(op), 0, 0xFF);
                }
                _ => self.warn(format!(
                    "line {line_number}: unknown assignment target '{lhs}', ignoring"
                )),
            }
            return Ok(());
        }

        Err(CompilerError::new(
            format!("unknown instruction '{instruction}'"),
            line_number,
        ))
    }

    /// End of a default-mode line: without an explicit jump the cell falls
    /// through to the next address, then the cursor moves on.
    fn end_default_line(&mut self) {
        if !matches!(self.mode, CompileMode::Default { fixed_jump: true }) {
            let next = self.write_cursor.wrapping_add(1);
            tracing::trace!("automatic jump 0x{:02X} -> 0x{:02X}", self.write_cursor, next);
            self.current_cell_apply(move |word| word.set_next_address(next), 0, 0xFF);
        }
        if let CompileMode::Default { fixed_jump } = &mut self.mode {
            *fixed_jump = false;
        }
        self.advance_cursor();
    }

    // --- conditional mode ---

    fn add_conditional_line(&mut self, code: &str, line_number: usize) -> Result<(), CompilerError> {
        let span = tracing::debug_span!("conditional_line", line = line_number, cursor = self.write_cursor);
        let _guard = span.enter();

        let CompileMode::Conditional { condition_max, .. } = self.mode else {
            return Err(CompilerError::new(
                "conditional line outside conditional mode",
                line_number,
            ));
        };

        let Some(rest) = code.strip_prefix('[') else {
            return Err(CompilerError::new(
                format!("expected '[lo, hi] #label' in conditional mode, found '{code}'"),
                line_number,
            ));
        };
        let Some((range, rest)) = rest.split_once(']') else {
            return Err(CompilerError::new("missing ']' in condition range", line_number));
        };
        let Some((lo, hi)) = range.split_once(',') else {
            return Err(CompilerError::new(
                format!("expected two bounds in condition range '[{range}]'"),
                line_number,
            ));
        };

        let lo = parse_bound(lo.trim(), condition_max).ok_or_else(|| {
            CompilerError::new(format!("malformed range bound '{}'", lo.trim()), line_number)
        })?;
        let hi = parse_bound(hi.trim(), condition_max).ok_or_else(|| {
            CompilerError::new(format!("malformed range bound '{}'", hi.trim()), line_number)
        })?;

        let rest = rest.trim();
        let Some(target) = rest.strip_prefix('#') else {
            return Err(CompilerError::new(
                format!("expected '#label' after condition range, found '{rest}'"),
                line_number,
            ));
        };
        let (label, finalize) = match target.strip_suffix(';') {
            Some(label) => (label.trim(), true),
            None => (target.trim(), false),
        };
        if !is_identifier(label) {
            return Err(CompilerError::new(
                format!("malformed jump label '{label}'"),
                line_number,
            ));
        }

        tracing::trace!(label, lo, hi, finalize, "conditional jump range");
        self.add_jump(label, lo, hi);

        if finalize {
            self.advance_cursor();
        }
        if let CompileMode::Conditional { open, .. } = &mut self.mode {
            *open = !finalize;
        }
        Ok(())
    }

    // --- shared pieces ---

    /// Record a label at the write cursor and fire every pending resolver
    /// waiting for it, in insertion order.
    fn register_label(&mut self, label: &str) {
        tracing::debug!("label '{}' at 0x{:02X}", label, self.write_cursor);
        if self.labels.insert(label.to_string(), self.write_cursor).is_some() {
            self.warn(format!("duplicate label '{label}', using the newest definition"));
        }

        let address = self.write_cursor;
        if let Some(resolvers) = self.pending_resolutions.remove(label) {
            let mut remaining = Vec::new();
            for resolver in resolvers {
                if !resolver.resolve(&mut self.memory, address) {
                    remaining.push(resolver);
                }
            }
            if !remaining.is_empty() {
                self.pending_resolutions.insert(label.to_string(), remaining);
            }
        }
    }

    /// Set the next-address field of the current cell for `[lo..hi]`, either
    /// immediately or through a pending resolution once the label shows up.
    fn add_jump(&mut self, label: &str, lo: usize, hi: usize) {
        if let Some(&address) = self.labels.get(label) {
            tracing::trace!(
                "jump from 0x{:02X} to '{}' at 0x{:02X} for [{}..{}]",
                self.write_cursor,
                label,
                address,
                lo,
                hi
            );
            self.current_cell_apply(move |word| word.set_next_address(address), lo, hi);
        } else {
            tracing::trace!("deferring jump from 0x{:02X} to unknown '{}'", self.write_cursor, label);
            if self.write_cursor == HALT_RESERVED {
                self.warn(format!(
                    "ignoring jump to '{label}' in reserved halt cell 0x{HALT_RESERVED:02X}"
                ));
                return;
            }
            self.pending_resolutions
                .entry(label.to_string())
                .or_default()
                .push(PendingJump {
                    cell: self.write_cursor,
                    lo,
                    hi,
                });
        }
    }

    /// Mutate the cell under the write cursor. The reserved halt cell is
    /// written once at construction and stays as it is; later writes are
    /// dropped with a warning.
    fn current_cell_apply<F: Fn(&mut MicroWord)>(&mut self, mutator: F, lo: usize, hi: usize) {
        if self.write_cursor == HALT_RESERVED {
            self.warn(format!(
                "ignoring write to reserved halt cell 0x{HALT_RESERVED:02X}"
            ));
            return;
        }
        self.memory[self.write_cursor as usize].apply_range(mutator, lo, hi);
    }

    fn reset_current_cell(&mut self, condition: &str, condition_max: usize) {
        if self.write_cursor == HALT_RESERVED {
            self.warn(format!(
                "ignoring reset of reserved halt cell 0x{HALT_RESERVED:02X}"
            ));
            return;
        }
        self.memory[self.write_cursor as usize].reset_conditional(condition, condition_max);
    }

    fn advance_cursor(&mut self) {
        tracing::debug!(
            "compiled at 0x{:02X}: {}",
            self.write_cursor,
            self.memory[self.write_cursor as usize]
        );
        self.write_cursor = self.write_cursor.wrapping_add(1);
        if self.write_cursor == 0 {
            self.warn("write cursor wrapped past 0xFF, continuing at 0x00".to_string());
        }
    }

    fn close_mode(&mut self) {
        if let CompileMode::Conditional { open: true, .. } = self.mode {
            self.warn(format!(
                "conditional cell at 0x{:02X} was never finalized with ';'",
                self.write_cursor
            ));
        }
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("{message}");
        self.warnings.push(message);
    }
}

impl Default for MicroAssembler {
    fn default() -> Self {
        Self::new()
    }
}
