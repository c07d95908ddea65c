//! Bytecode encoding of a compiled task graph.
//!
//! A program is a flat byte buffer: one opcode byte followed by a fixed number
//! of little-endian `i32` operands. The layout is
//!
//! ```text
//! SETUP(contexts, stacks, dep_lists)
//! CONTEXT(device)*
//! BEGIN
//! ( ALLOCATE | COPY_IN | STREAM_IN | STREAM_OUT | LAUNCH args* | ADD_DEP )*
//! BARRIER(dep_list) | STREAM_OUT_BLOCKING
//! END
//! ```
//!
//! Decoding lives in [`crate::runtime::executor::decode`].

use std::fmt::{self, Write as _};

/// Operand value for "no dependency list".
pub const NO_DEP: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    End = 0,
    Setup = 10,
    Begin = 11,
    Allocate = 19,
    CopyIn = 20,
    Context = 21,
    StreamIn = 22,
    StreamOut = 23,
    AddDep = 24,
    StreamOutBlocking = 25,
    Launch = 26,
    Barrier = 27,
    ConstantArg = 32,
    ReferenceArg = 33,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Opcode::End,
            10 => Opcode::Setup,
            11 => Opcode::Begin,
            19 => Opcode::Allocate,
            20 => Opcode::CopyIn,
            21 => Opcode::Context,
            22 => Opcode::StreamIn,
            23 => Opcode::StreamOut,
            24 => Opcode::AddDep,
            25 => Opcode::StreamOutBlocking,
            26 => Opcode::Launch,
            27 => Opcode::Barrier,
            32 => Opcode::ConstantArg,
            33 => Opcode::ReferenceArg,
            _ => return None,
        })
    }

    /// Number of `i32` operands following the opcode byte.
    pub fn operands(self) -> usize {
        match self {
            Opcode::End | Opcode::Begin => 0,
            Opcode::Context | Opcode::AddDep | Opcode::Barrier | Opcode::ConstantArg | Opcode::ReferenceArg => 1,
            Opcode::Allocate => 2,
            Opcode::Setup | Opcode::CopyIn | Opcode::StreamIn | Opcode::StreamOut | Opcode::StreamOutBlocking => 3,
            Opcode::Launch => 5,
        }
    }

    pub fn encoded_len(self) -> usize {
        1 + 4 * self.operands()
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::End => "END",
            Opcode::Setup => "SETUP",
            Opcode::Begin => "BEGIN",
            Opcode::Allocate => "ALLOCATE",
            Opcode::CopyIn => "COPY_IN",
            Opcode::Context => "CONTEXT",
            Opcode::StreamIn => "STREAM_IN",
            Opcode::StreamOut => "STREAM_OUT",
            Opcode::AddDep => "ADD_DEP",
            Opcode::StreamOutBlocking => "STREAM_OUT_BLOCKING",
            Opcode::Launch => "LAUNCH",
            Opcode::Barrier => "BARRIER",
            Opcode::ConstantArg => "CONSTANT_ARG",
            Opcode::ReferenceArg => "REFERENCE_ARG",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

fn operand(value: usize) -> i32 {
    i32::try_from(value).unwrap_or_else(|_| panic!("bytecode operand {value} does not fit in i32"))
}

/// Encoder for the bytecode format. Knows nothing about graphs.
#[derive(Debug, Clone, Default)]
pub struct GraphAssembler {
    buffer: Vec<u8>,
}

impl GraphAssembler {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Rewinds the write cursor, keeping the allocation.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    fn op(&mut self, opcode: Opcode, operands: &[i32]) -> usize {
        debug_assert_eq!(operands.len(), opcode.operands());
        let at = self.buffer.len();
        self.buffer.push(opcode as u8);
        for value in operands {
            self.buffer.extend_from_slice(&value.to_le_bytes());
        }
        at
    }

    pub fn setup(&mut self, contexts: usize, stacks: usize, dep_lists: usize) -> usize {
        self.op(Opcode::Setup, &[operand(contexts), operand(stacks), operand(dep_lists)])
    }

    pub fn context(&mut self, device: usize) -> usize {
        self.op(Opcode::Context, &[operand(device)])
    }

    pub fn begin(&mut self) -> usize {
        self.op(Opcode::Begin, &[])
    }

    pub fn allocate(&mut self, object: usize, context: usize) -> usize {
        self.op(Opcode::Allocate, &[operand(object), operand(context)])
    }

    pub fn copy_in(&mut self, object: usize, context: usize, dep: i32) -> usize {
        self.op(Opcode::CopyIn, &[operand(object), operand(context), dep])
    }

    pub fn stream_in(&mut self, object: usize, context: usize, dep: i32) -> usize {
        self.op(Opcode::StreamIn, &[operand(object), operand(context), dep])
    }

    pub fn stream_out(&mut self, object: usize, context: usize, dep: i32) -> usize {
        self.op(Opcode::StreamOut, &[operand(object), operand(context), dep])
    }

    pub fn stream_out_blocking(&mut self, object: usize, context: usize, dep: i32) -> usize {
        self.op(Opcode::StreamOutBlocking, &[operand(object), operand(context), dep])
    }

    pub fn launch(&mut self, gtid: usize, context: usize, task: usize, num_args: usize, dep: i32) -> usize {
        self.op(
            Opcode::Launch,
            &[operand(gtid), operand(context), operand(task), operand(num_args), dep],
        )
    }

    pub fn constant_arg(&mut self, slot: usize) -> usize {
        self.op(Opcode::ConstantArg, &[operand(slot)])
    }

    pub fn reference_arg(&mut self, slot: usize) -> usize {
        self.op(Opcode::ReferenceArg, &[operand(slot)])
    }

    pub fn add_dep(&mut self, list: usize) -> usize {
        self.op(Opcode::AddDep, &[operand(list)])
    }

    pub fn barrier(&mut self, list: usize) -> usize {
        self.op(Opcode::Barrier, &[operand(list)])
    }

    pub fn end(&mut self) -> usize {
        self.op(Opcode::End, &[])
    }

    /// Overwrites the opcode byte at `at`. Both opcodes must share an
    /// operand layout.
    pub fn patch_opcode(&mut self, at: usize, opcode: Opcode) {
        let old = self.buffer.get(at).copied().and_then(Opcode::from_byte);
        assert!(
            old.map_or(false, |o| o.operands() == opcode.operands()),
            "cannot patch {old:?} at {at} into {opcode}"
        );
        self.buffer[at] = opcode as u8;
    }

    pub fn dump(&self) -> String {
        hex_dump(&self.buffer)
    }

    pub fn finish(self, num_contexts: usize, num_stacks: usize, num_dep_lists: usize) -> CompiledProgram {
        CompiledProgram {
            code: self.buffer,
            num_contexts,
            num_stacks,
            num_dep_lists,
        }
    }
}

/// Hex and ASCII view, 16 bytes per row.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", row * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        out.extend(chunk.iter().map(|&b| if b.is_ascii_graphic() { b as char } else { '.' }));
        out.push_str("|\n");
    }
    out
}

/// Text listing of `code`. Stops at the first byte that is not an opcode or
/// at a truncated instruction.
pub fn disassemble(code: &[u8]) -> String {
    let mut out = String::new();
    let mut pos = 0;
    while let Some(opcode) = code.get(pos).copied().and_then(Opcode::from_byte) {
        let end = pos + opcode.encoded_len();
        let Some(raw) = code.get(pos + 1..end) else {
            let _ = writeln!(out, "{pos:6}: {opcode} <truncated>");
            return out;
        };
        let operands: Vec<String> = raw
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]).to_string())
            .collect();
        let indent = match opcode {
            Opcode::ConstantArg | Opcode::ReferenceArg => "  ",
            _ => "",
        };
        let _ = writeln!(out, "{pos:6}: {indent}{opcode} {}", operands.join(", "));
        pos = end;
    }
    if pos < code.len() {
        let _ = writeln!(out, "{pos:6}: <invalid opcode {}>", code[pos]);
    }
    out
}

/// A finished program. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledProgram {
    code: Vec<u8>,
    num_contexts: usize,
    num_stacks: usize,
    num_dep_lists: usize,
}

impl CompiledProgram {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn num_contexts(&self) -> usize {
        self.num_contexts
    }

    pub fn num_stacks(&self) -> usize {
        self.num_stacks
    }

    pub fn num_dep_lists(&self) -> usize {
        self.num_dep_lists
    }

    /// Hex view of the raw bytes.
    pub fn hex(&self) -> String {
        hex_dump(&self.code)
    }

    /// One instruction per line, `offset: MNEMONIC operands`.
    pub fn dump(&self) -> String {
        disassemble(&self.code)
    }
}
