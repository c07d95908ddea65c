use crate::error::{Error, Result};
use crate::runtime::plan::Opcode;

/// One decoded bytecode instruction. Slot and index operands are checked to
/// be non-negative; `dep` is `None` for "no dependency list".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    End,
    Setup { contexts: usize, stacks: usize, dep_lists: usize },
    Begin,
    Allocate { object: usize, context: usize },
    CopyIn { object: usize, context: usize, dep: Option<usize> },
    Context { device: usize },
    StreamIn { object: usize, context: usize, dep: Option<usize> },
    StreamOut { object: usize, context: usize, dep: Option<usize> },
    AddDep { list: usize },
    StreamOutBlocking { object: usize, context: usize, dep: Option<usize> },
    Launch { gtid: usize, context: usize, task: usize, num_args: usize, dep: Option<usize> },
    Barrier { list: usize },
    ConstantArg { slot: usize },
    ReferenceArg { slot: usize },
}

/// Streaming decoder over a program's bytes. Yields `(offset, instruction)`
/// and stops after the first error.
pub struct Decoder<'a> {
    code: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Decoder<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self::at(code, 0)
    }

    pub fn at(code: &'a [u8], pos: usize) -> Self {
        Self {
            code,
            pos,
            failed: false,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn decode(&mut self) -> Result<(usize, Instruction)> {
        let offset = self.pos;
        let byte = self.code[offset];
        let opcode = Opcode::from_byte(byte).ok_or_else(|| Error::bytecode(offset, format!("unknown opcode {byte}")))?;
        let end = offset + opcode.encoded_len();
        if end > self.code.len() {
            return Err(Error::bytecode(offset, format!("truncated {opcode}")));
        }
        let mut raw = [0i32; 5];
        for (i, chunk) in self.code[offset + 1..end].chunks_exact(4).enumerate() {
            raw[i] = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let index = |i: usize| -> Result<usize> {
            usize::try_from(raw[i]).map_err(|_| Error::bytecode(offset, format!("negative operand {} of {opcode}", raw[i])))
        };
        let dep = |i: usize| -> Result<Option<usize>> {
            match raw[i] {
                -1 => Ok(None),
                _ => index(i).map(Some),
            }
        };

        let instruction = match opcode {
            Opcode::End => Instruction::End,
            Opcode::Setup => Instruction::Setup {
                contexts: index(0)?,
                stacks: index(1)?,
                dep_lists: index(2)?,
            },
            Opcode::Begin => Instruction::Begin,
            Opcode::Allocate => Instruction::Allocate {
                object: index(0)?,
                context: index(1)?,
            },
            Opcode::CopyIn => Instruction::CopyIn {
                object: index(0)?,
                context: index(1)?,
                dep: dep(2)?,
            },
            Opcode::Context => Instruction::Context { device: index(0)? },
            Opcode::StreamIn => Instruction::StreamIn {
                object: index(0)?,
                context: index(1)?,
                dep: dep(2)?,
            },
            Opcode::StreamOut => Instruction::StreamOut {
                object: index(0)?,
                context: index(1)?,
                dep: dep(2)?,
            },
            Opcode::AddDep => Instruction::AddDep { list: index(0)? },
            Opcode::StreamOutBlocking => Instruction::StreamOutBlocking {
                object: index(0)?,
                context: index(1)?,
                dep: dep(2)?,
            },
            Opcode::Launch => Instruction::Launch {
                gtid: index(0)?,
                context: index(1)?,
                task: index(2)?,
                num_args: index(3)?,
                dep: dep(4)?,
            },
            Opcode::Barrier => Instruction::Barrier { list: index(0)? },
            Opcode::ConstantArg => Instruction::ConstantArg { slot: index(0)? },
            Opcode::ReferenceArg => Instruction::ReferenceArg { slot: index(0)? },
        };
        self.pos = end;
        Ok((offset, instruction))
    }
}

impl Iterator for Decoder<'_> {
    type Item = Result<(usize, Instruction)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.code.len() {
            return None;
        }
        let item = self.decode();
        self.failed = item.is_err();
        Some(item)
    }
}

pub fn decode_all(code: &[u8]) -> Result<Vec<Instruction>> {
    Decoder::new(code).map(|item| item.map(|(_, i)| i)).collect()
}
