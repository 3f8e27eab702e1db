//! Instruction cursor: decodes `(opcode, operand, next_position)` from the
//! raw instruction buffer, folding EXTENDED_ARG prefixes and normalizing the
//! pre-wordcode and wordcode encodings.

use byteorder::{ByteOrder, LittleEndian};

use crate::tables::{lookup, Opcode, OperandClass, Version, HAVE_ARGUMENT};
use crate::DepycError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instr {
    pub opcode: Opcode,
    pub class: OperandClass,
    pub operand: u32,
    /// Offset of the first byte of this instruction (its EXTENDED_ARG prefix
    /// included).
    pub offset: u32,
    /// Offset of the following instruction.
    pub next: u32,
}

pub struct InstrCursor<'a> {
    code: &'a [u8],
    pos: u32,
    version: Version,
}

impl<'a> InstrCursor<'a> {
    pub fn new(code: &'a [u8], version: Version) -> Self {
        Self { code, pos: 0, version }
    }

    pub fn pos(&self) -> u32 {
        self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos as usize >= self.code.len()
    }

    /// Reposition the cursor; used to step over compiler cleanup sequences
    /// that are only reachable through an already-folded branch.
    pub fn jump_to(&mut self, pos: u32) {
        if pos > self.pos && (pos as usize) <= self.code.len() {
            self.pos = pos;
        }
    }

    pub fn next(&mut self) -> Result<Instr, DepycError> {
        let offset = self.pos;
        let mut ext: u32 = 0;
        loop {
            let raw = *self
                .code
                .get(self.pos as usize)
                .ok_or(DepycError::Eof)?;
            let (opcode, class) = lookup(self.version, raw).ok_or(DepycError::UnknownOpcode {
                opcode: raw,
                pos: self.pos,
                version: self.version,
            })?;

            if self.version.wordcode() {
                let arg = *self
                    .code
                    .get(self.pos as usize + 1)
                    .ok_or(DepycError::TruncatedInstruction { pos: self.pos })?;
                self.pos += 2;
                if opcode == Opcode::ExtendedArg {
                    ext = (ext | arg as u32) << 8;
                    continue;
                }
                return Ok(Instr {
                    opcode,
                    class,
                    operand: ext | arg as u32,
                    offset,
                    next: self.pos,
                });
            }

            self.pos += 1;
            if raw < HAVE_ARGUMENT {
                return Ok(Instr {
                    opcode,
                    class,
                    operand: 0,
                    offset,
                    next: self.pos,
                });
            }
            if self.code.len() - (self.pos as usize) < 2 {
                return Err(DepycError::TruncatedInstruction { pos: offset });
            }
            let arg = LittleEndian::read_u16(&self.code[self.pos as usize..]) as u32;
            self.pos += 2;
            if opcode == Opcode::ExtendedArg {
                ext = arg << 16;
                continue;
            }
            return Ok(Instr {
                opcode,
                class,
                operand: ext | arg,
                offset,
                next: self.pos,
            });
        }
    }
}

/// Resolve a jump operand to a byte offset. 3.10 switched operands to
/// instruction units; 3.11 added relative-backward variants.
pub fn jump_target(version: Version, instr: &Instr) -> u32 {
    let scale = if version.at_least(3, 10) { 2 } else { 1 };
    match instr.class {
        OperandClass::JumpAbs => instr.operand * scale,
        OperandClass::JumpRel => {
            let delta = instr.operand * scale;
            if is_backward_jump(instr.opcode) {
                instr.next.saturating_sub(delta)
            } else {
                instr.next + delta
            }
        }
        _ => instr.operand,
    }
}

pub fn is_backward_jump(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::JumpBackward
            | Opcode::JumpBackwardNoInterrupt
            | Opcode::PopJumpBackwardIfFalse
            | Opcode::PopJumpBackwardIfTrue
            | Opcode::PopJumpBackwardIfNone
            | Opcode::PopJumpBackwardIfNotNone
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_encoding() {
        // 2.7: LOAD_CONST 1; RETURN_VALUE
        let code = [100u8, 1, 0, 83];
        let mut c = InstrCursor::new(&code, Version::new(2, 7));
        let i = c.next().unwrap();
        assert_eq!(i.opcode, Opcode::LoadConst);
        assert_eq!(i.operand, 1);
        assert_eq!((i.offset, i.next), (0, 3));
        let i = c.next().unwrap();
        assert_eq!(i.opcode, Opcode::ReturnValue);
        assert_eq!((i.offset, i.next), (3, 4));
        assert!(c.at_end());
    }

    #[test]
    fn wordcode_encoding() {
        // 3.8: LOAD_CONST 1; RETURN_VALUE
        let code = [100u8, 1, 83, 0];
        let mut c = InstrCursor::new(&code, Version::new(3, 8));
        let i = c.next().unwrap();
        assert_eq!(i.opcode, Opcode::LoadConst);
        assert_eq!(i.operand, 1);
        assert_eq!(i.next, 2);
    }

    #[test]
    fn extended_arg_accumulates() {
        // 3.8: EXTENDED_ARG 1; LOAD_CONST 4 -> operand 0x104
        let code = [144u8, 1, 100, 4];
        let mut c = InstrCursor::new(&code, Version::new(3, 8));
        let i = c.next().unwrap();
        assert_eq!(i.opcode, Opcode::LoadConst);
        assert_eq!(i.operand, 0x104);
        assert_eq!(i.offset, 0);
        assert_eq!(i.next, 4);

        // 2.7: EXTENDED_ARG 2; LOAD_CONST 5 -> operand 0x20005
        let code = [145u8, 2, 0, 100, 5, 0];
        let mut c = InstrCursor::new(&code, Version::new(2, 7));
        let i = c.next().unwrap();
        assert_eq!(i.opcode, Opcode::LoadConst);
        assert_eq!(i.operand, 0x20005);
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let code = [255u8, 0];
        let mut c = InstrCursor::new(&code, Version::new(3, 8));
        assert!(matches!(
            c.next(),
            Err(DepycError::UnknownOpcode { opcode: 255, .. })
        ));
    }

    #[test]
    fn jump_scaling() {
        let v38 = Version::new(3, 8);
        let v310 = Version::new(3, 10);
        let fwd = Instr {
            opcode: Opcode::JumpForward,
            class: OperandClass::JumpRel,
            operand: 6,
            offset: 10,
            next: 12,
        };
        assert_eq!(jump_target(v38, &fwd), 18);
        assert_eq!(jump_target(v310, &fwd), 24);
        let back = Instr {
            opcode: Opcode::JumpBackward,
            class: OperandClass::JumpRel,
            operand: 3,
            offset: 10,
            next: 12,
        };
        assert_eq!(jump_target(Version::new(3, 11), &back), 6);
    }
}
