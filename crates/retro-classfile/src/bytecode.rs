//! JVM instruction decoding and encoding.
//!
//! Instructions without pc-relative operands are carried verbatim ([`Insn::Plain`]); branches
//! and switches keep their targets as absolute offsets so that a body can be re-laid out after
//! instructions are inserted or replaced.

use crate::descriptor::{BaseType, FieldType, ReturnType};
use crate::error::{Error, Result};
use crate::reader::{Reader, Writer};

pub const ACONST_NULL: u8 = 0x01;
pub const ICONST_0: u8 = 0x03;
pub const BIPUSH: u8 = 0x10;
pub const LDC_W: u8 = 0x13;
pub const ILOAD: u8 = 0x15;
pub const LLOAD: u8 = 0x16;
pub const FLOAD: u8 = 0x17;
pub const DLOAD: u8 = 0x18;
pub const ALOAD: u8 = 0x19;
pub const ILOAD_0: u8 = 0x1a;
pub const LLOAD_0: u8 = 0x1e;
pub const FLOAD_0: u8 = 0x22;
pub const DLOAD_0: u8 = 0x26;
pub const ALOAD_0: u8 = 0x2a;
pub const ALOAD_1: u8 = 0x2b;
pub const ISTORE: u8 = 0x36;
pub const LSTORE: u8 = 0x37;
pub const FSTORE: u8 = 0x38;
pub const DSTORE: u8 = 0x39;
pub const ASTORE: u8 = 0x3a;
pub const ISTORE_0: u8 = 0x3b;
pub const LSTORE_0: u8 = 0x3f;
pub const FSTORE_0: u8 = 0x43;
pub const DSTORE_0: u8 = 0x47;
pub const ASTORE_0: u8 = 0x4b;
pub const ASTORE_1: u8 = 0x4c;
pub const POP: u8 = 0x57;
pub const DUP: u8 = 0x59;
pub const IINC: u8 = 0x84;
pub const IFEQ: u8 = 0x99;
pub const IFNE: u8 = 0x9a;
pub const GOTO: u8 = 0xa7;
pub const JSR: u8 = 0xa8;
pub const RET: u8 = 0xa9;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;
pub const IRETURN: u8 = 0xac;
pub const LRETURN: u8 = 0xad;
pub const FRETURN: u8 = 0xae;
pub const DRETURN: u8 = 0xaf;
pub const ARETURN: u8 = 0xb0;
pub const RETURN: u8 = 0xb1;
pub const GETSTATIC: u8 = 0xb2;
pub const PUTSTATIC: u8 = 0xb3;
pub const INVOKEVIRTUAL: u8 = 0xb6;
pub const INVOKESPECIAL: u8 = 0xb7;
pub const INVOKESTATIC: u8 = 0xb8;
pub const INVOKEINTERFACE: u8 = 0xb9;
pub const INVOKEDYNAMIC: u8 = 0xba;
pub const NEW: u8 = 0xbb;
pub const CHECKCAST: u8 = 0xc0;
pub const WIDE: u8 = 0xc4;
pub const IFNULL: u8 = 0xc6;
pub const IFNONNULL: u8 = 0xc7;
pub const GOTO_W: u8 = 0xc8;
pub const JSR_W: u8 = 0xc9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    /// An instruction without pc-relative operands, as encoded.
    Plain(Vec<u8>),
    /// `if*`, `goto`, `jsr` and their wide forms.
    Branch { opcode: u8, target: u32 },
    TableSwitch {
        default: u32,
        low: i32,
        targets: Vec<u32>,
    },
    LookupSwitch {
        default: u32,
        pairs: Vec<(i32, u32)>,
    },
}

/// Local-variable/return opcode family for a value type.
#[derive(Clone, Copy)]
enum Kind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl Kind {
    fn of(ty: &FieldType) -> Self {
        match ty {
            FieldType::Base(BaseType::Long) => Kind::Long,
            FieldType::Base(BaseType::Float) => Kind::Float,
            FieldType::Base(BaseType::Double) => Kind::Double,
            FieldType::Base(_) => Kind::Int,
            FieldType::Object(_) | FieldType::Array(_) => Kind::Reference,
        }
    }

    fn offset(self) -> u8 {
        match self {
            Kind::Int => 0,
            Kind::Long => 1,
            Kind::Float => 2,
            Kind::Double => 3,
            Kind::Reference => 4,
        }
    }
}

impl Insn {
    pub fn op(opcode: u8) -> Self {
        Insn::Plain(vec![opcode])
    }

    pub fn with_u1(opcode: u8, operand: u8) -> Self {
        Insn::Plain(vec![opcode, operand])
    }

    pub fn with_u2(opcode: u8, operand: u16) -> Self {
        let [hi, lo] = operand.to_be_bytes();
        Insn::Plain(vec![opcode, hi, lo])
    }

    /// `invokeinterface`; `arg_slots` counts the receiver.
    pub fn invokeinterface(index: u16, arg_slots: u8) -> Self {
        let [hi, lo] = index.to_be_bytes();
        Insn::Plain(vec![INVOKEINTERFACE, hi, lo, arg_slots, 0])
    }

    pub fn load(ty: &FieldType, slot: u16) -> Self {
        let kind = Kind::of(ty);
        local_access(ILOAD + kind.offset(), ILOAD_0 + kind.offset() * 4, slot)
    }

    pub fn store(ty: &FieldType, slot: u16) -> Self {
        let kind = Kind::of(ty);
        local_access(ISTORE + kind.offset(), ISTORE_0 + kind.offset() * 4, slot)
    }

    pub fn return_for(ret: &ReturnType) -> Self {
        match ret {
            ReturnType::Void => Insn::op(RETURN),
            ReturnType::Type(ty) => Insn::op(IRETURN + Kind::of(ty).offset()),
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Insn::Plain(bytes) => bytes[0],
            Insn::Branch { opcode, .. } => *opcode,
            Insn::TableSwitch { .. } => TABLESWITCH,
            Insn::LookupSwitch { .. } => LOOKUPSWITCH,
        }
    }

    /// The two-byte operand following the opcode (a constant pool index for field, method,
    /// class and `ldc_w` instructions).
    pub fn u2_operand(&self) -> Option<u16> {
        match self {
            Insn::Plain(bytes) if bytes.len() >= 3 => Some(u16::from_be_bytes([bytes[1], bytes[2]])),
            _ => None,
        }
    }

    pub(crate) fn size_at(&self, pc: u32, widened: bool) -> u32 {
        match self {
            Insn::Plain(bytes) => bytes.len() as u32,
            Insn::Branch { opcode, .. } => {
                if widened || *opcode == GOTO_W || *opcode == JSR_W {
                    5
                } else {
                    3
                }
            }
            Insn::TableSwitch { targets, .. } => 1 + padding(pc) + 12 + 4 * targets.len() as u32,
            Insn::LookupSwitch { pairs, .. } => 1 + padding(pc) + 8 + 8 * pairs.len() as u32,
        }
    }

    /// Short `goto`/`jsr` can be promoted to their `_w` forms when an offset no longer fits.
    pub(crate) fn is_widenable(&self) -> bool {
        matches!(self, Insn::Branch { opcode, .. } if *opcode == GOTO || *opcode == JSR)
    }

    pub(crate) fn has_short_offset(&self) -> bool {
        matches!(self, Insn::Branch { opcode, .. } if *opcode != GOTO_W && *opcode != JSR_W)
    }

    pub(crate) fn encode(
        &self,
        pc: u32,
        widened: bool,
        target_pc: &dyn Fn(u32) -> Result<u32>,
        out: &mut Writer,
    ) -> Result<()> {
        let relative = |target: u32| -> Result<i32> {
            Ok((i64::from(target_pc(target)?) - i64::from(pc)) as i32)
        };
        match self {
            Insn::Plain(bytes) => out.write_bytes(bytes),
            Insn::Branch { opcode, target } => {
                let offset = relative(*target)?;
                if *opcode == GOTO_W || *opcode == JSR_W {
                    out.write_u1(*opcode);
                    out.write_i4(offset);
                } else if widened {
                    out.write_u1(if *opcode == JSR { JSR_W } else { GOTO_W });
                    out.write_i4(offset);
                } else {
                    let offset =
                        i16::try_from(offset).map_err(|_| Error::BranchOffsetOverflow { pc })?;
                    out.write_u1(*opcode);
                    out.write_u2(offset as u16);
                }
            }
            Insn::TableSwitch {
                default,
                low,
                targets,
            } => {
                out.write_u1(TABLESWITCH);
                for _ in 0..padding(pc) {
                    out.write_u1(0);
                }
                out.write_i4(relative(*default)?);
                out.write_i4(*low);
                out.write_i4(low + targets.len() as i32 - 1);
                for target in targets {
                    out.write_i4(relative(*target)?);
                }
            }
            Insn::LookupSwitch { default, pairs } => {
                out.write_u1(LOOKUPSWITCH);
                for _ in 0..padding(pc) {
                    out.write_u1(0);
                }
                out.write_i4(relative(*default)?);
                out.write_i4(pairs.len() as i32);
                for (key, target) in pairs {
                    out.write_i4(*key);
                    out.write_i4(relative(*target)?);
                }
            }
        }
        Ok(())
    }
}

fn local_access(opcode: u8, short_base: u8, slot: u16) -> Insn {
    match slot {
        0..=3 => Insn::op(short_base + slot as u8),
        4..=255 => Insn::with_u1(opcode, slot as u8),
        _ => {
            let [hi, lo] = slot.to_be_bytes();
            Insn::Plain(vec![WIDE, opcode, hi, lo])
        }
    }
}

/// Switch operands are 4-byte aligned relative to the start of the code array.
fn padding(pc: u32) -> u32 {
    (4 - (pc + 1) % 4) % 4
}

/// Length of instructions with a fixed encoding; `None` for switches, `wide` and invalid
/// opcodes.
fn fixed_length(opcode: u8) -> Option<usize> {
    Some(match opcode {
        0x00..=0x0f => 1,
        0x10 => 2,
        0x11 => 3,
        0x12 => 2,
        0x13 | 0x14 => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        0x84 => 3,
        0x85..=0x98 => 1,
        0x99..=0xa8 => 3,
        0xa9 => 2,
        0xac..=0xb1 => 1,
        0xb2..=0xb8 => 3,
        0xb9 | 0xba => 5,
        0xbb => 3,
        0xbc => 2,
        0xbd => 3,
        0xbe | 0xbf => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        0xc5 => 4,
        0xc6 | 0xc7 => 3,
        0xc8 | 0xc9 => 5,
        0xca => 1,
        _ => return None,
    })
}

fn is_short_branch(opcode: u8) -> bool {
    matches!(opcode, IFEQ..=JSR | IFNULL | IFNONNULL)
}

/// Decodes a code array into `(pc, instruction)` pairs. Every branch target is checked to be
/// an instruction boundary.
pub fn decode(code: &[u8]) -> Result<Vec<(u32, Insn)>> {
    let mut insns = Vec::new();
    let mut pc = 0usize;
    while pc < code.len() {
        let opcode = code[pc];
        let at = pc as u32;
        let target = |offset: i64| -> Result<u32> {
            let target = at as i64 + offset;
            if target < 0 || target >= code.len() as i64 {
                return Err(Error::InvalidCodeOffset(target.max(0) as u32));
            }
            Ok(target as u32)
        };

        let (insn, len) = if is_short_branch(opcode) {
            let mut r = Reader::new(code.get(pc + 1..).unwrap_or_default());
            let offset = r.read_u2()? as i16;
            let insn = Insn::Branch {
                opcode,
                target: target(offset.into())?,
            };
            (insn, 3)
        } else if opcode == GOTO_W || opcode == JSR_W {
            let mut r = Reader::new(code.get(pc + 1..).unwrap_or_default());
            let offset = r.read_i4()?;
            let insn = Insn::Branch {
                opcode,
                target: target(offset.into())?,
            };
            (insn, 5)
        } else if opcode == TABLESWITCH || opcode == LOOKUPSWITCH {
            let operands = pc + 1 + padding(at) as usize;
            let mut r = Reader::new(code.get(operands..).ok_or(Error::UnexpectedEof)?);
            let default = target(r.read_i4()?.into())?;
            let insn = if opcode == TABLESWITCH {
                let low = r.read_i4()?;
                let high = r.read_i4()?;
                if high < low {
                    return Err(Error::MalformedAttribute("tableswitch"));
                }
                let count = (i64::from(high) - i64::from(low) + 1) as usize;
                let mut targets = Vec::with_capacity(count.min(code.len()));
                for _ in 0..count {
                    targets.push(target(r.read_i4()?.into())?);
                }
                Insn::TableSwitch {
                    default,
                    low,
                    targets,
                }
            } else {
                let npairs = r.read_i4()?;
                if npairs < 0 {
                    return Err(Error::MalformedAttribute("lookupswitch"));
                }
                let mut pairs = Vec::with_capacity((npairs as usize).min(code.len()));
                for _ in 0..npairs {
                    let key = r.read_i4()?;
                    pairs.push((key, target(r.read_i4()?.into())?));
                }
                Insn::LookupSwitch { default, pairs }
            };
            let len = operands - pc + r.position();
            (insn, len)
        } else {
            let len = if opcode == WIDE {
                match code.get(pc + 1).copied() {
                    Some(IINC) => 6,
                    Some(0x15..=0x19 | 0x36..=0x3a | RET) => 4,
                    Some(_) => return Err(Error::InvalidOpcode { pc: at, opcode }),
                    None => return Err(Error::UnexpectedEof),
                }
            } else {
                fixed_length(opcode).ok_or(Error::InvalidOpcode { pc: at, opcode })?
            };
            let bytes = code.get(pc..pc + len).ok_or(Error::UnexpectedEof)?;
            (Insn::Plain(bytes.to_vec()), len)
        };

        insns.push((at, insn));
        pc += len;
    }

    let boundaries: std::collections::HashSet<u32> = insns.iter().map(|(pc, _)| *pc).collect();
    for (_, insn) in &insns {
        let ok = match insn {
            Insn::Plain(_) => true,
            Insn::Branch { target, .. } => boundaries.contains(target),
            Insn::TableSwitch {
                default, targets, ..
            } => boundaries.contains(default) && targets.iter().all(|t| boundaries.contains(t)),
            Insn::LookupSwitch { default, pairs } => {
                boundaries.contains(default) && pairs.iter().all(|(_, t)| boundaries.contains(t))
            }
        };
        if !ok {
            return Err(Error::MalformedAttribute("Code"));
        }
    }

    Ok(insns)
}

/// Encodes straight-line instructions. Branch targets are absolute offsets into the produced
/// code; short branches are never widened.
pub fn assemble(insns: &[Insn]) -> Result<Vec<u8>> {
    let mut out = Writer::new();
    for insn in insns {
        let pc = out.len() as u32;
        insn.encode(pc, false, &|target| Ok(target), &mut out)?;
    }
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::parse_field_descriptor;

    #[test]
    fn load_and_store_pick_short_forms_and_wide() {
        let long = parse_field_descriptor("J").unwrap();
        let object = parse_field_descriptor("Ljava/lang/Object;").unwrap();
        let int = parse_field_descriptor("Z").unwrap();

        assert_eq!(Insn::load(&object, 0), Insn::op(ALOAD_0));
        assert_eq!(Insn::load(&long, 3), Insn::op(LLOAD_0 + 3));
        assert_eq!(Insn::store(&int, 7), Insn::with_u1(ISTORE, 7));
        assert_eq!(Insn::store(&object, 300), Insn::Plain(vec![WIDE, ASTORE, 0x01, 0x2c]));
    }

    #[test]
    fn decode_resolves_branch_and_switch_targets() {
        // 0: iload_0
        // 1: tableswitch (2 pad bytes) default -> 28, low 0, high 1, targets [24, 28]
        // 24: iconst_1
        // 25: goto 28
        // 28: return
        let mut code = vec![ILOAD_0, TABLESWITCH, 0, 0];
        code.extend_from_slice(&27i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&23i32.to_be_bytes());
        code.extend_from_slice(&27i32.to_be_bytes());
        code.extend_from_slice(&[0x04, GOTO, 0x00, 0x03]);
        code.push(RETURN);

        let insns = decode(&code).unwrap();
        let pcs: Vec<u32> = insns.iter().map(|(pc, _)| *pc).collect();
        assert_eq!(pcs, vec![0, 1, 24, 25, 28]);
        assert_eq!(
            insns[1].1,
            Insn::TableSwitch {
                default: 28,
                low: 0,
                targets: vec![24, 28],
            }
        );
        assert_eq!(
            insns[3].1,
            Insn::Branch {
                opcode: GOTO,
                target: 28
            }
        );

        let reencoded = assemble(&insns.into_iter().map(|(_, insn)| insn).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(reencoded, code);
    }

    #[test]
    fn decode_rejects_targets_inside_instructions() {
        // goto +1 lands inside the goto itself.
        let code = vec![GOTO, 0x00, 0x01, RETURN];
        assert!(decode(&code).is_err());
    }

    #[test]
    fn decode_handles_wide_iinc() {
        let code = vec![WIDE, IINC, 0x01, 0x00, 0x00, 0x05, RETURN];
        let insns = decode(&code).unwrap();
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[1].0, 6);
    }
}
