//! Instruction-level edits to a method body.
//!
//! A [`CodePatch`] collects edits keyed by the offset of an existing instruction. Applying it
//! re-lays out the whole body: branch and switch targets are re-resolved, short `goto`/`jsr`
//! are widened when their offsets overflow, and every pc-keyed table (exception handlers,
//! line numbers, local variable ranges, stack map frames) is remapped to the new layout.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::bytecode::{decode, Insn};
use crate::classfile::Attribute;
use crate::code::{
    encode_line_numbers, parse_line_numbers, Code, ExceptionHandler, LINE_NUMBER_TABLE,
    LOCAL_VARIABLE_TABLE, LOCAL_VARIABLE_TYPE_TABLE, STACK_MAP_TABLE,
};
use crate::error::{Error, Result};
use crate::reader::{Reader, Writer};
use crate::stackmap;

const RUNTIME_VISIBLE_TYPE_ANNOTATIONS: &str = "RuntimeVisibleTypeAnnotations";
const RUNTIME_INVISIBLE_TYPE_ANNOTATIONS: &str = "RuntimeInvisibleTypeAnnotations";

#[derive(Debug, Clone, Default)]
struct Edit {
    before: Vec<Insn>,
    replacement: Option<Vec<Insn>>,
}

#[derive(Debug, Clone, Default)]
pub struct CodePatch {
    edits: BTreeMap<u32, Edit>,
}

impl CodePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Replaces the instruction at `pc`. Anything that targeted it now targets the first
    /// replacement instruction.
    pub fn replace(&mut self, pc: u32, insns: Vec<Insn>) {
        self.edits.entry(pc).or_default().replacement = Some(insns);
    }

    /// Inserts instructions ahead of the one at `pc`. Branches to `pc` still land on the
    /// original instruction, skipping the inserted code.
    pub fn insert_before(&mut self, pc: u32, insns: Vec<Insn>) {
        self.edits.entry(pc).or_default().before.extend(insns);
    }

    /// Produces the patched body. `max_stack` and `max_locals` are carried over unchanged;
    /// callers that need more room adjust them on the result.
    ///
    /// Branch targets inside inserted instructions are interpreted as offsets into the
    /// original body.
    pub fn apply(&self, code: &Code) -> Result<Code> {
        let original = decode(&code.bytecode)?;
        let boundaries: HashSet<u32> = original.iter().map(|(pc, _)| *pc).collect();
        if let Some(pc) = self.edits.keys().find(|pc| !boundaries.contains(pc)) {
            return Err(Error::InvalidCodeOffset(*pc));
        }

        let mut emitted: Vec<Insn> = Vec::with_capacity(original.len());
        let mut labels: HashMap<u32, usize> = HashMap::with_capacity(original.len() + 1);
        for (pc, insn) in original {
            match self.edits.get(&pc) {
                None => {
                    labels.insert(pc, emitted.len());
                    emitted.push(insn);
                }
                Some(edit) => {
                    emitted.extend(edit.before.iter().cloned());
                    labels.insert(pc, emitted.len());
                    match &edit.replacement {
                        Some(replacement) => emitted.extend(replacement.iter().cloned()),
                        None => emitted.push(insn),
                    }
                }
            }
        }
        labels.insert(code.bytecode.len() as u32, emitted.len());

        let layout = Layout::relax(&emitted, labels)?;
        let bytecode = layout.encode(&emitted)?;
        let map = |pc: u32| layout.map(pc);

        let exception_table = code
            .exception_table
            .iter()
            .map(|h| {
                Ok(ExceptionHandler {
                    start_pc: to_u16(map(h.start_pc.into())?)?,
                    end_pc: to_u16(map(h.end_pc.into())?)?,
                    handler_pc: to_u16(map(h.handler_pc.into())?)?,
                    catch_type: h.catch_type,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut attributes = Vec::with_capacity(code.attributes.len());
        for attr in &code.attributes {
            let info = match attr.name.as_str() {
                LINE_NUMBER_TABLE => {
                    let entries = parse_line_numbers(&attr.info)?
                        .into_iter()
                        .map(|(start_pc, line)| Ok((to_u16(map(start_pc.into())?)?, line)))
                        .collect::<Result<Vec<_>>>()?;
                    encode_line_numbers(&entries)?
                }
                LOCAL_VARIABLE_TABLE | LOCAL_VARIABLE_TYPE_TABLE => {
                    remap_local_ranges(&attr.info, &map)?
                }
                STACK_MAP_TABLE => stackmap::remap(&attr.info, &map)?,
                RUNTIME_VISIBLE_TYPE_ANNOTATIONS | RUNTIME_INVISIBLE_TYPE_ANNOTATIONS => continue,
                _ => attr.info.clone(),
            };
            attributes.push(Attribute {
                name: attr.name.clone(),
                info,
            });
        }

        Ok(Code {
            max_stack: code.max_stack,
            max_locals: code.max_locals,
            bytecode,
            exception_table,
            attributes,
        })
    }
}

/// Final offsets of the emitted instructions.
struct Layout {
    labels: HashMap<u32, usize>,
    /// One entry per emitted instruction plus the end offset.
    positions: Vec<u32>,
    widened: Vec<bool>,
}

impl Layout {
    /// Widens short `goto`/`jsr` until every branch offset fits. Widening only grows the code,
    /// so the loop terminates.
    fn relax(emitted: &[Insn], labels: HashMap<u32, usize>) -> Result<Self> {
        let mut layout = Layout {
            labels,
            positions: Vec::new(),
            widened: vec![false; emitted.len()],
        };
        loop {
            layout.place(emitted);
            let mut changed = false;
            for (i, insn) in emitted.iter().enumerate() {
                let Insn::Branch { target, .. } = insn else {
                    continue;
                };
                if layout.widened[i] || !insn.has_short_offset() {
                    continue;
                }
                let pc = layout.positions[i];
                let offset = i64::from(layout.map(*target)?) - i64::from(pc);
                if i16::try_from(offset).is_ok() {
                    continue;
                }
                if !insn.is_widenable() {
                    return Err(Error::BranchOffsetOverflow { pc });
                }
                layout.widened[i] = true;
                changed = true;
            }
            if !changed {
                return Ok(layout);
            }
        }
    }

    fn place(&mut self, emitted: &[Insn]) {
        self.positions.clear();
        let mut pc = 0u32;
        for (insn, widened) in emitted.iter().zip(&self.widened) {
            self.positions.push(pc);
            pc += insn.size_at(pc, *widened);
        }
        self.positions.push(pc);
    }

    fn map(&self, old_pc: u32) -> Result<u32> {
        self.labels
            .get(&old_pc)
            .map(|&index| self.positions[index])
            .ok_or(Error::InvalidCodeOffset(old_pc))
    }

    fn encode(&self, emitted: &[Insn]) -> Result<Vec<u8>> {
        let end = self.positions.last().copied().unwrap_or(0) as usize;
        if end > u16::MAX as usize {
            return Err(Error::CodeTooLarge(end));
        }
        let mut out = Writer::new();
        for (i, insn) in emitted.iter().enumerate() {
            insn.encode(self.positions[i], self.widened[i], &|pc| self.map(pc), &mut out)?;
        }
        Ok(out.into_inner())
    }
}

/// Remaps the `[start_pc, start_pc + length)` ranges of a `LocalVariableTable` or
/// `LocalVariableTypeTable` payload; name, descriptor and slot are copied through.
fn remap_local_ranges(info: &[u8], map: &dyn Fn(u32) -> Result<u32>) -> Result<Vec<u8>> {
    let mut reader = Reader::new(info);
    let count = reader.read_u2()? as usize;
    let mut out = Writer::new();
    out.write_len_u2(count)?;
    for _ in 0..count {
        let start = u32::from(reader.read_u2()?);
        let length = u32::from(reader.read_u2()?);
        let new_start = map(start)?;
        let new_end = map(start + length)?;
        out.write_u2(to_u16(new_start)?);
        out.write_u2(to_u16(new_end - new_start)?);
        out.write_bytes(reader.read_bytes(6)?);
    }
    reader.ensure_empty()?;
    Ok(out.into_inner())
}

fn to_u16(pc: u32) -> Result<u16> {
    u16::try_from(pc).map_err(|_| Error::CodeTooLarge(pc as usize))
}
