//! Re-typing of `StackMapTable` frames after a body was rewritten.
//!
//! A rewritten call can produce a value of a different class than the original call did, and
//! that class may not be assignable to what the compiler's frames declare for the slot the
//! value flows into. [`retype_frames`] runs the body against its frames and widens each frame
//! entry that some incoming state is not assignable to, until every frame accepts every path
//! reaching it. Frames only ever widen, starting from the ones already there, so a body whose
//! frames are consistent keeps its table byte for byte.
//!
//! Assignability follows the type-checking verifier: interfaces accept any reference, and a
//! class is a subtype of another only along its superclass chain. Classes the hierarchy knows
//! nothing about are trusted to be assignable where the compiler said they were.

use std::collections::BTreeMap;

use crate::bytecode::{decode, Insn};
use crate::code::{Code, ExceptionHandler, STACK_MAP_TABLE};
use crate::constant_pool::{ConstantPool, CpInfo};
use crate::descriptor::{
    parse_field_descriptor, parse_method_descriptor, BaseType, FieldType, MethodDescriptor,
    ReturnType,
};
use crate::error::{Error, Result};
use crate::stackmap::{self, Frame, FrameKind, VerificationType};

const OBJECT: &str = "java/lang/Object";
const INIT: &str = "<init>";
const MALFORMED: Error = Error::MalformedAttribute("StackMapTable");
const SUBROUTINE: Error = Error::Other("subroutines cannot carry stack map frames");
/// Superclass chains longer than this are treated as unknown.
const MAX_CHAIN: usize = 64;

/// What [`retype_frames`] needs to know about a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HierarchyEntry {
    Interface,
    Class { super_class: Option<String> },
}

pub trait ClassHierarchy {
    /// `None` when nothing is known about `internal_name`.
    fn entry(&self, internal_name: &str) -> Option<HierarchyEntry>;
}

/// The method a body belongs to; it fixes the implicit frame at offset 0.
#[derive(Debug, Clone, Copy)]
pub struct MethodShape<'a> {
    pub this_class: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
    pub is_static: bool,
}

/// Widens the frames of `code` until the body type-checks against them. Returns whether the
/// `StackMapTable` changed; a body without one is left alone.
///
/// New class names are interned into `cp`.
pub fn retype_frames(
    code: &mut Code,
    cp: &mut ConstantPool,
    shape: MethodShape<'_>,
    hierarchy: &dyn ClassHierarchy,
) -> Result<bool> {
    let Some(position) = code
        .attributes
        .iter()
        .position(|attr| attr.name == STACK_MAP_TABLE)
    else {
        return Ok(false);
    };

    let descriptor = parse_method_descriptor(shape.descriptor)?;
    let initial = entry_locals(shape, &descriptor);
    let max_locals = usize::from(code.max_locals);

    let mut frames = BTreeMap::new();
    let mut locals = initial.clone();
    for frame in stackmap::parse(&code.attributes[position].info)? {
        let stack = apply_frame(&frame.kind, &mut locals, cp)?;
        let state = State {
            locals: expand(&locals, Some(max_locals))?,
            stack: expand(&stack, None)?,
        };
        frames.insert(frame.offset, state);
    }
    let declared = frames.clone();

    let analyzer = Analyzer {
        cp: &*cp,
        shape,
        hierarchy,
    };
    let insns = decode(&code.bytecode)?;
    let entry = State {
        locals: expand(&initial, Some(max_locals))?,
        stack: Vec::new(),
    };
    while analyzer.pass(&insns, &code.exception_table, &entry, &mut frames)? {}

    if frames == declared {
        return Ok(false);
    }
    code.attributes[position].info = encode_frames(&frames, &initial, cp)?;
    Ok(true)
}

/// A verification type. Values of `long` and `double` take two slots: the type itself
/// followed by `Top`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum VType {
    Top,
    Int,
    Float,
    Long,
    Double,
    Null,
    UninitThis,
    /// Offset of the `new` that created the value.
    Uninit(u32),
    /// Internal name, or descriptor for arrays.
    Ref(String),
}

impl VType {
    fn is_wide(&self) -> bool {
        matches!(self, VType::Long | VType::Double)
    }

    fn of(ty: &FieldType) -> VType {
        match ty {
            FieldType::Base(BaseType::Float) => VType::Float,
            FieldType::Base(BaseType::Long) => VType::Long,
            FieldType::Base(BaseType::Double) => VType::Double,
            FieldType::Base(_) => VType::Int,
            FieldType::Object(name) => VType::Ref(name.clone()),
            FieldType::Array(_) => VType::Ref(ty.to_string()),
        }
    }

    fn from_entry(ty: &VerificationType, cp: &ConstantPool) -> Result<VType> {
        Ok(match ty {
            VerificationType::Top => VType::Top,
            VerificationType::Integer => VType::Int,
            VerificationType::Float => VType::Float,
            VerificationType::Long => VType::Long,
            VerificationType::Double => VType::Double,
            VerificationType::Null => VType::Null,
            VerificationType::UninitializedThis => VType::UninitThis,
            VerificationType::Object(index) => VType::Ref(cp.get_class_name(*index)?.to_string()),
            VerificationType::Uninitialized(offset) => VType::Uninit(*offset),
        })
    }

    fn to_entry(&self, cp: &mut ConstantPool) -> Result<VerificationType> {
        Ok(match self {
            VType::Top => VerificationType::Top,
            VType::Int => VerificationType::Integer,
            VType::Float => VerificationType::Float,
            VType::Long => VerificationType::Long,
            VType::Double => VerificationType::Double,
            VType::Null => VerificationType::Null,
            VType::UninitThis => VerificationType::UninitializedThis,
            VType::Uninit(offset) => VerificationType::Uninitialized(*offset),
            VType::Ref(name) => VerificationType::Object(cp.class(name)?),
        })
    }
}

fn entry_locals(shape: MethodShape<'_>, descriptor: &MethodDescriptor) -> Vec<VType> {
    let mut locals = Vec::with_capacity(descriptor.params.len() + 1);
    if !shape.is_static {
        if shape.name == INIT && shape.this_class != OBJECT {
            locals.push(VType::UninitThis);
        } else {
            locals.push(VType::Ref(shape.this_class.to_string()));
        }
    }
    locals.extend(descriptor.params.iter().map(VType::of));
    locals
}

/// Applies one frame to the running locals (one entry per value) and returns its stack.
fn apply_frame(kind: &FrameKind, locals: &mut Vec<VType>, cp: &ConstantPool) -> Result<Vec<VType>> {
    let convert = |types: &[VerificationType]| -> Result<Vec<VType>> {
        types.iter().map(|ty| VType::from_entry(ty, cp)).collect()
    };
    Ok(match kind {
        FrameKind::Same => Vec::new(),
        FrameKind::SameLocals1(ty) => vec![VType::from_entry(ty, cp)?],
        FrameKind::Chop(count) => {
            let count = usize::from(*count);
            if count > locals.len() {
                return Err(MALFORMED);
            }
            locals.truncate(locals.len() - count);
            Vec::new()
        }
        FrameKind::Append(types) => {
            locals.extend(convert(types)?);
            Vec::new()
        }
        FrameKind::Full {
            locals: full,
            stack,
        } => {
            *locals = convert(full)?;
            convert(stack)?
        }
    })
}

/// One value per entry to one type per slot, padded with `Top` up to `len`.
fn expand(values: &[VType], len: Option<usize>) -> Result<Vec<VType>> {
    let mut slots = Vec::with_capacity(values.len() * 2);
    for value in values {
        slots.push(value.clone());
        if value.is_wide() {
            slots.push(VType::Top);
        }
    }
    if let Some(len) = len {
        if slots.len() > len {
            return Err(MALFORMED);
        }
        slots.resize(len, VType::Top);
    }
    Ok(slots)
}

/// Inverse of [`expand`]; trailing unused locals are dropped.
fn compress(slots: &[VType], trim: bool) -> Vec<VType> {
    let mut values = Vec::with_capacity(slots.len());
    let mut iter = slots.iter();
    while let Some(slot) = iter.next() {
        if slot.is_wide() {
            iter.next();
        }
        values.push(slot.clone());
    }
    if trim {
        while values.last() == Some(&VType::Top) {
            values.pop();
        }
    }
    values
}

fn encode_frames(
    frames: &BTreeMap<u32, State>,
    initial: &[VType],
    cp: &mut ConstantPool,
) -> Result<Vec<u8>> {
    let mut previous = initial.to_vec();
    let mut encoded = Vec::with_capacity(frames.len());
    for (&offset, state) in frames {
        let locals = compress(&state.locals, true);
        let stack = compress(&state.stack, false);
        let kind = frame_kind(&previous, &locals, &stack, cp)?;
        encoded.push(Frame { offset, kind });
        previous = locals;
    }
    stackmap::encode(&encoded)
}

/// The most compact encoding of a frame relative to the one before it.
fn frame_kind(
    previous: &[VType],
    locals: &[VType],
    stack: &[VType],
    cp: &mut ConstantPool,
) -> Result<FrameKind> {
    let same_locals = locals == previous;
    Ok(match stack.len() {
        0 if same_locals => FrameKind::Same,
        1 if same_locals => FrameKind::SameLocals1(stack[0].to_entry(cp)?),
        0 if locals.len() < previous.len()
            && previous.len() - locals.len() <= 3
            && previous.starts_with(locals) =>
        {
            FrameKind::Chop((previous.len() - locals.len()) as u8)
        }
        0 if locals.len() > previous.len()
            && locals.len() - previous.len() <= 3
            && locals.starts_with(previous) =>
        {
            FrameKind::Append(entries(&locals[previous.len()..], cp)?)
        }
        _ => FrameKind::Full {
            locals: entries(locals, cp)?,
            stack: entries(stack, cp)?,
        },
    })
}

fn entries(types: &[VType], cp: &mut ConstantPool) -> Result<Vec<VerificationType>> {
    types.iter().map(|ty| ty.to_entry(cp)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct State {
    locals: Vec<VType>,
    stack: Vec<VType>,
}

impl State {
    fn push(&mut self, value: VType) {
        let wide = value.is_wide();
        self.stack.push(value);
        if wide {
            self.stack.push(VType::Top);
        }
    }

    fn pop_slots(&mut self, count: usize) -> Result<()> {
        if count > self.stack.len() {
            return Err(MALFORMED);
        }
        self.stack.truncate(self.stack.len() - count);
        Ok(())
    }

    /// Pops one value, both slots of a `long` or `double`.
    fn pop(&mut self) -> Result<VType> {
        let top = self.stack.pop().ok_or(MALFORMED)?;
        if top == VType::Top && self.stack.last().is_some_and(VType::is_wide) {
            return self.stack.pop().ok_or(MALFORMED);
        }
        Ok(top)
    }

    /// Copies the top `take` slots below the `skip` slots under them (`dup` family).
    fn dup(&mut self, take: usize, skip: usize) -> Result<()> {
        let len = self.stack.len();
        if take + skip > len {
            return Err(MALFORMED);
        }
        let copied = self.stack[len - take..].to_vec();
        let at = len - take - skip;
        self.stack.splice(at..at, copied);
        Ok(())
    }

    fn local(&self, index: usize) -> Result<VType> {
        self.locals.get(index).cloned().ok_or(MALFORMED)
    }

    fn store(&mut self, index: usize, value: VType) -> Result<()> {
        let width = if value.is_wide() { 2 } else { 1 };
        if index + width > self.locals.len() {
            return Err(MALFORMED);
        }
        if index > 0 && self.locals[index - 1].is_wide() {
            self.locals[index - 1] = VType::Top;
        }
        self.locals[index] = value;
        if width == 2 {
            self.locals[index + 1] = VType::Top;
        }
        Ok(())
    }

    /// `<init>` turns every copy of the uninitialized receiver into an initialized reference.
    fn initialize(&mut self, receiver: &VType, class: String) {
        let initialized = VType::Ref(class);
        for slot in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if slot == receiver {
                *slot = initialized.clone();
            }
        }
    }
}

struct Analyzer<'a> {
    cp: &'a ConstantPool,
    shape: MethodShape<'a>,
    hierarchy: &'a dyn ClassHierarchy,
}

impl Analyzer<'_> {
    /// One walk over the body. Returns whether any frame was widened.
    fn pass(
        &self,
        insns: &[(u32, Insn)],
        handlers: &[ExceptionHandler],
        entry: &State,
        frames: &mut BTreeMap<u32, State>,
    ) -> Result<bool> {
        let mut changed = false;
        let mut state = Some(entry.clone());
        for (pc, insn) in insns {
            if let Some(frame) = frames.get_mut(pc) {
                if let Some(incoming) = &state {
                    changed |= self.merge(frame, incoming)?;
                }
                state = Some(frame.clone());
            }
            // Unreachable code without a frame of its own.
            let Some(current) = state.as_mut() else {
                continue;
            };

            let covering: Vec<u32> = handlers
                .iter()
                .filter(|h| u32::from(h.start_pc) <= *pc && *pc < u32::from(h.end_pc))
                .map(|h| u32::from(h.handler_pc))
                .collect();
            for handler in &covering {
                changed |= self.merge_locals(frames, *handler, &current.locals)?;
            }

            self.step(*pc, insn, current)?;

            if is_store(insn) {
                for handler in &covering {
                    changed |= self.merge_locals(frames, *handler, &current.locals)?;
                }
            }
            for target in branch_targets(insn) {
                let frame = frames.get_mut(&target).ok_or(MALFORMED)?;
                changed |= self.merge(frame, current)?;
            }
            if ends_block(insn) {
                state = None;
            }
        }
        Ok(changed)
    }

    fn merge(&self, frame: &mut State, incoming: &State) -> Result<bool> {
        if frame.stack.len() != incoming.stack.len() || frame.locals.len() != incoming.locals.len()
        {
            return Err(MALFORMED);
        }
        let mut changed = false;
        for (slot, value) in frame.locals.iter_mut().zip(&incoming.locals) {
            changed |= self.widen(slot, value);
        }
        for (slot, value) in frame.stack.iter_mut().zip(&incoming.stack) {
            if self.widen(slot, value) {
                if *slot == VType::Top {
                    return Err(MALFORMED);
                }
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Handler frames describe the locals at every instruction they protect.
    fn merge_locals(
        &self,
        frames: &mut BTreeMap<u32, State>,
        handler: u32,
        locals: &[VType],
    ) -> Result<bool> {
        let frame = frames.get_mut(&handler).ok_or(MALFORMED)?;
        if frame.locals.len() != locals.len() {
            return Err(MALFORMED);
        }
        let mut changed = false;
        for (slot, value) in frame.locals.iter_mut().zip(locals) {
            changed |= self.widen(slot, value);
        }
        Ok(changed)
    }

    fn widen(&self, slot: &mut VType, incoming: &VType) -> bool {
        if self.is_assignable(incoming, slot) {
            return false;
        }
        *slot = match (&*slot, incoming) {
            (VType::Ref(declared), VType::Ref(actual)) => {
                VType::Ref(self.common_superclass(declared, actual))
            }
            (VType::Null, VType::Ref(_)) => incoming.clone(),
            _ => VType::Top,
        };
        true
    }

    fn is_assignable(&self, from: &VType, to: &VType) -> bool {
        match (from, to) {
            (_, VType::Top) => true,
            (VType::Null, VType::Ref(_)) => true,
            (VType::Ref(from), VType::Ref(to)) => self.is_subclass(from, to),
            (from, to) => from == to,
        }
    }

    fn is_subclass(&self, from: &str, to: &str) -> bool {
        if from == to || to == OBJECT {
            return true;
        }
        if let Some(to_component) = to.strip_prefix('[') {
            return match from.strip_prefix('[') {
                Some(from_component) => match (
                    component_class(from_component),
                    component_class(to_component),
                ) {
                    (Some(from), Some(to)) => self.is_subclass(from, to),
                    _ => from_component == to_component,
                },
                None => false,
            };
        }
        if from.starts_with('[') {
            return to == "java/lang/Cloneable" || to == "java/io/Serializable";
        }
        if self.hierarchy.entry(to) == Some(HierarchyEntry::Interface) {
            return true;
        }

        let mut current = from.to_string();
        for _ in 0..MAX_CHAIN {
            if current == OBJECT {
                return false;
            }
            match self.hierarchy.entry(&current) {
                None => return true,
                Some(HierarchyEntry::Interface) => return false,
                Some(HierarchyEntry::Class { super_class: None }) => return false,
                Some(HierarchyEntry::Class {
                    super_class: Some(parent),
                }) => {
                    if parent == to {
                        return true;
                    }
                    current = parent;
                }
            }
        }
        true
    }

    /// The nearest superclass of `declared` that `actual` is assignable to.
    fn common_superclass(&self, declared: &str, actual: &str) -> String {
        if declared.starts_with('[') || actual.starts_with('[') {
            return OBJECT.to_string();
        }
        let mut current = declared.to_string();
        for _ in 0..MAX_CHAIN {
            if self.is_subclass(actual, &current) {
                return current;
            }
            match self.hierarchy.entry(&current) {
                Some(HierarchyEntry::Class {
                    super_class: Some(parent),
                }) => current = parent,
                _ => break,
            }
        }
        OBJECT.to_string()
    }

    fn step(&self, pc: u32, insn: &Insn, state: &mut State) -> Result<()> {
        let opcode = insn.opcode();
        let bytes: &[u8] = match insn {
            Insn::Plain(bytes) => bytes.as_slice(),
            _ => &[],
        };
        let u1 = || bytes.get(1).copied().ok_or(Error::UnexpectedEof);
        let u2 = || insn.u2_operand().ok_or(Error::UnexpectedEof);

        match opcode {
            0x00 => {}
            0x01 => state.push(VType::Null),
            0x02..=0x08 | 0x10 | 0x11 => state.push(VType::Int),
            0x09 | 0x0a => state.push(VType::Long),
            0x0b..=0x0d => state.push(VType::Float),
            0x0e | 0x0f => state.push(VType::Double),
            0x12 => state.push(self.constant(u16::from(u1()?))?),
            0x13 | 0x14 => state.push(self.constant(u2()?)?),
            0x15..=0x19 => load(state, opcode - 0x15, usize::from(u1()?))?,
            0x1a..=0x2d => {
                let offset = opcode - 0x1a;
                load(state, offset / 4, usize::from(offset % 4))?;
            }
            0x2e | 0x33..=0x35 => {
                state.pop_slots(2)?;
                state.push(VType::Int);
            }
            0x2f => {
                state.pop_slots(2)?;
                state.push(VType::Long);
            }
            0x30 => {
                state.pop_slots(2)?;
                state.push(VType::Float);
            }
            0x31 => {
                state.pop_slots(2)?;
                state.push(VType::Double);
            }
            0x32 => {
                state.pop_slots(1)?;
                let array = state.pop()?;
                state.push(component_of(&array)?);
            }
            0x36..=0x3a => {
                let value = state.pop()?;
                state.store(usize::from(u1()?), value)?;
            }
            0x3b..=0x4e => {
                let value = state.pop()?;
                state.store(usize::from((opcode - 0x3b) % 4), value)?;
            }
            0x50 | 0x52 => state.pop_slots(4)?,
            0x4f..=0x56 => state.pop_slots(3)?,
            0x57 => state.pop_slots(1)?,
            0x58 => state.pop_slots(2)?,
            0x59 => state.dup(1, 0)?,
            0x5a => state.dup(1, 1)?,
            0x5b => state.dup(1, 2)?,
            0x5c => state.dup(2, 0)?,
            0x5d => state.dup(2, 1)?,
            0x5e => state.dup(2, 2)?,
            0x5f => {
                let len = state.stack.len();
                if len < 2 {
                    return Err(MALFORMED);
                }
                state.stack.swap(len - 1, len - 2);
            }
            // add, sub, mul, div, rem, neg: int, long, float, double in turn.
            0x60..=0x77 => {
                let unary = opcode >= 0x74;
                let (width, result) = match (opcode - 0x60) % 4 {
                    0 => (1, VType::Int),
                    1 => (2, VType::Long),
                    2 => (1, VType::Float),
                    _ => (2, VType::Double),
                };
                state.pop_slots(if unary { width } else { width * 2 })?;
                state.push(result);
            }
            // Shifts take an int distance.
            0x78..=0x7d => {
                if (opcode - 0x78) % 2 == 0 {
                    state.pop_slots(2)?;
                    state.push(VType::Int);
                } else {
                    state.pop_slots(3)?;
                    state.push(VType::Long);
                }
            }
            0x7e..=0x83 => {
                if (opcode - 0x7e) % 2 == 0 {
                    state.pop_slots(2)?;
                    state.push(VType::Int);
                } else {
                    state.pop_slots(4)?;
                    state.push(VType::Long);
                }
            }
            0x84 => {}
            0x85..=0x93 => {
                let (width, result) = match opcode {
                    0x85 => (1, VType::Long),
                    0x86 => (1, VType::Float),
                    0x87 => (1, VType::Double),
                    0x88 => (2, VType::Int),
                    0x89 => (2, VType::Float),
                    0x8a => (2, VType::Double),
                    0x8b => (1, VType::Int),
                    0x8c => (1, VType::Long),
                    0x8d => (1, VType::Double),
                    0x8e => (2, VType::Int),
                    0x8f => (2, VType::Long),
                    0x90 => (2, VType::Float),
                    _ => (1, VType::Int),
                };
                state.pop_slots(width)?;
                state.push(result);
            }
            0x94 | 0x97 | 0x98 => {
                state.pop_slots(4)?;
                state.push(VType::Int);
            }
            0x95 | 0x96 => {
                state.pop_slots(2)?;
                state.push(VType::Int);
            }
            0x99..=0x9e | 0xc6 | 0xc7 => state.pop_slots(1)?,
            0x9f..=0xa6 => state.pop_slots(2)?,
            0xa7 | 0xc8 => {}
            0xa8 | 0xa9 | 0xc9 => return Err(SUBROUTINE),
            0xaa | 0xab => state.pop_slots(1)?,
            0xac..=0xb1 => state.stack.clear(),
            0xb2 => {
                let field = self.cp.get_member_ref(u2()?)?;
                state.push(VType::of(&parse_field_descriptor(&field.descriptor)?));
            }
            0xb3 => {
                let field = self.cp.get_member_ref(u2()?)?;
                state.pop_slots(parse_field_descriptor(&field.descriptor)?.slot_width().into())?;
            }
            0xb4 => {
                let field = self.cp.get_member_ref(u2()?)?;
                state.pop_slots(1)?;
                state.push(VType::of(&parse_field_descriptor(&field.descriptor)?));
            }
            0xb5 => {
                let field = self.cp.get_member_ref(u2()?)?;
                state.pop_slots(parse_field_descriptor(&field.descriptor)?.slot_width().into())?;
                state.pop_slots(1)?;
            }
            0xb6..=0xb9 => {
                let target = self.cp.get_member_ref(u2()?)?;
                let descriptor = parse_method_descriptor(&target.descriptor)?;
                state.pop_slots(descriptor.param_slots().into())?;
                if opcode != 0xb8 {
                    let receiver = state.pop()?;
                    if opcode == 0xb7 && target.name == INIT {
                        let class = match receiver {
                            VType::UninitThis => self.shape.this_class.to_string(),
                            VType::Uninit(_) => target.class,
                            _ => return Err(MALFORMED),
                        };
                        state.initialize(&receiver, class);
                    }
                }
                push_return(state, &descriptor.return_type);
            }
            0xba => {
                let name_and_type = match self.cp.get(u2()?)? {
                    CpInfo::InvokeDynamic {
                        name_and_type_index,
                        ..
                    } => *name_and_type_index,
                    _ => return Err(MALFORMED),
                };
                let (_, descriptor) = self.cp.get_name_and_type(name_and_type)?;
                let descriptor = parse_method_descriptor(descriptor)?;
                state.pop_slots(descriptor.param_slots().into())?;
                push_return(state, &descriptor.return_type);
            }
            0xbb => state.push(VType::Uninit(pc)),
            0xbc => {
                state.pop_slots(1)?;
                let code = match u1()? {
                    4 => 'Z',
                    5 => 'C',
                    6 => 'F',
                    7 => 'D',
                    8 => 'B',
                    9 => 'S',
                    10 => 'I',
                    11 => 'J',
                    _ => return Err(MALFORMED),
                };
                state.push(VType::Ref(format!("[{code}")));
            }
            0xbd => {
                state.pop_slots(1)?;
                let component = self.cp.get_class_name(u2()?)?;
                let array = if component.starts_with('[') {
                    format!("[{component}")
                } else {
                    format!("[L{component};")
                };
                state.push(VType::Ref(array));
            }
            0xbe => {
                state.pop_slots(1)?;
                state.push(VType::Int);
            }
            0xbf => state.pop_slots(1)?,
            0xc0 => {
                state.pop_slots(1)?;
                state.push(VType::Ref(self.cp.get_class_name(u2()?)?.to_string()));
            }
            0xc1 => {
                state.pop_slots(1)?;
                state.push(VType::Int);
            }
            0xc2 | 0xc3 => state.pop_slots(1)?,
            0xc4 => {
                let inner = u1()?;
                let index = match bytes {
                    [_, _, hi, lo, ..] => usize::from(u16::from_be_bytes([*hi, *lo])),
                    _ => return Err(Error::UnexpectedEof),
                };
                match inner {
                    0x15..=0x19 => load(state, inner - 0x15, index)?,
                    0x36..=0x3a => {
                        let value = state.pop()?;
                        state.store(index, value)?;
                    }
                    0x84 => {}
                    _ => return Err(SUBROUTINE),
                }
            }
            0xc5 => {
                let dimensions = bytes.get(3).copied().ok_or(Error::UnexpectedEof)?;
                state.pop_slots(dimensions.into())?;
                state.push(VType::Ref(self.cp.get_class_name(u2()?)?.to_string()));
            }
            _ => return Err(Error::InvalidOpcode { pc, opcode }),
        }
        Ok(())
    }

    fn constant(&self, index: u16) -> Result<VType> {
        Ok(match self.cp.get(index)? {
            CpInfo::Integer(_) => VType::Int,
            CpInfo::Float(_) => VType::Float,
            CpInfo::Long(_) => VType::Long,
            CpInfo::Double(_) => VType::Double,
            CpInfo::String(_) => VType::Ref("java/lang/String".to_string()),
            CpInfo::Class(_) => VType::Ref("java/lang/Class".to_string()),
            CpInfo::MethodType(_) => VType::Ref("java/lang/invoke/MethodType".to_string()),
            CpInfo::MethodHandle { .. } => VType::Ref("java/lang/invoke/MethodHandle".to_string()),
            CpInfo::Dynamic {
                name_and_type_index,
                ..
            } => {
                let (_, descriptor) = self.cp.get_name_and_type(*name_and_type_index)?;
                VType::of(&parse_field_descriptor(descriptor)?)
            }
            _ => return Err(MALFORMED),
        })
    }
}

/// `kind` counts int, long, float, double, reference.
fn load(state: &mut State, kind: u8, index: usize) -> Result<()> {
    let value = match kind {
        0 => VType::Int,
        1 => VType::Long,
        2 => VType::Float,
        3 => VType::Double,
        _ => state.local(index)?,
    };
    if kind != 4 {
        state.local(index)?;
    }
    state.push(value);
    Ok(())
}

fn push_return(state: &mut State, return_type: &ReturnType) {
    if let ReturnType::Type(ty) = return_type {
        state.push(VType::of(ty));
    }
}

/// Element type loaded by `aaload` from `array`.
fn component_of(array: &VType) -> Result<VType> {
    match array {
        VType::Null => Ok(VType::Null),
        VType::Ref(name) => match name.strip_prefix('[') {
            Some(component) => Ok(VType::of(&parse_field_descriptor(component)?)),
            None => Ok(VType::Ref(OBJECT.to_string())),
        },
        _ => Err(MALFORMED),
    }
}

/// The class named by an array component descriptor; `None` for primitives.
fn component_class(component: &str) -> Option<&str> {
    if component.starts_with('[') {
        return Some(component);
    }
    component.strip_prefix('L')?.strip_suffix(';')
}

fn is_store(insn: &Insn) -> bool {
    match insn {
        Insn::Plain(bytes) => match bytes.as_slice() {
            [0x36..=0x3a | 0x3b..=0x4e, ..] => true,
            [0xc4, 0x36..=0x3a, ..] => true,
            _ => false,
        },
        _ => false,
    }
}

fn branch_targets(insn: &Insn) -> Vec<u32> {
    match insn {
        Insn::Plain(_) => Vec::new(),
        Insn::Branch { target, .. } => vec![*target],
        Insn::TableSwitch {
            default, targets, ..
        } => std::iter::once(*default).chain(targets.iter().copied()).collect(),
        Insn::LookupSwitch { default, pairs } => std::iter::once(*default)
            .chain(pairs.iter().map(|(_, target)| *target))
            .collect(),
    }
}

/// Instructions after which control never falls through.
fn ends_block(insn: &Insn) -> bool {
    matches!(insn.opcode(), 0xa7 | 0xc8 | 0xaa | 0xab | 0xac..=0xb1 | 0xbf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{
        assemble, ACONST_NULL, ALOAD_0, ASTORE_0, CHECKCAST, ICONST_0, IFEQ, IFNULL, POP, RETURN,
    };
    use crate::classfile::Attribute;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    const NOP: u8 = 0x00;
    const OPTIONAL: &str = "java/util/Optional";
    const POLYFILL: &str = "rt/java/util/_Optional";

    struct Known(HashMap<&'static str, HierarchyEntry>);

    impl ClassHierarchy for Known {
        fn entry(&self, internal_name: &str) -> Option<HierarchyEntry> {
            self.0.get(internal_name).cloned()
        }
    }

    fn runtime() -> Known {
        Known(HashMap::from([(
            POLYFILL,
            HierarchyEntry::Class {
                super_class: Some(OBJECT.to_string()),
            },
        )]))
    }

    fn shape(descriptor: &str) -> MethodShape<'_> {
        MethodShape {
            this_class: "com/example/Main",
            name: "run",
            descriptor,
            is_static: true,
        }
    }

    fn body(insns: &[Insn], handlers: Vec<ExceptionHandler>, frames: Vec<u8>) -> Code {
        Code {
            max_stack: 2,
            max_locals: 1,
            bytecode: assemble(insns).unwrap(),
            exception_table: handlers,
            attributes: vec![Attribute::new(STACK_MAP_TABLE, frames)],
        }
    }

    #[test]
    fn consistent_frames_are_left_alone() {
        let mut cp = ConstantPool::new();
        // 0: aload_0  1: ifnull 6  4: aload_0  5: pop  6: return
        let mut code = body(
            &[
                Insn::op(ALOAD_0),
                Insn::Branch {
                    opcode: IFNULL,
                    target: 6,
                },
                Insn::op(ALOAD_0),
                Insn::op(POP),
                Insn::op(RETURN),
            ],
            Vec::new(),
            vec![0, 1, 6],
        );
        let before = code.clone();

        let shape = shape("(Ljava/util/Optional;)V");
        assert!(!retype_frames(&mut code, &mut cp, shape, &runtime()).unwrap());
        assert_eq!(code, before);
    }

    #[test]
    fn polyfill_value_widens_the_declared_local() {
        let mut cp = ConstantPool::new();
        let polyfill = cp.class(POLYFILL).unwrap();
        let optional = cp.class(OPTIONAL).unwrap();
        let [hi, lo] = optional.to_be_bytes();
        // 0: aconst_null  1: checkcast _Optional  4: astore_0  5: iconst_0  6: ifeq 10
        // 9: nop  10: return
        let mut code = body(
            &[
                Insn::op(ACONST_NULL),
                Insn::with_u2(CHECKCAST, polyfill),
                Insn::op(ASTORE_0),
                Insn::op(ICONST_0),
                Insn::Branch {
                    opcode: IFEQ,
                    target: 10,
                },
                Insn::op(NOP),
                Insn::op(RETURN),
            ],
            Vec::new(),
            // append_frame at 10 declaring local 0 as Optional
            vec![0, 1, 252, 0, 10, 7, hi, lo],
        );

        assert!(retype_frames(&mut code, &mut cp, shape("()V"), &runtime()).unwrap());
        let [hi, lo] = cp.class(OBJECT).unwrap().to_be_bytes();
        assert_eq!(
            code.attribute(STACK_MAP_TABLE).unwrap().info,
            vec![0, 1, 252, 0, 10, 7, hi, lo]
        );

        // The widened table is a fixpoint.
        assert!(!retype_frames(&mut code, &mut cp, shape("()V"), &runtime()).unwrap());
    }

    #[test]
    fn handler_frames_see_stores_inside_the_protected_range() {
        let mut cp = ConstantPool::new();
        let polyfill = cp.class(POLYFILL).unwrap();
        let [ohi, olo] = cp.class(OPTIONAL).unwrap().to_be_bytes();
        let [thi, tlo] = cp.class("java/lang/Throwable").unwrap().to_be_bytes();
        // 0: aconst_null  1: astore_0  2: aconst_null  3: checkcast _Optional  6: astore_0
        // 7: return  8: pop  9: return; [2, 7) is handled at 8.
        let mut code = body(
            &[
                Insn::op(ACONST_NULL),
                Insn::op(ASTORE_0),
                Insn::op(ACONST_NULL),
                Insn::with_u2(CHECKCAST, polyfill),
                Insn::op(ASTORE_0),
                Insn::op(RETURN),
                Insn::op(POP),
                Insn::op(RETURN),
            ],
            vec![ExceptionHandler {
                start_pc: 2,
                end_pc: 7,
                handler_pc: 8,
                catch_type: 0,
            }],
            vec![0, 1, 255, 0, 8, 0, 1, 7, ohi, olo, 0, 1, 7, thi, tlo],
        );

        assert!(retype_frames(&mut code, &mut cp, shape("()V"), &runtime()).unwrap());
        let [hi, lo] = cp.class(OBJECT).unwrap().to_be_bytes();
        assert_eq!(
            code.attribute(STACK_MAP_TABLE).unwrap().info,
            vec![0, 1, 255, 0, 8, 0, 1, 7, hi, lo, 0, 1, 7, thi, tlo]
        );
    }

    #[test]
    fn unknown_classes_are_trusted_and_interfaces_accept_anything() {
        let cp = ConstantPool::new();
        let mut known = runtime();
        known.0.insert("java/lang/Runnable", HierarchyEntry::Interface);
        let analyzer = Analyzer {
            cp: &cp,
            shape: shape("()V"),
            hierarchy: &known,
        };
        assert!(analyzer.is_subclass("java/lang/String", "java/lang/CharSequence"));
        assert!(analyzer.is_subclass(POLYFILL, "java/lang/Runnable"));
        assert!(!analyzer.is_subclass(POLYFILL, OPTIONAL));
        assert!(analyzer.is_subclass("[Ljava/lang/String;", "[Ljava/lang/Object;"));
        assert!(!analyzer.is_subclass("[I", "[J"));
        assert_eq!(analyzer.common_superclass(OPTIONAL, POLYFILL), OBJECT);
    }
}
