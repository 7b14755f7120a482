use crate::error::{Error, Result};
use crate::reader::{Reader, Writer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    /// Offset of the `new` instruction that created the value.
    Uninitialized(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Same,
    SameLocals1(VerificationType),
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) offset: u32,
    pub(crate) kind: FrameKind,
}

const MALFORMED: Error = Error::MalformedAttribute("StackMapTable");

/// Rewrites a `StackMapTable` payload for a re-laid-out body: frame offsets and
/// `Uninitialized(offset)` entries go through `map`, and each frame is re-encoded in the most
/// compact form its new offset delta allows.
pub(crate) fn remap(info: &[u8], map: &dyn Fn(u32) -> Result<u32>) -> Result<Vec<u8>> {
    let mut frames = parse(info)?;
    for frame in &mut frames {
        frame.offset = map(frame.offset)?;
        match &mut frame.kind {
            FrameKind::Same | FrameKind::Chop(_) => {}
            FrameKind::SameLocals1(ty) => remap_type(ty, map)?,
            FrameKind::Append(types) => {
                for ty in types {
                    remap_type(ty, map)?;
                }
            }
            FrameKind::Full { locals, stack } => {
                for ty in locals.iter_mut().chain(stack.iter_mut()) {
                    remap_type(ty, map)?;
                }
            }
        }
    }
    encode(&frames)
}

fn remap_type(ty: &mut VerificationType, map: &dyn Fn(u32) -> Result<u32>) -> Result<()> {
    if let VerificationType::Uninitialized(offset) = ty {
        *offset = map(*offset)?;
    }
    Ok(())
}

pub(crate) fn parse(info: &[u8]) -> Result<Vec<Frame>> {
    let mut reader = Reader::new(info);
    let count = reader.read_u2()? as usize;
    let mut frames = Vec::with_capacity(count);
    let mut previous: Option<u32> = None;
    for _ in 0..count {
        let frame_type = reader.read_u1()?;
        let (delta, kind) = match frame_type {
            0..=63 => (u32::from(frame_type), FrameKind::Same),
            64..=127 => (
                u32::from(frame_type - 64),
                FrameKind::SameLocals1(parse_type(&mut reader)?),
            ),
            247 => {
                let delta = u32::from(reader.read_u2()?);
                (delta, FrameKind::SameLocals1(parse_type(&mut reader)?))
            }
            248..=250 => (u32::from(reader.read_u2()?), FrameKind::Chop(251 - frame_type)),
            251 => (u32::from(reader.read_u2()?), FrameKind::Same),
            252..=254 => {
                let delta = u32::from(reader.read_u2()?);
                let types = parse_types(&mut reader, usize::from(frame_type - 251))?;
                (delta, FrameKind::Append(types))
            }
            255 => {
                let delta = u32::from(reader.read_u2()?);
                let locals_len = reader.read_u2()? as usize;
                let locals = parse_types(&mut reader, locals_len)?;
                let stack_len = reader.read_u2()? as usize;
                let stack = parse_types(&mut reader, stack_len)?;
                (delta, FrameKind::Full { locals, stack })
            }
            _ => return Err(MALFORMED),
        };
        let offset = match previous {
            None => delta,
            Some(prev) => prev + delta + 1,
        };
        previous = Some(offset);
        frames.push(Frame { offset, kind });
    }
    reader.ensure_empty()?;
    Ok(frames)
}

fn parse_types(reader: &mut Reader<'_>, count: usize) -> Result<Vec<VerificationType>> {
    (0..count).map(|_| parse_type(reader)).collect()
}

fn parse_type(reader: &mut Reader<'_>) -> Result<VerificationType> {
    Ok(match reader.read_u1()? {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(reader.read_u2()?),
        8 => VerificationType::Uninitialized(u32::from(reader.read_u2()?)),
        _ => return Err(MALFORMED),
    })
}

pub(crate) fn encode(frames: &[Frame]) -> Result<Vec<u8>> {
    let mut out = Writer::new();
    out.write_len_u2(frames.len())?;
    let mut previous: Option<u32> = None;
    for frame in frames {
        let delta = match previous {
            None => frame.offset,
            Some(prev) if frame.offset > prev => frame.offset - prev - 1,
            Some(_) => return Err(MALFORMED),
        };
        previous = Some(frame.offset);
        let delta = u16::try_from(delta).map_err(|_| MALFORMED)?;

        match &frame.kind {
            FrameKind::Same if delta <= 63 => out.write_u1(delta as u8),
            FrameKind::Same => {
                out.write_u1(251);
                out.write_u2(delta);
            }
            FrameKind::SameLocals1(ty) if delta <= 63 => {
                out.write_u1(64 + delta as u8);
                write_type(&mut out, ty)?;
            }
            FrameKind::SameLocals1(ty) => {
                out.write_u1(247);
                out.write_u2(delta);
                write_type(&mut out, ty)?;
            }
            FrameKind::Chop(k) => {
                out.write_u1(251 - k);
                out.write_u2(delta);
            }
            FrameKind::Append(types) => {
                out.write_u1(251 + types.len() as u8);
                out.write_u2(delta);
                for ty in types {
                    write_type(&mut out, ty)?;
                }
            }
            FrameKind::Full { locals, stack } => {
                out.write_u1(255);
                out.write_u2(delta);
                out.write_len_u2(locals.len())?;
                for ty in locals {
                    write_type(&mut out, ty)?;
                }
                out.write_len_u2(stack.len())?;
                for ty in stack {
                    write_type(&mut out, ty)?;
                }
            }
        }
    }
    Ok(out.into_inner())
}

fn write_type(out: &mut Writer, ty: &VerificationType) -> Result<()> {
    match ty {
        VerificationType::Top => out.write_u1(0),
        VerificationType::Integer => out.write_u1(1),
        VerificationType::Float => out.write_u1(2),
        VerificationType::Double => out.write_u1(3),
        VerificationType::Long => out.write_u1(4),
        VerificationType::Null => out.write_u1(5),
        VerificationType::UninitializedThis => out.write_u1(6),
        VerificationType::Object(index) => {
            out.write_u1(7);
            out.write_u2(*index);
        }
        VerificationType::Uninitialized(offset) => {
            out.write_u1(8);
            out.write_u2(u16::try_from(*offset).map_err(|_| MALFORMED)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(frames: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![0, frames.len() as u8];
        for frame in frames {
            out.extend_from_slice(frame);
        }
        out
    }

    #[test]
    fn identity_map_reproduces_table() {
        let info = table(&[
            &[10],                      // same, offset 10
            &[64 + 3, 7, 0, 9],         // same_locals_1 Object(#9), offset 14
            &[252, 0, 5, 1],            // append Integer, offset 20
            &[255, 0, 2, 0, 1, 1, 0, 1, 8, 0, 2], // full, offset 23
        ]);
        assert_eq!(remap(&info, &|pc| Ok(pc)).unwrap(), info);
    }

    #[test]
    fn shifted_offsets_switch_to_extended_forms() {
        let info = table(&[&[10], &[64 + 3, 1]]);
        let remapped = remap(&info, &|pc| Ok(pc + 100)).unwrap();
        // First frame: 110 no longer fits the compact `same` encoding.
        // Second frame keeps its delta of 3 relative to the first.
        assert_eq!(remapped, table(&[&[251, 0, 110], &[64 + 3, 1]]));
    }

    #[test]
    fn uninitialized_entries_follow_their_new_instruction() {
        let info = table(&[&[64 + 5, 8, 0, 2]]);
        let remapped = remap(&info, &|pc| Ok(if pc == 2 { 9 } else { pc + 7 })).unwrap();
        assert_eq!(remapped, table(&[&[64 + 12, 8, 0, 9]]));
    }
}
