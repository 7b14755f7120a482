use crate::classfile::{parse_attributes, write_attributes, Attribute};
use crate::constant_pool::ConstantPool;
use crate::error::{Error, Result};
use crate::reader::{Reader, Writer};

pub const LINE_NUMBER_TABLE: &str = "LineNumberTable";
pub const LOCAL_VARIABLE_TABLE: &str = "LocalVariableTable";
pub const LOCAL_VARIABLE_TYPE_TABLE: &str = "LocalVariableTypeTable";
pub const STACK_MAP_TABLE: &str = "StackMapTable";

/// A decoded `Code` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytecode: Vec<u8>,
    pub exception_table: Vec<ExceptionHandler>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

/// One entry of a `LocalVariableTable` (or `LocalVariableTypeTable`, where `descriptor` holds
/// the generic signature instead).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub start_pc: u16,
    pub length: u16,
    pub name: String,
    pub descriptor: String,
    pub index: u16,
}

impl Code {
    pub const ATTRIBUTE_NAME: &'static str = "Code";

    pub(crate) fn parse(info: &[u8], cp: &ConstantPool) -> Result<Self> {
        let mut reader = Reader::new(info);
        let max_stack = reader.read_u2()?;
        let max_locals = reader.read_u2()?;
        let code_length = reader.read_u4()? as usize;
        if code_length == 0 || code_length > u16::MAX as usize {
            return Err(Error::MalformedAttribute("Code"));
        }
        let bytecode = reader.read_bytes(code_length)?.to_vec();

        let handlers = reader.read_u2()? as usize;
        let mut exception_table = Vec::with_capacity(handlers);
        for _ in 0..handlers {
            exception_table.push(ExceptionHandler {
                start_pc: reader.read_u2()?,
                end_pc: reader.read_u2()?,
                handler_pc: reader.read_u2()?,
                catch_type: reader.read_u2()?,
            });
        }

        let attributes = parse_attributes(&mut reader, cp)?;
        reader.ensure_empty()?;

        Ok(Self {
            max_stack,
            max_locals,
            bytecode,
            exception_table,
            attributes,
        })
    }

    pub(crate) fn encode(&self, cp: &mut ConstantPool) -> Result<Vec<u8>> {
        if self.bytecode.len() > u16::MAX as usize {
            return Err(Error::CodeTooLarge(self.bytecode.len()));
        }
        let mut out = Writer::new();
        out.write_u2(self.max_stack);
        out.write_u2(self.max_locals);
        out.write_u4(self.bytecode.len() as u32);
        out.write_bytes(&self.bytecode);
        out.write_len_u2(self.exception_table.len())?;
        for handler in &self.exception_table {
            out.write_u2(handler.start_pc);
            out.write_u2(handler.end_pc);
            out.write_u2(handler.handler_pc);
            out.write_u2(handler.catch_type);
        }
        write_attributes(&mut out, cp, &self.attributes)?;
        Ok(out.into_inner())
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Source line of the instruction at `pc`, from the `LineNumberTable` if present.
    pub fn line_number_at(&self, pc: u32) -> Option<u16> {
        let mut best: Option<(u16, u16)> = None;
        for attr in self.attributes.iter().filter(|a| a.name == LINE_NUMBER_TABLE) {
            let Ok(entries) = parse_line_numbers(&attr.info) else {
                continue;
            };
            for (start_pc, line) in entries {
                if u32::from(start_pc) <= pc && best.map_or(true, |(s, _)| start_pc >= s) {
                    best = Some((start_pc, line));
                }
            }
        }
        best.map(|(_, line)| line)
    }
}

pub(crate) fn parse_line_numbers(info: &[u8]) -> Result<Vec<(u16, u16)>> {
    let mut reader = Reader::new(info);
    let count = reader.read_u2()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push((reader.read_u2()?, reader.read_u2()?));
    }
    reader.ensure_empty()?;
    Ok(entries)
}

pub(crate) fn encode_line_numbers(entries: &[(u16, u16)]) -> Result<Vec<u8>> {
    let mut out = Writer::new();
    out.write_len_u2(entries.len())?;
    for (start_pc, line) in entries {
        out.write_u2(*start_pc);
        out.write_u2(*line);
    }
    Ok(out.into_inner())
}

pub fn parse_local_variables(info: &[u8], cp: &ConstantPool) -> Result<Vec<LocalVariable>> {
    let mut reader = Reader::new(info);
    let count = reader.read_u2()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let start_pc = reader.read_u2()?;
        let length = reader.read_u2()?;
        let name = cp.get_utf8(reader.read_u2()?)?.to_string();
        let descriptor = cp.get_utf8(reader.read_u2()?)?.to_string();
        let index = reader.read_u2()?;
        entries.push(LocalVariable {
            start_pc,
            length,
            name,
            descriptor,
            index,
        });
    }
    reader.ensure_empty()?;
    Ok(entries)
}

pub fn encode_local_variables(entries: &[LocalVariable], cp: &mut ConstantPool) -> Result<Vec<u8>> {
    let mut out = Writer::new();
    out.write_len_u2(entries.len())?;
    for entry in entries {
        out.write_u2(entry.start_pc);
        out.write_u2(entry.length);
        out.write_u2(cp.utf8(&entry.name)?);
        out.write_u2(cp.utf8(&entry.descriptor)?);
        out.write_u2(entry.index);
    }
    Ok(out.into_inner())
}
