use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Base(BaseType),
    Object(String),
    Array(Box<FieldType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnType {
    Void,
    Type(FieldType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<FieldType>,
    pub return_type: ReturnType,
}

impl BaseType {
    pub fn from_code(code: char) -> Option<Self> {
        Some(match code {
            'B' => BaseType::Byte,
            'C' => BaseType::Char,
            'D' => BaseType::Double,
            'F' => BaseType::Float,
            'I' => BaseType::Int,
            'J' => BaseType::Long,
            'S' => BaseType::Short,
            'Z' => BaseType::Boolean,
            _ => return None,
        })
    }

    pub fn code(self) -> char {
        match self {
            BaseType::Byte => 'B',
            BaseType::Char => 'C',
            BaseType::Double => 'D',
            BaseType::Float => 'F',
            BaseType::Int => 'I',
            BaseType::Long => 'J',
            BaseType::Short => 'S',
            BaseType::Boolean => 'Z',
        }
    }
}

impl FieldType {
    /// Number of local-variable (and operand stack) slots a value of this type occupies.
    pub fn slot_width(&self) -> u16 {
        match self {
            FieldType::Base(BaseType::Long | BaseType::Double) => 2,
            _ => 1,
        }
    }

    pub fn is_reference(&self) -> bool {
        !matches!(self, FieldType::Base(_))
    }

    /// The name a `Class` constant uses for this type (`checkcast`, `anewarray`, ...):
    /// the internal name for objects, the full descriptor for arrays.
    pub fn class_entry_name(&self) -> Option<String> {
        match self {
            FieldType::Base(_) => None,
            FieldType::Object(name) => Some(name.clone()),
            FieldType::Array(_) => Some(self.to_string()),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Base(base) => write!(f, "{}", base.code()),
            FieldType::Object(name) => write!(f, "L{name};"),
            FieldType::Array(component) => write!(f, "[{component}"),
        }
    }
}

impl ReturnType {
    pub fn slot_width(&self) -> u16 {
        match self {
            ReturnType::Void => 0,
            ReturnType::Type(ty) => ty.slot_width(),
        }
    }
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnType::Void => f.write_str("V"),
            ReturnType::Type(ty) => write!(f, "{ty}"),
        }
    }
}

impl MethodDescriptor {
    /// Total slot width of the declared parameters (the receiver is not included).
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(FieldType::slot_width).sum()
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for param in &self.params {
            write!(f, "{param}")?;
        }
        write!(f, "){}", self.return_type)
    }
}

pub fn parse_field_descriptor(desc: &str) -> Result<FieldType> {
    match split_field_type(desc) {
        Some((ty, "")) => Ok(ty),
        _ => Err(Error::InvalidDescriptor(desc.to_string())),
    }
}

pub fn parse_method_descriptor(desc: &str) -> Result<MethodDescriptor> {
    let invalid = || Error::InvalidDescriptor(desc.to_string());
    let mut rest = desc.strip_prefix('(').ok_or_else(invalid)?;
    let mut params = Vec::new();
    let ret = loop {
        if let Some(ret) = rest.strip_prefix(')') {
            break ret;
        }
        let (param, tail) = split_field_type(rest).ok_or_else(invalid)?;
        params.push(param);
        rest = tail;
    };
    let return_type = match ret {
        "V" => ReturnType::Void,
        _ => ReturnType::Type(parse_field_descriptor(ret).map_err(|_| invalid())?),
    };
    Ok(MethodDescriptor {
        params,
        return_type,
    })
}

/// Splits the leading field type off `input`.
fn split_field_type(input: &str) -> Option<(FieldType, &str)> {
    let mut chars = input.chars();
    let code = chars.next()?;
    let rest = chars.as_str();
    match code {
        'L' => {
            let (name, rest) = rest.split_once(';')?;
            (!name.is_empty()).then(|| (FieldType::Object(name.to_string()), rest))
        }
        '[' => {
            let (component, rest) = split_field_type(rest)?;
            Some((FieldType::Array(Box::new(component)), rest))
        }
        _ => BaseType::from_code(code).map(|base| (FieldType::Base(base), rest)),
    }
}
