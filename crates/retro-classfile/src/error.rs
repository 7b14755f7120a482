use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    UnexpectedEof,
    InvalidMagic(u32),
    InvalidConstantPoolIndex(u16),
    InvalidConstantPoolTag(u8),
    ConstantPoolTypeMismatch {
        index: u16,
        expected: &'static str,
        found: &'static str,
    },
    ConstantPoolOverflow,
    InvalidModifiedUtf8,
    InvalidDescriptor(String),
    MalformedAttribute(&'static str),
    InvalidOpcode { pc: u32, opcode: u8 },
    InvalidCodeOffset(u32),
    BranchOffsetOverflow { pc: u32 },
    CodeTooLarge(usize),
    Other(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnexpectedEof => write!(f, "unexpected end of input"),
            Error::InvalidMagic(magic) => write!(f, "invalid classfile magic: 0x{magic:08x}"),
            Error::InvalidConstantPoolIndex(index) => {
                write!(f, "invalid constant pool index: {index}")
            }
            Error::InvalidConstantPoolTag(tag) => write!(f, "invalid constant pool tag: {tag}"),
            Error::ConstantPoolTypeMismatch {
                index,
                expected,
                found,
            } => write!(
                f,
                "constant pool type mismatch at index {index}: expected {expected}, found {found}"
            ),
            Error::ConstantPoolOverflow => write!(f, "constant pool exceeds 65535 entries"),
            Error::InvalidModifiedUtf8 => write!(f, "invalid modified UTF-8 constant"),
            Error::InvalidDescriptor(desc) => write!(f, "invalid descriptor: {desc}"),
            Error::MalformedAttribute(name) => write!(f, "malformed {name} attribute"),
            Error::InvalidOpcode { pc, opcode } => {
                write!(f, "invalid opcode 0x{opcode:02x} at pc {pc}")
            }
            Error::InvalidCodeOffset(pc) => {
                write!(f, "offset {pc} is not an instruction boundary")
            }
            Error::BranchOffsetOverflow { pc } => {
                write!(f, "branch at pc {pc} cannot reach its target after patching")
            }
            Error::CodeTooLarge(len) => write!(f, "method body of {len} bytes exceeds 65535"),
            Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Error {}
