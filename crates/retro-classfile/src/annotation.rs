use crate::constant_pool::ConstantPool;
use crate::error::{Error, Result};
use crate::reader::Reader;

pub const RUNTIME_VISIBLE_ANNOTATIONS: &str = "RuntimeVisibleAnnotations";
pub const RUNTIME_INVISIBLE_ANNOTATIONS: &str = "RuntimeInvisibleAnnotations";

/// The annotation types declared in a `Runtime{Visible,Invisible}Annotations` payload.
///
/// Element values are validated structurally but not materialized; rewriting only ever asks
/// whether a marker annotation is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub type_descriptor: String,
    pub type_internal_name: Option<String>,
}

impl Annotation {
    pub(crate) fn parse_all(info: &[u8], cp: &ConstantPool) -> Result<Vec<Annotation>> {
        let mut reader = Reader::new(info);
        let num = reader.read_u2()? as usize;
        let mut anns = Vec::with_capacity(num);
        for _ in 0..num {
            anns.push(Annotation::parse(&mut reader, cp)?);
        }
        reader.ensure_empty()?;
        Ok(anns)
    }

    fn parse(reader: &mut Reader<'_>, cp: &ConstantPool) -> Result<Self> {
        let type_index = reader.read_u2()?;
        let type_descriptor = cp.get_utf8(type_index)?.to_string();
        let type_internal_name = descriptor_to_internal_name(&type_descriptor);

        let num_element_value_pairs = reader.read_u2()? as usize;
        for _ in 0..num_element_value_pairs {
            let _element_name_index = reader.read_u2()?;
            skip_element_value(reader)?;
        }

        Ok(Self {
            type_descriptor,
            type_internal_name,
        })
    }
}

fn skip_element_value(reader: &mut Reader<'_>) -> Result<()> {
    let tag = reader.read_u1()? as char;
    match tag {
        'B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z' | 's' | 'c' => {
            reader.read_u2()?;
        }
        'e' => {
            reader.read_u2()?;
            reader.read_u2()?;
        }
        '@' => {
            reader.read_u2()?;
            let pairs = reader.read_u2()? as usize;
            for _ in 0..pairs {
                reader.read_u2()?;
                skip_element_value(reader)?;
            }
        }
        '[' => {
            let len = reader.read_u2()? as usize;
            for _ in 0..len {
                skip_element_value(reader)?;
            }
        }
        _ => return Err(Error::MalformedAttribute("RuntimeVisibleAnnotations")),
    }
    Ok(())
}

fn descriptor_to_internal_name(desc: &str) -> Option<String> {
    desc.strip_prefix('L')
        .and_then(|rest| rest.strip_suffix(';'))
        .map(str::to_string)
}
