//! Retypes local-variable debug entries of the legacy wrapper type to its polyfill.
//!
//! Locals live in a side table that descriptor rewriting never reaches, so they are fixed
//! up separately, before any call site is rewritten.

use std::collections::HashMap;

use retro_classfile::{
    encode_local_variables, parse_field_descriptor, parse_local_variables, ClassFile, ClassMember,
    ConstantPool, Error, LocalVariable, Result, LOCAL_VARIABLE_TABLE, LOCAL_VARIABLE_TYPE_TABLE,
};

use crate::diagnostics::{Diagnostic, Location};
use crate::resolve::Resolver;

pub(crate) fn fixup_local_variables(class: &mut ClassFile, resolver: &Resolver<'_>) -> Vec<Diagnostic> {
    let legacy = &resolver.conventions().local_variable_type;
    let Some(mapping) = resolver.resolve(legacy) else {
        return Vec::new();
    };
    let legacy = format!("L{legacy};");
    let polyfill = format!("L{};", mapping.polyfill);

    let mut diagnostics = Vec::new();
    for method in &mut class.methods {
        match fixup_method(method, &mut class.constant_pool, &legacy, &polyfill) {
            Ok(true) => tracing::debug!(
                target: crate::TRACE_TARGET,
                class = %class.this_class,
                method = %method.name,
                "retyped local variables"
            ),
            Ok(false) => {}
            Err(err) => diagnostics.push(Diagnostic::malformed(
                Location::method(&class.this_class, &method.name, &method.descriptor),
                err,
            )),
        }
    }
    diagnostics
}

/// Returns whether the method was changed. On error neither the method nor the pool is
/// touched.
fn fixup_method(
    method: &mut ClassMember,
    pool: &mut ConstantPool,
    legacy: &str,
    polyfill: &str,
) -> Result<bool> {
    let Some(mut code) = method.code(pool)? else {
        return Ok(false);
    };

    let mut tables = Vec::new();
    for (position, attr) in code.attributes.iter().enumerate() {
        if attr.name == LOCAL_VARIABLE_TABLE {
            tables.push((position, parse_local_variables(&attr.info, pool)?));
        }
    }
    if !tables
        .iter()
        .any(|(_, entries)| entries.iter().any(|e| e.descriptor == legacy))
    {
        return Ok(false);
    }

    let mut cp = pool.clone();
    // (original slot, start_pc, length) -> new slot
    let mut renumbered: HashMap<(u16, u16, u16), u16> = HashMap::new();
    let mut total = 0u32;
    for (position, mut entries) in tables {
        let mut next = 0u32;
        for entry in &mut entries {
            if entry.descriptor == legacy {
                entry.descriptor = polyfill.to_string();
            }
            let width = parse_field_descriptor(&entry.descriptor)?.slot_width();
            let index = u16::try_from(next).map_err(|_| Error::Other("local slot overflow"))?;
            renumbered.insert((entry.index, entry.start_pc, entry.length), index);
            entry.index = index;
            next += u32::from(width);
        }
        total = total.max(next);
        code.attributes[position].info = encode_local_variables(&entries, &mut cp)?;
    }

    for attr in code
        .attributes
        .iter_mut()
        .filter(|a| a.name == LOCAL_VARIABLE_TYPE_TABLE)
    {
        let mut entries: Vec<LocalVariable> = parse_local_variables(&attr.info, &cp)?;
        for entry in &mut entries {
            if let Some(index) = renumbered.get(&(entry.index, entry.start_pc, entry.length)) {
                entry.index = *index;
            }
        }
        attr.info = encode_local_variables(&entries, &mut cp)?;
    }

    let total = u16::try_from(total).map_err(|_| Error::Other("local slot overflow"))?;
    code.max_locals = code.max_locals.max(total);
    method.set_code(&code, &mut cp)?;
    *pool = cp;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeaveConfig;
    use crate::context::TypeContext;
    use pretty_assertions::assert_eq;
    use retro_classfile::bytecode::RETURN;
    use retro_classfile::{Attribute, Code, ACC_PUBLIC, ACC_STATIC};
    use retro_classpath::ClassPath;

    const OPTIONAL: &str = "Ljava/util/Optional;";
    const RETRO_OPTIONAL: &str = "Lio/github/retropiler/runtime/java/util/_Optional;";

    fn local(name: &str, descriptor: &str, index: u16) -> LocalVariable {
        LocalVariable {
            start_pc: 0,
            length: 1,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            index,
        }
    }

    fn class_with_locals(max_locals: u16, locals: &[LocalVariable], types: &[LocalVariable]) -> ClassFile {
        let mut class = ClassFile::new("com/example/Main", Some("java/lang/Object"), ACC_PUBLIC);
        let mut attributes = vec![Attribute::new(
            LOCAL_VARIABLE_TABLE,
            encode_local_variables(locals, &mut class.constant_pool).unwrap(),
        )];
        if !types.is_empty() {
            attributes.push(Attribute::new(
                LOCAL_VARIABLE_TYPE_TABLE,
                encode_local_variables(types, &mut class.constant_pool).unwrap(),
            ));
        }
        let code = Code {
            max_stack: 0,
            max_locals,
            bytecode: vec![RETURN],
            exception_table: Vec::new(),
            attributes,
        };
        let mut method = ClassMember::new(ACC_PUBLIC | ACC_STATIC, "main", "()V");
        method.set_code(&code, &mut class.constant_pool).unwrap();
        class.methods.push(method);
        class
    }

    fn run(class: &mut ClassFile) -> Vec<Diagnostic> {
        let runtime = vec![ClassFile::new(
            "io/github/retropiler/runtime/java/util/_Optional",
            Some("java/lang/Object"),
            ACC_PUBLIC,
        )];
        let classpath = ClassPath::from_classes(&runtime);
        let context = TypeContext::new(&[], &classpath);
        let conventions = WeaveConfig::default().conventions().unwrap();
        let resolver = Resolver::new(&context, &conventions);
        fixup_local_variables(class, &resolver)
    }

    fn table(class: &ClassFile, name: &str) -> Vec<LocalVariable> {
        let code = class.methods[0].code(&class.constant_pool).unwrap().unwrap();
        parse_local_variables(&code.attribute(name).unwrap().info, &class.constant_pool).unwrap()
    }

    #[test]
    fn retypes_legacy_locals_and_keeps_width_correct_slots() {
        let mut class = class_with_locals(
            5,
            &[
                local("opt", OPTIONAL, 0),
                local("total", "J", 1),
                local("name", "Ljava/lang/String;", 3),
                local("other", OPTIONAL, 4),
            ],
            &[],
        );
        assert!(run(&mut class).is_empty());

        assert_eq!(
            table(&class, LOCAL_VARIABLE_TABLE),
            vec![
                local("opt", RETRO_OPTIONAL, 0),
                local("total", "J", 1),
                local("name", "Ljava/lang/String;", 3),
                local("other", RETRO_OPTIONAL, 4),
            ]
        );
        let code = class.methods[0].code(&class.constant_pool).unwrap().unwrap();
        assert_eq!(code.max_locals, 5);
    }

    #[test]
    fn renumbers_as_running_total_and_follows_in_type_table() {
        let mut class = class_with_locals(
            4,
            &[local("opt", OPTIONAL, 0), local("list", "Ljava/util/List;", 3)],
            &[local("list", "Ljava/util/List<Ljava/lang/String;>;", 3)],
        );
        run(&mut class);

        assert_eq!(
            table(&class, LOCAL_VARIABLE_TABLE),
            vec![local("opt", RETRO_OPTIONAL, 0), local("list", "Ljava/util/List;", 1)]
        );
        assert_eq!(
            table(&class, LOCAL_VARIABLE_TYPE_TABLE),
            vec![local("list", "Ljava/util/List<Ljava/lang/String;>;", 1)]
        );
        // Never below what the instruction stream already uses.
        let code = class.methods[0].code(&class.constant_pool).unwrap().unwrap();
        assert_eq!(code.max_locals, 4);
    }

    #[test]
    fn methods_without_legacy_locals_are_untouched() {
        let mut class = class_with_locals(3, &[local("a", "J", 1)], &[]);
        let before = class.to_bytes().unwrap();
        run(&mut class);
        assert_eq!(class.to_bytes().unwrap(), before);
    }
}
