#![allow(dead_code)]

use retro_classfile::bytecode::{
    assemble, decode, CHECKCAST, GETSTATIC, INVOKEINTERFACE, INVOKESPECIAL, INVOKESTATIC,
    INVOKEVIRTUAL, LDC_W, NEW, PUTSTATIC,
};
use retro_classfile::{
    Attribute, ClassFile, ClassMember, Code, ConstantPool, CpInfo, Insn, ACC_ABSTRACT,
    ACC_INTERFACE, ACC_PUBLIC, ACC_STATIC, RUNTIME_INVISIBLE_ANNOTATIONS,
};
use retro_classpath::ClassPath;
use retro_weave::{WeaveConfig, WeaveOutput, Weaver};

pub const RUNTIME: &str = "io/github/retropiler/runtime";
pub const OBJECT: &str = "java/lang/Object";

pub fn class(name: &str) -> ClassFile {
    ClassFile::new(name, Some(OBJECT), ACC_PUBLIC)
}

pub fn interface(name: &str, supers: &[&str]) -> ClassFile {
    let mut class = ClassFile::new(name, Some(OBJECT), ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT);
    class.interfaces = supers.iter().map(|s| s.to_string()).collect();
    class
}

/// A polyfill carrying the mixin marker annotation.
pub fn mixin(name: &str) -> ClassFile {
    let mut class = class(name);
    let marker = class
        .constant_pool
        .utf8("Lio/github/retropiler/annotation/RetroMixin;")
        .unwrap();
    let [hi, lo] = marker.to_be_bytes();
    class
        .attributes
        .push(Attribute::new(RUNTIME_INVISIBLE_ANNOTATIONS, vec![0, 1, hi, lo, 0, 0]));
    class
}

pub fn abstract_method(class: &mut ClassFile, name: &str, descriptor: &str) {
    class
        .methods
        .push(ClassMember::new(ACC_PUBLIC | ACC_ABSTRACT, name, descriptor));
}

/// A bodiless static declaration, enough for lookups against the classpath.
pub fn static_decl(class: &mut ClassFile, name: &str, descriptor: &str) {
    class
        .methods
        .push(ClassMember::new(ACC_PUBLIC | ACC_STATIC, name, descriptor));
}

/// Adds a method whose body is produced by `body` against the class's constant pool.
pub fn method(
    class: &mut ClassFile,
    access_flags: u16,
    name: &str,
    descriptor: &str,
    max_locals: u16,
    body: impl FnOnce(&mut ConstantPool) -> Vec<Insn>,
) {
    method_with_attributes(class, access_flags, name, descriptor, max_locals, body, |_| Vec::new());
}

pub fn method_with_attributes(
    class: &mut ClassFile,
    access_flags: u16,
    name: &str,
    descriptor: &str,
    max_locals: u16,
    body: impl FnOnce(&mut ConstantPool) -> Vec<Insn>,
    attributes: impl FnOnce(&mut ConstantPool) -> Vec<Attribute>,
) {
    let insns = body(&mut class.constant_pool);
    let code = Code {
        max_stack: 4,
        max_locals,
        bytecode: assemble(&insns).unwrap(),
        exception_table: Vec::new(),
        attributes: attributes(&mut class.constant_pool),
    };
    let mut member = ClassMember::new(access_flags, name, descriptor);
    member.set_code(&code, &mut class.constant_pool).unwrap();
    class.methods.push(member);
}

pub fn call(cp: &mut ConstantPool, opcode: u8, owner: &str, name: &str, descriptor: &str) -> Insn {
    match opcode {
        INVOKEINTERFACE => {
            let index = cp.method_ref(owner, name, descriptor, true).unwrap();
            let slots = retro_classfile::parse_method_descriptor(descriptor)
                .unwrap()
                .param_slots();
            Insn::invokeinterface(index, 1 + slots as u8)
        }
        _ => Insn::with_u2(opcode, cp.method_ref(owner, name, descriptor, false).unwrap()),
    }
}

pub fn class_insn(cp: &mut ConstantPool, opcode: u8, name: &str) -> Insn {
    Insn::with_u2(opcode, cp.class(name).unwrap())
}

pub fn string(cp: &mut ConstantPool, value: &str) -> Insn {
    let utf8 = cp.utf8(value).unwrap();
    Insn::with_u2(LDC_W, cp.intern(CpInfo::String(utf8)).unwrap())
}

pub fn weave(batch: Vec<ClassFile>, runtime: &[ClassFile]) -> WeaveOutput {
    let weaver = Weaver::new(&WeaveConfig {
        threads: Some(2),
        ..WeaveConfig::default()
    })
    .unwrap();
    weaver.weave(batch, &ClassPath::from_classes(runtime))
}

pub fn find<'a>(classes: &'a [ClassFile], name: &str) -> &'a ClassFile {
    classes
        .iter()
        .find(|c| c.this_class == name)
        .unwrap_or_else(|| panic!("class {name} missing from output"))
}

pub fn code_of(class: &ClassFile, name: &str, descriptor: &str) -> Code {
    class
        .method(name, descriptor)
        .unwrap_or_else(|| panic!("method {name}{descriptor} missing"))
        .code(&class.constant_pool)
        .unwrap()
        .unwrap()
}

/// The body of `name` as one line per instruction, with constant pool operands spelled out.
pub fn disassemble(class: &ClassFile, name: &str, descriptor: &str) -> Vec<String> {
    let code = code_of(class, name, descriptor);
    let cp = &class.constant_pool;
    decode(&code.bytecode)
        .unwrap()
        .into_iter()
        .map(|(_, insn)| render(&insn, cp))
        .collect()
}

fn render(insn: &Insn, cp: &ConstantPool) -> String {
    let opcode = insn.opcode();
    let mnemonic = mnemonic(opcode);
    match (opcode, insn) {
        (NEW | CHECKCAST, _) => {
            let index = insn.u2_operand().unwrap();
            format!("{mnemonic} {}", cp.get_class_name(index).unwrap())
        }
        (INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE, _) => {
            let target = cp.get_member_ref(insn.u2_operand().unwrap()).unwrap();
            format!("{mnemonic} {}.{}{}", target.class, target.name, target.descriptor)
        }
        (GETSTATIC | PUTSTATIC, _) => {
            let target = cp.get_member_ref(insn.u2_operand().unwrap()).unwrap();
            format!("{mnemonic} {}.{}:{}", target.class, target.name, target.descriptor)
        }
        (LDC_W, _) => match cp.get(insn.u2_operand().unwrap()).unwrap() {
            CpInfo::String(utf8) => format!("{mnemonic} \"{}\"", cp.get_utf8(*utf8).unwrap()),
            other => format!("{mnemonic} {other:?}"),
        },
        (_, Insn::Branch { target, .. }) => format!("{mnemonic} {target}"),
        (_, Insn::Plain(bytes)) if bytes.len() == 2 => format!("{mnemonic} {}", bytes[1]),
        _ => mnemonic,
    }
}

fn mnemonic(opcode: u8) -> String {
    const KINDS: [char; 5] = ['i', 'l', 'f', 'd', 'a'];
    match opcode {
        0x00 => "nop".into(),
        0x01 => "aconst_null".into(),
        0x02..=0x08 => format!("iconst_{}", i32::from(opcode) - 3).replace("iconst_-1", "iconst_m1"),
        0x10 => "bipush".into(),
        0x13 => "ldc_w".into(),
        0x15..=0x19 => format!("{}load", KINDS[usize::from(opcode - 0x15)]),
        0x1a..=0x2d => {
            let offset = usize::from(opcode - 0x1a);
            format!("{}load_{}", KINDS[offset / 4], offset % 4)
        }
        0x36..=0x3a => format!("{}store", KINDS[usize::from(opcode - 0x36)]),
        0x3b..=0x4e => {
            let offset = usize::from(opcode - 0x3b);
            format!("{}store_{}", KINDS[offset / 4], offset % 4)
        }
        0x57 => "pop".into(),
        0x59 => "dup".into(),
        0x99 => "ifeq".into(),
        0xa7 => "goto".into(),
        0xac..=0xb0 => format!("{}return", KINDS[usize::from(opcode - 0xac)]),
        0xb1 => "return".into(),
        0xb2 => "getstatic".into(),
        0xb3 => "putstatic".into(),
        0xb6 => "invokevirtual".into(),
        0xb7 => "invokespecial".into(),
        0xb8 => "invokestatic".into(),
        0xb9 => "invokeinterface".into(),
        0xbb => "new".into(),
        0xc0 => "checkcast".into(),
        _ => format!("op_{opcode:#04x}"),
    }
}

pub fn lines(expected: &[&str]) -> Vec<String> {
    expected.iter().map(|s| s.to_string()).collect()
}
