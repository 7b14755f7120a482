mod support;

use pretty_assertions::assert_eq;
use retro_classfile::bytecode::{
    ALOAD_0, ALOAD_1, ASTORE_0, ASTORE_1, BIPUSH, DUP, ICONST_0, INVOKEINTERFACE, INVOKESPECIAL,
    INVOKESTATIC, INVOKEVIRTUAL, NEW, POP, RETURN,
};
use retro_classfile::{
    retype_frames, Attribute, Insn, MethodShape, ACC_PUBLIC, ACC_STATIC, LINE_NUMBER_TABLE,
    STACK_MAP_TABLE,
};
use retro_classpath::ClassPath;
use retro_weave::{Diagnostic, DiagnosticKind, Location, TypeContext};

use support::*;

fn optional_runtime() -> Vec<retro_classfile::ClassFile> {
    vec![class(&format!("{RUNTIME}/java/util/_Optional"))]
}

fn iterable_runtime() -> Vec<retro_classfile::ClassFile> {
    let mut iterable = interface("java/lang/Iterable", &[]);
    abstract_method(&mut iterable, "forEach", "(Ljava/util/function/Consumer;)V");
    abstract_method(&mut iterable, "spliterator", "()Ljava/util/Spliterator;");
    let list = interface("java/util/List", &["java/lang/Iterable"]);

    let mut polyfill = mixin(&format!("{RUNTIME}/java/lang/_Iterable"));
    static_decl(
        &mut polyfill,
        "forEach",
        "(Ljava/lang/Iterable;Ljava/util/function/Consumer;)V",
    );
    vec![iterable, list, polyfill]
}

#[test]
fn constructor_is_retargeted_with_primitive_argument_unchanged() {
    let polyfill = format!("{RUNTIME}/com/example/_A");
    let mut main = class("com/example/Main");
    method(&mut main, ACC_PUBLIC | ACC_STATIC, "make", "()V", 1, |cp| {
        vec![
            class_insn(cp, NEW, "com/example/A"),
            Insn::op(DUP),
            Insn::with_u1(BIPUSH, 5),
            call(cp, INVOKESPECIAL, "com/example/A", "<init>", "(I)V"),
            Insn::op(ASTORE_0),
            Insn::op(RETURN),
        ]
    });

    let output = weave(vec![main], &[class(&polyfill)]);
    assert!(output.diagnostics.is_empty());
    let main = find(&output.classes, "com/example/Main");
    assert_eq!(
        disassemble(main, "make", "()V"),
        lines(&[
            &format!("new {polyfill}"),
            "dup",
            "bipush 5",
            &format!("invokespecial {polyfill}.<init>(I)V"),
            "astore_0",
            "return",
        ])
    );
    assert_eq!(code_of(main, "make", "()V").max_locals, 1);
}

#[test]
fn superclass_constructor_calls_are_left_alone() {
    let polyfill = format!("{RUNTIME}/com/example/_A");
    let mut sub = retro_classfile::ClassFile::new("com/example/Sub", Some("com/example/A"), ACC_PUBLIC);
    method(&mut sub, ACC_PUBLIC, "<init>", "()V", 1, |cp| {
        vec![
            Insn::op(ALOAD_0),
            Insn::with_u1(BIPUSH, 1),
            call(cp, INVOKESPECIAL, "com/example/A", "<init>", "(I)V"),
            Insn::op(RETURN),
        ]
    });
    let before = sub.to_bytes().unwrap();

    let output = weave(vec![sub], &[class(&polyfill)]);
    assert_eq!(output.classes[0].to_bytes().unwrap(), before);
}

#[test]
fn static_replacement_casts_reference_arguments() {
    let polyfill = format!("{RUNTIME}/java/util/_Optional");
    let mut main = class("com/example/Main");
    method(&mut main, ACC_PUBLIC | ACC_STATIC, "make", "()V", 0, |cp| {
        vec![
            string(cp, "x"),
            call(
                cp,
                INVOKESTATIC,
                "java/util/Optional",
                "of",
                "(Ljava/lang/Object;)Ljava/util/Optional;",
            ),
            Insn::op(POP),
            Insn::op(RETURN),
        ]
    });

    let output = weave(vec![main], &optional_runtime());
    let main = find(&output.classes, "com/example/Main");
    assert_eq!(
        disassemble(main, "make", "()V"),
        lines(&[
            "ldc_w \"x\"",
            "astore_0",
            "aload_0",
            "checkcast java/lang/Object",
            &format!("invokestatic {polyfill}.of(Ljava/lang/Object;)L{polyfill};"),
            "pop",
            "return",
        ])
    );
    assert_eq!(code_of(main, "make", "()V").max_locals, 1);
}

#[test]
fn instance_replacement_casts_the_receiver() {
    let polyfill = format!("{RUNTIME}/java/util/_Optional");
    let mut main = class("com/example/Main");
    method(&mut main, ACC_PUBLIC | ACC_STATIC, "show", "(Ljava/util/Optional;)V", 1, |cp| {
        vec![
            Insn::op(ALOAD_0),
            call(cp, INVOKEVIRTUAL, "java/util/Optional", "get", "()Ljava/lang/Object;"),
            Insn::op(POP),
            Insn::op(RETURN),
        ]
    });

    let output = weave(vec![main], &optional_runtime());
    let main = find(&output.classes, "com/example/Main");
    assert_eq!(
        disassemble(main, "show", "(Ljava/util/Optional;)V"),
        lines(&[
            "aload_0",
            "astore_1",
            "aload_1",
            &format!("checkcast {polyfill}"),
            &format!("invokevirtual {polyfill}.get()Ljava/lang/Object;"),
            "pop",
            "return",
        ])
    );
    assert_eq!(code_of(main, "show", "(Ljava/util/Optional;)V").max_locals, 2);
}

#[test]
fn interface_polyfill_uses_invokeinterface_and_companion_for_statics() {
    let polyfill = format!("{RUNTIME}/java/util/function/_Function");
    let runtime = vec![
        interface(&polyfill, &[]),
        class(&format!("{polyfill}$")),
    ];
    let mut main = class("com/example/Main");
    method(
        &mut main,
        ACC_PUBLIC | ACC_STATIC,
        "apply",
        "(Ljava/util/function/Function;Ljava/lang/Object;)V",
        2,
        |cp| {
            vec![
                Insn::op(ALOAD_0),
                Insn::op(ALOAD_1),
                call(
                    cp,
                    INVOKEINTERFACE,
                    "java/util/function/Function",
                    "apply",
                    "(Ljava/lang/Object;)Ljava/lang/Object;",
                ),
                Insn::op(POP),
                call(
                    cp,
                    INVOKESTATIC,
                    "java/util/function/Function",
                    "identity",
                    "()Ljava/util/function/Function;",
                ),
                Insn::op(POP),
                Insn::op(RETURN),
            ]
        },
    );

    let output = weave(vec![main], &runtime);
    assert!(output.diagnostics.is_empty());
    let main = find(&output.classes, "com/example/Main");
    let descriptor = "(Ljava/util/function/Function;Ljava/lang/Object;)V";
    assert_eq!(
        disassemble(main, "apply", descriptor),
        lines(&[
            "aload_0",
            "aload_1",
            "astore_3",
            "astore_2",
            "aload_2",
            &format!("checkcast {polyfill}"),
            "aload_3",
            "checkcast java/lang/Object",
            &format!("invokeinterface {polyfill}.apply(Ljava/lang/Object;)Ljava/lang/Object;"),
            "pop",
            &format!("invokestatic {polyfill}$.identity()L{polyfill};"),
            "pop",
            "return",
        ])
    );
    assert_eq!(code_of(main, "apply", descriptor).max_locals, 4);
}

#[test]
fn mixin_call_becomes_static_call_on_the_declaring_type() {
    let polyfill = format!("{RUNTIME}/java/lang/_Iterable");
    let mut main = class("com/example/Main");
    let descriptor = "(Ljava/util/List;Ljava/util/function/Consumer;)V";
    method(&mut main, ACC_PUBLIC | ACC_STATIC, "run", descriptor, 2, |cp| {
        vec![
            Insn::op(ALOAD_0),
            Insn::op(ALOAD_1),
            call(
                cp,
                INVOKEINTERFACE,
                "java/util/List",
                "forEach",
                "(Ljava/util/function/Consumer;)V",
            ),
            Insn::op(RETURN),
        ]
    });

    let output = weave(vec![main], &iterable_runtime());
    assert!(output.diagnostics.is_empty());
    let main = find(&output.classes, "com/example/Main");
    assert_eq!(
        disassemble(main, "run", descriptor),
        lines(&[
            "aload_0",
            "aload_1",
            "astore_3",
            "astore_2",
            "aload_2",
            "checkcast java/lang/Iterable",
            "aload_3",
            "checkcast java/util/function/Consumer",
            &format!(
                "invokestatic {polyfill}.forEach(Ljava/lang/Iterable;Ljava/util/function/Consumer;)V"
            ),
            "return",
        ])
    );
    assert_eq!(code_of(main, "run", descriptor).max_locals, 4);
}

#[test]
fn missing_mixin_counterpart_is_reported_and_only_that_site_skipped() {
    let polyfill = format!("{RUNTIME}/java/lang/_Iterable");
    let mut main = class("com/example/Main");
    let descriptor = "(Ljava/util/List;Ljava/util/function/Consumer;)V";
    method_with_attributes(
        &mut main,
        ACC_PUBLIC | ACC_STATIC,
        "run",
        descriptor,
        2,
        |cp| {
            vec![
                Insn::op(ALOAD_0),
                call(cp, INVOKEINTERFACE, "java/util/List", "spliterator", "()Ljava/util/Spliterator;"),
                Insn::op(POP),
                Insn::op(ALOAD_0),
                Insn::op(ALOAD_1),
                call(
                    cp,
                    INVOKEINTERFACE,
                    "java/util/List",
                    "forEach",
                    "(Ljava/util/function/Consumer;)V",
                ),
                Insn::op(RETURN),
            ]
        },
        // pc 0 -> line 10, pc 7 -> line 11
        |_| vec![Attribute::new(LINE_NUMBER_TABLE, vec![0, 2, 0, 0, 0, 10, 0, 7, 0, 11])],
    );

    let output = weave(vec![main], &iterable_runtime());
    assert_eq!(
        output.diagnostics,
        vec![Diagnostic {
            location: Location::method("com/example/Main", "run", descriptor).at(1, Some(10)),
            kind: DiagnosticKind::UnresolvedMixinMethod {
                polyfill: polyfill.clone(),
                name: "spliterator".to_string(),
                descriptor: "(Ljava/lang/Iterable;)Ljava/util/Spliterator;".to_string(),
            },
        }]
    );

    let main = find(&output.classes, "com/example/Main");
    let body = disassemble(main, "run", descriptor);
    assert_eq!(
        body[..3],
        lines(&[
            "aload_0",
            "invokeinterface java/util/List.spliterator()Ljava/util/Spliterator;",
            "pop",
        ])[..]
    );
    assert!(body.contains(&format!(
        "invokestatic {polyfill}.forEach(Ljava/lang/Iterable;Ljava/util/function/Consumer;)V"
    )));
}

#[test]
fn unmapped_call_sites_are_byte_identical() {
    let mut main = class("com/example/Main");
    method(&mut main, ACC_PUBLIC | ACC_STATIC, "run", "(Ljava/util/List;)V", 1, |cp| {
        vec![
            class_insn(cp, NEW, "java/lang/StringBuilder"),
            Insn::op(DUP),
            call(cp, INVOKESPECIAL, "java/lang/StringBuilder", "<init>", "()V"),
            call(cp, INVOKEVIRTUAL, "java/lang/StringBuilder", "toString", "()Ljava/lang/String;"),
            Insn::op(POP),
            Insn::op(ALOAD_0),
            call(cp, INVOKEINTERFACE, "java/util/List", "size", "()I"),
            call(cp, INVOKESTATIC, "java/lang/String", "valueOf", "(I)Ljava/lang/String;"),
            Insn::op(POP),
            Insn::op(RETURN),
        ]
    });
    let before = main.to_bytes().unwrap();

    let mut runtime = optional_runtime();
    runtime.extend(iterable_runtime());
    let output = weave(vec![main], &runtime);
    assert!(output.diagnostics.is_empty());
    assert_eq!(output.classes[0].to_bytes().unwrap(), before);
}

#[test]
fn frames_accept_polyfill_values_flowing_into_branch_targets() {
    const ARRAYLENGTH: u8 = 0xbe;
    const ICONST_5: u8 = 0x08;
    const IF_ICMPLE: u8 = 0xa4;
    let descriptor = "([Ljava/lang/String;)V";
    let mut main = class("com/example/Main");
    method_with_attributes(
        &mut main,
        ACC_PUBLIC | ACC_STATIC,
        "main",
        descriptor,
        2,
        |cp| {
            vec![
                string(cp, "x"),
                call(
                    cp,
                    INVOKESTATIC,
                    "java/util/Optional",
                    "of",
                    "(Ljava/lang/Object;)Ljava/util/Optional;",
                ),
                Insn::op(ASTORE_1),
                Insn::op(ALOAD_0),
                Insn::op(ARRAYLENGTH),
                Insn::op(ICONST_5),
                Insn::Branch {
                    opcode: IF_ICMPLE,
                    target: 17,
                },
                Insn::op(ICONST_0),
                Insn::op(POP),
                Insn::op(ICONST_0),
                Insn::op(POP),
                // 17
                Insn::op(ALOAD_1),
                call(cp, INVOKEVIRTUAL, "java/util/Optional", "get", "()Ljava/lang/Object;"),
                Insn::op(POP),
                Insn::op(RETURN),
            ]
        },
        |cp| {
            // append_frame at 17: local 1 is an Optional
            let [hi, lo] = cp.class("java/util/Optional").unwrap().to_be_bytes();
            vec![Attribute::new(STACK_MAP_TABLE, vec![0, 1, 252, 0, 17, 7, hi, lo])]
        },
    );

    let runtime = optional_runtime();
    let output = weave(vec![main], &runtime);
    assert!(output.diagnostics.is_empty());
    let main = find(&output.classes, "com/example/Main");
    let code = code_of(main, "main", descriptor);
    let object = main.constant_pool.clone().class(OBJECT).unwrap();
    let [hi, lo] = object.to_be_bytes();
    // The join target moved to 22 and local 1 now holds either an Optional or its polyfill.
    assert_eq!(
        code.attribute(STACK_MAP_TABLE).unwrap().info,
        vec![0, 1, 252, 0, 22, 7, hi, lo]
    );

    // Checking the woven body again finds nothing left to widen.
    let classpath = ClassPath::from_classes(&runtime);
    let context = TypeContext::new(&output.classes, &classpath);
    let mut cp = main.constant_pool.clone();
    let mut code = code;
    let shape = MethodShape {
        this_class: "com/example/Main",
        name: "main",
        descriptor,
        is_static: true,
    };
    assert!(!retype_frames(&mut code, &mut cp, shape, &context).unwrap());
}

#[test]
fn malformed_method_is_reported_and_its_siblings_still_rewritten() {
    let polyfill = format!("{RUNTIME}/java/util/_Optional");
    let mut main = class("com/example/Main");
    method(&mut main, ACC_PUBLIC | ACC_STATIC, "broken", "()V", 0, |_| {
        vec![Insn::op(0xff), Insn::op(RETURN)]
    });
    method(&mut main, ACC_PUBLIC | ACC_STATIC, "show", "(Ljava/util/Optional;)V", 1, |cp| {
        vec![
            Insn::op(ALOAD_0),
            call(cp, INVOKEVIRTUAL, "java/util/Optional", "get", "()Ljava/lang/Object;"),
            Insn::op(POP),
            Insn::op(RETURN),
        ]
    });

    let output = weave(vec![main], &optional_runtime());
    assert_eq!(
        output.diagnostics,
        vec![Diagnostic {
            location: Location::method("com/example/Main", "broken", "()V"),
            kind: DiagnosticKind::MalformedMember {
                message: "invalid opcode 0xff at pc 0".to_string(),
            },
        }]
    );

    let main = find(&output.classes, "com/example/Main");
    assert_eq!(code_of(main, "broken", "()V").bytecode, vec![0xff, RETURN]);
    assert!(disassemble(main, "show", "(Ljava/util/Optional;)V")
        .contains(&format!("checkcast {polyfill}")));
}
