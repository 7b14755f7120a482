#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use retro_classfile::{bytecode, ClassFile};

mod utils;

/// Anything the parser accepts must serialize to bytes that parse again and serialize to
/// themselves; every decodable method body must re-assemble the same way.
fn check(input: &[u8]) {
    let Ok(class) = ClassFile::parse(input) else {
        return;
    };
    let written = class.to_bytes().expect("parsed class failed to serialize");
    let reparsed = ClassFile::parse(&written).expect("written class failed to parse");
    assert_eq!(
        reparsed.to_bytes().expect("reparsed class failed to serialize"),
        written,
        "serialization is not a fixpoint"
    );
    let _ = class.stub();

    for method in &class.methods {
        let Ok(Some(code)) = method.code(&class.constant_pool) else {
            continue;
        };
        if let Ok(insns) = bytecode::decode(&code.bytecode) {
            let insns: Vec<_> = insns.into_iter().map(|(_, insn)| insn).collect();
            let assembled = bytecode::assemble(&insns).expect("decoded body failed to assemble");
            let again: Vec<_> = bytecode::decode(&assembled)
                .expect("assembled body failed to decode")
                .into_iter()
                .map(|(_, insn)| insn)
                .collect();
            assert_eq!(
                bytecode::assemble(&again).expect("re-decoded body failed to assemble"),
                assembled,
                "assembly is not a fixpoint"
            );
        }
    }
}

fuzz_target!(|data: &[u8]| {
    static RUNNER: OnceLock<utils::Runner> = OnceLock::new();
    RUNNER
        .get_or_init(|| utils::Runner::spawn("fuzz_classfile", check))
        .run(data);
});
