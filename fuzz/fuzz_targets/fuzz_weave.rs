#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use retro_classfile::ClassFile;
use retro_classpath::ClassPath;
use retro_weave::{WeaveConfig, Weaver};

mod utils;

/// Weaving never panics, and whatever it produces still serializes.
fn check(input: &[u8]) {
    let Ok(class) = ClassFile::parse(input) else {
        return;
    };
    static WEAVER: OnceLock<Weaver> = OnceLock::new();
    let weaver = WEAVER.get_or_init(|| {
        Weaver::new(&WeaveConfig {
            threads: Some(1),
            ..WeaveConfig::default()
        })
        .expect("default configuration is valid")
    });

    // The class doubles as its own polyfill runtime, so inputs naming the polyfill namespace
    // exercise the rewriting paths.
    let classpath = ClassPath::from_classes([&class]);
    let output = weaver.weave(vec![class.clone()], &classpath);
    for class in &output.classes {
        let _ = class.to_bytes();
    }
}

fuzz_target!(|data: &[u8]| {
    static RUNNER: OnceLock<utils::Runner> = OnceLock::new();
    RUNNER
        .get_or_init(|| utils::Runner::spawn("fuzz_weave", check))
        .run(data);
});
