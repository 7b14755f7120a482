use anyhow::{Context, Result};
use clap::Parser;
use retro_classfile::ClassFile;
use retro_classpath::{read_class_dir, ClassBytes, ClassPath, ClasspathEntry};
use retro_weave::{WeaveConfig, Weaver};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "retro",
    version,
    about = "Retrofit compiled classes onto polyfill types"
)]
struct Cli {
    /// Directory of compiled classes to rewrite
    input: PathBuf,
    /// Directory the rewritten classes are written to
    #[arg(long, short)]
    output: PathBuf,
    /// Class directory or jar to resolve types against (repeatable); the polyfill runtime
    /// belongs here
    #[arg(long = "classpath", value_name = "ENTRY")]
    classpath: Vec<PathBuf>,
    /// TOML file overriding the default naming conventions
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Worker threads (overrides the config file)
    #[arg(long)]
    threads: Option<usize>,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = match &cli.config {
        Some(path) => WeaveConfig::load_from_path(path)?,
        None => WeaveConfig::default(),
    };
    if cli.threads.is_some() {
        config.threads = cli.threads;
    }
    let weaver = Weaver::new(&config)?;

    let inputs = read_class_dir(&cli.input)
        .with_context(|| format!("failed to read classes from {}", cli.input.display()))?;

    let mut entries = vec![ClasspathEntry::ClassDir(cli.input.clone())];
    entries.extend(cli.classpath.iter().cloned().map(ClasspathEntry::from_path));
    let classpath = ClassPath::from_entries(&entries).context("failed to index classpath")?;
    tracing::info!(
        inputs = inputs.len(),
        classpath_classes = classpath.len(),
        "loaded classes"
    );

    let mut classes = Vec::with_capacity(inputs.len());
    // Each woven class goes back where it was read from, whatever name it declares.
    let mut paths = Vec::with_capacity(inputs.len());
    let mut passthrough: Vec<ClassBytes> = Vec::new();
    for input in inputs {
        match ClassFile::parse(&input.bytes) {
            Ok(class) => {
                classes.push(class);
                paths.push(input.relative_path);
            }
            Err(err) => {
                tracing::warn!(
                    path = %input.relative_path.display(),
                    error = %err,
                    "copying unparseable class file unchanged"
                );
                passthrough.push(input);
            }
        }
    }

    let output = weaver.weave(classes, &classpath);
    for diagnostic in &output.diagnostics {
        tracing::warn!("{diagnostic}");
    }

    for (class, path) in output.classes.iter().zip(&paths) {
        let bytes = class
            .to_bytes()
            .with_context(|| format!("failed to serialize {}", class.this_class))?;
        write_output(&cli.output.join(path), &bytes)?;
    }
    for input in &passthrough {
        write_output(&cli.output.join(&input.relative_path), &input.bytes)?;
    }

    println!(
        "wove {} classes into {} ({} copied unchanged, {} diagnostics)",
        output.classes.len(),
        cli.output.display(),
        passthrough.len(),
        output.diagnostics.len()
    );
    Ok(0)
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}
