//! Type-resolution source for the weaver: class directories and jar archives indexed into
//! [`ClassStub`]s.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use thiserror::Error;

use retro_classfile::{ClassFile, ClassStub};

const TRACE_TARGET: &str = "retro.classpath";

#[derive(Debug, Error)]
pub enum ClasspathError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("classfile error: {0}")]
    ClassFile(#[from] retro_classfile::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClasspathEntry {
    ClassDir(PathBuf),
    Jar(PathBuf),
}

impl ClasspathEntry {
    /// `.jar` and `.zip` files are archives; anything else is treated as a class directory.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let is_archive = path
            .extension()
            .and_then(OsStr::to_str)
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jar") || ext.eq_ignore_ascii_case("zip"));
        if is_archive {
            ClasspathEntry::Jar(path)
        } else {
            ClasspathEntry::ClassDir(path)
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ClasspathEntry::ClassDir(p) | ClasspathEntry::Jar(p) => p,
        }
    }
}

/// Class stubs by internal name.
#[derive(Debug, Clone, Default)]
pub struct ClassPath {
    stubs: HashMap<String, ClassStub>,
}

impl ClassPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes every entry in order. When several entries define the same class, the first
    /// one wins.
    pub fn from_entries(entries: &[ClasspathEntry]) -> Result<Self, ClasspathError> {
        let mut classpath = ClassPath::new();
        for entry in entries {
            let stubs = index_entry(entry)?;
            tracing::debug!(
                target: TRACE_TARGET,
                entry = %entry.path().display(),
                classes = stubs.len(),
                "indexed classpath entry"
            );
            for stub in stubs {
                classpath.insert(stub);
            }
        }
        Ok(classpath)
    }

    /// Builds an index from already-parsed classes. Classes whose members cannot be
    /// summarized are left out.
    pub fn from_classes<'a>(classes: impl IntoIterator<Item = &'a ClassFile>) -> Self {
        let mut classpath = ClassPath::new();
        for class in classes {
            match class.stub() {
                Ok(stub) => {
                    classpath.insert(stub);
                }
                Err(err) => tracing::debug!(
                    target: TRACE_TARGET,
                    class = %class.this_class,
                    error = %err,
                    "skipping class"
                ),
            }
        }
        classpath
    }

    /// Adds a stub unless a class of the same name is already present. Returns whether the
    /// stub was added.
    pub fn insert(&mut self, stub: ClassStub) -> bool {
        if self.stubs.contains_key(&stub.internal_name) {
            return false;
        }
        self.stubs.insert(stub.internal_name.clone(), stub);
        true
    }

    pub fn lookup(&self, internal_name: &str) -> Option<&ClassStub> {
        self.stubs.get(internal_name)
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.stubs.keys().map(String::as_str)
    }
}

/// A class file read from an input directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassBytes {
    /// Path relative to the directory that was read.
    pub relative_path: PathBuf,
    pub bytes: Vec<u8>,
}

/// Reads every `*.class` file under `dir`, sorted by relative path.
pub fn read_class_dir(dir: &Path) -> Result<Vec<ClassBytes>, ClasspathError> {
    let mut out = Vec::new();
    for entry in class_files(dir) {
        let bytes = std::fs::read(entry.path())?;
        let relative_path = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .to_path_buf();
        out.push(ClassBytes {
            relative_path,
            bytes,
        });
    }
    out.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(out)
}

fn class_files(dir: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension() == Some(OsStr::new("class")))
}

fn is_ignored_class(internal_name: &str) -> bool {
    internal_name == "module-info"
        || internal_name == "package-info"
        || internal_name.ends_with("/package-info")
}

fn index_entry(entry: &ClasspathEntry) -> Result<Vec<ClassStub>, ClasspathError> {
    match entry {
        ClasspathEntry::ClassDir(dir) => index_class_dir(dir),
        ClasspathEntry::Jar(path) => index_jar(path),
    }
}

fn index_class_dir(dir: &Path) -> Result<Vec<ClassStub>, ClasspathError> {
    let mut out = Vec::new();
    for entry in class_files(dir) {
        let bytes = std::fs::read(entry.path())?;
        if let Some(stub) = stub_from_bytes(&bytes, &entry.path().display().to_string()) {
            out.push(stub);
        }
    }
    out.sort_by(|a, b| a.internal_name.cmp(&b.internal_name));
    Ok(out)
}

fn index_jar(path: &Path) -> Result<Vec<ClassStub>, ClasspathError> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let is_multi_release = jar_is_multi_release(&mut archive);

    // Versioned entries of a multi-release jar only fill in classes the base layer lacks,
    // preferring the highest version.
    let mut best: HashMap<String, (u32, ClassStub)> = HashMap::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if !file.is_file() {
            continue;
        }
        let name = file.name().to_owned();
        if !name.ends_with(".class") {
            continue;
        }

        let version = if let Some(rest) = name.strip_prefix("META-INF/versions/") {
            if !is_multi_release {
                continue;
            }
            let Some((version, _path)) = rest.split_once('/') else {
                continue;
            };
            match version.parse::<u32>() {
                Ok(v) => v,
                Err(_) => continue,
            }
        } else if name.starts_with("META-INF/") {
            continue;
        } else {
            0
        };

        let mut bytes = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut bytes)?;
        let Some(stub) = stub_from_bytes(&bytes, &name) else {
            continue;
        };

        match best.get(&stub.internal_name) {
            Some((existing, _)) if *existing == 0 => {}
            Some((existing, _)) if version != 0 && version <= *existing => {}
            _ => {
                best.insert(stub.internal_name.clone(), (version, stub));
            }
        }
    }

    let mut out: Vec<ClassStub> = best.into_values().map(|(_, stub)| stub).collect();
    out.sort_by(|a, b| a.internal_name.cmp(&b.internal_name));
    Ok(out)
}

fn stub_from_bytes(bytes: &[u8], origin: &str) -> Option<ClassStub> {
    let stub = ClassFile::parse(bytes).and_then(|class| class.stub());
    match stub {
        Ok(stub) if is_ignored_class(&stub.internal_name) => None,
        Ok(stub) => Some(stub),
        Err(err) => {
            tracing::debug!(target: TRACE_TARGET, origin, error = %err, "skipping unreadable class");
            None
        }
    }
}

fn jar_is_multi_release<R: Read + Seek>(archive: &mut zip::ZipArchive<R>) -> bool {
    let Ok(mut file) = archive.by_name("META-INF/MANIFEST.MF") else {
        return false;
    };
    let mut manifest = String::new();
    if file.read_to_string(&mut manifest).is_err() {
        return false;
    }
    manifest_is_multi_release(&manifest)
}

fn manifest_is_multi_release(manifest: &str) -> bool {
    manifest.lines().any(|line| {
        line.split_once(':').is_some_and(|(key, value)| {
            key.trim().eq_ignore_ascii_case("Multi-Release")
                && value.trim().eq_ignore_ascii_case("true")
        })
    })
}
