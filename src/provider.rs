use glob::{MatchOptions, Pattern};
use indexmap::IndexSet;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek};
use std::path::{Component, Path, PathBuf};

/// Anything a resource archive can be read from.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// A source of game files: a plain directory, an extracted or mounted disc
/// image, or an in-memory set of files.
///
/// File names are relative paths separated by `/`.
pub trait FileProvider {
    fn is_file(&self, name: &str) -> bool;

    /// Lists every file whose name matches the glob `pattern`, e.g. `**/*.pak`.
    fn glob(&self, pattern: &str) -> io::Result<Box<dyn Iterator<Item = String> + '_>>;

    fn open_binary(&self, name: &str) -> io::Result<Box<dyn ReadSeek + '_>>;
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

fn compile(pattern: &str) -> io::Result<Pattern> {
    Pattern::new(pattern).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Files below a directory on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        DirectoryProvider { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative_name(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts = relative
            .components()
            .map(|component| match component {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }
}

impl FileProvider for DirectoryProvider {
    fn is_file(&self, name: &str) -> bool {
        self.root.join(name).is_file()
    }

    fn glob(&self, pattern: &str) -> io::Result<Box<dyn Iterator<Item = String> + '_>> {
        let root = Pattern::escape(&self.root.to_string_lossy());
        let full = format!("{}/{}", root.trim_end_matches('/'), pattern);
        let paths = glob::glob_with(&full, match_options())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(Box::new(
            paths
                .filter_map(|entry| entry.ok())
                .filter(|path| path.is_file())
                .filter_map(move |path| self.relative_name(&path)),
        ))
    }

    fn open_binary(&self, name: &str) -> io::Result<Box<dyn ReadSeek + '_>> {
        Ok(Box::new(BufReader::new(File::open(self.root.join(name))?)))
    }
}

/// Files held in memory. Useful for disc images decoded up front and for tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryProvider {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, data: Vec<u8>) {
        self.files.insert(name.into(), data);
    }

    pub fn with_file<S: Into<String>>(mut self, name: S, data: Vec<u8>) -> Self {
        self.insert(name, data);
        self
    }
}

impl FileProvider for MemoryProvider {
    fn is_file(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    fn glob(&self, pattern: &str) -> io::Result<Box<dyn Iterator<Item = String> + '_>> {
        let pattern = compile(pattern)?;
        Ok(Box::new(
            self.files
                .keys()
                .filter(move |name| pattern.matches_with(name, match_options()))
                .cloned(),
        ))
    }

    fn open_binary(&self, name: &str) -> io::Result<Box<dyn ReadSeek + '_>> {
        match self.files.get(name) {
            Some(data) => Ok(Box::new(Cursor::new(data.as_slice()))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not in the file set", name),
            )),
        }
    }
}

/// Reads from `upper` first and falls back to `lower`. After a save, the
/// output directory sits above the original source.
pub struct LayeredProvider {
    upper: Box<dyn FileProvider>,
    lower: Box<dyn FileProvider>,
}

impl LayeredProvider {
    pub fn new<U, L>(upper: U, lower: L) -> Self
    where
        U: FileProvider + 'static,
        L: FileProvider + 'static,
    {
        LayeredProvider {
            upper: Box::new(upper),
            lower: Box::new(lower),
        }
    }

    pub(crate) fn from_boxed(upper: Box<dyn FileProvider>, lower: Box<dyn FileProvider>) -> Self {
        LayeredProvider { upper, lower }
    }
}

impl FileProvider for LayeredProvider {
    fn is_file(&self, name: &str) -> bool {
        self.upper.is_file(name) || self.lower.is_file(name)
    }

    fn glob(&self, pattern: &str) -> io::Result<Box<dyn Iterator<Item = String> + '_>> {
        let mut names: IndexSet<String> = self.upper.glob(pattern)?.collect();
        names.extend(self.lower.glob(pattern)?);
        Ok(Box::new(names.into_iter()))
    }

    fn open_binary(&self, name: &str) -> io::Result<Box<dyn ReadSeek + '_>> {
        if self.upper.is_file(name) {
            self.upper.open_binary(name)
        } else {
            self.lower.open_binary(name)
        }
    }
}
