use crate::*;
use cached::proc_macro::cached;
use std::any::Any;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("No codec is registered for {0}")]
    Unregistered(AssetType),
    #[error("Invalid {0} data: {1}")]
    InvalidData(AssetType, String),
    #[error(transparent)]
    ParseError(#[from] binread::Error),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// A structured resource format, keyed by its four character code.
pub trait AssetFormat: Sized + 'static {
    const ASSET_TYPE: AssetType;

    fn parse(data: &[u8], game: GameVersion) -> Result<Self, CodecError>;

    fn build(&self, game: GameVersion) -> Result<Vec<u8>, CodecError>;
}

/// A format that can list the assets it references.
pub trait DependencyHook: AssetFormat {
    fn dependencies_for(&self, game: GameVersion) -> Vec<Dependency>;
}

type ParseFn = fn(&[u8], GameVersion) -> Result<Box<dyn Any>, CodecError>;
pub(crate) type DependenciesFn = fn(&[u8], GameVersion) -> Result<Vec<Dependency>, CodecError>;

fn parse_erased<T: AssetFormat>(data: &[u8], game: GameVersion) -> Result<Box<dyn Any>, CodecError> {
    Ok(Box::new(T::parse(data, game)?))
}

fn dependencies_erased<T: DependencyHook>(
    data: &[u8],
    game: GameVersion,
) -> Result<Vec<Dependency>, CodecError> {
    Ok(T::parse(data, game)?.dependencies_for(game))
}

#[derive(Default, Clone, Copy)]
struct CodecEntry {
    parse: Option<ParseFn>,
    dependencies: Option<DependenciesFn>,
    no_dependencies: bool,
}

/// How the dependencies of one asset type are found.
#[derive(Clone, Copy)]
pub(crate) enum DependencyStrategy {
    None,
    Structured(DependenciesFn),
    Unstructured,
}

/// Types that never reference other assets.
#[cached]
fn default_no_dependency_types(game: GameVersion) -> Vec<AssetType> {
    let mut types: Vec<AssetType> = [b"AGSC", b"ATBL", b"CSNG", b"CTWK", b"DUMB", b"PATH", b"SAVW"]
        .iter()
        .map(|code| AssetType::from(*code))
        .collect();
    match game {
        GameVersion::Prime | GameVersion::Echoes => types.push(AssetType(*b"AFSM")),
        GameVersion::Corruption => types.push(AssetType(*b"FSM2")),
        GameVersion::Remastered => {}
    }
    types
}

/// Table of structured decoders, resolved once when a format is registered.
#[derive(Default, Clone)]
pub struct CodecRegistry {
    entries: HashMap<AssetType, CodecEntry>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that already knows which of `game`'s formats carry no
    /// references.
    pub fn for_game(game: GameVersion) -> Self {
        let mut registry = Self::new();
        for kind in default_no_dependency_types(game) {
            registry.mark_no_dependencies(kind);
        }
        registry
    }

    pub fn register<T: AssetFormat>(&mut self) -> &mut Self {
        self.entries.entry(T::ASSET_TYPE).or_default().parse = Some(parse_erased::<T>);
        self
    }

    pub fn register_with_dependencies<T: DependencyHook>(&mut self) -> &mut Self {
        let entry = self.entries.entry(T::ASSET_TYPE).or_default();
        entry.parse = Some(parse_erased::<T>);
        entry.dependencies = Some(dependencies_erased::<T>);
        entry.no_dependencies = false;
        self
    }

    pub fn mark_no_dependencies(&mut self, kind: AssetType) -> &mut Self {
        let entry = self.entries.entry(kind).or_default();
        entry.no_dependencies = true;
        entry.dependencies = None;
        self
    }

    pub fn is_registered(&self, kind: AssetType) -> bool {
        self.entries
            .get(&kind)
            .map_or(false, |entry| entry.parse.is_some())
    }

    pub fn has_no_dependencies(&self, kind: AssetType) -> bool {
        self.entries
            .get(&kind)
            .map_or(false, |entry| entry.no_dependencies)
    }

    pub fn has_dependency_hook(&self, kind: AssetType) -> bool {
        self.entries
            .get(&kind)
            .map_or(false, |entry| entry.dependencies.is_some())
    }

    /// Decodes `data` with the codec registered for `kind`.
    pub fn parse(
        &self,
        kind: AssetType,
        data: &[u8],
        game: GameVersion,
    ) -> Result<Box<dyn Any>, CodecError> {
        match self.entries.get(&kind).and_then(|entry| entry.parse) {
            Some(parse) => parse(data, game),
            None => Err(CodecError::Unregistered(kind)),
        }
    }

    pub(crate) fn dependency_strategy(&self, kind: AssetType) -> DependencyStrategy {
        match self.entries.get(&kind) {
            Some(entry) if entry.no_dependencies => DependencyStrategy::None,
            Some(CodecEntry {
                dependencies: Some(hook),
                ..
            }) => DependencyStrategy::Structured(*hook),
            _ => DependencyStrategy::Unstructured,
        }
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&AssetType> = self.entries.keys().collect();
        kinds.sort();
        f.debug_struct("CodecRegistry").field("types", &kinds).finish()
    }
}
