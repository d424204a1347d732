//! Reading, editing and rebuilding the PAK resource archives of the Metroid
//! Prime series.
//!
//! [`Pak`] is a bit-exact codec for a single archive. [`AssetManager`] indexes
//! every archive a [`FileProvider`] exposes, overlays edits on top of them and
//! writes back only the archives that changed. [`DependencyResolver`] walks the
//! reference graph between assets.
use binread::{BinRead, BinResult, ReadOptions};
use binwrite::{BinWrite, WriterOption};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::{Read, Seek, Write};
use std::str::FromStr;

mod codec;
mod compression;
mod dependencies;
mod error;
mod manager;
mod names;
mod parse;
mod provider;
mod writer;

pub use codec::{AssetFormat, CodecError, CodecRegistry, DependencyHook};
pub use compression::CompressionError;
pub use dependencies::{
    AssetLookup, ClosureOptions, DependencyResolver, DependencyScan, HeuristicScan,
    ParticleScan,
};
pub use error::{AssetError, ErrorKind};
pub use manager::{AssetManager, AssetRef};
pub use names::CUSTOM_NAMES_FILE;
pub use parse::{NamedResource, Pak, PakError, ResourceEntry, TableOfContents};
pub use provider::{DirectoryProvider, FileProvider, LayeredProvider, MemoryProvider, ReadSeek};
pub use writer::PakWriteError;

/// Every resource body starts on a multiple of this.
const PAK_ALIGNMENT: usize = 32;
const BODY_PADDING: u8 = 0xFF;
const TABLE_PADDING: u8 = 0x00;

fn align(pos: usize, alignment: usize) -> usize {
    (pos + alignment - 1) & !(alignment - 1)
}

/// Size of the archive identifier in bytes, fixed per game.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone, Serialize, Deserialize)]
pub enum IdWidth {
    U32,
    U64,
    Guid,
}

impl IdWidth {
    pub fn bytes(self) -> usize {
        match self {
            Self::U32 => 4,
            Self::U64 => 8,
            Self::Guid => 16,
        }
    }

    /// The all-ones id of this width, which the engine uses for "no asset".
    pub fn sentinel(self) -> AssetId {
        AssetId(match self {
            Self::U32 => u32::MAX as u128,
            Self::U64 => u64::MAX as u128,
            Self::Guid => u128::MAX,
        })
    }

    pub fn is_valid(self, id: AssetId) -> bool {
        id.0 < self.sentinel().0
    }

    /// Where freshly generated ids start counting from.
    fn first_generated(self) -> AssetId {
        AssetId(match self {
            Self::U32 => 0xFFFF_0000,
            Self::U64 => 0xFFFF_FFFF_0000_0000,
            Self::Guid => 0xFFFF_FFFF_FFFF_FFFF_0000_0000_0000_0000,
        })
    }

    fn next(self, id: AssetId) -> Option<AssetId> {
        let next = AssetId(id.0.checked_add(1)?);
        if self.is_valid(next) {
            Some(next)
        } else {
            None
        }
    }
}

/// How compressed bodies are encoded after their size prefix.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone, Serialize, Deserialize)]
pub enum CompressionScheme {
    None,
    /// LZ4 blocks in segments of at most 0x4000 decompressed bytes.
    SegmentedLz,
    /// A single zlib stream.
    Deflate,
}

/// The game an archive set belongs to. Selects the id width, compression
/// scheme and header version of every archive.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone, Serialize, Deserialize)]
pub enum GameVersion {
    Prime,
    Echoes,
    Corruption,
    Remastered,
}

impl GameVersion {
    pub fn id_width(self) -> IdWidth {
        match self {
            Self::Prime | Self::Echoes => IdWidth::U32,
            Self::Corruption => IdWidth::U64,
            Self::Remastered => IdWidth::Guid,
        }
    }

    pub fn compression(self) -> CompressionScheme {
        match self {
            Self::Prime => CompressionScheme::Deflate,
            Self::Echoes | Self::Corruption => CompressionScheme::SegmentedLz,
            Self::Remastered => CompressionScheme::None,
        }
    }

    /// `(major, minor)` stored in the archive header.
    pub fn pak_version(self) -> (u16, u16) {
        match self {
            Self::Prime | Self::Echoes => (3, 5),
            Self::Corruption => (3, 6),
            Self::Remastered => (3, 7),
        }
    }

    /// Fails with [`AssetError::InvalidAsset`] if `id` does not fit this
    /// game's id width or is the "no asset" sentinel.
    pub fn validate(self, id: AssetId) -> Result<AssetId, AssetError> {
        if self.id_width().is_valid(id) {
            Ok(id)
        } else {
            Err(AssetError::InvalidAsset { id, game: self })
        }
    }
}

/// Identifier of one asset. Wide enough for every game; [`GameVersion::validate`]
/// checks it against a particular game.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Copy, Clone, Default)]
pub struct AssetId(pub u128);

impl AssetId {
    pub const fn new(value: u128) -> Self {
        AssetId(value)
    }

    pub fn value(self) -> u128 {
        self.0
    }

    /// Reads a big-endian id from exactly `width` bytes at the start of `bytes`.
    pub(crate) fn from_be_slice(bytes: &[u8], width: IdWidth) -> Option<AssetId> {
        let bytes = bytes.get(..width.bytes())?;
        Some(AssetId(
            bytes.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128),
        ))
    }

    pub(crate) fn to_be_bytes(self, width: IdWidth) -> Vec<u8> {
        self.0.to_be_bytes()[16 - width.bytes()..].to_vec()
    }
}

impl From<u32> for AssetId {
    fn from(value: u32) -> Self {
        AssetId(value as u128)
    }
}

impl From<u64> for AssetId {
    fn from(value: u64) -> Self {
        AssetId(value as u128)
    }
}

impl From<u128> for AssetId {
    fn from(value: u128) -> Self {
        AssetId(value)
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl FromStr for AssetId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        u128::from_str_radix(digits, 16).map(AssetId)
    }
}

impl Serialize for AssetId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AssetId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

impl BinRead for AssetId {
    type Args = (IdWidth,);

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        options: &ReadOptions,
        args: Self::Args,
    ) -> BinResult<Self> {
        let (width,) = args;
        let value = match width {
            IdWidth::U32 => u32::read_options(reader, options, ())? as u128,
            IdWidth::U64 => u64::read_options(reader, options, ())? as u128,
            IdWidth::Guid => u128::read_options(reader, options, ())?,
        };
        Ok(AssetId(value))
    }
}

/// Four character code naming the format of a resource, e.g. `TXTR`.
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Copy, Clone, BinRead)]
pub struct AssetType(pub [u8; 4]);

impl AssetType {
    /// Stands in for the type of an id that no archive knows about.
    pub const UNKNOWN: AssetType = AssetType(*b"????");

    pub const fn new(code: [u8; 4]) -> Self {
        AssetType(code)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl From<&[u8; 4]> for AssetType {
    fn from(code: &[u8; 4]) -> Self {
        AssetType(*code)
    }
}

impl BinWrite for AssetType {
    fn write_options<W: Write>(&self, writer: &mut W, _: &WriterOption) -> std::io::Result<()> {
        writer.write_all(&self.0)
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetType({})", self)
    }
}

/// An undecoded resource body.
///
/// `compressed` records how the body should be stored, not how `data` is held:
/// `data` is always the decompressed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResource {
    pub kind: AssetType,
    pub data: Vec<u8>,
    pub compressed: bool,
}

impl RawResource {
    pub fn new(kind: AssetType, data: Vec<u8>) -> Self {
        RawResource {
            kind,
            data,
            compressed: false,
        }
    }

    pub fn compressed(kind: AssetType, data: Vec<u8>) -> Self {
        RawResource {
            kind,
            data,
            compressed: true,
        }
    }
}

/// An edge of the reference graph: the owning asset needs `id` to be loadable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub kind: AssetType,
    pub id: AssetId,
    /// Left out of aggregate closures unless the caller asks for it.
    pub exclude_from_closure_rollup: bool,
    pub may_duplicate: bool,
    /// Found by guessing at raw bytes rather than by a decoder.
    pub heuristic: bool,
}

impl Dependency {
    pub fn new(kind: AssetType, id: AssetId) -> Self {
        Dependency {
            kind,
            id,
            exclude_from_closure_rollup: false,
            may_duplicate: false,
            heuristic: false,
        }
    }

    pub fn excluded_from_rollup(mut self) -> Self {
        self.exclude_from_closure_rollup = true;
        self
    }

    pub fn duplicable(mut self) -> Self {
        self.may_duplicate = true;
        self
    }

    pub(crate) fn heuristic(mut self) -> Self {
        self.heuristic = true;
        self
    }
}

/// Size = 0x08
#[derive(Debug, Eq, PartialEq, Copy, Clone, BinRead, BinWrite)]
struct PakHeader {
    version_major: u16,
    version_minor: u16,
    reserved: u32,
}
