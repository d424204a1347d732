use crate::compression::{self, CompressionError};
use crate::*;
use binread::{BinRead, BinReaderExt};
use derivative::*;
use indexmap::IndexMap;
use log::warn;
use std::io::{Read, Seek, SeekFrom};
use thiserror::Error;

#[derive(Error, Debug)]
/// An enum representing all possible errors when reading or editing a PAK archive
pub enum PakError {
    #[error("Invalid {0} value: \"{1}\"")]
    InvalidData(String, String),
    #[error("Asset {0} is not in this archive")]
    UnknownAsset(AssetId),
    #[error("Asset {0} is already in this archive")]
    DuplicateAsset(AssetId),
    #[error("Asset {0} is a named resource and cannot be removed")]
    NamedResource(AssetId),
    #[error("Invalid UTF resource name")]
    InvalidName(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error(transparent)]
    ParseError(#[from] binread::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, PakError>;

/// An entry of the named-resource table. The engine looks these up by name,
/// so they can never be removed from the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedResource {
    pub kind: AssetType,
    pub id: AssetId,
    pub name: String,
}

/// One row of the resource table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceEntry {
    pub compressed: bool,
    pub kind: AssetType,
    pub id: AssetId,
    /// Stored length of the body, framing included and padding excluded
    pub size: u32,
    pub offset: u32,
}

/// Everything in an archive except the resource bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOfContents {
    pub game: GameVersion,
    pub named_resources: Vec<NamedResource>,
    pub entries: Vec<ResourceEntry>,
}

impl TableOfContents {
    pub fn contains(&self, id: AssetId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub fn is_named(&self, id: AssetId) -> bool {
        self.named_resources.iter().any(|named| named.id == id)
    }

    pub fn asset_type(&self, id: AssetId) -> Option<AssetType> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.kind)
    }
}

#[derive(BinRead)]
#[br(import(width: IdWidth))]
struct NamedResourceRecord {
    kind: AssetType,
    #[br(args(width))]
    id: AssetId,
    name_len: u32,
    #[br(count = name_len as usize)]
    name: Vec<u8>,
}

#[derive(BinRead)]
#[br(import(width: IdWidth))]
struct ResourceRecord {
    compressed: u32,
    kind: AssetType,
    #[br(args(width))]
    id: AssetId,
    size: u32,
    offset: u32,
}

/// A resource body held by a fully parsed archive.
#[derive(Clone, PartialEq, Eq)]
pub(crate) enum PakResource {
    /// Exactly the bytes found on disk, written back untouched.
    Stored {
        kind: AssetType,
        compressed: bool,
        bytes: Vec<u8>,
    },
    Modified(RawResource),
}

impl PakResource {
    pub(crate) fn kind(&self) -> AssetType {
        match self {
            Self::Stored { kind, .. } => *kind,
            Self::Modified(raw) => raw.kind,
        }
    }
}

#[derive(Derivative, Clone)]
#[derivative(Debug)]
/// A fully parsed PAK archive, editable in memory
pub struct Pak {
    pub(crate) game: GameVersion,
    named_resources: Vec<NamedResource>,
    #[derivative(Debug = "ignore")]
    pub(crate) resources: IndexMap<AssetId, PakResource>,
}

impl PartialEq for Pak {
    /// Returns true if both archives hold the same resources and names
    fn eq(&self, other: &Self) -> bool {
        self.game == other.game
            && self.named_resources == other.named_resources
            && self.resources == other.resources
    }
}

impl Pak {
    /// Creates an empty archive
    pub fn new(game: GameVersion) -> Pak {
        Pak {
            game,
            named_resources: vec![],
            resources: IndexMap::new(),
        }
    }

    /// Reads the header, named-resource table and resource table without
    /// touching any resource body
    pub fn read_table_of_contents<R: Read + Seek>(
        reader: &mut R,
        game: GameVersion,
    ) -> Result<TableOfContents> {
        let start = reader.stream_position()?;
        let header: PakHeader = reader.read_be()?;
        let expected = game.pak_version();
        if (header.version_major, header.version_minor) != expected {
            return Err(PakError::InvalidData(
                "PAK version".to_owned(),
                format!("{}.{}", header.version_major, header.version_minor),
            ));
        }

        let width = game.id_width();
        let named_count: u32 = reader.read_be()?;
        let mut named_resources = Vec::with_capacity(named_count.min(0x1000) as usize);
        for _ in 0..named_count {
            let record: NamedResourceRecord = reader.read_be_args((width,))?;
            named_resources.push(NamedResource {
                kind: record.kind,
                id: record.id,
                name: std::str::from_utf8(&record.name)?.to_owned(),
            });
        }

        let resource_count: u32 = reader.read_be()?;
        let mut entries = Vec::with_capacity(resource_count.min(0x10000) as usize);
        for _ in 0..resource_count {
            let record: ResourceRecord = reader.read_be_args((width,))?;
            let compressed = match record.compressed {
                0 => false,
                1 => true,
                other => {
                    return Err(PakError::InvalidData(
                        "compression flag".to_owned(),
                        other.to_string(),
                    ))
                }
            };
            if compressed && game.compression() == CompressionScheme::None {
                return Err(PakError::InvalidData(
                    "compression flag".to_owned(),
                    format!("{} in an uncompressed archive", record.id),
                ));
            }
            entries.push(ResourceEntry {
                compressed,
                kind: record.kind,
                id: record.id,
                size: record.size,
                offset: record.offset,
            });
        }

        let archive_len = reader.seek(SeekFrom::End(0))? - start;
        for entry in &entries {
            if entry.offset as u64 + entry.size as u64 > archive_len {
                return Err(PakError::InvalidData(
                    "resource extent".to_owned(),
                    format!("{} at {:#x}+{:#x}", entry.id, entry.offset, entry.size),
                ));
            }
        }

        Ok(TableOfContents {
            game,
            named_resources,
            entries,
        })
    }

    /// Parses a whole archive, bodies included
    pub fn parse<R: Read + Seek>(reader: &mut R, game: GameVersion) -> Result<Pak> {
        let start = reader.stream_position()?;
        let toc = Self::read_table_of_contents(reader, game)?;
        let mut resources = IndexMap::with_capacity(toc.entries.len());
        for entry in &toc.entries {
            if resources.contains_key(&entry.id) {
                warn!("Duplicate entry for {} in resource table, keeping the first", entry.id);
                continue;
            }
            reader.seek(SeekFrom::Start(start + entry.offset as u64))?;
            let mut bytes = vec![0u8; entry.size as usize];
            reader.read_exact(&mut bytes)?;
            resources.insert(
                entry.id,
                PakResource::Stored {
                    kind: entry.kind,
                    compressed: entry.compressed,
                    bytes,
                },
            );
        }
        Ok(Pak {
            game,
            named_resources: toc.named_resources,
            resources,
        })
    }

    /// Parses an archive held in memory
    pub fn from_bytes(data: &[u8], game: GameVersion) -> Result<Pak> {
        Self::parse(&mut std::io::Cursor::new(data), game)
    }

    /// Get the game this archive belongs to
    pub fn game(&self) -> GameVersion {
        self.game
    }

    /// Get the number of resources in the archive
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn contains(&self, id: AssetId) -> bool {
        self.resources.contains_key(&id)
    }

    /// Returns the ids of every resource, in archive order
    pub fn asset_ids(&self) -> impl Iterator<Item = AssetId> + '_ {
        self.resources.keys().copied()
    }

    pub fn named_resources(&self) -> &[NamedResource] {
        &self.named_resources
    }

    pub fn is_named(&self, id: AssetId) -> bool {
        self.named_resources.iter().any(|named| named.id == id)
    }

    /// Adds an entry to the named-resource table. The asset must already be
    /// in the archive.
    pub fn add_named_resource(&mut self, name: &str, id: AssetId) -> Result<()> {
        let kind = self
            .resources
            .get(&id)
            .map(PakResource::kind)
            .ok_or(PakError::UnknownAsset(id))?;
        self.named_resources.push(NamedResource {
            kind,
            id,
            name: name.to_owned(),
        });
        Ok(())
    }

    /// Get a resource by id, decompressing it if needed
    pub fn get_asset(&self, id: AssetId) -> Result<Option<RawResource>> {
        Ok(match self.resources.get(&id) {
            None => None,
            Some(PakResource::Modified(raw)) => Some(raw.clone()),
            Some(PakResource::Stored {
                kind,
                compressed,
                bytes,
            }) => Some(RawResource {
                kind: *kind,
                data: if *compressed {
                    compression::decompress(self.game.compression(), bytes)?
                } else {
                    bytes.clone()
                },
                compressed: *compressed,
            }),
        })
    }

    /// Replaces the body of `id`. A named resource keeps its name and takes
    /// the new type.
    pub fn replace_asset(&mut self, id: AssetId, resource: RawResource) -> Result<()> {
        let existing = self
            .resources
            .get_mut(&id)
            .ok_or(PakError::UnknownAsset(id))?;
        for named in self.named_resources.iter_mut().filter(|named| named.id == id) {
            named.kind = resource.kind;
        }
        *existing = PakResource::Modified(resource);
        Ok(())
    }

    /// Appends a new resource at the end of the archive
    pub fn add_asset(&mut self, id: AssetId, resource: RawResource) -> Result<()> {
        if self.resources.contains_key(&id) {
            return Err(PakError::DuplicateAsset(id));
        }
        self.resources.insert(id, PakResource::Modified(resource));
        Ok(())
    }

    pub fn remove_asset(&mut self, id: AssetId) -> Result<()> {
        if self.is_named(id) {
            return Err(PakError::NamedResource(id));
        }
        self.resources
            .shift_remove(&id)
            .map(|_| ())
            .ok_or(PakError::UnknownAsset(id))
    }
}
