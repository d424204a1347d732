use crate::compression::{self, CompressionError};
use crate::parse::PakResource;
use crate::*;
use num::ToPrimitive;
use std::borrow::Cow;
use std::io::{Cursor, Write};
use thiserror::Error;

type Result<T> = core::result::Result<T, PakWriteError>;

#[derive(Debug, Error)]
pub enum PakWriteError {
    #[error("Archive exceeds the 4 GiB offset range at {0:#x}")]
    TooLarge(usize),
    #[error("Could not compress {0}: {1}")]
    Compression(AssetId, #[source] CompressionError),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// A body ready to be laid out: the bytes to store and how to flag them.
struct Body<'a> {
    id: AssetId,
    kind: AssetType,
    compressed: bool,
    bytes: Cow<'a, [u8]>,
}

fn to_u32(value: usize) -> Result<u32> {
    value.to_u32().ok_or(PakWriteError::TooLarge(value))
}

fn pad<W: Write>(writer: &mut W, len: usize, byte: u8) -> std::io::Result<()> {
    writer.write_all(&vec![byte; len])
}

impl Pak {
    pub fn write_to_bytes(&self) -> Result<Vec<u8>> {
        let est_size: usize = 0x40
            + self
                .resources
                .values()
                .map(|resource| {
                    let len = match resource {
                        PakResource::Stored { bytes, .. } => bytes.len(),
                        PakResource::Modified(raw) => raw.data.len(),
                    };
                    len + PAK_ALIGNMENT + 0x20
                })
                .sum::<usize>();
        let mut buf: Vec<u8> =
            Vec::with_capacity((est_size as f32 * 1.1).to_usize().unwrap_or(est_size));
        self.write(&mut Cursor::new(&mut buf))?;
        Ok(buf)
    }

    /// Bodies in archive order. Untouched ones are borrowed verbatim; modified
    /// ones are compressed again if they ask for it and the game supports it.
    fn bodies(&self) -> Result<Vec<Body<'_>>> {
        let scheme = self.game.compression();
        self.resources
            .iter()
            .map(|(id, resource)| {
                Ok(match resource {
                    PakResource::Stored {
                        kind,
                        compressed,
                        bytes,
                    } => Body {
                        id: *id,
                        kind: *kind,
                        compressed: *compressed,
                        bytes: Cow::Borrowed(bytes.as_slice()),
                    },
                    PakResource::Modified(raw)
                        if raw.compressed && scheme != CompressionScheme::None =>
                    {
                        Body {
                            id: *id,
                            kind: raw.kind,
                            compressed: true,
                            bytes: Cow::Owned(
                                compression::compress(scheme, &raw.data)
                                    .map_err(|e| PakWriteError::Compression(*id, e))?,
                            ),
                        }
                    }
                    PakResource::Modified(raw) => Body {
                        id: *id,
                        kind: raw.kind,
                        compressed: false,
                        bytes: Cow::Borrowed(raw.data.as_slice()),
                    },
                })
            })
            .collect()
    }

    /// End of the tables, start of the first body and the offset of each body.
    fn layout(&self, bodies: &[Body<'_>]) -> Result<(usize, usize, Vec<u32>)> {
        let width = self.game.id_width();
        let named_size: usize = self
            .named_resources()
            .iter()
            .map(|named| 4 + width.bytes() + 4 + named.name.len())
            .sum();
        let tables_end = 0x08 + 4 + named_size + 4 + bodies.len() * (16 + width.bytes());
        let data_start = align(tables_end, PAK_ALIGNMENT);

        let mut offsets = Vec::with_capacity(bodies.len());
        let mut pos = data_start;
        for body in bodies {
            offsets.push(to_u32(pos)?);
            pos = align(pos + body.bytes.len(), PAK_ALIGNMENT);
        }
        to_u32(pos)?;
        Ok((tables_end, data_start, offsets))
    }

    /// The tables this archive would be written with.
    pub fn table_of_contents(&self) -> Result<TableOfContents> {
        let bodies = self.bodies()?;
        let (_, _, offsets) = self.layout(&bodies)?;
        let entries = bodies
            .iter()
            .zip(offsets)
            .map(|(body, offset)| {
                Ok(ResourceEntry {
                    compressed: body.compressed,
                    kind: body.kind,
                    id: body.id,
                    size: to_u32(body.bytes.len())?,
                    offset,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(TableOfContents {
            game: self.game,
            named_resources: self.named_resources().to_vec(),
            entries,
        })
    }

    /// Builds the archive.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut opts = binwrite::WriterOption::default();
        opts.endian = binwrite::Endian::Big;
        let width = self.game.id_width();

        let bodies = self.bodies()?;
        let (tables_end, data_start, offsets) = self.layout(&bodies)?;

        let (version_major, version_minor) = self.game.pak_version();
        PakHeader {
            version_major,
            version_minor,
            reserved: 0,
        }
        .write_options(writer, &opts)?;

        to_u32(self.named_resources().len())?.write_options(writer, &opts)?;
        for named in self.named_resources() {
            named.kind.write_options(writer, &opts)?;
            writer.write_all(&named.id.to_be_bytes(width))?;
            to_u32(named.name.len())?.write_options(writer, &opts)?;
            writer.write_all(named.name.as_bytes())?;
        }

        to_u32(bodies.len())?.write_options(writer, &opts)?;
        for (body, offset) in bodies.iter().zip(offsets.iter()) {
            (body.compressed as u32).write_options(writer, &opts)?;
            body.kind.write_options(writer, &opts)?;
            writer.write_all(&body.id.to_be_bytes(width))?;
            to_u32(body.bytes.len())?.write_options(writer, &opts)?;
            offset.write_options(writer, &opts)?;
        }
        pad(writer, data_start - tables_end, TABLE_PADDING)?;

        for body in &bodies {
            writer.write_all(&body.bytes)?;
            let len = body.bytes.len();
            pad(writer, align(len, PAK_ALIGNMENT) - len, BODY_PADDING)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::*;

    fn sample_pak(game: GameVersion) -> Pak {
        let mut pak = Pak::new(game);
        pak.add_asset(AssetId(0x10), RawResource::new(AssetType(*b"FOO "), vec![7; 40]))
            .unwrap();
        pak.add_asset(
            AssetId(0x20),
            RawResource::compressed(AssetType(*b"TXTR"), (0..2000u32).map(|i| (i / 9) as u8).collect()),
        )
        .unwrap();
        pak.add_asset(AssetId(0x30), RawResource::new(AssetType(*b"MLVL"), vec![]))
            .unwrap();
        pak.add_named_resource("Level", AssetId(0x30)).unwrap();
        pak
    }

    #[test]
    fn make_pak() {
        for game in [
            GameVersion::Prime,
            GameVersion::Echoes,
            GameVersion::Corruption,
            GameVersion::Remastered,
        ] {
            let data = sample_pak(game).write_to_bytes().unwrap();
            let pak = Pak::from_bytes(&data, game).unwrap();
            let new_data = pak.write_to_bytes().unwrap();
            if data != new_data {
                panic!(
                    "Roundtrip not binary identical for {:?}, wrong byte at offset {}",
                    game,
                    data.iter()
                        .zip(new_data.iter())
                        .enumerate()
                        .find(|(_, (b1, b2))| *b1 != *b2)
                        .map(|(i, _)| i)
                        .unwrap_or_else(|| data.len().min(new_data.len()))
                );
            }
            assert_eq!(
                pak.get_asset(AssetId(0x20)).unwrap().unwrap().data.len(),
                2000
            );
        }
    }

    #[test]
    fn layout() {
        let data = sample_pak(GameVersion::Prime).write_to_bytes().unwrap();
        assert_eq!(&data[..8], &[0, 3, 0, 5, 0, 0, 0, 0]);
        assert_eq!(data.len() % 32, 0);
        let toc = Pak::read_table_of_contents(&mut std::io::Cursor::new(&data), GameVersion::Prime)
            .unwrap();
        let foo = toc.entries[0];
        let end = foo.offset as usize + foo.size as usize;
        assert!(data[end..end + 24].iter().all(|b| *b == 0xFF));
        assert_eq!(&data[foo.offset as usize..end], &[7; 40][..]);
        let tables_end = 8 + 4 + (4 + 4 + 4 + 5) + 4 + 3 * 20;
        assert!(data[tables_end..toc.entries[0].offset as usize]
            .iter()
            .all(|b| *b == 0));
    }

    #[test]
    fn table_of_contents_matches_output() {
        let pak = sample_pak(GameVersion::Echoes);
        let data = pak.write_to_bytes().unwrap();
        let toc = Pak::read_table_of_contents(&mut std::io::Cursor::new(&data), GameVersion::Echoes)
            .unwrap();
        assert_eq!(pak.table_of_contents().unwrap(), toc);
        assert!(toc.is_named(AssetId(0x30)));
        assert!(toc.entries[1].compressed);
    }

    #[test]
    fn wide_ids() {
        let mut pak = Pak::new(GameVersion::Corruption);
        let id = AssetId(0x0123_4567_89AB_CDEF);
        pak.add_asset(id, RawResource::new(AssetType(*b"STRG"), b"text".to_vec()))
            .unwrap();
        let data = pak.write_to_bytes().unwrap();
        assert_eq!(&data[..4], &[0, 3, 0, 6]);
        // header, empty named table, count, then the first row
        let row = 8 + 4 + 4;
        assert_eq!(&data[row + 8..row + 16], &id.value().to_be_bytes()[8..]);
        let pak = Pak::from_bytes(&data, GameVersion::Corruption).unwrap();
        assert!(pak.contains(id));
    }

    #[test]
    fn uncompressed_games_store_plainly() {
        let pak = sample_pak(GameVersion::Remastered);
        let data = pak.write_to_bytes().unwrap();
        let toc = Pak::read_table_of_contents(
            &mut std::io::Cursor::new(&data),
            GameVersion::Remastered,
        )
        .unwrap();
        assert!(toc.entries.iter().all(|entry| !entry.compressed));
        assert_eq!(toc.entries[1].size, 2000);
    }

    #[test]
    fn edits_keep_order() {
        let data = sample_pak(GameVersion::Echoes).write_to_bytes().unwrap();
        let mut pak = Pak::from_bytes(&data, GameVersion::Echoes).unwrap();
        pak.remove_asset(AssetId(0x10)).unwrap();
        pak.add_asset(AssetId(0x05), RawResource::new(AssetType(*b"FOO "), vec![1, 2, 3]))
            .unwrap();
        pak.replace_asset(AssetId(0x20), RawResource::new(AssetType(*b"TXTR"), vec![9; 8]))
            .unwrap();
        let pak = Pak::from_bytes(&pak.write_to_bytes().unwrap(), GameVersion::Echoes).unwrap();
        assert_eq!(
            pak.asset_ids().collect::<Vec<_>>(),
            vec![AssetId(0x20), AssetId(0x30), AssetId(0x05)]
        );
        let txtr = pak.get_asset(AssetId(0x20)).unwrap().unwrap();
        assert_eq!(txtr.data, vec![9; 8]);
        assert!(!txtr.compressed);
    }
}
