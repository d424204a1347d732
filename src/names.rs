use crate::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Side-car file mapping custom asset names to ids, at the root of the game
/// files.
pub const CUSTOM_NAMES_FILE: &str = "custom_names.json";

pub(crate) fn read_custom_names(
    provider: &dyn FileProvider,
) -> Result<BTreeMap<String, AssetId>, AssetError> {
    if !provider.is_file(CUSTOM_NAMES_FILE) {
        return Ok(BTreeMap::new());
    }
    let reader = provider.open_binary(CUSTOM_NAMES_FILE)?;
    Ok(serde_json::from_reader(reader)?)
}

/// Rewrites the whole table, so an interrupted save can leave it stale but
/// never half written.
pub(crate) fn write_custom_names(
    output_dir: &Path,
    names: &BTreeMap<String, AssetId>,
) -> Result<(), AssetError> {
    let mut writer = BufWriter::new(File::create(output_dir.join(CUSTOM_NAMES_FILE))?);
    serde_json::to_writer_pretty(&mut writer, names)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut names = BTreeMap::new();
        names.insert("Phazon Suit Scan".to_owned(), AssetId(0xFFFF_0000));
        names.insert("door".to_owned(), AssetId(0x10));
        write_custom_names(dir.path(), &names).unwrap();

        let text = std::fs::read_to_string(dir.path().join(CUSTOM_NAMES_FILE)).unwrap();
        assert!(text.contains("\"door\": \"0x00000010\""));

        let provider = DirectoryProvider::new(dir.path());
        assert_eq!(read_custom_names(&provider).unwrap(), names);
    }

    #[test]
    fn missing_table_is_empty() {
        let provider = MemoryProvider::new();
        assert!(read_custom_names(&provider).unwrap().is_empty());
    }

    #[test]
    fn malformed_table() {
        let provider = MemoryProvider::new().with_file(CUSTOM_NAMES_FILE, b"{\"a\": 12}".to_vec());
        assert!(matches!(
            read_custom_names(&provider),
            Err(AssetError::CustomNames(_))
        ));
    }
}
