use crate::names::{read_custom_names, write_custom_names};
use crate::*;
use derivative::*;
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

type Result<T> = core::result::Result<T, AssetError>;

/// Every archive below the provider's root.
const PAK_PATTERN: &str = "**/*.pak";

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// Names an asset either by id or by a registered custom name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetRef<'a> {
    Id(AssetId),
    Name(&'a str),
}

impl From<AssetId> for AssetRef<'_> {
    fn from(id: AssetId) -> Self {
        AssetRef::Id(id)
    }
}

impl<'a> From<&'a str> for AssetRef<'a> {
    fn from(name: &'a str) -> Self {
        AssetRef::Name(name)
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
/// Single point of access to the assets of one game.
///
/// Archives are indexed from their tables of contents when the manager is
/// created; bodies are read the first time an archive is needed. Edits stay in
/// memory until [`save_modifications`](Self::save_modifications) writes the
/// affected archives.
///
/// Only one manager should write to a given output directory at a time, and a
/// save that fails part way leaves some archives rewritten and others not.
pub struct AssetManager {
    #[derivative(Debug = "ignore")]
    provider: Box<dyn FileProvider>,
    game: GameVersion,
    codecs: CodecRegistry,
    headers: IndexMap<String, TableOfContents>,
    paks_for_asset: HashMap<AssetId, BTreeSet<String>>,
    types: HashMap<AssetId, AssetType>,
    #[derivative(Debug = "ignore")]
    in_memory_paks: HashMap<String, Pak>,
    /// `None` marks a deleted asset.
    #[derivative(Debug = "ignore")]
    modified: HashMap<AssetId, Option<RawResource>>,
    ensured: HashMap<String, BTreeSet<AssetId>>,
    custom_names: BTreeMap<String, AssetId>,
    next_generated_id: AssetId,
    instance: u64,
    generation: u64,
}

impl AssetManager {
    /// Indexes every archive `provider` holds, with the default codec table for
    /// `game`.
    pub fn new<P: FileProvider + 'static>(provider: P, game: GameVersion) -> Result<Self> {
        Self::with_codecs(provider, game, CodecRegistry::for_game(game))
    }

    pub fn with_codecs<P: FileProvider + 'static>(
        provider: P,
        game: GameVersion,
        codecs: CodecRegistry,
    ) -> Result<Self> {
        let provider: Box<dyn FileProvider> = Box::new(provider);
        let custom_names = read_custom_names(provider.as_ref())?;
        let mut manager = AssetManager {
            provider,
            game,
            codecs,
            headers: IndexMap::new(),
            paks_for_asset: HashMap::new(),
            types: HashMap::new(),
            in_memory_paks: HashMap::new(),
            modified: HashMap::new(),
            ensured: HashMap::new(),
            custom_names,
            next_generated_id: game.id_width().first_generated(),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            generation: 0,
        };
        manager.update_headers()?;
        Ok(manager)
    }

    /// Rebuilds the id index from the tables of contents of every archive.
    fn update_headers(&mut self) -> Result<()> {
        self.headers.clear();
        self.paks_for_asset.clear();
        self.types.clear();
        self.in_memory_paks.clear();

        let mut names: Vec<String> = self.provider.glob(PAK_PATTERN)?.collect();
        names.sort();
        for name in names {
            let mut reader = self.provider.open_binary(&name)?;
            let toc = Pak::read_table_of_contents(&mut reader, self.game).map_err(|source| {
                AssetError::CorruptPak {
                    name: name.clone(),
                    source,
                }
            })?;
            for entry in &toc.entries {
                self.paks_for_asset
                    .entry(entry.id)
                    .or_default()
                    .insert(name.clone());
                let kind = *self.types.entry(entry.id).or_insert(entry.kind);
                if kind != entry.kind {
                    warn!(
                        "{} is {} in {} but {} elsewhere",
                        entry.id, entry.kind, name, kind
                    );
                }
            }
            debug!("Indexed {} with {} resources", name, toc.entries.len());
            self.headers.insert(name, toc);
        }
        info!(
            "Indexed {} assets across {} paks",
            self.paks_for_asset.len(),
            self.headers.len()
        );
        Ok(())
    }

    pub fn game(&self) -> GameVersion {
        self.game
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Increases with every edit. Anything derived from asset contents is
    /// stale once this changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Unique per manager in this process, so cached results can tell
    /// managers apart even when their generations are equal.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Every asset that currently exists, in no particular order.
    pub fn all_asset_ids(&self) -> impl Iterator<Item = AssetId> + '_ {
        let on_disk = self.paks_for_asset.keys();
        let added = self
            .modified
            .keys()
            .filter(move |id| !self.paks_for_asset.contains_key(*id));
        on_disk
            .chain(added)
            .copied()
            .filter(move |id| self.does_asset_exist(*id))
    }

    /// Names of every archive, in path order.
    pub fn all_paks(&self) -> impl Iterator<Item = &str> + '_ {
        self.headers.keys().map(String::as_str)
    }

    /// Archives that natively contain `id` on disk.
    pub fn find_paks(&self, id: AssetId) -> impl Iterator<Item = &str> + '_ {
        self.paks_for_asset
            .get(&id)
            .into_iter()
            .flat_map(|paks| paks.iter().map(String::as_str))
    }

    pub fn does_asset_exist(&self, id: AssetId) -> bool {
        match self.modified.get(&id) {
            Some(resource) => resource.is_some(),
            None => self.paks_for_asset.contains_key(&id),
        }
    }

    /// The error to report for an id that does not exist.
    pub(crate) fn missing(&self, id: AssetId) -> AssetError {
        match self.modified.get(&id) {
            Some(None) => AssetError::Deleted(id),
            _ => AssetError::NotFound(id),
        }
    }

    fn check_exists(&self, id: AssetId) -> Result<()> {
        if self.does_asset_exist(id) {
            Ok(())
        } else {
            Err(self.missing(id))
        }
    }

    pub fn get_asset_type(&self, id: AssetId) -> Result<AssetType> {
        match self.modified.get(&id) {
            Some(Some(resource)) => Ok(resource.kind),
            Some(None) => Err(AssetError::Deleted(id)),
            None => self
                .types
                .get(&id)
                .copied()
                .ok_or(AssetError::NotFound(id)),
        }
    }

    /// The current bytes of `id`, edits included.
    pub fn get_raw_asset(&mut self, id: AssetId) -> Result<RawResource> {
        match self.modified.get(&id) {
            Some(Some(resource)) => return Ok(resource.clone()),
            Some(None) => return Err(AssetError::Deleted(id)),
            None => {}
        }
        let pak_name = self
            .paks_for_asset
            .get(&id)
            .and_then(|paks| paks.iter().next())
            .cloned()
            .ok_or(AssetError::NotFound(id))?;
        self.load_pak(&pak_name)?
            .get_asset(id)?
            .ok_or(AssetError::NotFound(id))
    }

    /// Decodes `id` as `T`, failing if the asset is some other type.
    pub fn get_parsed_asset<T: AssetFormat>(&mut self, id: AssetId) -> Result<T> {
        let raw = self.get_raw_asset(id)?;
        if raw.kind != T::ASSET_TYPE {
            return Err(AssetError::TypeMismatch {
                id,
                expected: T::ASSET_TYPE,
                actual: raw.kind,
            });
        }
        T::parse(&raw.data, self.game).map_err(|source| AssetError::Codec {
            id,
            kind: raw.kind,
            source,
        })
    }

    /// Decodes `id` with whichever codec is registered for its type.
    pub fn get_parsed_asset_dyn(
        &mut self,
        id: AssetId,
        type_hint: Option<AssetType>,
    ) -> Result<Box<dyn Any>> {
        let raw = self.get_raw_asset(id)?;
        if let Some(expected) = type_hint {
            if expected != raw.kind {
                return Err(AssetError::TypeMismatch {
                    id,
                    expected,
                    actual: raw.kind,
                });
            }
        }
        self.codecs
            .parse(raw.kind, &raw.data, self.game)
            .map_err(|source| AssetError::Codec {
                id,
                kind: raw.kind,
                source,
            })
    }

    /// Encodes `asset` into a resource ready for [`replace_asset`](Self::replace_asset).
    pub fn encode_asset<T: AssetFormat>(&self, asset: &T, compressed: bool) -> Result<RawResource> {
        let data = asset.build(self.game).map_err(|source| AssetError::Codec {
            id: AssetId::default(),
            kind: T::ASSET_TYPE,
            source,
        })?;
        Ok(RawResource {
            kind: T::ASSET_TYPE,
            data,
            compressed,
        })
    }

    /// Returns an id no asset uses. Successive calls return increasing ids.
    pub fn generate_asset_id(&mut self) -> Result<AssetId> {
        let width = self.game.id_width();
        let mut candidate = self.next_generated_id;
        if !width.is_valid(candidate) {
            return Err(AssetError::IdSpaceExhausted);
        }
        while self.does_asset_exist(candidate) || self.paks_for_asset.contains_key(&candidate) {
            candidate = width.next(candidate).ok_or(AssetError::IdSpaceExhausted)?;
        }
        self.next_generated_id = width.next(candidate).unwrap_or_else(|| width.sentinel());
        Ok(candidate)
    }

    pub fn get_custom_asset(&self, name: &str) -> Option<AssetId> {
        self.custom_names.get(name).copied()
    }

    pub fn register_custom_asset_name(&mut self, name: &str, id: AssetId) -> Result<()> {
        if self.custom_names.contains_key(name) {
            return Err(AssetError::NameTaken(name.to_owned()));
        }
        self.check_exists(id)?;
        self.custom_names.insert(name.to_owned(), id);
        Ok(())
    }

    pub fn resolve_asset_id<'a, R: Into<AssetRef<'a>>>(&self, asset: R) -> Result<AssetId> {
        match asset.into() {
            AssetRef::Id(id) => self.game.validate(id),
            AssetRef::Name(name) => self
                .get_custom_asset(name)
                .ok_or_else(|| AssetError::UnknownName(name.to_owned())),
        }
    }

    /// Adds a new asset under a fresh id, registers `name` for it and places
    /// it in `target_paks`.
    pub fn add_new_asset<I, S>(
        &mut self,
        name: &str,
        resource: RawResource,
        target_paks: I,
    ) -> Result<AssetId>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.custom_names.contains_key(name) {
            return Err(AssetError::NameTaken(name.to_owned()));
        }
        let id = self.generate_asset_id()?;
        self.add_asset_with_id(id, Some(name), resource, target_paks)?;
        Ok(id)
    }

    /// Like [`add_new_asset`](Self::add_new_asset), with a caller-chosen id.
    pub fn add_asset_with_id<I, S>(
        &mut self,
        id: AssetId,
        name: Option<&str>,
        resource: RawResource,
        target_paks: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.game.validate(id)?;
        if self.does_asset_exist(id) {
            return Err(AssetError::AlreadyExists(id));
        }
        if let Some(name) = name {
            if self.custom_names.contains_key(name) {
                return Err(AssetError::NameTaken(name.to_owned()));
            }
        }
        let target_paks: Vec<String> = target_paks
            .into_iter()
            .map(|pak| pak.as_ref().to_owned())
            .collect();
        if let Some(unknown) = target_paks.iter().find(|pak| !self.headers.contains_key(*pak)) {
            return Err(AssetError::UnknownPak(unknown.clone()));
        }

        if let Some(name) = name {
            self.custom_names.insert(name.to_owned(), id);
        }
        self.modified.insert(id, Some(resource));
        self.generation += 1;
        for pak in &target_paks {
            self.ensure_present(pak, id)?;
        }
        Ok(())
    }

    pub fn replace_asset(&mut self, id: AssetId, resource: RawResource) -> Result<()> {
        self.game.validate(id)?;
        self.check_exists(id)?;
        self.modified.insert(id, Some(resource));
        self.generation += 1;
        Ok(())
    }

    /// Marks `id` as deleted. Named resources cannot be deleted.
    pub fn delete_asset(&mut self, id: AssetId) -> Result<()> {
        self.check_exists(id)?;
        if self.headers.values().any(|toc| toc.is_named(id)) {
            return Err(AssetError::PinnedAsset(id));
        }
        self.modified.insert(id, None);
        for ids in self.ensured.values_mut() {
            ids.remove(&id);
        }
        self.custom_names.retain(|_, named| *named != id);
        self.generation += 1;
        Ok(())
    }

    /// Makes sure `id` is stored in `pak_name` after the next save, copying
    /// it there if it is not already a member.
    pub fn ensure_present(&mut self, pak_name: &str, id: AssetId) -> Result<()> {
        if !self.headers.contains_key(pak_name) {
            return Err(AssetError::UnknownPak(pak_name.to_owned()));
        }
        self.check_exists(id)?;
        let native = self
            .paks_for_asset
            .get(&id)
            .map_or(false, |paks| paks.contains(pak_name));
        if !native {
            self.ensured
                .entry(pak_name.to_owned())
                .or_default()
                .insert(id);
        }
        Ok(())
    }

    /// The fully parsed archive, read on first use and cached afterwards.
    /// Pending edits are not applied to it until a save.
    pub fn get_pak(&mut self, name: &str) -> Result<&Pak> {
        self.load_pak(name).map(|pak| &*pak)
    }

    fn load_pak(&mut self, name: &str) -> Result<&mut Pak> {
        if !self.headers.contains_key(name) {
            return Err(AssetError::UnknownPak(name.to_owned()));
        }
        match self.in_memory_paks.entry(name.to_owned()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                debug!("Reading {}", name);
                let mut reader = self.provider.open_binary(name)?;
                let pak = Pak::parse(&mut reader, self.game).map_err(|source| {
                    AssetError::CorruptPak {
                        name: name.to_owned(),
                        source,
                    }
                })?;
                Ok(entry.insert(pak))
            }
        }
    }

    /// Writes every archive affected by pending edits to `output_dir`, keeping
    /// their relative paths, plus the custom name table. Afterwards the
    /// manager reads from `output_dir`, falling back to the original files for
    /// archives that were not rewritten.
    pub fn save_modifications<P: AsRef<Path>>(&mut self, output_dir: P) -> Result<()> {
        let output_dir = output_dir.as_ref();

        let mut touched: BTreeSet<String> = BTreeSet::new();
        for id in self.modified.keys() {
            if let Some(paks) = self.paks_for_asset.get(id) {
                touched.extend(paks.iter().cloned());
            }
        }
        touched.extend(
            self.ensured
                .iter()
                .filter(|(_, ids)| !ids.is_empty())
                .map(|(pak, _)| pak.clone()),
        );

        for name in &touched {
            self.load_pak(name)?;
        }

        let mut ensured_ids: Vec<AssetId> = self.ensured.values().flatten().copied().collect();
        ensured_ids.sort();
        ensured_ids.dedup();
        let mut ensured_data: HashMap<AssetId, RawResource> = HashMap::new();
        for id in ensured_ids {
            let resource = self.get_raw_asset(id)?;
            ensured_data.insert(id, resource);
        }

        for name in &touched {
            // the cached archive stays as read until the overlay is cleared
            let mut pak = match self.in_memory_paks.get(name) {
                Some(pak) => pak.clone(),
                None => continue,
            };
            for (id, resource) in &self.modified {
                let native = self
                    .paks_for_asset
                    .get(id)
                    .map_or(false, |paks| paks.contains(name));
                if !native {
                    continue;
                }
                match resource {
                    None => pak.remove_asset(*id)?,
                    Some(resource) => pak.replace_asset(*id, resource.clone())?,
                }
            }
            for id in self.ensured.get(name).into_iter().flatten() {
                let resource = ensured_data
                    .get(id)
                    .cloned()
                    .ok_or_else(|| AssetError::NotFound(*id))?;
                if pak.contains(*id) {
                    pak.replace_asset(*id, resource)?;
                } else {
                    pak.add_asset(*id, resource)?;
                }
            }

            let data = pak.write_to_bytes()?;
            let path = output_dir.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, data)?;
            info!("Wrote {}", path.display());
        }

        fs::create_dir_all(output_dir)?;
        write_custom_names(output_dir, &self.custom_names)?;

        self.modified.clear();
        self.ensured.clear();
        let upper = DirectoryProvider::new(output_dir);
        let lower = std::mem::replace(&mut self.provider, Box::new(upper.clone()));
        self.provider = Box::new(LayeredProvider::from_boxed(Box::new(upper), lower));
        self.generation += 1;
        self.update_headers()
    }
}

impl AssetLookup for AssetManager {
    fn asset_type(&self, id: AssetId) -> Option<AssetType> {
        self.get_asset_type(id).ok()
    }
}
