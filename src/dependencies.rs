//! Finding out what an asset references.
//!
//! Formats with a registered [`DependencyHook`] are decoded and asked
//! directly. Everything else goes through a [`DependencyScan`]: a partial scan
//! for formats whose id positions are known, and a byte-level heuristic for the
//! rest.
use crate::codec::DependencyStrategy;
use crate::*;
use indexmap::{IndexMap, IndexSet};
use lazy_static::lazy_static;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

lazy_static! {
    /// Particle-system formats. Their properties are tagged, and an asset
    /// reference is always a `CNST` tag followed by the id.
    static ref PARTICLE_TYPES: HashSet<AssetType> = [
        b"PART", b"ELSC", b"SWHC", b"DPSC", b"CRSC", b"WPSC", b"SPSC", b"SRSC",
    ]
    .iter()
    .map(|code| AssetType::from(*code))
    .collect();
}

const CONSTANT_TAG: &[u8; 4] = b"CNST";

/// What a scan needs to know about the current asset universe.
pub trait AssetLookup {
    /// The type of `id`, or `None` if no such asset currently exists.
    fn asset_type(&self, id: AssetId) -> Option<AssetType>;
}

/// A strategy for finding references in a body no decoder understands.
pub trait DependencyScan {
    /// Whether this scan knows anything about `kind`.
    fn handles(&self, kind: AssetType) -> bool;

    /// Lists the references of asset `owner`. Never fails: bytes that make no
    /// sense simply produce no dependencies.
    fn scan(
        &self,
        owner: AssetId,
        data: &[u8],
        game: GameVersion,
        lookup: &dyn AssetLookup,
    ) -> Vec<Dependency>;
}

/// Reads an id at every byte offset and keeps the ones that name an existing
/// asset. Finds false positives when unrelated bytes happen to match an id, and
/// misses ids that are stored in any other form; results are tagged
/// `heuristic`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicScan;

impl DependencyScan for HeuristicScan {
    fn handles(&self, _: AssetType) -> bool {
        true
    }

    fn scan(
        &self,
        owner: AssetId,
        data: &[u8],
        game: GameVersion,
        lookup: &dyn AssetLookup,
    ) -> Vec<Dependency> {
        let width = game.id_width();
        if data.len() < width.bytes() {
            return vec![];
        }
        let mut found = IndexSet::new();
        for offset in 0..=data.len() - width.bytes() {
            let id = match AssetId::from_be_slice(&data[offset..], width) {
                Some(id) => id,
                None => continue,
            };
            // zero runs are everywhere and would make id 0 a dependency of everything
            if id == owner || id.value() == 0 || !width.is_valid(id) {
                continue;
            }
            if let Some(kind) = lookup.asset_type(id) {
                found.insert(Dependency::new(kind, id).heuristic());
            }
        }
        found.into_iter().collect()
    }
}

/// Looks for ids only where the particle formats store them. Ids that do not
/// exist are still reported, with [`AssetType::UNKNOWN`], so a closure can
/// tell the caller about them.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParticleScan;

impl DependencyScan for ParticleScan {
    fn handles(&self, kind: AssetType) -> bool {
        PARTICLE_TYPES.contains(&kind)
    }

    fn scan(
        &self,
        owner: AssetId,
        data: &[u8],
        game: GameVersion,
        lookup: &dyn AssetLookup,
    ) -> Vec<Dependency> {
        let width = game.id_width();
        let mut found = IndexSet::new();
        let mut offset = 0;
        while offset + CONSTANT_TAG.len() <= data.len() {
            if &data[offset..offset + CONSTANT_TAG.len()] != CONSTANT_TAG {
                offset += 1;
                continue;
            }
            offset += CONSTANT_TAG.len();
            if let Some(id) = AssetId::from_be_slice(&data[offset..], width) {
                if width.is_valid(id) && id != owner {
                    let kind = lookup.asset_type(id).unwrap_or(AssetType::UNKNOWN);
                    found.insert(Dependency::new(kind, id));
                }
            }
        }
        found.into_iter().collect()
    }
}

/// Options for [`DependencyResolver::closure`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClosureOptions {
    /// Fail on references to assets that do not exist instead of skipping them.
    pub must_exist: bool,
    /// Fail on references that only the heuristic scan found.
    pub structured_only: bool,
    /// Follow edges flagged `exclude_from_closure_rollup`.
    pub include_excluded: bool,
}

struct CachedDependencies {
    instance: u64,
    generation: u64,
    dependencies: Rc<[Dependency]>,
}

/// Computes direct and transitive dependencies, memoized per asset.
///
/// Cache entries remember the manager ([`AssetManager::instance`]) and the
/// [`AssetManager::generation`] they were computed at; any edit to that
/// manager, or passing a different one, makes them stale.
pub struct DependencyResolver {
    partial_scans: Vec<Box<dyn DependencyScan>>,
    fallback: Box<dyn DependencyScan>,
    cache: HashMap<AssetId, CachedDependencies>,
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyResolver {
    pub fn new() -> Self {
        DependencyResolver {
            partial_scans: vec![Box::new(ParticleScan)],
            fallback: Box::new(HeuristicScan),
            cache: HashMap::new(),
        }
    }

    /// Replaces the scan used for formats nothing else understands.
    pub fn with_fallback<S: DependencyScan + 'static>(mut self, fallback: S) -> Self {
        self.fallback = Box::new(fallback);
        self.cache.clear();
        self
    }

    /// Adds a scan tried before the fallback for the formats it handles.
    pub fn with_partial_scan<S: DependencyScan + 'static>(mut self, scan: S) -> Self {
        self.partial_scans.push(Box::new(scan));
        self.cache.clear();
        self
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// The assets `id` references directly.
    pub fn direct_dependencies(
        &mut self,
        manager: &mut AssetManager,
        id: AssetId,
    ) -> Result<Rc<[Dependency]>, AssetError> {
        let instance = manager.instance();
        let generation = manager.generation();
        if let Some(cached) = self.cache.get(&id) {
            if cached.instance == instance && cached.generation == generation {
                return Ok(cached.dependencies.clone());
            }
            debug!("Dependencies of {} are stale, recomputing", id);
        }

        let kind = manager.get_asset_type(id)?;
        let game = manager.game();
        let dependencies: Vec<Dependency> = match manager.codecs().dependency_strategy(kind) {
            DependencyStrategy::None => vec![],
            DependencyStrategy::Structured(hook) => {
                let raw = manager.get_raw_asset(id)?;
                hook(&raw.data, game).map_err(|source| AssetError::Codec {
                    id,
                    kind,
                    source,
                })?
            }
            DependencyStrategy::Unstructured => {
                let raw = manager.get_raw_asset(id)?;
                let scan = self
                    .partial_scans
                    .iter()
                    .find(|scan| scan.handles(kind))
                    .unwrap_or(&self.fallback);
                scan.scan(id, &raw.data, game, &*manager)
            }
        };

        let dependencies: Rc<[Dependency]> = dependencies.into();
        self.cache.insert(
            id,
            CachedDependencies {
                instance,
                generation,
                dependencies: dependencies.clone(),
            },
        );
        Ok(dependencies)
    }

    /// Every asset reachable from `ids`, excluding the roots themselves unless
    /// something references them.
    pub fn closure<I>(
        &mut self,
        manager: &mut AssetManager,
        ids: I,
        options: ClosureOptions,
    ) -> Result<IndexSet<Dependency>, AssetError>
    where
        I: IntoIterator<Item = AssetId>,
    {
        let mut walked: IndexMap<AssetId, Rc<[Dependency]>> = IndexMap::new();
        for id in ids {
            if !manager.does_asset_exist(id) {
                if options.must_exist {
                    return Err(manager.missing(id));
                }
                warn!("Skipping dependencies of {}, which does not exist", id);
                continue;
            }
            self.walk(manager, id, options, &mut walked)?;
        }
        Ok(walked
            .values()
            .flat_map(|dependencies| dependencies.iter().copied())
            .collect())
    }

    fn walk(
        &mut self,
        manager: &mut AssetManager,
        id: AssetId,
        options: ClosureOptions,
        walked: &mut IndexMap<AssetId, Rc<[Dependency]>>,
    ) -> Result<(), AssetError> {
        if walked.contains_key(&id) {
            return Ok(());
        }
        // placeholder so that cycles terminate
        walked.insert(id, Rc::from(Vec::new()));

        let direct = match self.direct_dependencies(manager, id) {
            Ok(direct) => direct,
            Err(e) if e.kind() == ErrorKind::StructuredDecodeFailure => return Err(e),
            Err(e) => {
                warn!("Could not list dependencies of {}: {}", id, e);
                return Ok(());
            }
        };

        let mut kept = Vec::with_capacity(direct.len());
        for dependency in direct.iter() {
            if dependency.exclude_from_closure_rollup && !options.include_excluded {
                continue;
            }
            if dependency.heuristic && options.structured_only {
                return Err(AssetError::HeuristicDependency {
                    owner: id,
                    dependency: dependency.id,
                });
            }
            if !manager.does_asset_exist(dependency.id) {
                if options.must_exist {
                    return Err(AssetError::MissingDependency {
                        owner: id,
                        dependency: dependency.id,
                    });
                }
                warn!("{} references {}, which does not exist", id, dependency.id);
                continue;
            }
            kept.push(*dependency);
        }
        walked.insert(id, kept.clone().into());

        for dependency in kept {
            self.walk(manager, dependency.id, options, walked)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::RefList;

    const TXTR: AssetType = AssetType(*b"TXTR");
    const CMDL: AssetType = AssetType(*b"CMDL");
    const PART: AssetType = AssetType(*b"PART");

    struct Known(HashMap<AssetId, AssetType>);

    impl AssetLookup for Known {
        fn asset_type(&self, id: AssetId) -> Option<AssetType> {
            self.0.get(&id).copied()
        }
    }

    fn ref_list(refs: &[(AssetType, u32)]) -> RawResource {
        RawResource::new(
            RefList::ASSET_TYPE,
            RefList(refs.to_vec()).build(GameVersion::Prime).unwrap(),
        )
    }

    fn manager(assets: Vec<(u32, RawResource)>) -> AssetManager {
        let mut pak = Pak::new(GameVersion::Prime);
        for (id, resource) in assets {
            pak.add_asset(AssetId::from(id), resource).unwrap();
        }
        let provider =
            MemoryProvider::new().with_file("Metroid1.pak", pak.write_to_bytes().unwrap());
        let mut codecs = CodecRegistry::for_game(GameVersion::Prime);
        codecs.register_with_dependencies::<RefList>();
        AssetManager::with_codecs(provider, GameVersion::Prime, codecs).unwrap()
    }

    #[test]
    fn heuristic_scan_finds_existing_ids() {
        let known = Known(
            vec![(AssetId(0x1234_5678), TXTR), (AssetId(0x0A0B_0C0D), CMDL)]
                .into_iter()
                .collect(),
        );
        let data = [
            0xFF, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x00, 0x00, 0x0A, 0x0B, 0x0C, 0x0D, 0x12,
            0x34, 0x56, 0x78,
        ];
        let found = HeuristicScan.scan(AssetId(0x99), &data, GameVersion::Prime, &known);
        assert_eq!(
            found,
            vec![
                Dependency::new(TXTR, AssetId(0x1234_5678)).heuristic(),
                Dependency::new(CMDL, AssetId(0x0A0B_0C0D)).heuristic(),
            ]
        );
        assert!(HeuristicScan
            .scan(AssetId(0x1234_5678), &data[..5], GameVersion::Prime, &known)
            .is_empty());
        assert!(HeuristicScan
            .scan(AssetId(0x99), &[1, 2], GameVersion::Prime, &known)
            .is_empty());
    }

    #[test]
    fn particle_scan_reads_constants() {
        let known = Known(vec![(AssetId(0x40), TXTR)].into_iter().collect());
        let mut data = b"TEXRCNST".to_vec();
        data.extend_from_slice(&0x40u32.to_be_bytes());
        data.extend_from_slice(b"PMDLCNST");
        data.extend_from_slice(&0x41u32.to_be_bytes());
        data.extend_from_slice(b"SSEGCNST");
        data.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        assert!(ParticleScan.handles(PART));
        assert!(!ParticleScan.handles(TXTR));
        let found = ParticleScan.scan(AssetId(1), &data, GameVersion::Prime, &known);
        assert_eq!(
            found,
            vec![
                Dependency::new(TXTR, AssetId(0x40)),
                Dependency::new(AssetType::UNKNOWN, AssetId(0x41)),
            ]
        );
    }

    #[test]
    fn structured_direct_dependencies() {
        let mut manager = manager(vec![
            (0x1, ref_list(&[(TXTR, 0x2), (CMDL, 0x3)])),
            (0x2, RawResource::new(TXTR, vec![0; 16])),
            (0x3, RawResource::new(CMDL, vec![0; 16])),
        ]);
        let mut resolver = DependencyResolver::new();
        let direct = resolver
            .direct_dependencies(&mut manager, AssetId(0x1))
            .unwrap();
        assert_eq!(
            &direct[..],
            &[
                Dependency::new(TXTR, AssetId(0x2)),
                Dependency::new(CMDL, AssetId(0x3)),
            ][..]
        );
        assert!(direct.iter().all(|dependency| !dependency.heuristic));
    }

    #[test]
    fn no_dependency_types_skip_scanning() {
        let mut manager = manager(vec![
            (0x1, RawResource::new(AssetType(*b"AGSC"), 0x2u32.to_be_bytes().to_vec())),
            (0x2, RawResource::new(TXTR, vec![0; 4])),
        ]);
        let mut resolver = DependencyResolver::new();
        assert!(resolver
            .direct_dependencies(&mut manager, AssetId(0x1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn opaque_formats_use_the_fallback() {
        let mut body = vec![0xAB; 3];
        body.extend_from_slice(&0x2u32.to_be_bytes());
        let mut manager = manager(vec![
            (0x1, RawResource::new(CMDL, body)),
            (0x2, RawResource::new(TXTR, vec![0; 4])),
        ]);
        let mut resolver = DependencyResolver::new();
        let direct = resolver
            .direct_dependencies(&mut manager, AssetId(0x1))
            .unwrap();
        assert_eq!(&direct[..], &[Dependency::new(TXTR, AssetId(0x2)).heuristic()][..]);

        struct Nothing;
        impl DependencyScan for Nothing {
            fn handles(&self, _: AssetType) -> bool {
                true
            }
            fn scan(&self, _: AssetId, _: &[u8], _: GameVersion, _: &dyn AssetLookup) -> Vec<Dependency> {
                vec![]
            }
        }
        let mut resolver = DependencyResolver::new().with_fallback(Nothing);
        assert!(resolver
            .direct_dependencies(&mut manager, AssetId(0x1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn closure_survives_cycles() {
        let mut manager = manager(vec![
            (0x1, ref_list(&[(RefList::ASSET_TYPE, 0x2)])),
            (0x2, ref_list(&[(RefList::ASSET_TYPE, 0x1), (TXTR, 0x3)])),
            (0x3, RawResource::new(TXTR, vec![0; 8])),
        ]);
        let mut resolver = DependencyResolver::new();
        let closure = resolver
            .closure(&mut manager, vec![AssetId(0x1)], ClosureOptions::default())
            .unwrap();
        let ids: HashSet<AssetId> = closure.iter().map(|dependency| dependency.id).collect();
        assert_eq!(
            ids,
            vec![AssetId(0x1), AssetId(0x2), AssetId(0x3)]
                .into_iter()
                .collect()
        );
        for dependency in &closure {
            assert!(manager.does_asset_exist(dependency.id));
        }
    }

    #[test]
    fn missing_dependencies() {
        let mut manager = manager(vec![
            (0x1, ref_list(&[(TXTR, 0x2), (TXTR, 0x77)])),
            (0x2, RawResource::new(TXTR, vec![0; 8])),
        ]);
        let mut resolver = DependencyResolver::new();
        let closure = resolver
            .closure(&mut manager, vec![AssetId(0x1)], ClosureOptions::default())
            .unwrap();
        assert_eq!(
            closure.into_iter().collect::<Vec<_>>(),
            vec![Dependency::new(TXTR, AssetId(0x2))]
        );

        let strict = ClosureOptions {
            must_exist: true,
            ..ClosureOptions::default()
        };
        assert!(matches!(
            resolver.closure(&mut manager, vec![AssetId(0x1)], strict),
            Err(AssetError::MissingDependency { dependency, .. }) if dependency == AssetId(0x77)
        ));
        assert!(matches!(
            resolver.closure(&mut manager, vec![AssetId(0x55)], strict),
            Err(AssetError::NotFound(_))
        ));
    }

    #[test]
    fn structured_failures_abort_the_closure() {
        let mut manager = manager(vec![
            (0x1, ref_list(&[(RefList::ASSET_TYPE, 0x2)])),
            (0x2, RawResource::new(RefList::ASSET_TYPE, vec![1, 2, 3])),
        ]);
        let mut resolver = DependencyResolver::new();
        let result = resolver.closure(&mut manager, vec![AssetId(0x1)], ClosureOptions::default());
        match result {
            Err(e) => assert_eq!(e.kind(), ErrorKind::StructuredDecodeFailure),
            Ok(closure) => panic!("expected a decode failure, got {:?}", closure),
        }
    }

    #[test]
    fn strict_closures_reject_heuristic_edges() {
        let mut manager = manager(vec![
            (0x1, ref_list(&[(CMDL, 0x2)])),
            (0x2, RawResource::new(CMDL, 0x3u32.to_be_bytes().to_vec())),
            (0x3, RawResource::new(TXTR, vec![0; 8])),
        ]);
        let mut resolver = DependencyResolver::new();
        let loose = resolver
            .closure(&mut manager, vec![AssetId(0x1)], ClosureOptions::default())
            .unwrap();
        assert!(loose.iter().any(|dependency| dependency.id == AssetId(0x3) && dependency.heuristic));
        let strict = ClosureOptions {
            structured_only: true,
            ..ClosureOptions::default()
        };
        assert!(matches!(
            resolver.closure(&mut manager, vec![AssetId(0x1)], strict),
            Err(AssetError::HeuristicDependency { owner, .. }) if owner == AssetId(0x2)
        ));
    }

    #[test]
    fn excluded_edges_are_left_out_of_rollups() {
        struct Excluding;
        impl DependencyScan for Excluding {
            fn handles(&self, kind: AssetType) -> bool {
                kind == CMDL
            }
            fn scan(&self, _: AssetId, _: &[u8], _: GameVersion, lookup: &dyn AssetLookup) -> Vec<Dependency> {
                vec![Dependency::new(
                    lookup.asset_type(AssetId(0x3)).unwrap_or(AssetType::UNKNOWN),
                    AssetId(0x3),
                )
                .excluded_from_rollup()]
            }
        }
        let mut manager = manager(vec![
            (0x1, ref_list(&[(CMDL, 0x2)])),
            (0x2, RawResource::new(CMDL, vec![0; 4])),
            (0x3, RawResource::new(TXTR, vec![0; 4])),
        ]);
        let mut resolver = DependencyResolver::new().with_partial_scan(Excluding);
        let rollup = resolver
            .closure(&mut manager, vec![AssetId(0x1)], ClosureOptions::default())
            .unwrap();
        assert!(rollup.iter().all(|dependency| dependency.id != AssetId(0x3)));
        let everything = ClosureOptions {
            include_excluded: true,
            ..ClosureOptions::default()
        };
        let full = resolver
            .closure(&mut manager, vec![AssetId(0x1)], everything)
            .unwrap();
        assert!(full.iter().any(|dependency| dependency.id == AssetId(0x3)));
    }

    #[test]
    fn edits_invalidate_the_cache() {
        let mut manager = manager(vec![
            (0x1, ref_list(&[(TXTR, 0x2)])),
            (0x2, RawResource::new(TXTR, vec![0; 8])),
            (0x3, RawResource::new(TXTR, vec![0; 8])),
        ]);
        let mut resolver = DependencyResolver::new();
        let before = resolver
            .direct_dependencies(&mut manager, AssetId(0x1))
            .unwrap();
        assert_eq!(before[0].id, AssetId(0x2));
        manager
            .replace_asset(AssetId(0x1), ref_list(&[(TXTR, 0x3)]))
            .unwrap();
        let after = resolver
            .direct_dependencies(&mut manager, AssetId(0x1))
            .unwrap();
        assert_eq!(after[0].id, AssetId(0x3));
    }

    fn ids(dependencies: &[Dependency]) -> Vec<AssetId> {
        let mut ids: Vec<AssetId> = dependencies.iter().map(|dependency| dependency.id).collect();
        ids.sort();
        ids
    }

    #[test]
    fn deletions_additions_and_saves_invalidate_the_cache() {
        let scanned = RawResource::new(CMDL, vec![0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 7]);
        let mut manager = manager(vec![
            (0x2, RawResource::new(TXTR, vec![0; 8])),
            (0x3, RawResource::new(TXTR, vec![0; 8])),
            (0x4, scanned),
        ]);
        let mut resolver = DependencyResolver::new();
        let owner = AssetId(0x4);
        assert_eq!(
            ids(&resolver.direct_dependencies(&mut manager, owner).unwrap()),
            vec![AssetId(0x2), AssetId(0x3)]
        );

        manager.delete_asset(AssetId(0x3)).unwrap();
        assert_eq!(
            ids(&resolver.direct_dependencies(&mut manager, owner).unwrap()),
            vec![AssetId(0x2)]
        );

        manager
            .add_asset_with_id(
                AssetId(0x7),
                None,
                RawResource::new(TXTR, vec![]),
                Vec::<&str>::new(),
            )
            .unwrap();
        assert_eq!(
            ids(&resolver.direct_dependencies(&mut manager, owner).unwrap()),
            vec![AssetId(0x2), AssetId(0x7)]
        );

        // 0x7 belongs to no archive, so it does not survive the save
        let dir = tempfile::tempdir().unwrap();
        manager.save_modifications(dir.path()).unwrap();
        assert!(!manager.does_asset_exist(AssetId(0x7)));
        assert_eq!(
            ids(&resolver.direct_dependencies(&mut manager, owner).unwrap()),
            vec![AssetId(0x2)]
        );
    }

    #[test]
    fn cache_is_per_manager() {
        let mut first = manager(vec![
            (0x1, ref_list(&[(TXTR, 0x2)])),
            (0x2, RawResource::new(TXTR, vec![0; 8])),
        ]);
        let mut second = manager(vec![
            (0x1, ref_list(&[(TXTR, 0x3)])),
            (0x3, RawResource::new(TXTR, vec![0; 8])),
        ]);
        assert_eq!(first.generation(), second.generation());
        assert_ne!(first.instance(), second.instance());

        let mut resolver = DependencyResolver::new();
        assert_eq!(
            ids(&resolver.direct_dependencies(&mut first, AssetId(0x1)).unwrap()),
            vec![AssetId(0x2)]
        );
        assert_eq!(
            ids(&resolver.direct_dependencies(&mut second, AssetId(0x1)).unwrap()),
            vec![AssetId(0x3)]
        );
    }
}
