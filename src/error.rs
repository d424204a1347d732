use crate::*;
use thiserror::Error;

/// Broad classes of [`AssetError`], for callers that only need to know what
/// went wrong and not where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The asset never existed or was deleted.
    NotFound,
    /// The id cannot exist in this game.
    InvalidAsset,
    /// The request itself is not allowed.
    InvalidOperation,
    /// A structured decoder rejected an asset.
    StructuredDecodeFailure,
    /// Reading or writing files failed, or an archive is corrupt.
    Io,
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("Asset {0} does not exist")]
    NotFound(AssetId),
    #[error("Asset {0} was deleted")]
    Deleted(AssetId),
    #[error("Asset id {id} is not valid for {game:?}")]
    InvalidAsset { id: AssetId, game: GameVersion },
    #[error("Asset {id} is {actual}, expected {expected}")]
    TypeMismatch {
        id: AssetId,
        expected: AssetType,
        actual: AssetType,
    },
    #[error("Unknown pak {0}")]
    UnknownPak(String),
    #[error("Asset {0} already exists")]
    AlreadyExists(AssetId),
    #[error("Custom asset name {0:?} is already registered")]
    NameTaken(String),
    #[error("Unknown custom asset name {0:?}")]
    UnknownName(String),
    #[error("Asset {0} is a named resource and cannot be removed")]
    PinnedAsset(AssetId),
    #[error("No free asset id is left")]
    IdSpaceExhausted,
    #[error("{owner} references {dependency}, which does not exist")]
    MissingDependency { owner: AssetId, dependency: AssetId },
    #[error("{owner} references {dependency}, but only a heuristic scan found it")]
    HeuristicDependency { owner: AssetId, dependency: AssetId },
    #[error("Could not decode {kind} asset {id}: {source}")]
    Codec {
        id: AssetId,
        kind: AssetType,
        source: CodecError,
    },
    #[error("Could not read pak {name}: {source}")]
    CorruptPak { name: String, source: PakError },
    #[error(transparent)]
    Pak(#[from] PakError),
    #[error(transparent)]
    Write(#[from] PakWriteError),
    #[error("Invalid custom name table: {0}")]
    CustomNames(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AssetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::Deleted(_) | Self::MissingDependency { .. } => {
                ErrorKind::NotFound
            }
            Self::InvalidAsset { .. } => ErrorKind::InvalidAsset,
            Self::TypeMismatch { .. }
            | Self::UnknownPak(_)
            | Self::AlreadyExists(_)
            | Self::NameTaken(_)
            | Self::UnknownName(_)
            | Self::PinnedAsset(_)
            | Self::IdSpaceExhausted
            | Self::HeuristicDependency { .. } => ErrorKind::InvalidOperation,
            Self::Codec {
                source: CodecError::Unregistered(_),
                ..
            } => ErrorKind::InvalidOperation,
            Self::Codec { .. } => ErrorKind::StructuredDecodeFailure,
            Self::Pak(PakError::NamedResource(_)) | Self::Pak(PakError::DuplicateAsset(_)) => {
                ErrorKind::InvalidOperation
            }
            Self::Pak(PakError::UnknownAsset(_)) => ErrorKind::NotFound,
            Self::CorruptPak { .. }
            | Self::Pak(_)
            | Self::Write(_)
            | Self::CustomNames(_)
            | Self::Io(_) => ErrorKind::Io,
        }
    }
}
