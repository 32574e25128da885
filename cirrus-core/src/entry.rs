//! Remote file system entries

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::error::ApiError;
use crate::metadata::timestamp;

/// Id of the root folder
pub const ROOT_FOLDER_ID: u64 = 0;

/// Typed entry id, written `d<folderid>` or `f<fileid>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryId {
    Folder(u64),
    File(u64),
}

impl EntryId {
    pub fn is_folder(&self) -> bool {
        matches!(self, EntryId::Folder(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, EntryId::File(_))
    }

    /// Numeric id without the kind prefix
    pub fn raw(&self) -> u64 {
        match self {
            EntryId::Folder(id) | EntryId::File(id) => *id,
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Folder(id) => write!(f, "d{}", id),
            EntryId::File(id) => write!(f, "f{}", id),
        }
    }
}

impl FromStr for EntryId {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ApiError::invalid_argument(format!("invalid entry id: {s:?}"));
        let (kind, digits) = match (s.get(..1), s.get(1..)) {
            (Some(kind), Some(digits)) => (kind, digits),
            _ => return Err(invalid()),
        };
        let id: u64 = digits.parse().map_err(|_| invalid())?;
        match kind {
            "d" => Ok(EntryId::Folder(id)),
            "f" => Ok(EntryId::File(id)),
            _ => Err(invalid()),
        }
    }
}

/// A file stored remotely
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub file_id: u64,
    pub parent_folder_id: u64,
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub hash: Option<u64>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl RemoteFile {
    pub fn id(&self) -> EntryId {
        EntryId::File(self.file_id)
    }
}

/// A folder stored remotely, with its children when listed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub folder_id: u64,
    /// `None` for the root folder
    pub parent_folder_id: Option<u64>,
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub children: Vec<RemoteEntry>,
}

impl RemoteFolder {
    pub fn id(&self) -> EntryId {
        EntryId::Folder(self.folder_id)
    }

    pub fn is_root(&self) -> bool {
        self.folder_id == ROOT_FOLDER_ID
    }

    pub fn files(&self) -> impl Iterator<Item = &RemoteFile> {
        self.children.iter().filter_map(RemoteEntry::as_file)
    }

    pub fn folders(&self) -> impl Iterator<Item = &RemoteFolder> {
        self.children.iter().filter_map(RemoteEntry::as_folder)
    }

    /// Direct child with the given name
    pub fn child(&self, name: &str) -> Option<&RemoteEntry> {
        self.children.iter().find(|e| e.name() == name)
    }
}

/// File or folder
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawMetadata")]
pub enum RemoteEntry {
    File(RemoteFile),
    Folder(RemoteFolder),
}

impl RemoteEntry {
    pub fn id(&self) -> EntryId {
        match self {
            RemoteEntry::File(f) => f.id(),
            RemoteEntry::Folder(f) => f.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RemoteEntry::File(f) => &f.name,
            RemoteEntry::Folder(f) => &f.name,
        }
    }

    pub fn parent_folder_id(&self) -> Option<u64> {
        match self {
            RemoteEntry::File(f) => Some(f.parent_folder_id),
            RemoteEntry::Folder(f) => f.parent_folder_id,
        }
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        match self {
            RemoteEntry::File(f) => f.modified,
            RemoteEntry::Folder(f) => f.modified,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, RemoteEntry::Folder(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, RemoteEntry::File(_))
    }

    pub fn as_file(&self) -> Option<&RemoteFile> {
        match self {
            RemoteEntry::File(f) => Some(f),
            RemoteEntry::Folder(_) => None,
        }
    }

    pub fn as_folder(&self) -> Option<&RemoteFolder> {
        match self {
            RemoteEntry::Folder(f) => Some(f),
            RemoteEntry::File(_) => None,
        }
    }

    pub fn into_file(self) -> Result<RemoteFile, ApiError> {
        match self {
            RemoteEntry::File(f) => Ok(f),
            RemoteEntry::Folder(f) => Err(ApiError::protocol(format!(
                "expected file metadata, got folder {}",
                f.folder_id
            ))),
        }
    }

    pub fn into_folder(self) -> Result<RemoteFolder, ApiError> {
        match self {
            RemoteEntry::Folder(f) => Ok(f),
            RemoteEntry::File(f) => Err(ApiError::protocol(format!(
                "expected folder metadata, got file {}",
                f.file_id
            ))),
        }
    }
}

/// Wire shape of a `metadata` object
#[derive(Deserialize)]
struct RawMetadata {
    #[serde(rename = "isfolder")]
    is_folder: bool,
    name: String,
    #[serde(rename = "folderid")]
    folder_id: Option<u64>,
    #[serde(rename = "fileid")]
    file_id: Option<u64>,
    #[serde(rename = "parentfolderid")]
    parent_folder_id: Option<u64>,
    #[serde(default)]
    size: u64,
    #[serde(rename = "contenttype")]
    content_type: Option<String>,
    hash: Option<u64>,
    #[serde(default, deserialize_with = "timestamp::optional")]
    created: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::optional")]
    modified: Option<DateTime<Utc>>,
    #[serde(default)]
    contents: Vec<RemoteEntry>,
}

impl TryFrom<RawMetadata> for RemoteEntry {
    type Error = String;

    fn try_from(raw: RawMetadata) -> Result<Self, Self::Error> {
        if raw.is_folder {
            let folder_id = raw
                .folder_id
                .ok_or_else(|| format!("folder {:?} without folderid", raw.name))?;
            Ok(RemoteEntry::Folder(RemoteFolder {
                folder_id,
                parent_folder_id: raw.parent_folder_id,
                name: raw.name,
                created: raw.created,
                modified: raw.modified,
                children: raw.contents,
            }))
        } else {
            let file_id = raw
                .file_id
                .ok_or_else(|| format!("file {:?} without fileid", raw.name))?;
            let parent_folder_id = raw
                .parent_folder_id
                .ok_or_else(|| format!("file {:?} without parentfolderid", raw.name))?;
            Ok(RemoteEntry::File(RemoteFile {
                file_id,
                parent_folder_id,
                name: raw.name,
                size: raw.size,
                content_type: raw.content_type,
                hash: raw.hash,
                created: raw.created,
                modified: raw.modified,
            }))
        }
    }
}
