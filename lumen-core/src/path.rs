use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// The reserved identifier marking "unset" in LwM2M id spaces.
pub const INVALID_ID: u16 = 0xffff;

/// An LwM2M path: up to four 16-bit identifiers `(oid, iid, rid, riid)`.
///
/// Any suffix may be absent; the empty path is the data model root.
/// Ordering is lexicographic on the present identifiers, which makes a
/// sorted set of paths enumerate siblings in ascending-id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path {
    ids: [u16; 4],
    len: u8,
}

impl Path {
    pub const ROOT: Path = Path {
        ids: [INVALID_ID; 4],
        len: 0,
    };

    pub fn object(oid: u16) -> Path {
        Path::build(&[oid])
    }

    pub fn instance(oid: u16, iid: u16) -> Path {
        Path::build(&[oid, iid])
    }

    pub fn resource(oid: u16, iid: u16, rid: u16) -> Path {
        Path::build(&[oid, iid, rid])
    }

    pub fn resource_instance(oid: u16, iid: u16, rid: u16, riid: u16) -> Path {
        Path::build(&[oid, iid, rid, riid])
    }

    fn build(ids: &[u16]) -> Path {
        let mut buf = [INVALID_ID; 4];
        buf[..ids.len()].copy_from_slice(ids);
        Path {
            ids: buf,
            len: ids.len() as u8,
        }
    }

    pub fn from_ids(ids: &[u16]) -> Result<Path, PathParseError> {
        if ids.len() > 4 {
            return Err(PathParseError::TooDeep);
        }
        if ids.contains(&INVALID_ID) {
            return Err(PathParseError::ReservedId);
        }
        Ok(Path::build(ids))
    }

    pub fn ids(&self) -> &[u16] {
        &self.ids[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_root(&self) -> bool {
        self.len == 0
    }

    pub fn oid(&self) -> Option<u16> {
        self.ids().first().copied()
    }

    pub fn iid(&self) -> Option<u16> {
        self.ids().get(1).copied()
    }

    pub fn rid(&self) -> Option<u16> {
        self.ids().get(2).copied()
    }

    pub fn riid(&self) -> Option<u16> {
        self.ids().get(3).copied()
    }

    pub fn is_object(&self) -> bool {
        self.len == 1
    }

    pub fn is_instance(&self) -> bool {
        self.len == 2
    }

    pub fn is_resource(&self) -> bool {
        self.len == 3
    }

    pub fn is_resource_instance(&self) -> bool {
        self.len == 4
    }

    pub fn parent(&self) -> Option<Path> {
        if self.len == 0 {
            None
        } else {
            Some(Path::build(&self.ids()[..self.len as usize - 1]))
        }
    }

    /// True when `prefix` is this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        prefix.len <= self.len && self.ids()[..prefix.len as usize] == *prefix.ids()
    }

    /// True when the two paths share an ancestor/descendant relationship.
    pub fn intersects(&self, other: &Path) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }

    pub fn join(&self, id: u16) -> Result<Path, PathParseError> {
        if self.len == 4 {
            return Err(PathParseError::TooDeep);
        }
        if id == INVALID_ID {
            return Err(PathParseError::ReservedId);
        }
        let mut ids = self.ids;
        ids[self.len as usize] = id;
        Ok(Path {
            ids,
            len: self.len + 1,
        })
    }
}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Path) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Path {
    fn cmp(&self, other: &Path) -> std::cmp::Ordering {
        self.ids().cmp(other.ids())
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            return write!(f, "/");
        }
        for id in self.ids() {
            write!(f, "/{id}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PathParseError {
    #[error("path has more than four segments")]
    TooDeep,
    #[error("path segment is not a decimal id below 65535")]
    BadSegment,
    #[error("path uses the reserved id 65535")]
    ReservedId,
}

impl FromStr for Path {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Path, PathParseError> {
        let trimmed = s.strip_prefix('/').unwrap_or(s);
        if trimmed.is_empty() {
            return Ok(Path::ROOT);
        }
        let mut ids = [INVALID_ID; 4];
        let mut len = 0usize;
        for segment in trimmed.split('/') {
            if len == 4 {
                return Err(PathParseError::TooDeep);
            }
            let id: u16 = segment.parse().map_err(|_| PathParseError::BadSegment)?;
            if id == INVALID_ID {
                return Err(PathParseError::ReservedId);
            }
            ids[len] = id;
            len += 1;
        }
        Ok(Path {
            ids,
            len: len as u8,
        })
    }
}
