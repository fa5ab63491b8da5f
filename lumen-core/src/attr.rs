//! Notification attributes (`pmin`, `pmax`, `gt`, `lt`, `st`, `edge`,
//! `con`) and the path-keyed store they live in.
//!
//! Attributes inherit downwards: the effective set for an observed path is
//! resolved on demand by overlaying the request-supplied attributes, the
//! exact-path entry, the entries of each ancestor path and finally the
//! server-account defaults. The store is keyed by path — there are no
//! back-pointers into the data model tree.

use crate::flat_map::FlatMap;
use crate::path::Path;
use crate::value::DataType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One level's worth of notification attributes; every field optional.
///
/// `epmin`, `epmax` and `hqmax` are accepted for protocol compliance but
/// have no behavioral effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrSet {
    pub pmin: Option<u32>,
    pub pmax: Option<u32>,
    pub gt: Option<f64>,
    pub lt: Option<f64>,
    pub st: Option<f64>,
    pub edge: Option<bool>,
    pub con: Option<bool>,
    pub epmin: Option<u32>,
    pub epmax: Option<u32>,
    pub hqmax: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttrError {
    #[error("lt must be less than gt")]
    LtNotBelowGt,
    #[error("lt + 2*st must be less than gt")]
    StepTooWide,
    #[error("pmin must not exceed pmax")]
    PminAbovePmax,
    #[error("gt/lt/st apply only to numeric resources")]
    ValueAttrOnNonNumeric,
    #[error("edge applies only to boolean resources")]
    EdgeOnNonBoolean,
    #[error("value attributes apply only at resource depth or below")]
    ValueAttrAboveResource,
    #[error("unknown or malformed attribute query {0:?}")]
    BadQuery(String),
}

impl AttrSet {
    pub fn is_empty(&self) -> bool {
        *self == AttrSet::default()
    }

    pub fn has_value_triggers(&self) -> bool {
        self.gt.is_some() || self.lt.is_some() || self.st.is_some() || self.edge.is_some()
    }

    /// Fills unset fields of `self` from `base` (nearer levels win).
    pub fn overlay_onto(mut self, base: &AttrSet) -> AttrSet {
        self.pmin = self.pmin.or(base.pmin);
        self.pmax = self.pmax.or(base.pmax);
        self.gt = self.gt.or(base.gt);
        self.lt = self.lt.or(base.lt);
        self.st = self.st.or(base.st);
        self.edge = self.edge.or(base.edge);
        self.con = self.con.or(base.con);
        self.epmin = self.epmin.or(base.epmin);
        self.epmax = self.epmax.or(base.epmax);
        self.hqmax = self.hqmax.or(base.hqmax);
        self
    }

    /// Checks the consistency rules for attributes written at `path` on a
    /// resource of type `data_type` (when known).
    pub fn validate(&self, path: &Path, data_type: Option<DataType>) -> Result<(), AttrError> {
        if let (Some(lt), Some(gt)) = (self.lt, self.gt) {
            if lt >= gt {
                return Err(AttrError::LtNotBelowGt);
            }
            if let Some(st) = self.st {
                if lt + 2.0 * st >= gt {
                    return Err(AttrError::StepTooWide);
                }
            }
        }
        if let (Some(pmin), Some(pmax)) = (self.pmin, self.pmax) {
            if pmin > pmax {
                return Err(AttrError::PminAbovePmax);
            }
        }
        let has_numeric_trigger = self.gt.is_some() || self.lt.is_some() || self.st.is_some();
        if (has_numeric_trigger || self.edge.is_some()) && path.len() < 3 {
            return Err(AttrError::ValueAttrAboveResource);
        }
        if let Some(data_type) = data_type {
            if has_numeric_trigger && !data_type.is_numeric() {
                return Err(AttrError::ValueAttrOnNonNumeric);
            }
            if self.edge.is_some() && data_type != DataType::Bool {
                return Err(AttrError::EdgeOnNonBoolean);
            }
        }
        Ok(())
    }

    /// Applies one `key[=value]` pair from a Write-Attributes query; a
    /// missing value clears the attribute.
    pub fn apply_query(&mut self, query: &str) -> Result<(), AttrError> {
        let (key, value) = match query.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (query, None),
        };
        let bad = || AttrError::BadQuery(query.to_string());
        match key {
            "pmin" => self.pmin = parse_opt(value).ok_or_else(bad)?,
            "pmax" => self.pmax = parse_opt(value).ok_or_else(bad)?,
            "gt" => self.gt = parse_opt(value).ok_or_else(bad)?,
            "lt" => self.lt = parse_opt(value).ok_or_else(bad)?,
            "st" => self.st = parse_opt(value).ok_or_else(bad)?,
            "edge" => {
                self.edge = match value {
                    None => None,
                    Some("0") => Some(false),
                    Some("1") => Some(true),
                    Some(_) => return Err(bad()),
                }
            }
            "con" => {
                self.con = match value {
                    None => None,
                    Some("0") => Some(false),
                    Some("1") => Some(true),
                    Some(_) => return Err(bad()),
                }
            }
            "epmin" => self.epmin = parse_opt(value).ok_or_else(bad)?,
            "epmax" => self.epmax = parse_opt(value).ok_or_else(bad)?,
            "hqmax" => self.hqmax = parse_opt(value).ok_or_else(bad)?,
            _ => return Err(bad()),
        }
        Ok(())
    }
}

/// `None` value clears (`Some(None)`); an unparseable value is `None`.
fn parse_opt<T: std::str::FromStr>(value: Option<&str>) -> Option<Option<T>> {
    match value {
        None => Some(None),
        Some(raw) => raw.parse().ok().map(Some),
    }
}

/// Per-path attribute storage for one server account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrStore {
    entries: FlatMap<Path, AttrSet>,
}

impl AttrStore {
    pub fn new() -> AttrStore {
        AttrStore::default()
    }

    pub fn get(&self, path: &Path) -> Option<&AttrSet> {
        self.entries.get(path)
    }

    /// Stores `attrs` at `path`, dropping the entry when it becomes empty.
    pub fn set(&mut self, path: Path, attrs: AttrSet) {
        if attrs.is_empty() {
            self.entries.remove(&path);
        } else {
            self.entries.insert(path, attrs);
        }
    }

    pub fn update<F>(&mut self, path: Path, f: F) -> Result<(), AttrError>
    where
        F: FnOnce(&mut AttrSet) -> Result<(), AttrError>,
    {
        let mut attrs = self.entries.get(&path).copied().unwrap_or_default();
        f(&mut attrs)?;
        self.set(path, attrs);
        Ok(())
    }

    /// Drops all entries at or below `path` (path deletion).
    pub fn remove_subtree(&mut self, path: &Path) {
        self.entries.retain(|entry, _| !entry.starts_with(path));
    }

    /// Resolves the effective attributes for `path`.
    ///
    /// Precedence: `request` (attributes carried in the Observe request) →
    /// exact path → ancestors nearest-first → `defaults` from the server
    /// account.
    pub fn resolve(&self, path: &Path, request: Option<&AttrSet>, defaults: &AttrSet) -> AttrSet {
        let mut effective = request.copied().unwrap_or_default();
        let mut level = Some(*path);
        while let Some(at) = level {
            if let Some(stored) = self.entries.get(&at) {
                effective = effective.overlay_onto(stored);
            }
            level = at.parent();
        }
        effective.overlay_onto(defaults)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &AttrSet)> {
        self.entries.iter().map(|(p, a)| (p, a))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rules() {
        let resource = Path::resource(3, 0, 9);
        let mut attrs = AttrSet {
            lt: Some(10.0),
            gt: Some(5.0),
            ..Default::default()
        };
        assert_eq!(
            attrs.validate(&resource, Some(DataType::Int)),
            Err(AttrError::LtNotBelowGt)
        );

        attrs.gt = Some(20.0);
        attrs.st = Some(6.0);
        assert_eq!(
            attrs.validate(&resource, Some(DataType::Int)),
            Err(AttrError::StepTooWide)
        );
        attrs.st = Some(4.0);
        assert!(attrs.validate(&resource, Some(DataType::Int)).is_ok());

        assert_eq!(
            attrs.validate(&Path::instance(3, 0), Some(DataType::Int)),
            Err(AttrError::ValueAttrAboveResource)
        );
        assert_eq!(
            attrs.validate(&resource, Some(DataType::Text)),
            Err(AttrError::ValueAttrOnNonNumeric)
        );

        let edge = AttrSet {
            edge: Some(true),
            ..Default::default()
        };
        assert_eq!(
            edge.validate(&resource, Some(DataType::Int)),
            Err(AttrError::EdgeOnNonBoolean)
        );
        assert!(edge.validate(&resource, Some(DataType::Bool)).is_ok());

        let periods = AttrSet {
            pmin: Some(60),
            pmax: Some(30),
            ..Default::default()
        };
        assert_eq!(
            periods.validate(&Path::object(3), None),
            Err(AttrError::PminAbovePmax)
        );
    }

    #[test]
    fn query_parse_and_clear() {
        let mut attrs = AttrSet::default();
        attrs.apply_query("pmin=30").unwrap();
        attrs.apply_query("gt=21.5").unwrap();
        attrs.apply_query("con=1").unwrap();
        assert_eq!(attrs.pmin, Some(30));
        assert_eq!(attrs.gt, Some(21.5));
        assert_eq!(attrs.con, Some(true));

        attrs.apply_query("gt").unwrap();
        assert_eq!(attrs.gt, None);
        assert!(attrs.apply_query("bogus=1").is_err());
        assert!(attrs.apply_query("edge=yes").is_err());
    }

    #[test]
    fn resolution_precedence() {
        let mut store = AttrStore::new();
        store.set(
            Path::object(3),
            AttrSet {
                pmin: Some(10),
                pmax: Some(300),
                ..Default::default()
            },
        );
        store.set(
            Path::resource(3, 0, 9),
            AttrSet {
                pmin: Some(60),
                ..Default::default()
            },
        );
        let defaults = AttrSet {
            pmax: Some(600),
            con: Some(true),
            ..Default::default()
        };

        let effective = store.resolve(&Path::resource(3, 0, 9), None, &defaults);
        assert_eq!(effective.pmin, Some(60)); // exact path beats ancestor
        assert_eq!(effective.pmax, Some(300)); // ancestor beats defaults
        assert_eq!(effective.con, Some(true)); // defaults fill the rest

        let request = AttrSet {
            pmin: Some(5),
            ..Default::default()
        };
        let effective = store.resolve(&Path::resource(3, 0, 9), Some(&request), &defaults);
        assert_eq!(effective.pmin, Some(5)); // request wins over everything
    }
}
