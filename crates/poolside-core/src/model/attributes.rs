// ── Tracked object types and their attributes ──
//
// Decides which enumerated objects enter the model and which attributes
// are subscribed for each of them.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Subscribed for tracked types that have neither an override nor an
/// entry in the default table.
const FALLBACK_ATTRIBUTES: &[&str] = &["SNAME", "STATUS"];

/// Default attributes for the common equipment types.
const DEFAULT_ATTRIBUTES: &[(&str, &[&str])] = &[
    (
        "BODY",
        &[
            "SNAME", "STATUS", "TEMP", "LOTMP", "HITMP", "HTSRC", "HTMODE", "LSTTMP", "VOL",
            "PARENT",
        ],
    ),
    (
        "CHEM",
        &[
            "SNAME", "PHVAL", "PHSET", "ORPVAL", "ORPSET", "SALT", "ALK", "CALC", "CYACID",
            "QUALTY", "PARENT",
        ],
    ),
    ("CIRCGRP", &["CIRCUIT", "ACT", "USE", "DLY", "PARENT"]),
    (
        "CIRCUIT",
        &["SNAME", "STATUS", "USE", "FEATR", "FREEZE", "ACT", "LIMIT", "TIME", "PARENT"],
    ),
    (
        "HEATER",
        &["SNAME", "STATUS", "BODY", "PERMIT", "TIMOUT", "READY", "HTMODE", "PARENT"],
    ),
    (
        "PUMP",
        &["SNAME", "STATUS", "PWR", "RPM", "GPM", "MIN", "MAX", "PARENT"],
    ),
    (
        "SCHED",
        &["SNAME", "ACT", "CIRCUIT", "STATUS", "DAY", "SINGLE", "START", "TIME", "STOP", "TIMOUT"],
    ),
    ("SENSE", &["SNAME", "STATUS", "SOURCE", "PROBE", "PARENT"]),
    (
        "SYSTEM",
        &["SNAME", "MODE", "PROPNAME", "VER", "SERVICE", "VACFLO", "TEMPNC", "TIMZON"],
    ),
    ("VALVE", &["SNAME", "ASSIGN", "PARENT"]),
];

/// Built-in attribute set for `objtype`, if it has one.
pub fn default_attributes(objtype: &str) -> Option<&'static [&'static str]> {
    DEFAULT_ATTRIBUTES
        .iter()
        .find(|(t, _)| *t == objtype)
        .map(|(_, attrs)| *attrs)
}

/// Tracked-types allow-list with optional per-type attribute overrides.
///
/// An empty attribute list means "use the default set for this type".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeMap {
    types: IndexMap<String, Vec<String>>,
}

impl AttributeMap {
    /// A map tracking nothing.
    pub fn empty() -> Self {
        Self {
            types: IndexMap::new(),
        }
    }

    /// Track `objtype` with its default attributes.
    pub fn track(mut self, objtype: impl Into<String>) -> Self {
        self.types.entry(objtype.into()).or_default();
        self
    }

    /// Track `objtype` with exactly `keys`.
    pub fn with_attributes<I, S>(mut self, objtype: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types
            .insert(objtype.into(), keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_tracked(&self, objtype: &str) -> bool {
        self.types.contains_key(objtype)
    }

    pub fn tracked_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Attributes to subscribe for `objtype`. Empty for untracked types.
    pub fn attributes_for(&self, objtype: &str) -> Vec<String> {
        match self.types.get(objtype) {
            None => Vec::new(),
            Some(keys) if !keys.is_empty() => keys.clone(),
            Some(_) => default_attributes(objtype)
                .unwrap_or(FALLBACK_ATTRIBUTES)
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
        }
    }
}

impl Default for AttributeMap {
    /// Every type in the default table, with its default attributes.
    fn default() -> Self {
        DEFAULT_ATTRIBUTES
            .iter()
            .fold(Self::empty(), |map, (objtype, _)| map.track(*objtype))
    }
}
