// ── Equipment objects ──

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use poolside_api::Params;

pub const OBJTYP: &str = "OBJTYP";
pub const SUBTYP: &str = "SUBTYP";
pub const SNAME: &str = "SNAME";
pub const STATUS: &str = "STATUS";
pub const PARENT: &str = "PARENT";

/// One piece of equipment known to the controller.
///
/// Type and subtype are held as fields and never appear in `properties`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolObject {
    objnam: String,
    objtype: String,
    subtype: Option<String>,
    properties: Params,
}

impl PoolObject {
    /// Build an object from an enumeration entry. Returns `None` when the
    /// entry has no `OBJTYP`.
    pub fn new(objnam: impl Into<String>, mut params: Params) -> Option<Self> {
        let objtype = match params.remove(OBJTYP) {
            Some(Value::String(objtype)) => objtype,
            _ => return None,
        };
        let subtype = match params.remove(SUBTYP) {
            Some(Value::String(subtype)) => Some(subtype),
            _ => None,
        };
        Some(Self {
            objnam: objnam.into(),
            objtype,
            subtype,
            properties: params,
        })
    }

    pub fn objnam(&self) -> &str {
        &self.objnam
    }

    pub fn objtype(&self) -> &str {
        &self.objtype
    }

    pub fn subtype(&self) -> Option<&str> {
        self.subtype.as_deref()
    }

    pub fn sname(&self) -> Option<&str> {
        self.str_attribute(SNAME)
    }

    pub fn status(&self) -> Option<&str> {
        self.str_attribute(STATUS)
    }

    pub fn parent(&self) -> Option<&str> {
        self.str_attribute(PARENT)
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Names of every attribute currently held.
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    pub fn properties(&self) -> &Params {
        &self.properties
    }

    /// Apply `params` and return the subset that actually changed.
    ///
    /// Values equal to the current ones are skipped. `OBJTYP` is immutable
    /// and ignored; `SUBTYP` updates the subtype field.
    pub fn update(&mut self, params: &Params) -> Params {
        let mut changed = Params::new();

        for (key, value) in params {
            match key.as_str() {
                OBJTYP => {
                    if value.as_str() != Some(self.objtype.as_str()) {
                        tracing::warn!(
                            objnam = %self.objnam,
                            current = %self.objtype,
                            received = %value,
                            "ignoring object type change"
                        );
                    }
                }
                SUBTYP => {
                    let subtype = value.as_str().map(str::to_owned);
                    if subtype != self.subtype {
                        self.subtype = subtype;
                        changed.insert(key.clone(), value.clone());
                    }
                }
                _ => {
                    if self.properties.get(key) != Some(value) {
                        self.properties.insert(key.clone(), value.clone());
                        changed.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        changed
    }

    fn str_attribute(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

impl fmt::Display for PoolObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}", self.objnam, self.objtype)?;
        if let Some(subtype) = &self.subtype {
            write!(f, "/{subtype}")?;
        }
        write!(f, ")")?;
        if let Some(sname) = self.sname() {
            write!(f, " \"{sname}\"")?;
        }
        Ok(())
    }
}
