// ── Controller system information ──

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use poolside_api::Params;

pub const PROPNAME: &str = "PROPNAME";
pub const VER: &str = "VER";
pub const MODE: &str = "MODE";

/// Keys requested from the system object at startup.
pub const SYSTEM_INFO_KEYS: &[&str] = &[PROPNAME, VER, MODE, super::object::SNAME];

/// Identity and settings of the controller itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub objnam: String,
    pub prop_name: String,
    pub sw_version: String,
    pub mode: String,
    /// Stable across restarts: derived from the system name.
    pub unique_id: Uuid,
}

impl SystemInfo {
    pub fn from_params(objnam: impl Into<String>, params: &Params) -> Self {
        let text = |key: &str| {
            params
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        let sname = text(super::object::SNAME);
        Self {
            objnam: objnam.into(),
            prop_name: text(PROPNAME),
            sw_version: text(VER),
            mode: text(MODE),
            unique_id: Uuid::new_v5(&Uuid::NAMESPACE_DNS, sname.as_bytes()),
        }
    }

    pub fn uses_metric(&self) -> bool {
        self.mode == "METRIC"
    }

    /// Fold a change set for the system object in. Returns `true` if any
    /// tracked field changed.
    pub fn apply(&mut self, changes: &Params) -> bool {
        let mut changed = false;
        for (key, field) in [
            (PROPNAME, &mut self.prop_name),
            (VER, &mut self.sw_version),
            (MODE, &mut self.mode),
        ] {
            if let Some(value) = changes.get(key).and_then(Value::as_str) {
                if field != value {
                    *field = value.to_owned();
                    changed = true;
                }
            }
        }
        changed
    }
}
