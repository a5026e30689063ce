// ── Equipment model ──
//
// Keyed store of the controller's equipment. Bulk enumeration adds
// objects; notifications and subscription responses only update objects
// already present. Objects are never removed, so the model survives
// reconnects.

mod attributes;
mod object;
mod system;

use indexmap::IndexMap;
use serde_json::Value;

use poolside_api::{ObjectEntry, ObjectQuery, Params};

pub use attributes::{AttributeMap, default_attributes};
pub use object::{OBJTYP, PARENT, PoolObject, SNAME, STATUS, SUBTYP};
pub use system::{SYSTEM_INFO_KEYS, SystemInfo};

/// Object type of the controller itself.
pub const SYSTEM_TYPE: &str = "SYSTEM";

/// Keys fetched for every object during bulk enumeration.
pub const ENUMERATION_KEYS: &[&str] = &[OBJTYP, SUBTYP, SNAME, PARENT];

/// Changed attributes per object, in the order they were applied.
pub type ModelUpdate = IndexMap<String, Params>;

#[derive(Debug, Clone, Default)]
pub struct PoolModel {
    attribute_map: AttributeMap,
    objects: IndexMap<String, PoolObject>,
}

impl PoolModel {
    pub fn new(attribute_map: AttributeMap) -> Self {
        Self {
            attribute_map,
            objects: IndexMap::new(),
        }
    }

    pub fn attribute_map(&self) -> &AttributeMap {
        &self.attribute_map
    }

    // ── Mutation ─────────────────────────────────────────────────────

    /// Add one enumerated object.
    ///
    /// Entries without an `OBJTYP`, or of an untracked type, are ignored.
    /// An object already present is updated instead. Returns the changed
    /// attributes (all of them for a new object).
    pub fn add_object(&mut self, objnam: &str, params: Params) -> Params {
        let Some(objtype) = params.get(OBJTYP).and_then(Value::as_str) else {
            tracing::trace!(objnam, "skipping entry without object type");
            return Params::new();
        };
        if !self.attribute_map.is_tracked(objtype) {
            tracing::trace!(objnam, objtype, "skipping untracked object type");
            return Params::new();
        }

        if let Some(existing) = self.objects.get_mut(objnam) {
            return existing.update(&params);
        }

        let added = params.clone();
        if let Some(object) = PoolObject::new(objnam, params) {
            tracing::debug!(%object, "added object");
            self.objects.insert(objnam.to_owned(), object);
            added
        } else {
            Params::new()
        }
    }

    /// Add every entry of a bulk enumeration. Returns how many objects
    /// were newly added.
    pub fn add_objects(&mut self, entries: impl IntoIterator<Item = ObjectEntry>) -> usize {
        let before = self.objects.len();
        for entry in entries {
            let _ = self.add_object(&entry.objnam, entry.params);
        }
        self.objects.len() - before
    }

    /// Apply attribute deltas to known objects.
    ///
    /// Unknown objects are skipped; only objects with a non-empty diff
    /// appear in the result.
    pub fn process_updates(&mut self, entries: &[ObjectEntry]) -> ModelUpdate {
        let mut updates = ModelUpdate::new();
        for entry in entries {
            let Some(object) = self.objects.get_mut(&entry.objnam) else {
                continue;
            };
            let changed = object.update(&entry.params);
            if changed.is_empty() {
                continue;
            }
            updates
                .entry(entry.objnam.clone())
                .or_default()
                .extend(changed);
        }
        updates
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Subscription queries: one per object, with its type's attributes.
    pub fn attributes_to_track(&self) -> Vec<ObjectQuery> {
        self.objects
            .values()
            .filter_map(|object| {
                let keys = self.attribute_map.attributes_for(object.objtype());
                (!keys.is_empty()).then(|| ObjectQuery {
                    objnam: object.objnam().to_owned(),
                    keys,
                })
            })
            .collect()
    }

    pub fn get(&self, objnam: &str) -> Option<&PoolObject> {
        self.objects.get(objnam)
    }

    pub fn get_by_type<'a>(
        &'a self,
        objtype: &'a str,
    ) -> impl Iterator<Item = &'a PoolObject> + 'a {
        self.objects.values().filter(move |o| o.objtype() == objtype)
    }

    /// Objects of `objtype` whose subtype is `subtype`.
    pub fn get_by_subtype<'a>(
        &'a self,
        objtype: &'a str,
        subtype: &'a str,
    ) -> impl Iterator<Item = &'a PoolObject> + 'a {
        self.get_by_type(objtype)
            .filter(move |o| o.subtype() == Some(subtype))
    }

    /// Objects whose `PARENT` is `objnam`.
    pub fn children<'a>(&'a self, objnam: &'a str) -> impl Iterator<Item = &'a PoolObject> + 'a {
        self.objects
            .values()
            .filter(move |o| o.parent() == Some(objnam))
    }

    pub fn system_object(&self) -> Option<&PoolObject> {
        self.get_by_type(SYSTEM_TYPE).next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoolObject> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Split subscription queries into requests of at most `limit` attributes.
///
/// A query larger than `limit` is split across requests by key.
pub fn batch_queries(queries: Vec<ObjectQuery>, limit: usize) -> Vec<Vec<ObjectQuery>> {
    let limit = limit.max(1);
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut count = 0;

    for query in queries {
        for keys in query.keys.chunks(limit) {
            if count + keys.len() > limit && !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                count = 0;
            }
            count += keys.len();
            current.push(ObjectQuery {
                objnam: query.objnam.clone(),
                keys: keys.to_vec(),
            });
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn entry(objnam: &str, value: Value) -> ObjectEntry {
        ObjectEntry::new(objnam, params(value))
    }

    fn sample_model() -> PoolModel {
        let mut model = PoolModel::default();
        model.add_objects([
            entry("INCR", json!({"OBJTYP": "SYSTEM", "SNAME": "Home"})),
            entry("B1101", json!({"OBJTYP": "BODY", "SUBTYP": "POOL", "SNAME": "Pool"})),
            entry("O1", json!({"OBJTYP": "CIRCUIT", "STATUS": "OFF", "PARENT": "B1101"})),
            entry("P1", json!({"OBJTYP": "PANEL", "SNAME": "Panel"})),
            entry("X1", json!({})),
        ]);
        model
    }

    #[test]
    fn only_tracked_typed_objects_are_added() {
        let model = sample_model();
        assert_eq!(model.len(), 3);
        assert!(model.get("P1").is_none());
        assert!(model.get("X1").is_none());
    }

    #[test]
    fn add_existing_object_updates_it() {
        let mut model = sample_model();
        let changed = model.add_object("O1", params(json!({"OBJTYP": "CIRCUIT", "STATUS": "ON"})));
        assert_eq!(changed, params(json!({"STATUS": "ON"})));
        assert_eq!(model.len(), 3);
    }

    #[test]
    fn notification_updates_existing_object() {
        let mut model = sample_model();
        let updates = model.process_updates(&[entry("O1", json!({"STATUS": "ON"}))]);

        let mut expected = ModelUpdate::new();
        expected.insert("O1".into(), params(json!({"STATUS": "ON"})));
        assert_eq!(updates, expected);
        assert_eq!(model.get("O1").unwrap().status(), Some("ON"));
    }

    #[test]
    fn updates_never_create_objects() {
        let mut model = sample_model();
        let updates = model.process_updates(&[entry(
            "NEW1",
            json!({"OBJTYP": "CIRCUIT", "STATUS": "ON"}),
        )]);
        assert!(updates.is_empty());
        assert!(model.get("NEW1").is_none());
    }

    #[test]
    fn unchanged_values_are_not_reported() {
        let mut model = sample_model();
        let updates = model.process_updates(&[
            entry("O1", json!({"STATUS": "OFF"})),
            entry("B1101", json!({"SNAME": "Pool"})),
        ]);
        assert!(updates.is_empty());
    }

    #[test]
    fn lookups() {
        let model = sample_model();
        assert_eq!(model.system_object().unwrap().objnam(), "INCR");
        assert_eq!(model.get_by_type("BODY").count(), 1);
        let children: Vec<_> = model.children("B1101").map(PoolObject::objnam).collect();
        assert_eq!(children, vec!["O1"]);
    }

    #[test]
    fn subtype_lookup_narrows_type() {
        let mut model = sample_model();
        model.add_object("B1202", params(json!({"OBJTYP": "BODY", "SUBTYP": "SPA", "SNAME": "Spa"})));

        assert_eq!(model.get_by_type("BODY").count(), 2);
        let spas: Vec<_> = model.get_by_subtype("BODY", "SPA").map(PoolObject::objnam).collect();
        assert_eq!(spas, vec!["B1202"]);
        assert_eq!(model.get_by_subtype("CIRCUIT", "SPA").count(), 0);
    }

    #[test]
    fn tracking_queries_use_type_attributes() {
        let mut model = PoolModel::new(
            AttributeMap::empty()
                .with_attributes("CIRCUIT", ["STATUS"])
                .track("BODY"),
        );
        model.add_objects([
            entry("O1", json!({"OBJTYP": "CIRCUIT"})),
            entry("B1", json!({"OBJTYP": "BODY"})),
        ]);

        let queries = model.attributes_to_track();
        assert_eq!(queries[0].keys, vec!["STATUS"]);
        assert_eq!(
            queries[1].keys,
            default_attributes("BODY")
                .unwrap()
                .iter()
                .map(|s| (*s).to_owned())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn batches_respect_attribute_ceiling() {
        let query = |objnam: &str, n: usize| ObjectQuery {
            objnam: objnam.into(),
            keys: (0..n).map(|i| format!("K{i}")).collect(),
        };
        let batches = batch_queries(vec![query("A", 30), query("B", 30), query("C", 120)], 50);

        for batch in &batches {
            let total: usize = batch.iter().map(|q| q.keys.len()).sum();
            assert!(total <= 50, "batch of {total} attributes");
        }
        let total: usize = batches.iter().flatten().map(|q| q.keys.len()).sum();
        assert_eq!(total, 180);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].objnam, "A");
    }
}
