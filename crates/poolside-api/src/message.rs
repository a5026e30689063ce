//! Wire message types.
//!
//! Every message is one JSON object. Requests carry a `messageID` and a
//! `command`; responses echo both plus a `response` code; `NotifyList`
//! pushes carry an `objectList` of attribute deltas and no response code.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Attribute name to value, as sent and received on the wire.
pub type Params = serde_json::Map<String, Value>;

/// Command name of unsolicited push notifications.
pub const NOTIFY_LIST: &str = "NotifyList";

/// Response code for success.
pub const SUCCESS_CODE: &str = "200";

const MESSAGE_ID_KEY: &str = "messageID";
const COMMAND_KEY: &str = "command";
const RESPONSE_KEY: &str = "response";
const OBJECT_LIST_KEY: &str = "objectList";
const ANSWER_KEY: &str = "answer";

// ── Object payloads ─────────────────────────────────────────────────

/// One object and a bag of its attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub objnam: String,
    #[serde(default)]
    pub params: Params,
}

impl ObjectEntry {
    pub fn new(objnam: impl Into<String>, params: Params) -> Self {
        Self {
            objnam: objnam.into(),
            params,
        }
    }
}

/// A read or subscription query: which keys to fetch for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectQuery {
    pub objnam: String,
    pub keys: Vec<String>,
}

// ── Request ─────────────────────────────────────────────────────────

/// An outgoing request. Command-specific fields are flattened beside
/// `messageID` and `command`.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    #[serde(rename = "messageID")]
    pub message_id: String,
    pub command: String,
    #[serde(flatten)]
    pub fields: Params,
}

impl Request {
    /// Serialize to a single JSON line body (terminator not included).
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

// ── Response ────────────────────────────────────────────────────────

/// A correlated answer to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub message_id: String,
    pub command: String,
    pub code: String,
    /// The full message body, including the fields above.
    pub body: Params,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    /// Turn a non-200 response into [`Error::Response`].
    pub fn into_result(self) -> Result<Self, Error> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::Response {
                command: self.command,
                code: self.code,
            })
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Decode the `objectList` field.
    pub fn object_list(&self) -> Result<Vec<ObjectEntry>, Error> {
        let raw = self.require(OBJECT_LIST_KEY)?;
        serde_json::from_value(raw.clone()).map_err(|e| self.malformed(e.to_string()))
    }

    /// The `answer` array of a `GetQuery` response.
    pub fn answer(&self) -> Result<Vec<Value>, Error> {
        match self.require(ANSWER_KEY)? {
            Value::Array(items) => Ok(items.clone()),
            other => Err(self.malformed(format!("answer is not an array: {other}"))),
        }
    }

    fn require(&self, key: &str) -> Result<&Value, Error> {
        self.body
            .get(key)
            .ok_or_else(|| self.malformed(format!("missing {key}")))
    }

    fn malformed(&self, reason: String) -> Error {
        Error::MalformedResponse {
            command: self.command.clone(),
            reason,
        }
    }
}

// ── Notification ────────────────────────────────────────────────────

/// An unsolicited `NotifyList` push.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub message_id: Option<String>,
    pub objects: Vec<ObjectEntry>,
}

// ── Classification ──────────────────────────────────────────────────

/// A decoded inbound message, sorted by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
    /// Anything else the controller sends. Logged and ignored.
    Other { command: String },
}

impl Incoming {
    /// Classify a raw JSON object.
    ///
    /// A message with a `response` field is a response regardless of its
    /// command; a `NotifyList` without one is a notification.
    pub fn classify(body: Params) -> Result<Self, Error> {
        let command = body
            .get(COMMAND_KEY)
            .map(scalar_to_string)
            .unwrap_or_default();

        if let Some(code) = body.get(RESPONSE_KEY) {
            let code = scalar_to_string(code);
            let message_id = body
                .get(MESSAGE_ID_KEY)
                .map(scalar_to_string)
                .ok_or_else(|| Error::MalformedMessage {
                    reason: format!("{command} response without messageID"),
                })?;
            return Ok(Self::Response(Response {
                message_id,
                command,
                code,
                body,
            }));
        }

        if command == NOTIFY_LIST {
            let raw = body
                .get(OBJECT_LIST_KEY)
                .cloned()
                .ok_or_else(|| Error::MalformedMessage {
                    reason: "NotifyList without objectList".into(),
                })?;
            let objects: Vec<ObjectEntry> =
                serde_json::from_value(raw).map_err(|e| Error::MalformedMessage {
                    reason: format!("NotifyList objectList: {e}"),
                })?;
            return Ok(Self::Notification(Notification {
                message_id: body.get(MESSAGE_ID_KEY).map(scalar_to_string),
                objects,
            }));
        }

        if command.is_empty() {
            return Err(Error::MalformedMessage {
                reason: "message has neither response nor command".into(),
            });
        }

        Ok(Self::Other { command })
    }
}

/// The controller mixes string and numeric ids/codes; compare as strings.
fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Pruning ─────────────────────────────────────────────────────────

/// Strip "undefined" attributes from a value tree.
///
/// The controller reports an attribute it has no value for by echoing the
/// key as the value (`"SUBTYP": "SUBTYP"`). Those pairs are removed at
/// every depth.
pub fn prune(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(prune).collect()),
        Value::Object(map) => Value::Object(prune_params(map)),
        other => other,
    }
}

/// [`prune`] applied to one attribute bag.
pub fn prune_params(params: Params) -> Params {
    params
        .into_iter()
        .filter(|(k, v)| v.as_str() != Some(k.as_str()))
        .map(|(k, v)| (k, prune(v)))
        .collect()
}

/// [`prune`] applied to every entry's attributes.
pub fn prune_entries(entries: Vec<ObjectEntry>) -> Vec<ObjectEntry> {
    entries
        .into_iter()
        .map(|entry| ObjectEntry {
            objnam: entry.objnam,
            params: prune_params(entry.params),
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn request_serializes_flat() {
        let mut fields = Params::new();
        fields.insert("condition".into(), json!("OBJTYP=SYSTEM"));
        let request = Request {
            message_id: "7".into(),
            command: "GetParamList".into(),
            fields,
        };
        let encoded: Value = serde_json::from_slice(&request.to_bytes().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"messageID": "7", "command": "GetParamList", "condition": "OBJTYP=SYSTEM"})
        );
    }

    #[test]
    fn classify_response() {
        let body = object(json!({
            "messageID": "3",
            "command": "SendParamList",
            "response": "200",
            "objectList": [{"objnam": "C0001", "params": {"STATUS": "ON"}}]
        }));
        let Incoming::Response(resp) = Incoming::classify(body).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.message_id, "3");
        assert!(resp.is_success());
        let objects = resp.object_list().unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].params["STATUS"], json!("ON"));
    }

    #[test]
    fn numeric_codes_compare_as_strings() {
        let body = object(json!({"messageID": 9, "command": "X", "response": 400}));
        let Incoming::Response(resp) = Incoming::classify(body).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.message_id, "9");
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.response_code(), Some("400"));
    }

    #[test]
    fn classify_notification() {
        let body = object(json!({
            "command": "NotifyList",
            "objectList": [{"objnam": "O1", "params": {"STATUS": "ON"}}]
        }));
        let Incoming::Notification(n) = Incoming::classify(body).unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(n.message_id, None);
        assert_eq!(n.objects[0].objnam, "O1");
    }

    #[test]
    fn response_without_message_id_is_malformed() {
        let body = object(json!({"command": "GetParamList", "response": "200"}));
        assert!(matches!(
            Incoming::classify(body),
            Err(Error::MalformedMessage { .. })
        ));
    }

    #[test]
    fn notification_without_object_list_is_malformed() {
        let body = object(json!({"command": "NotifyList"}));
        assert!(Incoming::classify(body).is_err());
    }

    #[test]
    fn unknown_command_is_other() {
        let body = object(json!({"command": "WriteParamList"}));
        assert_eq!(
            Incoming::classify(body).unwrap(),
            Incoming::Other {
                command: "WriteParamList".into()
            }
        );
    }

    #[test]
    fn prune_drops_echoed_keys_at_every_depth() {
        let raw = json!([
            {"objnam": "B1", "params": {"OBJTYP": "BODY", "SUBTYP": "SUBTYP", "SNAME": "Pool"}},
            {"objnam": "X1", "params": {"OBJTYP": "OBJTYP"}}
        ]);
        assert_eq!(
            prune(raw),
            json!([
                {"objnam": "B1", "params": {"OBJTYP": "BODY", "SNAME": "Pool"}},
                {"objnam": "X1", "params": {}}
            ])
        );
    }

    #[test]
    fn answer_requires_array() {
        let body = object(json!({"messageID": "1", "command": "GetQuery", "response": "200", "answer": 5}));
        let Incoming::Response(resp) = Incoming::classify(body).unwrap() else {
            panic!("expected response");
        };
        assert!(matches!(resp.answer(), Err(Error::MalformedResponse { .. })));
    }
}
