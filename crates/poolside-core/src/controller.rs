// ── Controller abstraction ──
//
// Lifecycle of one controller connection: connect, read system info,
// enumerate equipment, subscribe to tracked attributes, and keep the
// model current from push notifications. All requests share one slot,
// so writes issued while anything else is in flight are coalesced.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use poolside_api::message::prune_entries;
use poolside_api::{
    Connection, DispatchError, Notification, NotificationHandler, ObjectEntry, Params, Response,
};

use crate::coalesce::{ChangeSink, WriteCoalescer};
use crate::config::ControllerConfig;
use crate::error::CoreError;
use crate::metrics::{ConnectionMetrics, MetricsSnapshot};
use crate::model::{
    ENUMERATION_KEYS, ModelUpdate, PoolModel, PoolObject, SYSTEM_INFO_KEYS, SystemInfo,
    batch_queries,
};

const UPDATE_CHANNEL_SIZE: usize = 256;

/// Pseudo object name addressing "every object" in reads.
const ALL_OBJECTS: &str = "INCR";

const GET_PARAM_LIST: &str = "GetParamList";
const REQUEST_PARAM_LIST: &str = "RequestParamList";
const SET_PARAM_LIST: &str = "SETPARAMLIST";
const GET_QUERY: &str = "GetQuery";

// ── Link ─────────────────────────────────────────────────────────

/// What the supervisor drives: something that can be started, watched for
/// loss, and stopped.
pub trait Link: Send + Sync + 'static {
    /// Establish the link and bring it to a usable state.
    fn start(&self) -> BoxFuture<'_, Result<(), CoreError>>;
    /// Resolves when the live link drops, with the cause.
    fn lost(&self) -> BoxFuture<'_, String>;
    /// Tear the link down. Pending requests fail.
    fn stop(&self) -> BoxFuture<'_, ()>;
}

// ── Controller ───────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<ControllerInner>`. The model outlives
/// individual connections.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    shared: Arc<Shared>,
    slot: Arc<Mutex<()>>,
    coalescer: WriteCoalescer<WriteSink>,
}

/// State reachable from the session task (notifications) and the write
/// path as well as from the controller itself.
struct Shared {
    connection: ArcSwapOption<Connection>,
    model: RwLock<PoolModel>,
    system_info: ArcSwapOption<SystemInfo>,
    updates: broadcast::Sender<Arc<ModelUpdate>>,
    metrics: ConnectionMetrics,
}

impl Controller {
    /// Create a controller. Does NOT connect; call [`start()`](Self::start).
    pub fn new(config: ControllerConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_SIZE);
        let shared = Arc::new(Shared {
            connection: ArcSwapOption::empty(),
            model: RwLock::new(PoolModel::new(config.attributes.clone())),
            system_info: ArcSwapOption::empty(),
            updates,
            metrics: ConnectionMetrics::new(),
        });
        let slot = Arc::new(Mutex::new(()));
        let coalescer = WriteCoalescer::new(
            WriteSink {
                shared: shared.clone(),
            },
            slot.clone(),
        );

        Self {
            inner: Arc::new(ControllerInner {
                config,
                shared,
                slot,
                coalescer,
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Connect and synchronize.
    ///
    /// Reads system info, enumerates equipment into the model, then
    /// subscribes to tracked attributes. On any failure the connection is
    /// closed and the error returned.
    pub async fn start(&self) -> Result<(), CoreError> {
        if self.is_connected() {
            return Err(CoreError::AlreadyStarted);
        }

        let config = &self.inner.config;
        let shared = &self.inner.shared;
        shared.metrics.connect_attempted();

        let feed: Arc<dyn NotificationHandler> = Arc::new(ModelFeed {
            shared: shared.clone(),
        });
        let connection = Connection::connect(
            &config.host,
            config.port,
            config.connection.clone(),
            Some(feed),
        )
        .await?;
        shared.connection.store(Some(Arc::new(connection.clone())));

        if let Err(e) = self.synchronize().await {
            warn!(error = %e, "initial synchronization failed, disconnecting");
            shared.connection.store(None);
            connection.disconnect().await;
            return Err(e);
        }

        shared.metrics.connected();
        let objects = shared.model.read().await.len();
        info!(addr = %config.addr(), objects, "controller ready");
        Ok(())
    }

    /// Close the connection. The model is kept.
    pub async fn stop(&self) {
        if let Some(connection) = self.inner.shared.connection.swap(None) {
            connection.disconnect().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .shared
            .connection
            .load()
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    async fn synchronize(&self) -> Result<(), CoreError> {
        let info = self.fetch_system_info().await?;
        debug!(sw_version = %info.sw_version, mode = %info.mode, "system info");
        self.inner.shared.system_info.store(Some(Arc::new(info)));

        let entries = self.get_all_objects(ENUMERATION_KEYS).await?;
        let added = self.inner.shared.model.write().await.add_objects(entries);
        debug!(added, "equipment enumerated");

        let queries = self.inner.shared.model.read().await.attributes_to_track();
        let batches = batch_queries(queries, self.inner.config.max_attributes_per_request);
        debug!(requests = batches.len(), "subscribing to tracked attributes");
        for batch in batches {
            let response = self.send_cmd(REQUEST_PARAM_LIST, object_list(&batch)?).await?;
            let entries = prune_entries(response.object_list()?);
            self.inner.shared.apply(&entries).await;
        }
        Ok(())
    }

    async fn fetch_system_info(&self) -> Result<SystemInfo, CoreError> {
        let mut fields = Params::new();
        fields.insert("condition".into(), json!("OBJTYP=SYSTEM"));
        fields.insert(
            "objectList".into(),
            json!([{"objnam": ALL_OBJECTS, "keys": SYSTEM_INFO_KEYS}]),
        );
        let response = self.send_cmd(GET_PARAM_LIST, fields).await?;
        let entries = prune_entries(response.object_list()?);
        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::InvalidResponse {
                message: "system info response has no objects".into(),
            })?;
        Ok(SystemInfo::from_params(entry.objnam, &entry.params))
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Send a raw request through the shared request slot.
    pub async fn send_cmd(&self, command: &str, fields: Params) -> Result<Response, CoreError> {
        let _slot = self.inner.slot.lock().await;
        self.inner.shared.send(command, fields).await
    }

    /// Every object's values for `keys`, pruned of unset attributes.
    pub async fn get_all_objects(&self, keys: &[&str]) -> Result<Vec<ObjectEntry>, CoreError> {
        let mut fields = Params::new();
        fields.insert("condition".into(), json!(""));
        fields.insert(
            "objectList".into(),
            json!([{"objnam": ALL_OBJECTS, "keys": keys}]),
        );
        let response = self.send_cmd(GET_PARAM_LIST, fields).await?;
        Ok(prune_entries(response.object_list()?))
    }

    /// Run a named query and return its `answer`.
    pub async fn get_query(&self, name: &str, arguments: &str) -> Result<Vec<Value>, CoreError> {
        let mut fields = Params::new();
        fields.insert("queryName".into(), json!(name));
        fields.insert("arguments".into(), json!(arguments));
        let response = self.send_cmd(GET_QUERY, fields).await?;
        Ok(response.answer()?)
    }

    pub async fn get_configuration(&self) -> Result<Vec<Value>, CoreError> {
        self.get_query("GetConfiguration", "").await
    }

    /// Write to one object immediately, bypassing coalescing.
    pub async fn request_changes(
        &self,
        objnam: &str,
        params: Params,
    ) -> Result<Response, CoreError> {
        self.request_batch(vec![ObjectEntry::new(objnam, params)])
            .await
    }

    /// Write to several objects in one request, bypassing coalescing.
    pub async fn request_batch(&self, entries: Vec<ObjectEntry>) -> Result<Response, CoreError> {
        self.send_cmd(SET_PARAM_LIST, object_list(&entries)?).await
    }

    /// Write to one object, merged with any concurrent writes.
    pub async fn set_params(&self, objnam: &str, params: Params) -> Result<Response, CoreError> {
        self.inner.coalescer.set(objnam, params).await
    }

    // ── State observation ────────────────────────────────────────

    /// Read access to the equipment model.
    pub async fn model(&self) -> RwLockReadGuard<'_, PoolModel> {
        self.inner.shared.model.read().await
    }

    /// Snapshot of one object.
    pub async fn object(&self, objnam: &str) -> Option<PoolObject> {
        self.inner.shared.model.read().await.get(objnam).cloned()
    }

    /// Subscribe to model changes.
    pub fn updates(&self) -> broadcast::Receiver<Arc<ModelUpdate>> {
        self.inner.shared.updates.subscribe()
    }

    /// Model changes as a `Stream`. Lagging consumers see an error item
    /// for the skipped updates.
    pub fn update_stream(&self) -> BroadcastStream<Arc<ModelUpdate>> {
        BroadcastStream::new(self.updates())
    }

    pub fn system_info(&self) -> Option<Arc<SystemInfo>> {
        self.inner.shared.system_info.load_full()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.shared.metrics.snapshot()
    }
}

impl Link for Controller {
    fn start(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(Controller::start(self))
    }

    fn lost(&self) -> BoxFuture<'_, String> {
        Box::pin(async move {
            match self.inner.shared.connection.load_full() {
                Some(connection) => connection.closed().await.to_string(),
                None => "not connected".to_owned(),
            }
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(Controller::stop(self))
    }
}

// ── Shared state ─────────────────────────────────────────────────

impl Shared {
    async fn send(&self, command: &str, fields: Params) -> Result<Response, CoreError> {
        let connection = self
            .connection
            .load_full()
            .ok_or(CoreError::NotConnected)?;
        self.metrics.request_sent();
        let result = connection.send_request(command, fields).await;
        self.metrics.request_finished(result.is_ok());
        Ok(result?)
    }

    /// Apply deltas to the model and publish what changed.
    async fn apply(&self, entries: &[ObjectEntry]) -> usize {
        let (updates, system) = {
            let mut model = self.model.write().await;
            let updates = model.process_updates(entries);
            let system = model.system_object().map(|o| o.objnam().to_owned());
            (updates, system)
        };
        if updates.is_empty() {
            return 0;
        }

        if let Some(changes) = system.and_then(|objnam| updates.get(&objnam)) {
            if let Some(current) = self.system_info.load_full() {
                let mut info = (*current).clone();
                if info.apply(changes) {
                    self.system_info.store(Some(Arc::new(info)));
                }
            }
        }

        let count = updates.len();
        // No subscribers is fine.
        let _ = self.updates.send(Arc::new(updates));
        count
    }
}

/// Feeds `NotifyList` pushes into the model.
struct ModelFeed {
    shared: Arc<Shared>,
}

impl NotificationHandler for ModelFeed {
    fn on_notification(
        &self,
        notification: Notification,
    ) -> BoxFuture<'_, Result<(), DispatchError>> {
        Box::pin(async move {
            let entries = prune_entries(notification.objects);
            let changed = self.shared.apply(&entries).await;
            debug!(objects = entries.len(), changed, "notification applied");
            Ok(())
        })
    }
}

/// Delivers coalesced batches. The coalescer already holds the slot.
struct WriteSink {
    shared: Arc<Shared>,
}

impl ChangeSink for WriteSink {
    fn send_changes(&self, changes: Vec<ObjectEntry>) -> BoxFuture<'_, Result<Response, CoreError>> {
        Box::pin(async move {
            let fields = object_list(&changes)?;
            self.shared.send(SET_PARAM_LIST, fields).await
        })
    }
}

fn object_list<T: serde::Serialize>(items: &[T]) -> Result<Params, CoreError> {
    let list = serde_json::to_value(items)
        .map_err(|e| CoreError::Internal(format!("cannot encode objectList: {e}")))?;
    let mut fields = Params::new();
    fields.insert("objectList".into(), list);
    Ok(fields)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use poolside_api::ObjectQuery;

    use super::*;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn seeded_controller() -> (Controller, ModelFeed) {
        let controller = Controller::new(ControllerConfig::new("127.0.0.1"));
        let feed = ModelFeed {
            shared: controller.inner.shared.clone(),
        };
        (controller, feed)
    }

    async fn seed(controller: &Controller) {
        let shared = &controller.inner.shared;
        shared.model.write().await.add_objects([
            ObjectEntry::new(
                "INCR",
                params(json!({"OBJTYP": "SYSTEM", "SNAME": "Home", "MODE": "ENGLISH"})),
            ),
            ObjectEntry::new("O1", params(json!({"OBJTYP": "CIRCUIT", "STATUS": "OFF"}))),
        ]);
        shared.system_info.store(Some(Arc::new(SystemInfo::from_params(
            "INCR",
            &params(json!({"SNAME": "Home", "MODE": "ENGLISH", "VER": "1.064"})),
        ))));
    }

    fn notify(objnam: &str, value: Value) -> Notification {
        Notification {
            message_id: None,
            objects: vec![ObjectEntry::new(objnam, params(value))],
        }
    }

    #[tokio::test]
    async fn notification_updates_model_and_broadcasts() {
        let (controller, feed) = seeded_controller();
        seed(&controller).await;
        let mut updates = controller.updates();

        feed.on_notification(notify("O1", json!({"STATUS": "ON"})))
            .await
            .unwrap();

        let update = updates.recv().await.unwrap();
        assert_eq!(update.get("O1"), Some(&params(json!({"STATUS": "ON"}))));
        assert_eq!(
            controller.object("O1").await.unwrap().status(),
            Some("ON")
        );
    }

    #[tokio::test]
    async fn unchanged_notification_is_not_broadcast() {
        let (controller, feed) = seeded_controller();
        seed(&controller).await;
        let mut updates = controller.updates();

        feed.on_notification(notify("O1", json!({"STATUS": "OFF"})))
            .await
            .unwrap();
        assert!(matches!(
            updates.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn system_notification_refreshes_system_info() {
        let (controller, feed) = seeded_controller();
        seed(&controller).await;

        feed.on_notification(notify("INCR", json!({"MODE": "METRIC"})))
            .await
            .unwrap();
        assert!(controller.system_info().unwrap().uses_metric());
    }

    #[tokio::test]
    async fn requests_fail_when_not_connected() {
        let controller = Controller::new(ControllerConfig::new("127.0.0.1"));
        assert!(!controller.is_connected());
        assert!(matches!(
            controller.get_configuration().await,
            Err(CoreError::NotConnected)
        ));
        assert!(matches!(
            controller
                .set_params("O1", params(json!({"STATUS": "ON"})))
                .await,
            Err(CoreError::NotConnected)
        ));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn lifecycle_futures_are_send() {
        let controller = Controller::new(ControllerConfig::new("127.0.0.1"));
        assert_send(&controller.start());
        assert_send(&Link::start(&controller));
        assert_send(&controller.set_params("O1", Params::new()));
    }

    #[test]
    fn object_list_encodes_entries() {
        let fields = object_list(&[ObjectQuery {
            objnam: "O1".into(),
            keys: vec!["STATUS".into()],
        }])
        .unwrap();
        assert_eq!(
            fields["objectList"],
            json!([{"objnam": "O1", "keys": ["STATUS"]}])
        );
    }
}
