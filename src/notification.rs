//! Change notifications
//!
//! A [`RecordSetNotification`] snapshots the state of the records touched by
//! one statement, once before and once after it runs, shaped per action by the
//! action's `include_values` getters. Notifications are collected in a
//! [`NotificationPool`] and handed to the per-action delivery channels when the
//! enclosing operation completes: on success every state pair is sent, on
//! failure each channel receives a single error event instead. Delivery runs
//! on its own thread, and a channel closes once its queued events are sent.

use crate::error::{EngineError, Result};
use crate::links::GenericLink;
use crate::meta::{Action, Getter, Meta, Method};
use crate::query::QueryContext;
use crate::retrieve_policy::RetrievePolicy;
use crate::types::{map_to_json, Value, ValueMap};
use crossbeam::channel::{bounded, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Identity attached to every notification payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: Option<i64>,
    pub login: String,
    #[serde(default)]
    pub role: Option<String>,
}

impl User {
    pub fn new(login: &str) -> Self {
        User {
            id: None,
            login: login.to_string(),
            role: None,
        }
    }
}

/// One message on a delivery channel
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// `{ action, object, previous, current, user }`, `Null` for error events
    pub payload: serde_json::Value,
    /// Raised by the record the caller submitted, not by a nested one
    pub is_root: bool,
    pub error: Option<String>,
}

impl Event {
    pub fn object(payload: serde_json::Value, is_root: bool) -> Self {
        Event {
            payload,
            is_root,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Event {
            payload: serde_json::Value::Null,
            is_root: true,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Delivery target of one action
pub trait Notifier: Send + Sync {
    /// Open a delivery channel buffering up to `capacity` events. The channel
    /// is finished when every sender has been dropped.
    fn open(&self, capacity: usize) -> Sender<Event>;

    /// Deliver events raised by nested records too
    fn active_if_not_root(&self) -> bool;
}

/// Spawn a consumer thread draining a fresh bounded channel into `on_event`;
/// `on_close` runs once the channel is disconnected
pub fn broadcast<F, C>(capacity: usize, mut on_event: F, on_close: C) -> Sender<Event>
where
    F: FnMut(Event) + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    let (sender, receiver) = bounded::<Event>(capacity.max(1));
    std::thread::spawn(move || {
        for event in receiver.iter() {
            on_event(event);
        }
        on_close();
    });
    sender
}

#[derive(Default)]
struct Collected {
    events: Mutex<Vec<Event>>,
    closed: Mutex<usize>,
    closed_signal: Condvar,
}

/// Notifier that keeps every delivered event in memory
#[derive(Clone, Default)]
pub struct TestNotifier {
    active_if_not_root: bool,
    collected: Arc<Collected>,
}

impl TestNotifier {
    pub fn new(active_if_not_root: bool) -> Self {
        TestNotifier {
            active_if_not_root,
            collected: Arc::new(Collected::default()),
        }
    }

    /// Handle sharing this notifier's event log, with its own flag
    pub fn with_active_if_not_root(&self, active_if_not_root: bool) -> Self {
        TestNotifier {
            active_if_not_root,
            collected: self.collected.clone(),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.collected.events.lock().clone()
    }

    pub fn closed_channels(&self) -> usize {
        *self.collected.closed.lock()
    }

    /// Block until at least `count` channels have been closed
    pub fn wait_closed(&self, count: usize, timeout: Duration) -> bool {
        let mut closed = self.collected.closed.lock();
        while *closed < count {
            if self.collected.closed_signal.wait_for(&mut closed, timeout).timed_out() {
                return *closed >= count;
            }
        }
        true
    }
}

impl Notifier for TestNotifier {
    fn open(&self, capacity: usize) -> Sender<Event> {
        let on_event = self.collected.clone();
        let on_close = self.collected.clone();
        broadcast(
            capacity,
            move |event| on_event.events.lock().push(event),
            move || {
                *on_close.closed.lock() += 1;
                on_close.closed_signal.notify_all();
            },
        )
    }

    fn active_if_not_root(&self) -> bool {
        self.active_if_not_root
    }
}

/// States of the records of one statement, per action
pub struct RecordSetNotification {
    meta: Arc<Meta>,
    method: Method,
    is_root: bool,
    user: Option<User>,
    actions: Vec<Action>,
    previous: HashMap<usize, Vec<ValueMap>>,
    current: HashMap<usize, Vec<ValueMap>>,
}

impl RecordSetNotification {
    pub fn new(meta: Arc<Meta>, method: Method, is_root: bool, user: Option<User>) -> Self {
        let actions = meta.actions.filter_by_method(method).into_iter().cloned().collect();
        RecordSetNotification {
            meta,
            method,
            is_root,
            user,
            actions,
            previous: HashMap::new(),
            current: HashMap::new(),
        }
    }

    /// True when an action of the meta listens to this method
    pub fn should_be_processed(&self) -> bool {
        !self.actions.is_empty()
    }

    pub fn meta(&self) -> &Arc<Meta> {
        &self.meta
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Snapshot the stored state of `records` before the statement runs
    pub fn capture_previous(&mut self, ctx: &QueryContext<'_>, records: &[ValueMap]) -> Result<()> {
        self.previous = self.capture(ctx, records)?;
        Ok(())
    }

    /// Snapshot the stored state of `records` after the statement ran
    pub fn capture_current(&mut self, ctx: &QueryContext<'_>, records: &[ValueMap]) -> Result<()> {
        self.current = self.capture(ctx, records)?;
        Ok(())
    }

    /// Empty states for records which do not exist (any more)
    pub fn capture_empty(&mut self, count: usize, previous: bool) {
        let states: HashMap<usize, Vec<ValueMap>> = self
            .actions
            .iter()
            .map(|a| (a.id, vec![ValueMap::new(); count]))
            .collect();
        if previous {
            self.previous = states;
        } else {
            self.current = states;
        }
    }

    fn capture(&self, ctx: &QueryContext<'_>, records: &[ValueMap]) -> Result<HashMap<usize, Vec<ValueMap>>> {
        let sources = if self.method == Method::Remove {
            records.iter().map(|r| Some(r.clone())).collect()
        } else {
            self.fetch(ctx, records)?
        };

        let mut states = HashMap::new();
        for action in &self.actions {
            let mut action_states = Vec::with_capacity(records.len());
            for (submitted, source) in records.iter().zip(&sources) {
                let state = match source {
                    Some(source) => self.shape_state(ctx, action, submitted, source)?,
                    None => ValueMap::new(),
                };
                action_states.push(state);
            }
            states.insert(action.id, action_states);
        }
        Ok(states)
    }

    /// Stored rows of `records`, aligned with them
    fn fetch(&self, ctx: &QueryContext<'_>, records: &[ValueMap]) -> Result<Vec<Option<ValueMap>>> {
        let keys: Vec<Value> = records
            .iter()
            .filter_map(|r| r.get(&self.meta.key).filter(|k| !k.is_null()).cloned())
            .collect();
        let rows = ctx.get_by_keys(&self.meta, &keys, 1, true)?;
        let by_key: HashMap<String, ValueMap> = rows
            .into_iter()
            .map(|row| {
                let key = row.get(&self.meta.key).map(Value::to_key_string).unwrap_or_default();
                (key, row)
            })
            .collect();
        Ok(records
            .iter()
            .map(|r| {
                r.get(&self.meta.key)
                    .filter(|k| !k.is_null())
                    .and_then(|k| by_key.get(&k.to_key_string()).cloned())
            })
            .collect())
    }

    fn shape_state(
        &self,
        ctx: &QueryContext<'_>,
        action: &Action,
        submitted: &ValueMap,
        source: &ValueMap,
    ) -> Result<ValueMap> {
        let mut state: ValueMap = if self.method == Method::Remove {
            source.clone()
        } else {
            source
                .iter()
                .filter(|(name, _)| submitted.contains_key(*name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        };
        for (alias, getter) in &action.include_values {
            let value = read_getter(ctx, &self.meta, source, getter)?;
            state.insert(alias.clone(), value);
            if let Getter::Path(path) = getter {
                if alias != path && state.contains_key(path) {
                    state.remove(path);
                }
            }
        }
        Ok(state)
    }

    fn payloads(&self) -> Vec<(usize, serde_json::Value)> {
        let user = self
            .user
            .as_ref()
            .and_then(|u| serde_json::to_value(u).ok())
            .unwrap_or(serde_json::Value::Null);
        let mut payloads = Vec::new();
        for action in &self.actions {
            let previous = self.previous.get(&action.id).map(Vec::as_slice).unwrap_or_default();
            let current = self.current.get(&action.id).map(Vec::as_slice).unwrap_or_default();
            let empty = ValueMap::new();
            for index in 0..previous.len().max(current.len()) {
                let payload = serde_json::json!({
                    "action": self.method.as_str(),
                    "object": self.meta.name,
                    "previous": map_to_json(previous.get(index).unwrap_or(&empty)),
                    "current": map_to_json(current.get(index).unwrap_or(&empty)),
                    "user": user,
                });
                payloads.push((action.id, payload));
            }
        }
        payloads
    }
}

/// Value of one getter against a stored record
fn read_getter(ctx: &QueryContext<'_>, meta: &Arc<Meta>, record: &ValueMap, getter: &Getter) -> Result<Value> {
    match getter {
        Getter::Path(path) => read_path(ctx, meta, record, path),
        Getter::Generic { field, cases } => {
            let stored = record.get(field).cloned().unwrap_or(Value::Null);
            let key_of = |object: &str| ctx_key_of(ctx, object);
            let Some(link) = GenericLink::from_value(&stored, key_of) else {
                return Ok(Value::Null);
            };
            let Some(object) = link.object.as_deref() else {
                return Ok(Value::Null);
            };
            let Some(case) = cases.iter().find(|c| c.object == object) else {
                return Ok(Value::Null);
            };
            let target = ctx.metas().require_meta(object)?;
            match ctx.get(&target, &link.pk, 1, RetrievePolicy::empty(), true)? {
                Some(target_record) => read_path(ctx, &target, &target_record, &case.value),
                None => Ok(Value::Null),
            }
        }
    }
}

/// Follow a dotted path, loading records behind inner links
fn read_path(ctx: &QueryContext<'_>, meta: &Arc<Meta>, record: &ValueMap, path: &str) -> Result<Value> {
    let mut meta = meta.clone();
    let mut record = record.clone();
    let segments: Vec<&str> = path.split('.').collect();
    for (index, segment) in segments.iter().enumerate() {
        let value = record.get(*segment).cloned().unwrap_or(Value::Null);
        if index + 1 == segments.len() {
            return Ok(value);
        }
        let Some(target_name) = meta.find_field(segment).and_then(|f| f.link_meta.clone()) else {
            return Ok(Value::Null);
        };
        if value.is_null() {
            return Ok(Value::Null);
        }
        let target = ctx.metas().require_meta(&target_name)?;
        match ctx.get(&target, &value, 1, RetrievePolicy::empty(), true)? {
            Some(next) => {
                record = next;
                meta = target;
            }
            None => return Ok(Value::Null),
        }
    }
    Ok(Value::Null)
}

fn ctx_key_of(ctx: &QueryContext<'_>, object: &str) -> Option<String> {
    ctx.metas().get_meta(object).ok().flatten().map(|m| m.key.clone())
}

/// Per-action delivery channels of one pool
struct NotificationSender {
    capacity: usize,
    channels: HashMap<(String, Method, usize), Sender<Event>>,
}

impl NotificationSender {
    fn new(capacity: usize) -> Self {
        NotificationSender {
            capacity,
            channels: HashMap::new(),
        }
    }

    /// Channel of an action, opened on first use; `None` when the action's
    /// notifier ignores events of nested records
    fn channel(&mut self, meta: &Meta, method: Method, action_id: usize, is_root: bool) -> Option<&Sender<Event>> {
        let notifier = meta.actions.notifier(method, action_id)?;
        if !is_root && !notifier.active_if_not_root() {
            return None;
        }
        let capacity = self.capacity;
        Some(
            self.channels
                .entry((meta.name.clone(), method, action_id))
                .or_insert_with(|| notifier.open(capacity)),
        )
    }

    fn send_error(&self, message: &str) {
        for ((meta, method, action_id), channel) in &self.channels {
            match channel.try_send(Event::error(message)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(meta = %meta, method = method.as_str(), action_id, "notification channel full, error event dropped");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    fn close(&mut self) {
        self.channels.clear();
    }
}

fn deliver_blocking(outbox: Vec<(String, Sender<Event>, Event)>) {
    for (meta, channel, event) in outbox {
        if channel.send(event).is_err() {
            tracing::warn!(meta = %meta, "notification consumer is gone");
        }
    }
}

/// Notifications of one top-level operation
pub struct NotificationPool {
    notifications: Vec<RecordSetNotification>,
    sender: NotificationSender,
    outbox: Vec<(String, Sender<Event>, Event)>,
}

impl NotificationPool {
    pub fn new(capacity: usize) -> Self {
        NotificationPool {
            notifications: Vec::new(),
            sender: NotificationSender::new(capacity),
            outbox: Vec::new(),
        }
    }

    pub fn add(&mut self, notification: RecordSetNotification) {
        if notification.should_be_processed() {
            self.notifications.push(notification);
        }
    }

    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }

    /// Queue the collected states of `method` on their delivery channels
    pub fn push(&mut self, method: Method) {
        for notification in self.notifications.iter().filter(|n| n.method == method) {
            for (action_id, payload) in notification.payloads() {
                let Some(channel) =
                    self.sender
                        .channel(&notification.meta, method, action_id, notification.is_root)
                else {
                    continue;
                };
                let event = Event::object(payload, notification.is_root);
                self.outbox.push((notification.meta.name.clone(), channel.clone(), event));
            }
        }
    }

    /// Hand queued events to a delivery thread, which owns their senders
    /// until every event is sent
    fn dispatch(&mut self) {
        let outbox = std::mem::take(&mut self.outbox);
        if outbox.is_empty() {
            return;
        }
        let spawned = std::thread::Builder::new()
            .name("notification-delivery".to_string())
            .spawn(move || deliver_blocking(outbox));
        if let Err(e) = spawned {
            tracing::error!(error = %e, "cannot start notification delivery, events dropped");
        }
    }

    /// Finish the pool: push everything on success, an error event per
    /// channel on failure; every channel is closed afterwards
    pub fn complete(mut self, outcome: std::result::Result<(), &EngineError>) {
        match outcome {
            Ok(()) => {
                for method in [Method::Create, Method::Update, Method::Remove] {
                    self.push(method);
                }
                self.dispatch();
            }
            Err(error) => {
                let targets: Vec<(Arc<Meta>, Method, usize, bool)> = self
                    .notifications
                    .iter()
                    .flat_map(|n| n.actions.iter().map(move |a| (n.meta.clone(), n.method, a.id, n.is_root)))
                    .collect();
                for (meta, method, action_id, is_root) in targets {
                    self.sender.channel(&meta, method, action_id, is_root);
                }
                self.sender.send_error(&error.to_string());
            }
        }
        self.sender.close();
    }
}
