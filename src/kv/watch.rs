// Long-poll watch support: a single task owns a ring buffer of recent
// change rows and the set of pending subscriptions, and resolves each
// subscription with its first matching change.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::kv::{SqlBackend, MAX_CHANGES};
use crate::models::{ActionUpdate, EtcdError, Node};

/// One change row, with its materialized update memoized after the
/// first lookup.
#[derive(Debug, Clone, Default)]
pub(crate) struct Change {
    pub index: i64,
    pub key: String,
    pub action: String,
    pub prev_node_modified: Option<i64>,
    value: Option<ActionUpdate>,
}

enum MaterializeError {
    /// A node row referenced by the change has already been pruned.
    Cleared,
    Failed(EtcdError),
}

impl Change {
    fn is_delete(&self) -> bool {
        matches!(self.action.as_str(), "delete" | "compareAndDelete" | "expire")
    }

    /// Resets the memoized value so the slot can be reused.
    fn clear(&mut self) {
        self.value = None;
    }

    /// Looks up the node rows this change refers to and assembles the
    /// update. For delete-like actions the emitted node is a stub carrying
    /// the key, the prior createdIndex and the deletion index.
    async fn value(&mut self, store: &SqlBackend) -> Result<ActionUpdate, MaterializeError> {
        if let Some(value) = &self.value {
            return Ok(value.clone());
        }

        let is_delete = self.is_delete();
        if is_delete && self.prev_node_modified.is_none() {
            return Err(MaterializeError::Failed(EtcdError::internal(format!(
                "action type {} should have prev_node_modified set",
                self.action
            ))));
        }

        let mut wanted = Vec::with_capacity(2);
        if !is_delete {
            wanted.push(self.index);
        }
        if let Some(prev) = self.prev_node_modified {
            wanted.push(prev);
        }

        let rows = store
            .nodes_by_modified(&self.key, &wanted)
            .await
            .map_err(|err| MaterializeError::Failed(err.into()))?;
        let mut by_modified: HashMap<i64, Node> =
            rows.into_iter().map(|n| (n.modified_index, n)).collect();

        let prev_node = match self.prev_node_modified {
            Some(modified) => Some(
                by_modified
                    .remove(&modified)
                    .ok_or(MaterializeError::Cleared)?,
            ),
            None => None,
        };

        let node = match (is_delete, &prev_node) {
            (true, Some(prev)) => Node {
                key: self.key.clone(),
                created_index: prev.created_index,
                modified_index: self.index,
                ..Default::default()
            },
            (true, None) => return Err(MaterializeError::Cleared),
            (false, _) => by_modified
                .remove(&self.index)
                .ok_or(MaterializeError::Cleared)?,
        };

        let update = ActionUpdate {
            action: self.action.clone(),
            node,
            prev_node,
        };
        self.value = Some(update.clone());
        Ok(update)
    }
}

/// A circular buffer of recent changes. Old entries are overwritten once
/// the buffer is full, after dropping their memoized values.
pub(crate) struct ChangeList {
    changes: Vec<Change>,
    begin: usize,
    size: usize,
}

impl ChangeList {
    pub fn new(capacity: usize) -> ChangeList {
        ChangeList {
            changes: vec![Change::default(); capacity],
            begin: 0,
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.changes.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn slot(&self, i: usize) -> usize {
        (self.begin + i) % self.capacity()
    }

    /// The `i`th element in logical order; 0 is the oldest.
    pub fn item(&self, i: usize) -> &Change {
        &self.changes[self.slot(i)]
    }

    pub fn item_mut(&mut self, i: usize) -> &mut Change {
        let slot = self.slot(i);
        &mut self.changes[slot]
    }

    pub fn first(&self) -> &Change {
        self.item(0)
    }

    pub fn last(&self) -> &Change {
        self.item(self.size - 1)
    }

    pub fn pop(&mut self) {
        if self.size > 0 {
            self.size -= 1;
        }
    }

    /// Moves the tail forward by one and returns the new last slot. At
    /// capacity, the oldest slot is cleared and recycled.
    pub fn next(&mut self) -> &mut Change {
        if self.size == self.capacity() {
            self.item_mut(0).clear();
            self.begin = (self.begin + 1) % self.capacity();
        } else {
            self.size += 1;
        }
        self.item_mut(self.size - 1)
    }
}

/// A pending long-poll subscription.
pub(crate) struct WatchSub {
    pub index: i64,
    pub key: String,
    pub recursive: bool,
    result: mpsc::Sender<Result<ActionUpdate, EtcdError>>,
}

impl WatchSub {
    /// Delivers the result. The channel holds one slot and the receiver
    /// never re-arms, so a duplicate send is silently dropped.
    fn resolve(&self, result: Result<ActionUpdate, EtcdError>) {
        let _ = self.result.try_send(result);
    }

    /// Whether the waiting client has gone away.
    fn is_abandoned(&self) -> bool {
        self.result.is_closed()
    }

    /// A change matches when it is at or past the waited-for index and
    /// touches the watched key: the key itself, anything under it for a
    /// recursive watch, or the removal of an ancestor directory (watchers
    /// must see their subtree being deleted from above).
    pub fn matches(&self, change: &Change) -> bool {
        if change.index < self.index {
            return false;
        }
        if change.key == self.key {
            return true;
        }
        if self.recursive && is_parent(&self.key, &change.key) {
            return true;
        }
        matches!(change.action.as_str(), "delete" | "expire") && is_parent(&change.key, &self.key)
    }
}

fn is_parent(parent: &str, child: &str) -> bool {
    child.len() > parent.len()
        && child.as_bytes()[parent.len()] == b'/'
        && child.starts_with(parent)
}

/// Handle to the watcher task. Cloneable; dropping every handle stops
/// the task.
#[derive(Clone)]
pub struct ChangeWatcher {
    submit: mpsc::Sender<WatchSub>,
}

impl ChangeWatcher {
    /// Spawns the watcher task, which refreshes the change ring from the
    /// database every `refresh_period` and resolves subscriptions as
    /// matching changes arrive.
    pub fn spawn(store: SqlBackend, refresh_period: Duration) -> ChangeWatcher {
        let (submit, rx) = mpsc::channel(64);
        let task = WatcherTask {
            store,
            changes: ChangeList::new(MAX_CHANGES as usize),
            watches: Vec::new(),
            last_index: 0,
        };
        tokio::spawn(task.run(rx, refresh_period));
        ChangeWatcher { submit }
    }

    /// Waits for the next change matching `key` at or after `wait_index`
    /// (0 = future changes only) and returns its update. Delivery is
    /// at-least-one: the first match ends the wait and clients
    /// re-subscribe with the next index.
    pub async fn next_change(
        &self,
        key: &str,
        recursive: bool,
        wait_index: i64,
    ) -> Result<ActionUpdate, EtcdError> {
        let (result, mut rx) = mpsc::channel(1);
        let sub = WatchSub {
            index: wait_index,
            key: key.to_string(),
            recursive,
            result,
        };
        if self.submit.send(sub).await.is_err() {
            return Err(EtcdError::internal("watcher is not running".to_string()));
        }
        match rx.recv().await {
            Some(result) => result,
            None => Err(EtcdError::internal(
                "watcher dropped the subscription".to_string(),
            )),
        }
    }
}

struct WatcherTask {
    store: SqlBackend,
    changes: ChangeList,
    watches: Vec<WatchSub>,
    last_index: i64,
}

impl WatcherTask {
    async fn run(mut self, mut submit: mpsc::Receiver<WatchSub>, refresh_period: Duration) {
        self.refresh().await;

        let mut ticker = interval_at(Instant::now() + refresh_period, refresh_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                sub = submit.recv() => match sub {
                    Some(sub) => self.add_watch(sub).await,
                    // every handle dropped; shut down
                    None => break,
                },
                _ = ticker.tick() => self.refresh().await,
            }
        }
    }

    /// Registers a subscription, first trying to resolve it against the
    /// buffered history when it asks for a past index.
    async fn add_watch(&mut self, sub: WatchSub) {
        if sub.index > 0 && self.changes.size() > 0 {
            let oldest = self.changes.first().index;
            if sub.index < oldest {
                sub.resolve(Err(EtcdError::index_cleared(
                    oldest,
                    sub.index,
                    self.last_index,
                )));
                return;
            }
            for i in 0..self.changes.size() {
                let change = self.changes.item_mut(i);
                if check_change(&self.store, self.last_index, change, &sub).await {
                    return;
                }
            }
        }
        self.watches.push(sub);
    }

    async fn refresh(&mut self) {
        let added = self.fetch_since().await;
        self.watches.retain(|w| !w.is_abandoned());
        if added == 0 {
            return;
        }
        self.last_index = self.changes.last().index;

        let start = self.changes.size().saturating_sub(added);
        for i in start..self.changes.size() {
            let mut j = 0;
            while j < self.watches.len() {
                let resolved = {
                    let change = self.changes.item_mut(i);
                    check_change(&self.store, self.last_index, change, &self.watches[j]).await
                };
                if resolved {
                    self.watches.swap_remove(j);
                } else {
                    j += 1;
                }
            }
        }
    }

    /// Pulls new change rows into the ring, oldest first. The expiration
    /// sweep runs first so TTL deletions show up as changes. Errors are
    /// logged and skipped; the loop keeps running on the next tick.
    async fn fetch_since(&mut self) -> usize {
        if let Err(err) = self.store.expire_nodes().await {
            tracing::error!(error = %err, "expiration sweep failed during watch refresh");
        }
        let rows = match self.store.changes_since(self.last_index).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::error!(error = %err, "error refreshing changes");
                return 0;
            }
        };
        let count = rows.len();
        for (index, key, action, prev_node_modified) in rows {
            let slot = self.changes.next();
            slot.index = index;
            slot.key = key;
            slot.action = action;
            slot.prev_node_modified = prev_node_modified;
            slot.clear();
        }
        count
    }
}

/// Attempts to resolve `sub` with `change`. Returns true when the
/// subscription received a result and should be dropped from the set.
async fn check_change(
    store: &SqlBackend,
    last_index: i64,
    change: &mut Change,
    sub: &WatchSub,
) -> bool {
    if !sub.matches(change) {
        return false;
    }
    match change.value(store).await {
        Ok(update) => {
            sub.resolve(Ok(update));
            true
        }
        Err(MaterializeError::Cleared) => {
            if sub.index == 0 {
                // no index was requested; keep waiting for the next match
                false
            } else {
                sub.resolve(Err(EtcdError::index_cleared(
                    change.index + 1,
                    sub.index,
                    last_index,
                )));
                true
            }
        }
        Err(MaterializeError::Failed(err)) => {
            sub.resolve(Err(err));
            true
        }
    }
}
