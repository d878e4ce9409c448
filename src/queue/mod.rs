//! The multi-sub-queue primitive underneath the broker.
//!
//! Items move between the delay, dependent, ready, run, and bury sub-queues;
//! removal takes them out entirely. A background timer task promotes delayed
//! items whose delay has elapsed and handles TTR expiry of reserved items.
//! The queue stores opaque data per item and never inspects it; the owner
//! hooks behavior in via the ready-added and TTR callbacks.

pub mod item;

pub use item::{ItemDef, ItemSnapshot, ItemState, QueueError};

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use item::Item;

/// What to do with a reserved item whose TTR ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtrAction {
    /// Return the item to the ready sub-queue.
    MoveToReady,
    /// Keep it reserved and re-arm the TTR (the owner has flagged the
    /// attached work as lost and wants the reservation to survive).
    KeepRunning,
}

/// Called once per batch of items entering the ready sub-queue, in its own
/// task, with snapshots of those items.
pub type ReadyAddedCallback<D> =
    Arc<dyn Fn(Vec<ItemSnapshot<D>>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Called under the queue lock for each item whose TTR expired; decides its
/// fate. Must not call back into the queue.
pub type TtrCallback<D> = Arc<dyn Fn(&D) -> TtrAction + Send + Sync>;

/// Counts of items per sub-queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub delayed: usize,
    pub dependent: usize,
    pub ready: usize,
    pub running: usize,
    pub buried: usize,
}

struct Inner<D> {
    items: HashMap<String, Item<D>>,
    /// Ordered best-first: highest priority, then oldest insertion.
    ready: BTreeSet<(Reverse<u8>, u64, String)>,
    /// Ordered by the instant each delayed item becomes ready.
    delay: BTreeSet<(Instant, u64, String)>,
    /// Ordered by TTR expiry instant.
    run: BTreeSet<(Instant, u64, String)>,
    /// dependency key -> keys of items waiting on it.
    waiting_on: HashMap<String, HashSet<String>>,
    next_seq: u64,
}

struct Shared<D> {
    inner: Mutex<Inner<D>>,
    timer_wake: Notify,
    closed: AtomicBool,
    ready_cb: RwLock<Option<ReadyAddedCallback<D>>>,
    ttr_cb: RwLock<Option<TtrCallback<D>>>,
}

pub struct Queue<D: Clone + Send + Sync + 'static> {
    name: String,
    shared: Arc<Shared<D>>,
}

impl<D: Clone + Send + Sync + 'static> Queue<D> {
    pub fn new(name: impl Into<String>) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                items: HashMap::new(),
                ready: BTreeSet::new(),
                delay: BTreeSet::new(),
                run: BTreeSet::new(),
                waiting_on: HashMap::new(),
                next_seq: 0,
            }),
            timer_wake: Notify::new(),
            closed: AtomicBool::new(false),
            ready_cb: RwLock::new(None),
            ttr_cb: RwLock::new(None),
        });
        tokio::spawn(timer_loop(Arc::downgrade(&shared)));
        Self {
            name: name.into(),
            shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the callback fired when items enter the ready sub-queue.
    /// Replaces any previous callback.
    pub fn set_ready_added_callback(&self, cb: ReadyAddedCallback<D>) {
        *self.shared.ready_cb.write().unwrap() = Some(cb);
    }

    pub fn set_ttr_callback(&self, cb: TtrCallback<D>) {
        *self.shared.ttr_cb.write().unwrap() = Some(cb);
    }

    fn check_open(&self) -> Result<(), QueueError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    pub async fn add(&self, def: ItemDef<D>) -> Result<(), QueueError> {
        let (added, _) = self.add_many(vec![def]).await?;
        if added == 0 {
            return Err(QueueError::AlreadyExists);
        }
        Ok(())
    }

    /// Add a batch of items. Returns `(added, duplicates)`; a duplicate is
    /// any key already present in a non-removed sub-queue, and duplicates
    /// are left untouched.
    pub async fn add_many(&self, defs: Vec<ItemDef<D>>) -> Result<(usize, usize), QueueError> {
        self.check_open()?;
        let mut added = 0;
        let mut dups = 0;
        let mut ready_batch = Vec::new();
        {
            let batch_keys: HashSet<String> = defs.iter().map(|d| d.key.clone()).collect();
            let mut inner = self.shared.inner.lock().await;
            for def in defs {
                if inner.items.contains_key(&def.key) {
                    dups += 1;
                    continue;
                }
                added += 1;
                let seq = inner.next_seq;
                inner.next_seq += 1;

                // a dependency neither in the queue nor elsewhere in this
                // batch is treated as already resolved
                let outstanding: HashSet<String> = def
                    .dependencies
                    .into_iter()
                    .filter(|dep| {
                        dep != &def.key
                            && (inner.items.contains_key(dep) || batch_keys.contains(dep))
                    })
                    .collect();

                let mut it = Item {
                    key: def.key.clone(),
                    data: def.data,
                    priority: def.priority,
                    delay: def.delay,
                    ttr: def.ttr,
                    reserve_group: def.reserve_group,
                    state: ItemState::Ready,
                    seq,
                    ready_at: None,
                    expires_at: None,
                    outstanding_deps: HashSet::new(),
                };

                if !outstanding.is_empty() {
                    it.state = ItemState::Dependent;
                    for dep in &outstanding {
                        inner
                            .waiting_on
                            .entry(dep.clone())
                            .or_default()
                            .insert(def.key.clone());
                    }
                    it.outstanding_deps = outstanding;
                } else if !def.delay.is_zero() {
                    it.state = ItemState::Delay;
                    let at = Instant::now() + def.delay;
                    it.ready_at = Some(at);
                    inner.delay.insert((at, seq, def.key.clone()));
                } else {
                    inner
                        .ready
                        .insert((Reverse(it.priority), seq, def.key.clone()));
                    ready_batch.push(it.snapshot());
                }
                inner.items.insert(def.key, it);
            }
        }
        self.shared.timer_wake.notify_one();
        self.fire_ready(ready_batch);
        Ok((added, dups))
    }

    pub async fn get(&self, key: &str) -> Option<ItemSnapshot<D>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return None;
        }
        let inner = self.shared.inner.lock().await;
        inner.items.get(key).map(|it| it.snapshot())
    }

    /// Pop the best ready item: highest priority, oldest first. With a
    /// group, only items carrying that reserve group are eligible. The item
    /// moves to the run sub-queue with its TTR armed.
    pub async fn reserve(&self, group: Option<&str>) -> Result<ItemSnapshot<D>, QueueError> {
        self.check_open()?;
        let snapshot = {
            let mut inner = self.shared.inner.lock().await;
            let entry = inner
                .ready
                .iter()
                .find(|(_, _, key)| match group {
                    Some(g) => {
                        inner.items.get(key).map(|it| it.reserve_group.as_str()) == Some(g)
                    }
                    None => true,
                })
                .cloned();
            let Some(entry) = entry else {
                return Err(QueueError::NothingReady);
            };
            inner.ready.remove(&entry);
            let (_, seq, key) = entry;
            let Some(it) = inner.items.get_mut(&key) else {
                return Err(QueueError::NotFound);
            };
            it.state = ItemState::Run;
            let expires = Instant::now() + it.ttr;
            it.expires_at = Some(expires);
            let snap = it.snapshot();
            inner.run.insert((expires, seq, key));
            snap
        };
        self.shared.timer_wake.notify_one();
        Ok(snapshot)
    }

    /// Re-arm the TTR of a reserved item.
    pub async fn touch(&self, key: &str) -> Result<(), QueueError> {
        self.check_open()?;
        {
            let mut inner = self.shared.inner.lock().await;
            let it = inner.items.get_mut(key).ok_or(QueueError::NotFound)?;
            if it.state != ItemState::Run {
                return Err(QueueError::WrongSubQueue);
            }
            let (seq, old_expires) = (it.seq, it.expires_at);
            let expires = Instant::now() + it.ttr;
            it.expires_at = Some(expires);
            if let Some(old) = old_expires {
                inner.run.remove(&(old, seq, key.to_string()));
            }
            inner.run.insert((expires, seq, key.to_string()));
        }
        self.shared.timer_wake.notify_one();
        Ok(())
    }

    /// Change the delay an item will sit out when next released. If the
    /// item is currently delayed, its wake-up moves accordingly.
    pub async fn set_delay(&self, key: &str, delay: Duration) -> Result<(), QueueError> {
        self.check_open()?;
        {
            let mut inner = self.shared.inner.lock().await;
            let it = inner.items.get_mut(key).ok_or(QueueError::NotFound)?;
            let (state, seq, old_ready_at) = (it.state, it.seq, it.ready_at);
            it.delay = delay;
            if state == ItemState::Delay {
                let at = Instant::now() + delay;
                it.ready_at = Some(at);
                if let Some(old) = old_ready_at {
                    inner.delay.remove(&(old, seq, key.to_string()));
                }
                inner.delay.insert((at, seq, key.to_string()));
            }
        }
        self.shared.timer_wake.notify_one();
        Ok(())
    }

    /// Move a reserved item to the delay sub-queue for its current delay;
    /// a zero delay goes straight to ready.
    pub async fn release(&self, key: &str) -> Result<(), QueueError> {
        self.check_open()?;
        let mut ready_batch = Vec::new();
        {
            let mut inner = self.shared.inner.lock().await;
            let it = inner.items.get_mut(key).ok_or(QueueError::NotFound)?;
            if it.state != ItemState::Run {
                return Err(QueueError::WrongSubQueue);
            }
            let (seq, delay, old_expires) = (it.seq, it.delay, it.expires_at);
            it.expires_at = None;
            if delay.is_zero() {
                it.state = ItemState::Ready;
                let entry = (Reverse(it.priority), seq, key.to_string());
                ready_batch.push(it.snapshot());
                if let Some(expires) = old_expires {
                    inner.run.remove(&(expires, seq, key.to_string()));
                }
                inner.ready.insert(entry);
            } else {
                it.state = ItemState::Delay;
                let at = Instant::now() + delay;
                it.ready_at = Some(at);
                if let Some(expires) = old_expires {
                    inner.run.remove(&(expires, seq, key.to_string()));
                }
                inner.delay.insert((at, seq, key.to_string()));
            }
        }
        self.shared.timer_wake.notify_one();
        self.fire_ready(ready_batch);
        Ok(())
    }

    /// Move a reserved or ready item to the bury sub-queue.
    pub async fn bury(&self, key: &str) -> Result<(), QueueError> {
        self.check_open()?;
        let mut inner = self.shared.inner.lock().await;
        let it = inner.items.get_mut(key).ok_or(QueueError::NotFound)?;
        if it.state != ItemState::Run && it.state != ItemState::Ready {
            return Err(QueueError::WrongSubQueue);
        }
        let (state, seq, expires_at, priority) = (it.state, it.seq, it.expires_at, it.priority);
        it.state = ItemState::Bury;
        it.expires_at = None;
        match state {
            ItemState::Run => {
                if let Some(expires) = expires_at {
                    inner.run.remove(&(expires, seq, key.to_string()));
                }
            }
            ItemState::Ready => {
                inner.ready.remove(&(Reverse(priority), seq, key.to_string()));
            }
            _ => {}
        }
        Ok(())
    }

    /// Move a buried item back to the ready sub-queue.
    pub async fn kick(&self, key: &str) -> Result<(), QueueError> {
        self.check_open()?;
        let mut ready_batch = Vec::new();
        {
            let mut inner = self.shared.inner.lock().await;
            let it = inner.items.get_mut(key).ok_or(QueueError::NotFound)?;
            if it.state != ItemState::Bury {
                return Err(QueueError::WrongSubQueue);
            }
            let (seq, priority) = (it.seq, it.priority);
            it.state = ItemState::Ready;
            ready_batch.push(it.snapshot());
            inner.ready.insert((Reverse(priority), seq, key.to_string()));
        }
        self.fire_ready(ready_batch);
        Ok(())
    }

    /// Take an item out of the queue entirely, resolving it as a
    /// dependency for anything waiting on it.
    pub async fn remove(&self, key: &str) -> Result<(), QueueError> {
        self.check_open()?;
        let mut ready_batch = Vec::new();
        {
            let mut inner = self.shared.inner.lock().await;
            let it = inner.items.remove(key).ok_or(QueueError::NotFound)?;
            match it.state {
                ItemState::Ready => {
                    inner
                        .ready
                        .remove(&(Reverse(it.priority), it.seq, key.to_string()));
                }
                ItemState::Delay => {
                    if let Some(at) = it.ready_at {
                        inner.delay.remove(&(at, it.seq, key.to_string()));
                    }
                }
                ItemState::Run => {
                    if let Some(expires) = it.expires_at {
                        inner.run.remove(&(expires, it.seq, key.to_string()));
                    }
                }
                ItemState::Dependent => {
                    for dep in &it.outstanding_deps {
                        if let Some(waiters) = inner.waiting_on.get_mut(dep) {
                            waiters.remove(key);
                        }
                    }
                }
                ItemState::Bury => {}
            }
            ready_batch = inner.resolve_dependency(key);
        }
        self.fire_ready(ready_batch);
        Ok(())
    }

    /// Re-index an item under a new key without moving it between
    /// sub-queues. Dependency edges referring to the old key follow it.
    pub async fn change_key(&self, old: &str, new: &str) -> Result<(), QueueError> {
        self.check_open()?;
        let mut inner = self.shared.inner.lock().await;
        if inner.items.contains_key(new) {
            return Err(QueueError::AlreadyExists);
        }
        let mut it = inner.items.remove(old).ok_or(QueueError::NotFound)?;

        match it.state {
            ItemState::Ready => {
                inner
                    .ready
                    .remove(&(Reverse(it.priority), it.seq, old.to_string()));
                inner
                    .ready
                    .insert((Reverse(it.priority), it.seq, new.to_string()));
            }
            ItemState::Delay => {
                if let Some(at) = it.ready_at {
                    inner.delay.remove(&(at, it.seq, old.to_string()));
                    inner.delay.insert((at, it.seq, new.to_string()));
                }
            }
            ItemState::Run => {
                if let Some(expires) = it.expires_at {
                    inner.run.remove(&(expires, it.seq, old.to_string()));
                    inner.run.insert((expires, it.seq, new.to_string()));
                }
            }
            ItemState::Dependent | ItemState::Bury => {}
        }

        // edges where this item is the waiter
        for dep in it.outstanding_deps.clone() {
            if let Some(waiters) = inner.waiting_on.get_mut(&dep) {
                waiters.remove(old);
                waiters.insert(new.to_string());
            }
        }
        // edges where this item is the dependency
        if let Some(waiters) = inner.waiting_on.remove(old) {
            for waiter in &waiters {
                if let Some(w) = inner.items.get_mut(waiter) {
                    w.outstanding_deps.remove(old);
                    w.outstanding_deps.insert(new.to_string());
                }
            }
            inner.waiting_on.insert(new.to_string(), waiters);
        }

        it.key = new.to_string();
        inner.items.insert(new.to_string(), it);
        Ok(())
    }

    /// Atomically re-parameterise an item: data, priority, delay, TTR,
    /// reserve group and dependencies. Dependency changes can move the item
    /// between the dependent and ready sub-queues.
    #[allow(clippy::too_many_arguments)]
    pub async fn update(
        &self,
        key: &str,
        reserve_group: &str,
        data: D,
        priority: u8,
        delay: Duration,
        ttr: Duration,
        dependencies: Vec<String>,
    ) -> Result<(), QueueError> {
        self.check_open()?;
        let mut ready_batch = Vec::new();
        {
            let mut inner = self.shared.inner.lock().await;
            let it = inner.items.get(key).ok_or(QueueError::NotFound)?;
            let (state, seq, old_priority) = (it.state, it.seq, it.priority);
            let old_deps = it.outstanding_deps.clone();

            if state == ItemState::Ready && old_priority != priority {
                inner
                    .ready
                    .remove(&(Reverse(old_priority), seq, key.to_string()));
                inner.ready.insert((Reverse(priority), seq, key.to_string()));
            }

            let outstanding: HashSet<String> = dependencies
                .into_iter()
                .filter(|dep| dep != key && inner.items.contains_key(dep))
                .collect();
            for dep in &old_deps {
                if let Some(waiters) = inner.waiting_on.get_mut(dep) {
                    waiters.remove(key);
                }
            }
            for dep in &outstanding {
                inner
                    .waiting_on
                    .entry(dep.clone())
                    .or_default()
                    .insert(key.to_string());
            }

            let Some(it) = inner.items.get_mut(key) else {
                return Err(QueueError::NotFound);
            };
            it.reserve_group = reserve_group.to_string();
            it.data = data;
            it.priority = priority;
            it.delay = delay;
            it.ttr = ttr;
            it.outstanding_deps = outstanding.clone();

            match state {
                ItemState::Dependent if outstanding.is_empty() => {
                    it.state = ItemState::Ready;
                    ready_batch.push(it.snapshot());
                    inner.ready.insert((Reverse(priority), seq, key.to_string()));
                }
                ItemState::Ready if !outstanding.is_empty() => {
                    it.state = ItemState::Dependent;
                    inner
                        .ready
                        .remove(&(Reverse(priority), seq, key.to_string()));
                }
                ItemState::Delay if !outstanding.is_empty() => {
                    let ready_at = it.ready_at.take();
                    it.state = ItemState::Dependent;
                    if let Some(at) = ready_at {
                        inner.delay.remove(&(at, seq, key.to_string()));
                    }
                }
                _ => {}
            }
        }
        self.fire_ready(ready_batch);
        Ok(())
    }

    /// Restrict which reservations may pop this item.
    pub async fn set_reserve_group(&self, key: &str, group: &str) -> Result<(), QueueError> {
        self.check_open()?;
        let mut inner = self.shared.inner.lock().await;
        let it = inner.items.get_mut(key).ok_or(QueueError::NotFound)?;
        it.reserve_group = group.to_string();
        Ok(())
    }

    pub async fn all_items(&self) -> Vec<ItemSnapshot<D>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let inner = self.shared.inner.lock().await;
        inner.items.values().map(|it| it.snapshot()).collect()
    }

    pub async fn stats(&self) -> QueueStats {
        if self.shared.closed.load(Ordering::SeqCst) {
            return QueueStats::default();
        }
        let inner = self.shared.inner.lock().await;
        let mut stats = QueueStats::default();
        for it in inner.items.values() {
            match it.state {
                ItemState::Delay => stats.delayed += 1,
                ItemState::Dependent => stats.dependent += 1,
                ItemState::Ready => stats.ready += 1,
                ItemState::Run => stats.running += 1,
                ItemState::Bury => stats.buried += 1,
            }
        }
        stats
    }

    /// Close the queue and drop everything in it. All later operations
    /// fail with `Closed`.
    pub async fn destroy(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let mut inner = self.shared.inner.lock().await;
        inner.items.clear();
        inner.ready.clear();
        inner.delay.clear();
        inner.run.clear();
        inner.waiting_on.clear();
        self.shared.timer_wake.notify_one();
    }

    fn fire_ready(&self, batch: Vec<ItemSnapshot<D>>) {
        fire_ready_shared(&self.shared, batch);
    }
}

impl<D: Clone + Send + Sync + 'static> Drop for Queue<D> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.timer_wake.notify_one();
    }
}

impl<D: Clone + Send + Sync + 'static> Inner<D> {
    /// Mark `key` resolved for anything waiting on it; returns the items
    /// this promoted to ready.
    fn resolve_dependency(&mut self, key: &str) -> Vec<ItemSnapshot<D>> {
        let Some(waiters) = self.waiting_on.remove(key) else {
            return Vec::new();
        };
        let mut promoted = Vec::new();
        for waiter in waiters {
            let Some(it) = self.items.get_mut(&waiter) else {
                continue;
            };
            it.outstanding_deps.remove(key);
            if it.state == ItemState::Dependent && it.outstanding_deps.is_empty() {
                it.state = ItemState::Ready;
                let entry = (Reverse(it.priority), it.seq, waiter.clone());
                promoted.push(it.snapshot());
                self.ready.insert(entry);
            }
        }
        promoted
    }
}

fn fire_ready_shared<D: Clone + Send + Sync + 'static>(
    shared: &Arc<Shared<D>>,
    batch: Vec<ItemSnapshot<D>>,
) {
    if batch.is_empty() {
        return;
    }
    let cb = shared.ready_cb.read().unwrap().clone();
    if let Some(cb) = cb {
        tokio::spawn(cb(batch));
    }
}

async fn timer_loop<D: Clone + Send + Sync + 'static>(weak: Weak<Shared<D>>) {
    loop {
        let Some(shared) = weak.upgrade() else { return };
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let next = {
            let inner = shared.inner.lock().await;
            let delay = inner.delay.iter().next().map(|e| e.0);
            let run = inner.run.iter().next().map(|e| e.0);
            match (delay, run) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            }
        };
        match next {
            Some(when) => {
                tokio::select! {
                    _ = shared.timer_wake.notified() => {}
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(when)) => {
                        process_due(&shared).await;
                    }
                }
            }
            None => shared.timer_wake.notified().await,
        }
    }
}

/// Promote delayed items whose delay elapsed and settle reserved items
/// whose TTR ran out.
async fn process_due<D: Clone + Send + Sync + 'static>(shared: &Arc<Shared<D>>) {
    let mut ready_batch = Vec::new();
    {
        let mut inner = shared.inner.lock().await;
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();

        while let Some(&(at, seq, ref key)) = inner.delay.iter().next() {
            if at > now {
                break;
            }
            let key = key.clone();
            inner.delay.remove(&(at, seq, key.clone()));
            let Some(it) = inner.items.get_mut(&key) else {
                continue;
            };
            it.state = ItemState::Ready;
            it.ready_at = None;
            let entry = (Reverse(it.priority), seq, key);
            ready_batch.push(it.snapshot());
            inner.ready.insert(entry);
        }

        let ttr_cb = shared.ttr_cb.read().unwrap().clone();
        while let Some(&(expires, seq, ref key)) = inner.run.iter().next() {
            if expires > now {
                break;
            }
            let key = key.clone();
            inner.run.remove(&(expires, seq, key.clone()));
            let Some(it) = inner.items.get_mut(&key) else {
                continue;
            };
            let action = match &ttr_cb {
                Some(cb) => cb(&it.data),
                None => TtrAction::MoveToReady,
            };
            match action {
                TtrAction::KeepRunning => {
                    let expires = now + it.ttr;
                    it.expires_at = Some(expires);
                    inner.run.insert((expires, seq, key));
                }
                TtrAction::MoveToReady => {
                    it.state = ItemState::Ready;
                    it.expires_at = None;
                    let entry = (Reverse(it.priority), seq, key);
                    ready_batch.push(it.snapshot());
                    inner.ready.insert(entry);
                }
            }
        }
    }
    fire_ready_shared(shared, ready_batch);
}
