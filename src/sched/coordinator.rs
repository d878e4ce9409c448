use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::sched::{Requirements, Scheduler};

struct CoordInner {
    /// Per scheduler group: how many runners are wanted (jobs on the
    /// ready/run path). Entries are removed when they reach zero.
    counts: HashMap<String, usize>,
    /// Per scheduler group: the requirements runners must be provisioned
    /// with. Kept in lockstep with `counts`.
    reqs: HashMap<String, Requirements>,
}

/// Keeps the external cluster scheduler's runner demand in sync with the
/// number of jobs per scheduler group.
///
/// All count/requirement mutation happens under one lock, and the
/// scheduler's `schedule` call is made before that lock is released, so an
/// observer of the scheduler sees each group's count change monotonically
/// between observations.
pub struct Coordinator {
    sched: Arc<dyn Scheduler>,
    queue_name: String,
    /// Runner command template with `{queue}` and `{group}` placeholders;
    /// empty disables scheduling entirely.
    runner_cmd: String,
    inner: Mutex<CoordInner>,
}

impl Coordinator {
    pub fn new(sched: Arc<dyn Scheduler>, queue_name: String, runner_cmd: String) -> Self {
        Self {
            sched,
            queue_name,
            runner_cmd,
            inner: Mutex::new(CoordInner {
                counts: HashMap::new(),
                reqs: HashMap::new(),
            }),
        }
    }

    /// Whether this coordinator spawns runners at all.
    pub fn spawns_runners(&self) -> bool {
        !self.runner_cmd.is_empty()
    }

    pub fn place(&self, req: &Requirements) -> String {
        self.sched.place(req)
    }

    fn runner_command(&self, group: &str) -> String {
        self.runner_cmd
            .replace("{queue}", &self.queue_name)
            .replace("{group}", group)
    }

    /// Record `n` more jobs wanting runners in `group`, caching the group's
    /// requirements on first sight, and update the external scheduler.
    pub async fn increment(&self, group: &str, req: &Requirements, n: usize) {
        if n == 0 {
            return;
        }
        let mut inner = self.inner.lock().await;
        let count = {
            let count = inner.counts.entry(group.to_string()).or_insert(0);
            *count += n;
            *count
        };
        let req = inner
            .reqs
            .entry(group.to_string())
            .or_insert_with(|| req.clone())
            .clone();
        if self.spawns_runners() {
            self.sched
                .schedule(&self.runner_command(group), &req, count);
        }
        tracing::debug!(group, count, "scheduler group demand up");
    }

    /// Record one job leaving the ready/run path of `group` and update the
    /// external scheduler; the group's entries are dropped at zero after a
    /// final zero-count schedule call.
    pub async fn decrement(&self, group: &str) {
        if group.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().await;
        let Some(count) = inner.counts.get_mut(group) else {
            return;
        };
        *count = count.saturating_sub(1);
        let count = *count;
        let req = inner.reqs.get(group).cloned();
        if count == 0 {
            inner.counts.remove(group);
            inner.reqs.remove(group);
        }
        if self.spawns_runners() {
            if let Some(req) = req {
                self.sched
                    .schedule(&self.runner_command(group), &req, count);
            }
        }
        tracing::debug!(group, count, "scheduler group demand down");
    }

    /// The current demand for a group, if any.
    pub async fn count(&self, group: &str) -> Option<usize> {
        let inner = self.inner.lock().await;
        inner.counts.get(group).copied()
    }

    pub async fn requirements(&self, group: &str) -> Option<Requirements> {
        let inner = self.inner.lock().await;
        inner.reqs.get(group).cloned()
    }

    pub fn busy(&self) -> bool {
        self.sched.busy()
    }
}
