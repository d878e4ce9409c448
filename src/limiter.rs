use std::collections::HashMap;

use tokio::sync::Mutex;

struct LimitGroup {
    limit: Option<u64>,
    current: u64,
}

/// Named counting semaphores restricting how many jobs tagged with a group
/// may be reserved at once. Groups without a configured limit never block.
#[derive(Default)]
pub struct Limiter {
    groups: Mutex<HashMap<String, LimitGroup>>,
}

impl Limiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a slot in every named group, or none of them: if any group is
    /// at its limit, nothing is incremented and false is returned.
    pub async fn increment(&self, names: &[String]) -> bool {
        if names.is_empty() {
            return true;
        }
        let mut groups = self.groups.lock().await;
        for name in names {
            if let Some(group) = groups.get(name) {
                if let Some(limit) = group.limit {
                    if group.current >= limit {
                        return false;
                    }
                }
            }
        }
        for name in names {
            let group = groups.entry(name.clone()).or_insert(LimitGroup {
                limit: None,
                current: 0,
            });
            group.current += 1;
        }
        true
    }

    /// Release a slot in every named group.
    pub async fn decrement(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let mut groups = self.groups.lock().await;
        for name in names {
            if let Some(group) = groups.get_mut(name) {
                group.current = group.current.saturating_sub(1);
            }
        }
    }

    /// The configured limit of a group, or None when it has never been
    /// limited.
    pub async fn limit(&self, name: &str) -> Option<u64> {
        let groups = self.groups.lock().await;
        groups.get(name).and_then(|g| g.limit)
    }

    /// Set a group's limit. A limit of `None` removes the restriction but
    /// keeps counting.
    pub async fn set_limit(&self, name: &str, limit: Option<u64>) {
        let mut groups = self.groups.lock().await;
        let group = groups.entry(name.to_string()).or_insert(LimitGroup {
            limit: None,
            current: 0,
        });
        group.limit = limit;
    }

    pub async fn current(&self, name: &str) -> u64 {
        let groups = self.groups.lock().await;
        groups.get(name).map(|g| g.current).unwrap_or(0)
    }
}
