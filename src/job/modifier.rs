use serde::{Deserialize, Serialize};

use crate::job::{Dependency, Job};

/// A batch edit applied to non-running jobs by the jmod method.
///
/// Every field is optional; unset fields leave the job untouched. Editing
/// `cmd` or `cwd` changes job identity, so callers must re-index the queue
/// and storage with the old-to-new key mapping that `modify` reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobModifier {
    pub cmd: Option<String>,
    pub cwd: Option<String>,
    pub rep_group: Option<String>,
    pub req_group: Option<String>,
    pub priority: Option<u8>,
    pub retries: Option<u8>,
    pub limit_groups: Option<Vec<String>>,
    pub dep_groups: Option<Vec<String>>,
    pub dependencies: Option<Vec<Dependency>>,
}

impl JobModifier {
    /// Whether applying this modifier can change job keys.
    pub fn changes_keys(&self) -> bool {
        self.cmd.is_some() || self.cwd.is_some()
    }

    pub fn sets_priority(&self) -> bool {
        self.priority.is_some()
    }

    pub fn sets_dependencies(&self) -> bool {
        self.dependencies.is_some()
    }

    pub fn sets_limit_groups(&self) -> bool {
        self.limit_groups.is_some()
    }

    /// Apply the modifier to one job, returning its (old, new) keys.
    pub fn modify(&self, job: &mut Job) -> (String, String) {
        let old_key = job.key();

        if let Some(cmd) = &self.cmd {
            job.cmd = cmd.clone();
        }
        if let Some(cwd) = &self.cwd {
            job.cwd = cwd.clone();
        }
        if let Some(rep_group) = &self.rep_group {
            job.rep_group = rep_group.clone();
        }
        if let Some(req_group) = &self.req_group {
            job.req_group = req_group.clone();
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
        if let Some(retries) = self.retries {
            job.retries = retries;
            job.until_buried = retries + 1;
        }
        if let Some(limit_groups) = &self.limit_groups {
            job.limit_groups = limit_groups.clone();
        }
        if let Some(dep_groups) = &self.dep_groups {
            job.dep_groups = dep_groups.clone();
        }
        if let Some(dependencies) = &self.dependencies {
            job.dependencies = dependencies.clone();
        }

        (old_key, job.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modify_reports_key_change() {
        let mut job = Job::new("echo old", "/tmp");
        let old_key = job.key();

        let modifier = JobModifier {
            cmd: Some("echo new".to_string()),
            priority: Some(9),
            ..Default::default()
        };
        let (old, new) = modifier.modify(&mut job);

        assert_eq!(old, old_key);
        assert_eq!(new, job.key());
        assert_ne!(old, new);
        assert_eq!(job.priority, 9);
    }

    #[test]
    fn retries_reset_until_buried() {
        let mut job = Job::new("echo x", "/tmp");
        job.until_buried = 1;

        let modifier = JobModifier {
            retries: Some(4),
            ..Default::default()
        };
        let (old, new) = modifier.modify(&mut job);

        assert_eq!(old, new);
        assert_eq!(job.until_buried, 5);
    }
}
