use crate::job::JobState;

/// The rep-group wildcard every transition is also broadcast under.
pub const ALL_REP_GROUPS: &str = "+all+";

/// One observed job state transition, sent on the lossy status bus. Slow
/// subscribers miss events rather than slowing the server down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStateCount {
    pub rep_group: String,
    pub from: JobState,
    pub to: JobState,
    pub count: usize,
}
