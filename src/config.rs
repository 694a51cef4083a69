//! Rust-native stand-ins for the parameter groups the configuration
//! language would otherwise carry (§6.1): typed structs operator
//! constructors take directly, rather than path-token lookups into a
//! parsed group/list/scalar tree. `serde`-deserializable so a caller that
//! does want to load these from a file (JSON today) can.

use crate::hashtable::HashFn;
use crate::memory::{AllocPolicy, NumaNode};
use crate::operator::hash_join::{ProjectionEntry, Side};
use crate::operator::ThreadId;
use crate::schema::CompareOp;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "fn", rename_all = "lowercase")]
pub enum HashFnConfig {
    Modulo,
    Knuth,
    Bytes,
    ExactRange { min: i64, max: i64 },
    AlwaysZero,
}

impl From<HashFnConfig> for HashFn {
    fn from(cfg: HashFnConfig) -> Self {
        match cfg {
            HashFnConfig::Modulo => HashFn::Modulo,
            HashFnConfig::Knuth => HashFn::Knuth,
            HashFnConfig::Bytes => HashFn::Bytes,
            HashFnConfig::ExactRange { min, max } => HashFn::ExactRange { min, max },
            HashFnConfig::AlwaysZero => HashFn::AlwaysZero,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HashConfig {
    pub hash: HashFnConfig,
    pub buckets: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocPolicyConfig {
    Local,
    Striped { stripeon: Vec<NumaNode> },
}

impl From<AllocPolicyConfig> for AllocPolicy {
    fn from(cfg: AllocPolicyConfig) -> Self {
        match cfg {
            AllocPolicyConfig::Local => AllocPolicy::Local,
            AllocPolicyConfig::Striped { stripeon } => AllocPolicy::Striped(stripeon),
        }
    }
}

/// A partition of participating thread ids into cooperating groups; the
/// first id in each group is that group's barrier/build leader.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadGroupConfig {
    pub threadgroups: Vec<Vec<ThreadId>>,
}

impl ThreadGroupConfig {
    pub fn group_of(&self, tid: ThreadId) -> Option<&[ThreadId]> {
        self.threadgroups.iter().find(|g| g.contains(&tid)).map(Vec::as_slice)
    }

    pub fn leader_of(&self, tid: ThreadId) -> Option<ThreadId> {
        self.group_of(tid).and_then(|g| g.first().copied())
    }

    pub fn is_leader(&self, tid: ThreadId) -> bool {
        self.leader_of(tid) == Some(tid)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideConfig {
    B,
    P,
}

impl From<SideConfig> for Side {
    fn from(cfg: SideConfig) -> Self {
        match cfg {
            SideConfig::B => Side::Build,
            SideConfig::P => Side::Probe,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectionEntryConfig {
    pub side: SideConfig,
    pub index: usize,
}

impl From<ProjectionEntryConfig> for ProjectionEntry {
    fn from(cfg: ProjectionEntryConfig) -> Self {
        ProjectionEntry { side: cfg.side.into(), index: cfg.index }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinConfig {
    pub buildjattr: usize,
    pub probejattr: usize,
    pub projection: Vec<ProjectionEntryConfig>,
    pub threadgroups: ThreadGroupConfig,
    pub tuplesperbucket: usize,
    pub allocpolicy: AllocPolicyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrepartitionedJoinConfig {
    pub range: (i64, i64),
    pub buckets: usize,
    pub mostfreqbuildkeyoccurances: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregateConfig {
    pub fields: Vec<usize>,
    pub hash: HashConfig,
    #[serde(default)]
    pub presorted: bool,
    #[serde(default)]
    pub global: bool,
    pub threads: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortFlag {
    Yes,
    No,
}

impl SortFlag {
    pub fn as_bool(&self) -> bool {
        matches!(self, SortFlag::Yes)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionConfig {
    pub attr: usize,
    pub maxtuples: usize,
    pub range: (i64, i64),
    pub buckets: usize,
    #[serde(default = "default_sort")]
    pub sort: SortFlag,
    pub sortattr: Option<usize>,
}

fn default_sort() -> SortFlag {
    SortFlag::No
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOpConfig {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

impl From<CompareOpConfig> for CompareOp {
    fn from(cfg: CompareOpConfig) -> Self {
        match cfg {
            CompareOpConfig::Lt => CompareOp::Lt,
            CompareOpConfig::Le => CompareOp::Le,
            CompareOpConfig::Eq => CompareOp::Eq,
            CompareOpConfig::Ne => CompareOp::Ne,
            CompareOpConfig::Ge => CompareOp::Ge,
            CompareOpConfig::Gt => CompareOp::Gt,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    pub field: usize,
    pub op: CompareOpConfig,
    pub value: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeConfig {
    pub threads: usize,
    #[serde(default = "default_stack_size")]
    pub stacksize: usize,
}

fn default_stack_size() -> usize {
    2 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_config_round_trips_through_json() {
        let json = r#"{
            "buildjattr": 0, "probejattr": 1,
            "projection": [{"side":"b","index":0},{"side":"p","index":1}],
            "threadgroups": {"threadgroups": [[0,1],[2,3]]},
            "tuplesperbucket": 4, "allocpolicy": {"striped":{"stripeon":[0,1]}}
        }"#;
        let cfg: JoinConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.threadgroups.leader_of(3), Some(2));
        assert!(cfg.threadgroups.is_leader(0));
        let entry: ProjectionEntry = cfg.projection[1].clone().into();
        assert_eq!(entry.side, Side::Probe);
    }

    #[test]
    fn hash_config_selects_exact_range() {
        let json = r#"{"hash": {"fn":"exactrange","min":0,"max":99}, "buckets": 10}"#;
        let cfg: HashConfig = serde_json::from_str(json).unwrap();
        let hash_fn: HashFn = cfg.hash.into();
        assert!(matches!(hash_fn, HashFn::ExactRange { min: 0, max: 99 }));
    }
}
