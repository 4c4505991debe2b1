//=====================================================
// File: whitelist/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Static table of operations sandboxed scripts may perform
// Objective: Exact (type, member, kind) lookup, per-entry call caps and the
//            global operation/loop budgets of a session
//=====================================================

mod catalog;

pub use catalog::{GLOBAL_TYPE, HostMember, HostType, TypeCatalog};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Whether an entry names a method (call) or a property (read).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    Method,
    Property,
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberKind::Method => f.write_str("method"),
            MemberKind::Property => f.write_str("property"),
        }
    }
}

/// Upper bound on a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cap {
    Limited(u64),
    Unbounded,
}

impl Cap {
    /// True when `count` operations have already used the whole budget.
    pub fn is_reached(self, count: u64) -> bool {
        match self {
            Cap::Limited(limit) => count >= limit,
            Cap::Unbounded => false,
        }
    }

    pub fn limit(self) -> Option<u64> {
        match self {
            Cap::Limited(limit) => Some(limit),
            Cap::Unbounded => None,
        }
    }
}

impl From<Option<u64>> for Cap {
    fn from(value: Option<u64>) -> Self {
        value.map_or(Cap::Unbounded, Cap::Limited)
    }
}

/// Index of an entry inside its [`WhitelistPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) usize);

impl EntryId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One permitted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    #[serde(rename = "type")]
    pub owner_type: String,
    pub member: String,
    #[serde(default = "default_kind")]
    pub kind: MemberKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap: Option<u64>,
}

fn default_kind() -> MemberKind {
    MemberKind::Method
}

impl WhitelistEntry {
    pub fn method(owner_type: &str, member: &str) -> Self {
        Self {
            owner_type: owner_type.to_string(),
            member: member.to_string(),
            kind: MemberKind::Method,
            cap: None,
        }
    }

    pub fn property(owner_type: &str, member: &str) -> Self {
        Self {
            kind: MemberKind::Property,
            ..Self::method(owner_type, member)
        }
    }

    pub fn with_cap(mut self, cap: u64) -> Self {
        self.cap = Some(cap);
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.owner_type, self.member)
    }
}

/// Fatal startup errors: the engine refuses to start on any of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("unknown type '{owner}' in whitelist")]
    UnknownType { owner: String },
    #[error("type '{owner}' has no member '{member}'")]
    UnknownMember { owner: String, member: String },
    #[error("'{owner}.{member}' is not a {kind}")]
    KindMismatch {
        owner: String,
        member: String,
        kind: MemberKind,
    },
    #[error("duplicate whitelist entry {kind} '{owner}.{member}'")]
    DuplicateEntry {
        owner: String,
        member: String,
        kind: MemberKind,
    },
    #[error("cap of '{owner}.{member}' must be at least 1")]
    ZeroCap { owner: String, member: String },
    #[error("sandboxed {name} cap must be a positive limit")]
    UnboundedGlobalCap { name: &'static str },
    #[error("type '{name}' registered twice")]
    DuplicateType { name: String },
    #[error("invalid setting {name}: {message}")]
    InvalidSetting { name: &'static str, message: String },
}

/// Immutable table of permitted operations, shared across workers.
#[derive(Debug, Clone, Default)]
pub struct WhitelistPolicy {
    entries: Vec<WhitelistEntry>,
    index: HashMap<(String, String, MemberKind), EntryId>,
}

impl WhitelistPolicy {
    /// Validate `entries` against `catalog` and build the lookup table.
    pub fn new(
        entries: Vec<WhitelistEntry>,
        catalog: &TypeCatalog,
    ) -> Result<Self, ConfigurationError> {
        let mut index = HashMap::with_capacity(entries.len());

        for (position, entry) in entries.iter().enumerate() {
            catalog.validate(&entry.owner_type, &entry.member, entry.kind)?;
            if entry.cap == Some(0) {
                return Err(ConfigurationError::ZeroCap {
                    owner: entry.owner_type.clone(),
                    member: entry.member.clone(),
                });
            }

            let key = (entry.owner_type.clone(), entry.member.clone(), entry.kind);
            if index.insert(key, EntryId(position)).is_some() {
                return Err(ConfigurationError::DuplicateEntry {
                    owner: entry.owner_type.clone(),
                    member: entry.member.clone(),
                    kind: entry.kind,
                });
            }
        }

        Ok(Self { entries, index })
    }

    pub fn lookup(&self, owner: &str, member: &str, kind: MemberKind) -> Option<EntryId> {
        self.index
            .get(&(owner.to_string(), member.to_string(), kind))
            .copied()
    }

    pub fn is_allowed(&self, owner: &str, member: &str, kind: MemberKind) -> bool {
        self.lookup(owner, member, kind).is_some()
    }

    pub fn cap_for(&self, entry: EntryId) -> Cap {
        self.entries
            .get(entry.0)
            .map_or(Cap::Unbounded, |entry| Cap::from(entry.cap))
    }

    pub fn entry(&self, entry: EntryId) -> Option<&WhitelistEntry> {
        self.entries.get(entry.0)
    }

    pub fn entries(&self) -> &[WhitelistEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Caps a session is held to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationPolicy {
    entry_caps: Vec<Cap>,
    total_op_cap: Cap,
    loop_cap: Cap,
}

impl InvocationPolicy {
    /// Budget for untrusted scripts; both global caps must be limited.
    pub fn sandboxed(
        whitelist: &WhitelistPolicy,
        total_op_cap: Cap,
        loop_cap: Cap,
    ) -> Result<Self, ConfigurationError> {
        if !matches!(total_op_cap, Cap::Limited(n) if n > 0) {
            return Err(ConfigurationError::UnboundedGlobalCap {
                name: "total operation",
            });
        }
        if !matches!(loop_cap, Cap::Limited(n) if n > 0) {
            return Err(ConfigurationError::UnboundedGlobalCap {
                name: "loop iteration",
            });
        }

        let entry_caps = (0..whitelist.len())
            .map(|index| whitelist.cap_for(EntryId(index)))
            .collect();

        Ok(Self {
            entry_caps,
            total_op_cap,
            loop_cap,
        })
    }

    pub fn privileged() -> Self {
        Self {
            entry_caps: Vec::new(),
            total_op_cap: Cap::Unbounded,
            loop_cap: Cap::Unbounded,
        }
    }

    pub fn entry_cap(&self, entry: EntryId) -> Cap {
        self.entry_caps
            .get(entry.0)
            .copied()
            .unwrap_or(Cap::Unbounded)
    }

    pub fn total_op_cap(&self) -> Cap {
        self.total_op_cap
    }

    pub fn loop_cap(&self) -> Cap {
        self.loop_cap
    }
}


//=====================================================
// End of file
//=====================================================
