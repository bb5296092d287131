//! Backend operations and the commit engine
//!
//! Every model mutation in [`Ruleset`] journals an [`Op`]. [`commit`] drains
//! the journal and hands the batch to the backend as one transaction: either
//! all of it applies or none of it does.

use super::backend::Backend;
use super::error::Result;
use super::expr::Expr;
use super::ruleset::{ChainSpec, Family, KeyType, Ruleset};
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Backend-side identity of a table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableRef {
    pub family: Family,
    pub name: String,
}

impl TableRef {
    pub fn new(family: Family, name: impl Into<String>) -> Self {
        Self {
            family,
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.name)
    }
}

/// A rule as a backend lists it back: its handle plus decoded expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedRule {
    pub handle: u64,
    pub exprs: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddTable(TableRef),
    DeleteTable(TableRef),
    AddChain {
        table: TableRef,
        name: String,
        spec: ChainSpec,
    },
    AddSet {
        table: TableRef,
        name: String,
        key_type: KeyType,
    },
    AddRule {
        table: TableRef,
        chain: String,
        exprs: Vec<Expr>,
    },
    DeleteRule {
        table: TableRef,
        chain: String,
        handle: u64,
    },
    FlushChain {
        table: TableRef,
        chain: String,
    },
    FlushSet {
        table: TableRef,
        set: String,
    },
    AddElements {
        table: TableRef,
        set: String,
        elements: Vec<Ipv4Addr>,
    },
    DeleteElements {
        table: TableRef,
        set: String,
        elements: Vec<Ipv4Addr>,
    },
}

impl Op {
    pub fn table(&self) -> &TableRef {
        match self {
            Self::AddTable(t) | Self::DeleteTable(t) => t,
            Self::AddChain { table, .. }
            | Self::AddSet { table, .. }
            | Self::AddRule { table, .. }
            | Self::DeleteRule { table, .. }
            | Self::FlushChain { table, .. }
            | Self::FlushSet { table, .. }
            | Self::AddElements { table, .. }
            | Self::DeleteElements { table, .. } => table,
        }
    }
}

/// Ships every pending operation of `ruleset` to `backend` as one batch.
///
/// Returns the number of operations committed. An empty journal commits
/// nothing and succeeds. The journal is drained either way; on failure the
/// model keeps the mutations the backend refused.
pub fn commit<B: Backend + ?Sized>(ruleset: &mut Ruleset, backend: &mut B) -> Result<usize> {
    let ops = ruleset.take_pending();
    if ops.is_empty() {
        debug!("Nothing to commit");
        return Ok(0);
    }

    debug!("Committing batch of {} operation(s)", ops.len());
    match backend.commit(&ops) {
        Ok(()) => Ok(ops.len()),
        Err(e) => {
            warn!("Batch of {} operation(s) rejected: {e}", ops.len());
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::memory::MemoryBackend;
    use crate::core::matches::MatchBuilder;
    use crate::core::ruleset::{ChainType, Hook, Policy, priority};

    fn filter_input() -> ChainSpec {
        ChainSpec {
            kind: ChainType::Filter,
            hook: Hook::Input,
            priority: priority::FILTER,
            policy: Some(Policy::Drop),
        }
    }

    #[test]
    fn test_empty_commit_succeeds() {
        let mut rs = Ruleset::new();
        let mut backend = MemoryBackend::new();
        assert_eq!(commit(&mut rs, &mut backend).unwrap(), 0);
        assert!(backend.commits().is_empty());
    }

    #[test]
    fn test_commit_ships_whole_journal() {
        let mut rs = Ruleset::new();
        let t = rs.new_table(Family::Inet, "t");
        let c = rs.new_chain(t, "input", filter_input()).unwrap();
        rs.add_rule(c, MatchBuilder::new().accept()).unwrap();

        let mut backend = MemoryBackend::new();
        assert_eq!(commit(&mut rs, &mut backend).unwrap(), 3);
        assert_eq!(backend.commits().len(), 1);
        assert!(rs.pending().is_empty());

        let table = TableRef::new(Family::Inet, "t");
        assert_eq!(backend.chain_rules(&table, "input").map(<[_]>::len), Some(1));
    }

    #[test]
    fn test_failed_commit_applies_nothing() {
        let mut rs = Ruleset::new();
        let t = rs.new_table(Family::Inet, "t");
        rs.new_chain(t, "input", filter_input()).unwrap();

        let mut backend = MemoryBackend::new();
        backend.fail_next_commit("Operation not permitted");
        assert!(commit(&mut rs, &mut backend).is_err());
        assert!(backend.tables().is_empty());
        // Journal is drained, model keeps its state
        assert!(rs.pending().is_empty());
        assert!(rs.chain_by_name(t, "input").is_some());
    }

    #[test]
    fn test_table_ref_display() {
        assert_eq!(TableRef::new(Family::Ip6, "x").to_string(), "ip6 x");
    }
}
