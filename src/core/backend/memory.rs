//! In-process backend that behaves like the kernel's nf_tables for the
//! operations tunwall issues.
//!
//! Batches are atomic: the current state is cloned, every operation is
//! applied to the clone, and the clone replaces the state only when the
//! whole batch succeeded. Adding an existing table, chain or set is a no-op
//! (as `nft add` is); deleting anything that does not exist is an error (as
//! `nft delete` is).

use super::Backend;
use crate::core::error::{Error, Result};
use crate::core::ruleset::{ChainSpec, KeyType};
use crate::core::transaction::{ListedRule, Op, TableRef};
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

#[derive(Debug, Clone)]
struct ChainState {
    spec: ChainSpec,
    rules: Vec<ListedRule>,
}

#[derive(Debug, Clone)]
struct SetState {
    key_type: KeyType,
    elements: BTreeSet<Ipv4Addr>,
}

#[derive(Debug, Clone, Default)]
struct TableState {
    chains: BTreeMap<String, ChainState>,
    sets: BTreeMap<String, SetState>,
}

#[derive(Debug, Clone, Default)]
struct State {
    tables: BTreeMap<TableRef, TableState>,
    next_handle: u64,
}

fn missing(what: &str, name: &str, table: &TableRef) -> Error {
    Error::backend(format!(
        "Could not process rule: No such file or directory ({what} {name} in table {table})"
    ))
}

impl State {
    fn table_mut(&mut self, table: &TableRef) -> Result<&mut TableState> {
        self.tables.get_mut(table).ok_or_else(|| {
            Error::backend(format!(
                "Could not process rule: No such file or directory (table {table} does not exist)"
            ))
        })
    }

    fn chain_mut(&mut self, table: &TableRef, chain: &str) -> Result<&mut ChainState> {
        self.table_mut(table)?
            .chains
            .get_mut(chain)
            .ok_or_else(|| missing("chain", chain, table))
    }

    fn set_mut(&mut self, table: &TableRef, set: &str) -> Result<&mut SetState> {
        self.table_mut(table)?
            .sets
            .get_mut(set)
            .ok_or_else(|| missing("set", set, table))
    }

    fn apply(&mut self, op: &Op) -> Result<()> {
        match op {
            Op::AddTable(t) => {
                self.tables.entry(t.clone()).or_default();
            }
            Op::DeleteTable(t) => {
                if self.tables.remove(t).is_none() {
                    return Err(Error::backend(format!(
                        "Could not process rule: No such file or directory (table {t} does not exist)"
                    )));
                }
            }
            Op::AddChain { table, name, spec } => {
                self.table_mut(table)?
                    .chains
                    .entry(name.clone())
                    .or_insert_with(|| ChainState {
                        spec: *spec,
                        rules: Vec::new(),
                    });
            }
            Op::AddSet {
                table,
                name,
                key_type,
            } => {
                self.table_mut(table)?
                    .sets
                    .entry(name.clone())
                    .or_insert_with(|| SetState {
                        key_type: *key_type,
                        elements: BTreeSet::new(),
                    });
            }
            Op::AddRule {
                table,
                chain,
                exprs,
            } => {
                self.next_handle += 1;
                let handle = self.next_handle;
                self.chain_mut(table, chain)?.rules.push(ListedRule {
                    handle,
                    exprs: exprs.clone(),
                });
            }
            Op::DeleteRule {
                table,
                chain,
                handle,
            } => {
                let c = self.chain_mut(table, chain)?;
                let before = c.rules.len();
                c.rules.retain(|r| r.handle != *handle);
                if c.rules.len() == before {
                    return Err(missing("rule handle", &handle.to_string(), table));
                }
            }
            Op::FlushChain { table, chain } => {
                self.chain_mut(table, chain)?.rules.clear();
            }
            Op::FlushSet { table, set } => {
                self.set_mut(table, set)?.elements.clear();
            }
            Op::AddElements {
                table,
                set,
                elements,
            } => {
                self.set_mut(table, set)?
                    .elements
                    .extend(elements.iter().copied());
            }
            Op::DeleteElements {
                table,
                set,
                elements,
            } => {
                let s = self.set_mut(table, set)?;
                for e in elements {
                    if !s.elements.remove(e) {
                        return Err(missing("element", &e.to_string(), table));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Kernel stand-in with commit history and fault injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: State,
    history: Vec<Vec<Op>>,
    fail_commit: Option<String>,
    fail_list: Option<String>,
    /// Listings that still succeed before `fail_list` applies
    list_grace: Cell<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next commit is rejected with `message` and applies nothing.
    pub fn fail_next_commit(&mut self, message: impl Into<String>) {
        self.fail_commit = Some(message.into());
    }

    /// `list_tables` / `list_rules` fail with `message` until the next commit.
    pub fn fail_listing(&mut self, message: impl Into<String>) {
        self.fail_listing_after(0, message);
    }

    /// Like [`Self::fail_listing`], but the next `grace` listings still succeed.
    pub fn fail_listing_after(&mut self, grace: usize, message: impl Into<String>) {
        self.fail_list = Some(message.into());
        self.list_grace.set(grace);
    }

    /// Every batch accepted so far, oldest first.
    pub fn commits(&self) -> &[Vec<Op>] {
        &self.history
    }

    pub fn tables(&self) -> Vec<TableRef> {
        self.state.tables.keys().cloned().collect()
    }

    pub fn has_table(&self, table: &TableRef) -> bool {
        self.state.tables.contains_key(table)
    }

    pub fn chain_spec(&self, table: &TableRef, chain: &str) -> Option<ChainSpec> {
        self.state
            .tables
            .get(table)?
            .chains
            .get(chain)
            .map(|c| c.spec)
    }

    pub fn chain_rules(&self, table: &TableRef, chain: &str) -> Option<&[ListedRule]> {
        self.state
            .tables
            .get(table)?
            .chains
            .get(chain)
            .map(|c| c.rules.as_slice())
    }

    pub fn set_key_type(&self, table: &TableRef, set: &str) -> Option<KeyType> {
        self.state.tables.get(table)?.sets.get(set).map(|s| s.key_type)
    }

    pub fn set_elements(&self, table: &TableRef, set: &str) -> Option<&BTreeSet<Ipv4Addr>> {
        self.state
            .tables
            .get(table)?
            .sets
            .get(set)
            .map(|s| &s.elements)
    }

    fn check_list_failure(&self) -> Result<()> {
        let Some(msg) = &self.fail_list else {
            return Ok(());
        };
        match self.list_grace.get() {
            0 => Err(Error::backend(msg.clone())),
            n => {
                self.list_grace.set(n - 1);
                Ok(())
            }
        }
    }
}

impl Backend for MemoryBackend {
    fn list_tables(&self) -> Result<Vec<TableRef>> {
        self.check_list_failure()?;
        Ok(self.tables())
    }

    fn list_rules(&self, table: &TableRef, chain: &str) -> Result<Vec<ListedRule>> {
        self.check_list_failure()?;
        self.chain_rules(table, chain)
            .map(<[ListedRule]>::to_vec)
            .ok_or_else(|| missing("chain", chain, table))
    }

    fn commit(&mut self, ops: &[Op]) -> Result<()> {
        self.fail_list = None;
        if let Some(msg) = self.fail_commit.take() {
            return Err(Error::Nftables {
                message: msg.clone(),
                stderr: Some(msg),
                exit_code: Some(1),
            });
        }

        let mut next = self.state.clone();
        for op in ops {
            next.apply(op)?;
        }
        self.state = next;
        self.history.push(ops.to_vec());
        Ok(())
    }
}
