//! In-memory rule-set model
//!
//! Tables, chains, sets and rules live in arenas addressed by typed indices
//! ([`TableId`], [`ChainId`], [`SetId`], [`RuleId`]). The model does no I/O:
//! every mutation records the equivalent backend [`Op`] in a journal that
//! [`super::transaction::commit`] ships as one batch.

use super::error::{Error, Result};
use super::expr::Expr;
use super::transaction::{ListedRule, Op, TableRef};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Named hook priorities, lower runs first.
pub mod priority {
    pub const RAW: i32 = -300;
    pub const CONNTRACK: i32 = -200;
    pub const MANGLE: i32 = -150;
    pub const NAT_DEST: i32 = -100;
    pub const FILTER: i32 = 0;
    pub const SECURITY: i32 = 50;
    pub const NAT_SOURCE: i32 = 100;
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Family {
    #[strum(serialize = "inet")]
    Inet,
    #[strum(serialize = "ip")]
    Ip,
    #[strum(serialize = "ip6")]
    Ip6,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
pub enum Hook {
    #[strum(serialize = "prerouting")]
    Prerouting,
    #[strum(serialize = "input")]
    Input,
    #[strum(serialize = "output")]
    Output,
    #[strum(serialize = "postrouting")]
    Postrouting,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
pub enum ChainType {
    #[strum(serialize = "filter")]
    Filter,
    /// Output-path chain that triggers a reroute when marks change
    #[strum(serialize = "route")]
    Route,
    #[strum(serialize = "nat")]
    Nat,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
pub enum Policy {
    #[strum(serialize = "accept")]
    Accept,
    #[strum(serialize = "drop")]
    Drop,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
pub enum KeyType {
    #[strum(serialize = "ipv4_addr")]
    Ipv4Addr,
}

/// Base-chain attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSpec {
    pub kind: ChainType,
    pub hook: Hook,
    pub priority: i32,
    /// `None` leaves the kernel default (accept)
    pub policy: Option<Policy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SetId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub family: Family,
    pub name: String,
    pub chains: Vec<ChainId>,
    pub sets: Vec<SetId>,
}

impl Table {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.family, self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub table: TableId,
    pub name: String,
    pub spec: ChainSpec,
    /// Evaluation order
    pub rules: Vec<RuleId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Set {
    pub table: TableId,
    pub name: String,
    pub key_type: KeyType,
    pub elements: BTreeSet<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub id: RuleId,
    pub chain: ChainId,
    pub exprs: Vec<Expr>,
    /// Backend handle, known only for rules listed back from a backend
    pub handle: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    tables: Vec<Option<Table>>,
    chains: Vec<Option<Chain>>,
    sets: Vec<Option<Set>>,
    rules: Vec<Option<Rule>>,
    pending: Vec<Op>,
}

fn stale(what: &str) -> Error {
    Error::Internal(format!("stale {what} handle"))
}

impl Ruleset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, id: TableId) -> Option<&Table> {
        self.tables.get(id.0).and_then(Option::as_ref)
    }

    pub fn chain(&self, id: ChainId) -> Option<&Chain> {
        self.chains.get(id.0).and_then(Option::as_ref)
    }

    pub fn set(&self, id: SetId) -> Option<&Set> {
        self.sets.get(id.0).and_then(Option::as_ref)
    }

    pub fn rule(&self, id: RuleId) -> Option<&Rule> {
        self.rules.get(id.0).and_then(Option::as_ref)
    }

    pub fn tables(&self) -> impl Iterator<Item = (TableId, &Table)> {
        self.tables
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (TableId(i), t)))
    }

    pub fn chain_by_name(&self, table: TableId, name: &str) -> Option<ChainId> {
        self.table(table)?
            .chains
            .iter()
            .copied()
            .find(|&c| self.chain(c).is_some_and(|c| c.name == name))
    }

    pub fn set_by_name(&self, table: TableId, name: &str) -> Option<SetId> {
        self.table(table)?
            .sets
            .iter()
            .copied()
            .find(|&s| self.set(s).is_some_and(|s| s.name == name))
    }

    /// Operations recorded since the last commit.
    pub fn pending(&self) -> &[Op] {
        &self.pending
    }

    pub fn take_pending(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.pending)
    }

    fn table_ref(&self, id: TableId) -> Result<TableRef> {
        self.table(id)
            .map(Table::table_ref)
            .ok_or_else(|| stale("table"))
    }

    fn chain_location(&self, id: ChainId) -> Result<(TableRef, String)> {
        let chain = self.chain(id).ok_or_else(|| stale("chain"))?;
        Ok((self.table_ref(chain.table)?, chain.name.clone()))
    }

    fn set_location(&self, id: SetId) -> Result<(TableRef, String)> {
        let set = self.set(id).ok_or_else(|| stale("set"))?;
        Ok((self.table_ref(set.table)?, set.name.clone()))
    }

    pub fn new_table(&mut self, family: Family, name: &str) -> TableId {
        let id = TableId(self.tables.len());
        self.tables.push(Some(Table {
            family,
            name: name.to_string(),
            chains: Vec::new(),
            sets: Vec::new(),
        }));
        self.pending
            .push(Op::AddTable(TableRef::new(family, name.to_string())));
        id
    }

    pub fn new_chain(&mut self, table: TableId, name: &str, spec: ChainSpec) -> Result<ChainId> {
        let table_ref = self.table_ref(table)?;
        let id = ChainId(self.chains.len());
        self.chains.push(Some(Chain {
            table,
            name: name.to_string(),
            spec,
            rules: Vec::new(),
        }));
        if let Some(Some(t)) = self.tables.get_mut(table.0) {
            t.chains.push(id);
        }
        self.pending.push(Op::AddChain {
            table: table_ref,
            name: name.to_string(),
            spec,
        });
        Ok(id)
    }

    pub fn new_set(&mut self, table: TableId, name: &str, key_type: KeyType) -> Result<SetId> {
        let table_ref = self.table_ref(table)?;
        let id = SetId(self.sets.len());
        self.sets.push(Some(Set {
            table,
            name: name.to_string(),
            key_type,
            elements: BTreeSet::new(),
        }));
        if let Some(Some(t)) = self.tables.get_mut(table.0) {
            t.sets.push(id);
        }
        self.pending.push(Op::AddSet {
            table: table_ref,
            name: name.to_string(),
            key_type,
        });
        Ok(id)
    }

    /// Appends a rule to the end of `chain`.
    pub fn add_rule(&mut self, chain: ChainId, exprs: Vec<Expr>) -> Result<RuleId> {
        let (table, chain_name) = self.chain_location(chain)?;
        let id = RuleId(self.rules.len());
        self.rules.push(Some(Rule {
            id,
            chain,
            exprs: exprs.clone(),
            handle: None,
        }));
        if let Some(Some(c)) = self.chains.get_mut(chain.0) {
            c.rules.push(id);
        }
        self.pending.push(Op::AddRule {
            table,
            chain: chain_name,
            exprs,
        });
        Ok(id)
    }

    /// Deletes a rule by its backend handle.
    ///
    /// Rules created locally have no handle until listed back from the backend.
    pub fn delete_rule(&mut self, rule: RuleId) -> Result<()> {
        let r = self.rule(rule).ok_or_else(|| stale("rule"))?;
        let handle = r.handle.ok_or_else(|| {
            Error::Internal("rule has no backend handle; list the chain first".to_string())
        })?;
        let chain = r.chain;
        let (table, chain_name) = self.chain_location(chain)?;

        self.rules[rule.0] = None;
        if let Some(Some(c)) = self.chains.get_mut(chain.0) {
            c.rules.retain(|&r| r != rule);
        }
        self.pending.push(Op::DeleteRule {
            table,
            chain: chain_name,
            handle,
        });
        Ok(())
    }

    /// Rules of `chain` in evaluation order.
    pub fn list_rules(&self, chain: ChainId) -> Result<Vec<&Rule>> {
        let c = self.chain(chain).ok_or_else(|| stale("chain"))?;
        Ok(c.rules.iter().filter_map(|&r| self.rule(r)).collect())
    }

    pub fn flush_chain(&mut self, chain: ChainId) -> Result<()> {
        let (table, chain_name) = self.chain_location(chain)?;
        self.clear_chain_rules(chain);
        self.pending.push(Op::FlushChain {
            table,
            chain: chain_name,
        });
        Ok(())
    }

    fn clear_chain_rules(&mut self, chain: ChainId) {
        let ids = self
            .chains
            .get_mut(chain.0)
            .and_then(Option::as_mut)
            .map(|c| std::mem::take(&mut c.rules))
            .unwrap_or_default();
        for id in ids {
            self.rules[id.0] = None;
        }
    }

    /// Replaces the model's rules for `chain` with what the backend reported.
    ///
    /// Nothing is journaled: the model catches up with the backend.
    pub fn adopt_rules(&mut self, chain: ChainId, listed: Vec<ListedRule>) -> Result<Vec<RuleId>> {
        if self.chain(chain).is_none() {
            return Err(stale("chain"));
        }
        self.clear_chain_rules(chain);

        let mut ids = Vec::with_capacity(listed.len());
        for l in listed {
            let id = RuleId(self.rules.len());
            self.rules.push(Some(Rule {
                id,
                chain,
                exprs: l.exprs,
                handle: Some(l.handle),
            }));
            ids.push(id);
        }
        if let Some(Some(c)) = self.chains.get_mut(chain.0) {
            c.rules.clone_from(&ids);
        }
        Ok(ids)
    }

    fn forget_table(&mut self, table: TableId) {
        let Some(t) = self.tables.get_mut(table.0).and_then(Option::take) else {
            return;
        };
        for c in t.chains {
            self.clear_chain_rules(c);
            self.chains[c.0] = None;
        }
        for s in t.sets {
            self.sets[s.0] = None;
        }
    }

    /// Deletes a table with all of its chains, rules and sets.
    pub fn drop_table(&mut self, table: TableId) -> Result<()> {
        let table_ref = self.table_ref(table)?;
        self.forget_table(table);
        self.pending.push(Op::DeleteTable(table_ref));
        Ok(())
    }

    /// Deletes a backend table by name, whether or not the model knows it.
    pub fn drop_table_by_ref(&mut self, table_ref: TableRef) {
        let known: Vec<TableId> = self
            .tables()
            .filter(|(_, t)| t.family == table_ref.family && t.name == table_ref.name)
            .map(|(id, _)| id)
            .collect();
        for id in known {
            self.forget_table(id);
        }
        self.pending.push(Op::DeleteTable(table_ref));
    }

    pub fn add_elements(&mut self, set: SetId, addrs: &[Ipv4Addr]) -> Result<()> {
        let (table, set_name) = self.set_location(set)?;
        if let Some(Some(s)) = self.sets.get_mut(set.0) {
            s.elements.extend(addrs.iter().copied());
        }
        self.pending.push(Op::AddElements {
            table,
            set: set_name,
            elements: addrs.to_vec(),
        });
        Ok(())
    }

    pub fn delete_elements(&mut self, set: SetId, addrs: &[Ipv4Addr]) -> Result<()> {
        let (table, set_name) = self.set_location(set)?;
        if let Some(Some(s)) = self.sets.get_mut(set.0) {
            for a in addrs {
                s.elements.remove(a);
            }
        }
        self.pending.push(Op::DeleteElements {
            table,
            set: set_name,
            elements: addrs.to_vec(),
        });
        Ok(())
    }

    pub fn flush_set(&mut self, set: SetId) -> Result<()> {
        let (table, set_name) = self.set_location(set)?;
        if let Some(Some(s)) = self.sets.get_mut(set.0) {
            s.elements.clear();
        }
        self.pending.push(Op::FlushSet {
            table,
            set: set_name,
        });
        Ok(())
    }
}
