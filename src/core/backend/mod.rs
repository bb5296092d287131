//! Packet-filter backends
//!
//! The policy engine never talks to the kernel directly. It builds batches of
//! [`Op`]s and hands them to a [`Backend`]:
//!
//! - [`memory::MemoryBackend`]: in-process kernel stand-in for tests, previews and dry runs
//! - [`nft::NftBackend`]: drives the `nft` binary in JSON mode

pub mod memory;
pub mod nft;

use super::error::Result;
use super::transaction::{ListedRule, Op, TableRef};

pub trait Backend {
    /// Tables currently present, all families.
    fn list_tables(&self) -> Result<Vec<TableRef>>;

    /// Rules of one chain in evaluation order, with their handles.
    fn list_rules(&self, table: &TableRef, chain: &str) -> Result<Vec<ListedRule>>;

    /// Applies a batch atomically: all operations or none.
    fn commit(&mut self, ops: &[Op]) -> Result<()>;
}

impl<B: Backend + ?Sized> Backend for &mut B {
    fn list_tables(&self) -> Result<Vec<TableRef>> {
        (**self).list_tables()
    }

    fn list_rules(&self, table: &TableRef, chain: &str) -> Result<Vec<ListedRule>> {
        (**self).list_rules(table, chain)
    }

    fn commit(&mut self, ops: &[Op]) -> Result<()> {
        (**self).commit(ops)
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn list_tables(&self) -> Result<Vec<TableRef>> {
        (**self).list_tables()
    }

    fn list_rules(&self, table: &TableRef, chain: &str) -> Result<Vec<ListedRule>> {
        (**self).list_rules(table, chain)
    }

    fn commit(&mut self, ops: &[Op]) -> Result<()> {
        (**self).commit(ops)
    }
}
