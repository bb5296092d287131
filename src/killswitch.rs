//! Tunnel lifecycle on top of the policy engine
//!
//! [`KillSwitch`] sequences [`PolicyEngine`] operations for interface up and
//! down notifications. Once the baseline tables exist, any failing step tears
//! everything down again so a half-built rule set never stays behind.

use crate::config::TunnelConfig;
use crate::core::backend::Backend;
use crate::core::error::{Error, Result};
use crate::core::policy::PolicyEngine;
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct KillSwitch<B: Backend> {
    engine: PolicyEngine<B>,
}

impl<B: Backend> KillSwitch<B> {
    pub fn new(backend: B) -> Self {
        Self {
            engine: PolicyEngine::new(backend),
        }
    }

    pub fn engine(&self) -> &PolicyEngine<B> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut PolicyEngine<B> {
        &mut self.engine
    }

    pub fn into_engine(self) -> PolicyEngine<B> {
        self.engine
    }

    pub fn is_up(&self) -> bool {
        self.engine.is_up()
    }

    /// Number of rules in the engine's model.
    pub fn rule_count(&self) -> usize {
        let rs = self.engine.ruleset();
        rs.tables()
            .flat_map(|(_, t)| t.chains.iter())
            .filter_map(|&c| rs.chain(c))
            .map(|c| c.rules.len())
            .sum()
    }

    /// Builds the complete kill switch for `config`.
    ///
    /// A `tunwall` table left behind by an earlier run is replaced by the
    /// baseline batch.
    ///
    /// # Errors
    ///
    /// Fails with a precondition error when already up; otherwise returns the
    /// first failing step's error after tearing down what was built.
    pub fn up(&mut self, config: &TunnelConfig) -> Result<()> {
        if self.engine.is_up() {
            return Err(Error::precondition("kill switch is already up"));
        }
        info!("Bringing up kill switch on {}", config.interface);
        self.engine.create_baseline()?;

        if let Err(e) = self.configure(config) {
            error!("Kill switch setup failed, tearing down: {e}");
            if let Err(cleanup) = self.engine.remove_all() {
                error!("Teardown after failed setup also failed: {cleanup}");
            }
            return Err(e);
        }

        info!(
            "Kill switch up on {} ({} rules)",
            config.interface,
            self.rule_count()
        );
        Ok(())
    }

    fn configure(&mut self, config: &TunnelConfig) -> Result<()> {
        let engine = &mut self.engine;
        engine.apply_fwmark(config.fwmark)?;
        engine.restrict_traffic(&config.interface)?;

        if let Some(addr) = &config.ipv6_address {
            engine.isolate_tunnel_address(&config.interface, addr)?;
        }
        for prefix in &config.excluded_prefixes {
            engine.allow_prefix(prefix)?;
        }
        if config.allow_dhcp {
            engine.allow_dhcp()?;
        }
        if config.block_dns {
            engine.block_dns()?;
        }
        if config.allow_ndp {
            engine.allow_ndp()?;
        }
        for server in &config.server_addresses {
            engine.mark_inbound(server)?;
        }
        if let Some(classid) = config.excluded_classid {
            engine.mark_cgroup_v1(classid)?;
        }
        for cgroup in &config.excluded_cgroups {
            engine.mark_cgroup_v2(cgroup)?;
        }
        debug!("Kill switch configured");
        Ok(())
    }

    /// Removes every `tunwall` table, including ones created by another process.
    ///
    /// Succeeds when nothing is installed.
    pub fn down(&mut self) -> Result<()> {
        info!("Disabling kill switch");
        self.engine.remove_all()
    }

    pub fn mark_inbound(&mut self, server: &str) -> Result<()> {
        self.engine.mark_inbound(server)
    }

    pub fn clear_inbound(&mut self, server: &str) -> Result<()> {
        self.engine.clear_inbound(server)
    }

    pub fn clear_all_inbound(&mut self) -> Result<()> {
        self.engine.clear_all_inbound()
    }

    pub fn mark_cgroup_v1(&mut self, classid: u32) -> Result<()> {
        self.engine.mark_cgroup_v1(classid)
    }

    pub fn mark_cgroup_v2(&mut self, path: &str) -> Result<()> {
        self.engine.mark_cgroup_v2(path)
    }

    pub fn clear_cgroup_v2(&mut self, path: &str) -> Result<()> {
        self.engine.reset_cgroup_v2(path)
    }

    pub fn clear_all_cgroups(&mut self) -> Result<()> {
        self.engine.reset_all_cgroups()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::memory::MemoryBackend;
    use crate::core::policy::{CHAIN_INPUT, CHAIN_OUTPUT, TABLE_NAME, table_ref};
    use crate::core::ruleset::Family;
    use crate::core::transaction::{Op, TableRef};

    fn config() -> TunnelConfig {
        TunnelConfig {
            ipv6_address: Some("fd00:6d:6f7a::2/128".into()),
            server_addresses: vec!["198.51.100.7".into()],
            excluded_prefixes: vec!["192.168.0.0/16".into()],
            excluded_cgroups: vec!["/user.slice/app.scope".into()],
            excluded_classid: Some(0x0010_0001),
            ..TunnelConfig::default()
        }
    }

    #[test]
    fn test_up_builds_everything() {
        let mut ks = KillSwitch::new(MemoryBackend::new());
        ks.up(&config()).unwrap();
        assert!(ks.is_up());

        let b = ks.engine().backend();
        // restrict 5 + prefix 1 + dhcp 2 + ndp 4
        assert_eq!(b.chain_rules(&table_ref(), CHAIN_INPUT).unwrap().len(), 12);
        // restrict 5 + prefix 1 + dhcp 2 + dns 2 + ndp 4
        assert_eq!(b.chain_rules(&table_ref(), CHAIN_OUTPUT).unwrap().len(), 14);
        assert_eq!(b.set_elements(&table_ref(), "servers").unwrap().len(), 1);
        assert_eq!(ks.rule_count(), 12 + 14 + 2 + 2 + 2 + 1);
    }

    #[test]
    fn test_up_twice_is_rejected() {
        let mut ks = KillSwitch::new(MemoryBackend::new());
        ks.up(&TunnelConfig::default()).unwrap();
        let commits = ks.engine().backend().commits().len();
        assert_eq!(ks.up(&TunnelConfig::default()).unwrap_err().code(), -1);
        assert_eq!(ks.engine().backend().commits().len(), commits);
    }

    #[test]
    fn test_failed_step_tears_down() {
        let mut ks = KillSwitch::new(MemoryBackend::new());
        let bad = TunnelConfig {
            excluded_prefixes: vec!["10.0.0.0/8".into(), "not-a-prefix".into()],
            ..TunnelConfig::default()
        };
        let err = ks.up(&bad).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "prefix"));
        assert!(!ks.is_up());
        assert!(ks.engine().backend().tables().is_empty());
    }

    #[test]
    fn test_up_replaces_stale_tables() {
        let mut backend = MemoryBackend::new();
        backend
            .commit(&[Op::AddTable(TableRef::new(Family::Ip, TABLE_NAME))])
            .unwrap();
        let mut ks = KillSwitch::new(backend);
        ks.up(&TunnelConfig::default()).unwrap();
        assert_eq!(ks.engine().backend().tables(), vec![table_ref()]);
    }

    #[test]
    fn test_down_is_idempotent() {
        let mut ks = KillSwitch::new(MemoryBackend::new());
        ks.down().unwrap();
        ks.up(&config()).unwrap();
        ks.down().unwrap();
        ks.down().unwrap();
        assert!(!ks.is_up());
        assert!(ks.engine().backend().tables().is_empty());
    }

    #[test]
    fn test_pass_throughs_require_up() {
        let mut ks = KillSwitch::new(MemoryBackend::new());
        assert_eq!(ks.mark_inbound("198.51.100.7").unwrap_err().code(), -1);
        ks.up(&TunnelConfig::default()).unwrap();
        ks.mark_inbound("198.51.100.7").unwrap();
        ks.clear_inbound("198.51.100.7").unwrap();
        ks.mark_cgroup_v2("/a").unwrap();
        ks.mark_cgroup_v1(9).unwrap();
        // fwmark 2, restrict 10, dhcp 4, dns 2, ndp 8
        let baseline = 2 + 10 + 4 + 2 + 8;
        assert_eq!(ks.rule_count(), baseline + 4);
        ks.clear_cgroup_v2("/a").unwrap();
        assert_eq!(ks.rule_count(), baseline + 2);
        ks.clear_all_cgroups().unwrap();
        assert_eq!(ks.rule_count(), baseline);
    }
}
