//! TOML configuration for the engine.
//!
//! Two sections mirror the daemon's configuration schema: one unnamed
//! `[rfc5444]` section with protocol-wide settings and one named
//! `[interface.<name>]` section per local interface. [`ConfigApplier`]
//! reconciles a freshly loaded document against the running engine:
//! new sections create interfaces, changed sections reconfigure them,
//! vanished sections remove them. Invalid sections are logged and skipped;
//! configuration never aborts the daemon.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use crate::acl::Acl;
use crate::engine::{Engine, InterfaceRef};
use crate::socket::TransportConfig;
use crate::wire::{MANET_MULTICAST_V4, MANET_MULTICAST_V6, MANET_UDP_PORT};

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default, rename = "rfc5444")]
    pub core: CoreSection,
    #[serde(default, rename = "interface")]
    pub interfaces: BTreeMap<String, InterfaceSection>,
}

/// The unnamed protocol-wide section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreSection {
    /// Inbound filter entries, e.g. `["+10.0.0.0/8", "default_reject"]`.
    #[serde(default = "CoreSection::default_acl")]
    pub acl: Vec<String>,
    #[serde(default = "CoreSection::default_bindto_v4")]
    pub bindto_v4: Ipv4Addr,
    #[serde(default = "CoreSection::default_bindto_v6")]
    pub bindto_v6: Ipv6Addr,
    /// Protocol-wide UDP port, 1-65535.
    #[serde(default = "CoreSection::default_port")]
    pub port: u16,
    /// Aggregation delay in seconds. The key is misspelled on purpose: it
    /// is a compatibility surface shared with existing deployments.
    #[serde(default = "CoreSection::default_aggregation", rename = "agregation_interval")]
    pub agregation_interval: f64,
}

impl CoreSection {
    fn default_acl() -> Vec<String> {
        vec!["default_accept".to_string()]
    }
    fn default_bindto_v4() -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }
    fn default_bindto_v6() -> Ipv6Addr {
        Ipv6Addr::UNSPECIFIED
    }
    fn default_port() -> u16 {
        MANET_UDP_PORT
    }
    fn default_aggregation() -> f64 {
        0.100
    }

    pub fn aggregation_interval(&self) -> Result<Duration> {
        if !self.agregation_interval.is_finite() || self.agregation_interval <= 0.0 {
            bail!("agregation_interval must be a positive number of seconds");
        }
        Ok(Duration::from_secs_f64(self.agregation_interval))
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("port must be between 1 and 65535");
        }
        Acl::from_entries(&self.acl).context("invalid acl")?;
        self.aggregation_interval()?;
        Ok(())
    }

    fn to_transport_config(&self) -> Result<TransportConfig> {
        Ok(TransportConfig {
            acl: Acl::from_entries(&self.acl).context("invalid acl")?,
            bindto_v4: self.bindto_v4,
            bindto_v6: self.bindto_v6,
            ..TransportConfig::default()
        })
    }
}

impl Default for CoreSection {
    fn default() -> Self {
        Self {
            acl: Self::default_acl(),
            bindto_v4: Self::default_bindto_v4(),
            bindto_v6: Self::default_bindto_v6(),
            port: Self::default_port(),
            agregation_interval: Self::default_aggregation(),
        }
    }
}

/// One named `[interface.<name>]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterfaceSection {
    #[serde(default = "CoreSection::default_acl")]
    pub acl: Vec<String>,
    #[serde(default = "CoreSection::default_bindto_v4")]
    pub bindto_v4: Ipv4Addr,
    /// Defaults to the link-local prefix: the transport substitutes the
    /// device's own link-local address at bind time.
    #[serde(default = "InterfaceSection::default_bindto_v6")]
    pub bindto_v6: Ipv6Addr,
    /// Multicast group, empty string to disable.
    #[serde(default = "InterfaceSection::default_multicast_v4")]
    pub multicast_v4: String,
    #[serde(default = "InterfaceSection::default_multicast_v6")]
    pub multicast_v6: String,
}

impl InterfaceSection {
    fn default_bindto_v6() -> Ipv6Addr {
        Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0)
    }
    fn default_multicast_v4() -> String {
        Ipv4Addr::from(MANET_MULTICAST_V4).to_string()
    }
    fn default_multicast_v6() -> String {
        Ipv6Addr::from(MANET_MULTICAST_V6).to_string()
    }

    fn to_transport_config(&self) -> Result<TransportConfig> {
        let multicast_v4 = match self.multicast_v4.trim() {
            "" => None,
            text => Some(
                text.parse::<Ipv4Addr>()
                    .with_context(|| format!("invalid multicast_v4 '{text}'"))?,
            ),
        };
        let multicast_v6 = match self.multicast_v6.trim() {
            "" => None,
            text => Some(
                text.parse::<Ipv6Addr>()
                    .with_context(|| format!("invalid multicast_v6 '{text}'"))?,
            ),
        };
        Ok(TransportConfig {
            acl: Acl::from_entries(&self.acl).context("invalid acl")?,
            bindto_v4: self.bindto_v4,
            bindto_v6: self.bindto_v6,
            multicast_v4,
            multicast_v6,
            ..TransportConfig::default()
        })
    }
}

impl Default for InterfaceSection {
    fn default() -> Self {
        Self {
            acl: CoreSection::default_acl(),
            bindto_v4: CoreSection::default_bindto_v4(),
            bindto_v6: Self::default_bindto_v6(),
            multicast_v4: Self::default_multicast_v4(),
            multicast_v6: Self::default_multicast_v6(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// A config for a single-interface node, suitable as a starting point.
    pub fn default_example() -> Self {
        let mut interfaces = BTreeMap::new();
        interfaces.insert("eth0".to_string(), InterfaceSection::default());
        Self { core: CoreSection::default(), interfaces }
    }

    /// Strict validation for `manetd check`. The daemon itself skips bad
    /// sections instead of failing.
    pub fn validate(&self) -> Result<()> {
        self.core.validate().context("rfc5444 section")?;
        for (name, section) in &self.interfaces {
            section
                .to_transport_config()
                .with_context(|| format!("interface section '{name}'"))?;
        }
        Ok(())
    }
}

/// Applies configuration documents to an engine and tracks which interfaces
/// it created, so sections removed by the operator remove their interfaces
/// again.
#[derive(Default)]
pub struct ConfigApplier {
    bound: BTreeMap<String, InterfaceRef>,
}

impl ConfigApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, engine: &mut Engine, config: &Config) {
        let protocol = engine.default_protocol();

        match config.core.validate() {
            Ok(()) => {
                engine.reconfigure_protocol(&protocol, config.core.port);
                if let Ok(interval) = config.core.aggregation_interval() {
                    engine.set_aggregation_interval(interval);
                }
                match config.core.to_transport_config() {
                    Ok(transport_config) => {
                        let unicast = engine.unicast_interface();
                        engine.reconfigure_interface(&unicast, Some(&transport_config));
                    }
                    Err(e) => tracing::warn!("could not apply rfc5444 section: {e:#}"),
                }
            }
            Err(e) => tracing::warn!("invalid rfc5444 section, ignored: {e:#}"),
        }

        // sections that disappeared take their interfaces with them
        let section_keys: Vec<String> =
            config.interfaces.keys().map(|k| k.to_ascii_lowercase()).collect();
        let vanished: Vec<String> = self
            .bound
            .keys()
            .filter(|key| !section_keys.contains(key))
            .cloned()
            .collect();
        for key in vanished {
            if let Some(interface) = self.bound.remove(&key) {
                tracing::info!("interface section '{key}' removed, removing interface");
                engine.remove_interface(interface, None);
            }
        }

        for (name, section) in &config.interfaces {
            let transport_config = match section.to_transport_config() {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("invalid interface section '{name}', ignored: {e:#}");
                    continue;
                }
            };
            let key = name.to_ascii_lowercase();
            let interface = match self.bound.get(&key) {
                Some(interface) => interface.clone(),
                None => {
                    let (interface, _) = engine.add_interface(&protocol, None, name);
                    self.bound.insert(key, interface.clone());
                    interface
                }
            };
            engine.reconfigure_interface(&interface, Some(&transport_config));
        }
    }
}
