use domain::{Address, Service, Target};

use crate::conn::PeerProperties;
use crate::Addresser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Legacy,
    Routable,
    Dynamic,
}

/// Prefix/label bag for the original "legacy" address scheme: one flat
/// namespace distinguished by prefix alone.
#[derive(Debug, Clone)]
pub struct LegacyPrefixes {
    pub server_request_prefix: String,
    pub broadcast_prefix: String,
    pub group_request_prefix: String,
}

impl Default for LegacyPrefixes {
    fn default() -> Self {
        LegacyPrefixes {
            server_request_prefix: "exclusive".to_string(),
            broadcast_prefix: "broadcast".to_string(),
            group_request_prefix: "unicast".to_string(),
        }
    }
}

/// Prefix/label bag for the "routable" scheme: separate RPC/notify address
/// prefixes plus explicit unicast/multicast/anycast labels understood by
/// routing-capable intermediaries.
#[derive(Debug, Clone)]
pub struct RoutablePrefixes {
    pub rpc_address_prefix: String,
    pub notify_address_prefix: String,
    pub multicast_address: String,
    pub unicast_address: String,
    pub anycast_address: String,
}

impl Default for RoutablePrefixes {
    fn default() -> Self {
        RoutablePrefixes {
            rpc_address_prefix: "openstack.org/om/rpc".to_string(),
            notify_address_prefix: "openstack.org/om/notify".to_string(),
            multicast_address: "multicast".to_string(),
            unicast_address: "unicast".to_string(),
            anycast_address: "anycast".to_string(),
        }
    }
}

fn service_label(service: Service) -> &'static str {
    match service {
        Service::Rpc => "rpc",
        Service::Notify => "notify",
    }
}

pub struct LegacyAddresser {
    default_exchange: String,
    prefixes: LegacyPrefixes,
}

impl LegacyAddresser {
    pub fn new(default_exchange: impl Into<String>, prefixes: LegacyPrefixes) -> Self {
        LegacyAddresser {
            default_exchange: default_exchange.into(),
            prefixes,
        }
    }

    fn exchange<'a>(&'a self, target: &'a Target) -> &'a str {
        target.exchange.as_deref().unwrap_or(&self.default_exchange)
    }
}

impl Addresser for LegacyAddresser {
    fn unicast_address(&self, target: &Target, _service: Service) -> Address {
        let server = target.server.as_deref().unwrap_or("");
        Address(format!(
            "{}.{}/{}/{}",
            self.prefixes.server_request_prefix,
            self.exchange(target),
            target.topic,
            server
        ))
    }

    fn multicast_address(&self, target: &Target, _service: Service) -> Address {
        Address(format!(
            "{}.{}/{}",
            self.prefixes.broadcast_prefix,
            self.exchange(target),
            target.topic
        ))
    }

    fn anycast_address(&self, target: &Target, _service: Service) -> Address {
        Address(format!(
            "{}.{}/{}",
            self.prefixes.group_request_prefix,
            self.exchange(target),
            target.topic
        ))
    }

    fn is_multicast(&self, address: &Address) -> bool {
        address.0.starts_with(&self.prefixes.broadcast_prefix)
    }

    fn is_anycast(&self, address: &Address) -> bool {
        address.0.starts_with(&self.prefixes.group_request_prefix)
    }
}

pub struct RoutableAddresser {
    prefixes: RoutablePrefixes,
}

impl RoutableAddresser {
    pub fn new(prefixes: RoutablePrefixes) -> Self {
        RoutableAddresser { prefixes }
    }

    fn prefix(&self, service: Service) -> &str {
        match service {
            Service::Rpc => &self.prefixes.rpc_address_prefix,
            Service::Notify => &self.prefixes.notify_address_prefix,
        }
    }
}

impl Addresser for RoutableAddresser {
    fn unicast_address(&self, target: &Target, service: Service) -> Address {
        let server = target.server.as_deref().unwrap_or("");
        Address(format!(
            "{}/{}/{}/{}",
            self.prefixes.unicast_address,
            self.prefix(service),
            target.topic,
            server
        ))
    }

    fn multicast_address(&self, target: &Target, service: Service) -> Address {
        Address(format!(
            "{}/{}/{}",
            self.prefixes.multicast_address,
            self.prefix(service),
            target.topic
        ))
    }

    fn anycast_address(&self, target: &Target, service: Service) -> Address {
        Address(format!(
            "{}/{}/{}",
            self.prefixes.anycast_address,
            self.prefix(service),
            target.topic
        ))
    }

    fn is_multicast(&self, address: &Address) -> bool {
        address.0.starts_with(&self.prefixes.multicast_address)
    }

    fn is_anycast(&self, address: &Address) -> bool {
        address.0.starts_with(&self.prefixes.anycast_address)
    }
}

/// Given default exchange, mode, and the legacy/routable prefix bags,
/// resolves to a concrete `Addresser` at connection time — `dynamic` mode
/// picks Legacy or Routable from the peer's advertised properties, so the
/// wire form always matches what that peer understands.
pub struct AddresserFactory {
    default_exchange: String,
    mode: AddressingMode,
    legacy: LegacyPrefixes,
    routable: RoutablePrefixes,
}

impl AddresserFactory {
    pub fn new(
        default_exchange: impl Into<String>,
        mode: AddressingMode,
        legacy: LegacyPrefixes,
        routable: RoutablePrefixes,
    ) -> Self {
        AddresserFactory {
            default_exchange: default_exchange.into(),
            mode,
            legacy,
            routable,
        }
    }

    pub fn build(&self, peer: &PeerProperties) -> Box<dyn Addresser> {
        let use_routable = match self.mode {
            AddressingMode::Legacy => false,
            AddressingMode::Routable => true,
            AddressingMode::Dynamic => peer.supports_routable_addresses(),
        };
        if use_routable {
            Box::new(RoutableAddresser::new(self.routable.clone()))
        } else {
            Box::new(LegacyAddresser::new(
                self.default_exchange.clone(),
                self.legacy.clone(),
            ))
        }
    }
}
