use std::{net::IpAddr, path::Path};

use ipnet::IpNet;
use ipnet_trie::IpnetTrie;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::error::ServerError;

// Connection policy applied to an IP range.
#[derive(PartialEq, Eq, Clone, Copy)]
enum IpPolicy {
    Allow,
    Deny,
}

// Maps an IP address to the ISO code of the country it is registered in.
//
// Lookups are best-effort: a missing or misconfigured database must never
// take the filter down, so any failure is reported as "no country match".
#[cfg_attr(test, automock)]
pub(crate) trait CountryResolver: Send + Sync {
    fn country_code(&self, address: IpAddr) -> Option<String>;
}

// Country resolver backed by a MaxMind GeoLite2-Country database.
pub(crate) struct GeoDatabase {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl GeoDatabase {
    pub(crate) fn open(path: &Path) -> color_eyre::Result<Self> {
        Ok(GeoDatabase {
            reader: maxminddb::Reader::open_readfile(path)?,
        })
    }
}

impl CountryResolver for GeoDatabase {
    fn country_code(&self, address: IpAddr) -> Option<String> {
        self.reader
            .lookup::<maxminddb::geoip2::Country>(address)
            .ok()
            .and_then(|record| record.country)
            .and_then(|country| country.iso_code)
            .map(str::to_owned)
    }
}

pub(crate) struct IpFilterConfig {
    pub(crate) allowlist: Option<Vec<IpNet>>,
    pub(crate) blocklist: Option<Vec<IpNet>>,
    pub(crate) allowed_countries: Option<Vec<String>>,
    pub(crate) blocked_countries: Option<Vec<String>>,
}

// Service that identifies whether to allow or block a given IP address.
pub(crate) struct IpFilter {
    // Which policy to apply for IPs matching no explicit rule.
    default_policy: IpPolicy,
    // Trie for efficient lookup of IPs by the network prefix.
    data: IpnetTrie<IpPolicy>,
    allowed_countries: Vec<String>,
    blocked_countries: Vec<String>,
    resolver: Option<Box<dyn CountryResolver>>,
}

impl IpFilter {
    pub(crate) fn new(
        config: IpFilterConfig,
        resolver: Option<Box<dyn CountryResolver>>,
    ) -> color_eyre::Result<Self> {
        let IpFilterConfig {
            allowlist,
            blocklist,
            allowed_countries,
            blocked_countries,
        } = config;
        let allowed_countries = allowed_countries.unwrap_or_default();
        let blocked_countries = blocked_countries.unwrap_or_default();
        let mut data = IpnetTrie::new();
        let mut default_policy = IpPolicy::Allow;
        // As soon as any allow-list exists, everything else is blocked by
        // default.
        if !allowed_countries.is_empty() {
            default_policy = IpPolicy::Deny;
        }
        if let Some(allowlist) = allowlist {
            if !allowlist.is_empty() {
                default_policy = IpPolicy::Deny;
            }
            for network in allowlist {
                if data.insert(network, IpPolicy::Allow).is_some() {
                    return Err(ServerError::DuplicateNetworkCidr(network).into());
                }
            }
        }
        if let Some(blocklist) = blocklist {
            for network in blocklist {
                if data.insert(network, IpPolicy::Deny).is_some() {
                    return Err(ServerError::DuplicateNetworkCidr(network).into());
                }
            }
        }
        Ok(IpFilter {
            default_policy,
            data,
            allowed_countries,
            blocked_countries,
            resolver,
        })
    }

    pub(crate) fn is_allowed(&self, address: IpAddr) -> bool {
        // Explicit per-address entries take precedence over country rules.
        if let Some((_, policy)) = self
            .data
            .longest_match(&IpNet::from(address.to_canonical()))
        {
            return *policy == IpPolicy::Allow;
        }
        if let Some(country) = self
            .resolver
            .as_ref()
            .and_then(|resolver| resolver.country_code(address))
        {
            if self.blocked_countries.contains(&country) {
                debug!(%address, %country, "Address matches blocked country.");
                return false;
            }
            if self.allowed_countries.contains(&country) {
                return true;
            }
        }
        self.default_policy == IpPolicy::Allow
    }
}
