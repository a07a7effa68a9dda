//! Country lookup backends

use maxminddb::geoip2;
use std::net::IpAddr;
use std::path::Path;

/// Resolves an IP address to an ISO 3166 country code
pub trait GeoLookup: Send + Sync {
    fn country(&self, ip: IpAddr) -> Option<String>;
}

/// MaxMind GeoLite2/GeoIP2 country database
pub struct MaxMindGeo {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindGeo {
    /// Opens the database file into memory
    pub fn open(path: &Path) -> Result<Self, maxminddb::MaxMindDBError> {
        let reader = maxminddb::Reader::open_readfile(path)?;
        Ok(Self { reader })
    }
}

impl GeoLookup for MaxMindGeo {
    fn country(&self, ip: IpAddr) -> Option<String> {
        let record: geoip2::Country = self.reader.lookup(ip).ok()?;
        record
            .country
            .and_then(|country| country.iso_code)
            .map(str::to_string)
    }
}

/// Fixed-answer lookup, for wiring tests and offline runs
#[derive(Debug, Clone, Default)]
pub struct StaticGeo {
    entries: Vec<(IpAddr, String)>,
}

impl StaticGeo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: IpAddr, country: &str) -> Self {
        self.entries.push((ip, country.to_string()));
        self
    }
}

impl GeoLookup for StaticGeo {
    fn country(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .iter()
            .find(|(addr, _)| *addr == ip)
            .map(|(_, country)| country.clone())
    }
}
