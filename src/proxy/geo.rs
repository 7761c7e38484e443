//! Country lookup for proxy exit addresses using an MMDB database

use crate::Result;
use maxminddb::{geoip2, Reader};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Code reported for addresses that cannot be resolved
pub const UNKNOWN_COUNTRY: &str = "UNKNOWN";

/// Maps exit IPs to ISO country codes
pub trait CountryResolver: Send + Sync {
    /// Resolve every address in `ips`; unresolvable ones map to `UNKNOWN`
    fn resolve_batch(&self, ips: &[String]) -> HashMap<String, String>;
}

/// MaxMind-backed resolver with a per-address cache.
///
/// Without a database every lookup yields `UNKNOWN`.
pub struct GeoIpResolver {
    reader: Option<Arc<Reader<Vec<u8>>>>,
    cache: RwLock<HashMap<String, String>>,
}

impl GeoIpResolver {
    /// Open an MMDB file (Country or City database)
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Some(Arc::new(reader)),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Resolver that knows no countries
    pub fn disabled() -> Self {
        Self {
            reader: None,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Open `path`, falling back to a disabled resolver with a warning
    pub fn open_or_disabled<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::from_path(path) {
            Ok(resolver) => {
                info!(path = %path.display(), "GeoIP database loaded");
                resolver
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "GeoIP database unavailable, countries will be reported as {}",
                    UNKNOWN_COUNTRY
                );
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.reader.is_some()
    }

    /// Look up the country code for an IP address string
    pub fn lookup(&self, ip_str: &str) -> Result<Option<String>> {
        let Some(reader) = &self.reader else {
            return Ok(None);
        };
        let ip: IpAddr = ip_str.parse()?;
        let lookup_result = reader.lookup(ip)?;

        let country: Option<geoip2::Country> = lookup_result.decode()?;
        Ok(country.and_then(|country| country.country.iso_code.map(String::from)))
    }

    fn resolve(&self, ip: &str) -> String {
        if let Ok(cache) = self.cache.read() {
            if let Some(code) = cache.get(ip) {
                return code.clone();
            }
        }

        let code = match self.lookup(ip) {
            Ok(Some(code)) => code,
            Ok(None) => UNKNOWN_COUNTRY.to_string(),
            Err(e) => {
                warn!(ip, error = %e, "country lookup failed");
                UNKNOWN_COUNTRY.to_string()
            }
        };

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(ip.to_string(), code.clone());
        }
        code
    }
}

impl CountryResolver for GeoIpResolver {
    fn resolve_batch(&self, ips: &[String]) -> HashMap<String, String> {
        ips.iter()
            .map(|ip| (ip.clone(), self.resolve(ip)))
            .collect()
    }
}
