//! China geolocation database. Text format, one network per line:
//! `CIDR<TAB>area<TAB>region<TAB>isp`. Read-only after load.

use ipnet::IpNet;
use std::net::IpAddr;
use std::path::Path;

use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoRecord {
    pub area: String,
    pub region: String,
    pub isp: String,
}

pub struct GeoDb {
    nets: Vec<(IpNet, GeoRecord)>,
}

impl GeoDb {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ProxyError::Config(format!("cannot read ip database: {e}")))?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        let mut nets = Vec::new();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split('\t');
            let (Some(cidr), Some(area), Some(region), Some(isp)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let net: IpNet = cidr
                .parse()
                .map_err(|e| ProxyError::Config(format!("bad network {cidr}: {e}")))?;
            nets.push((
                net,
                GeoRecord {
                    area: area.to_string(),
                    region: region.to_string(),
                    isp: isp.to_string(),
                },
            ));
        }
        Ok(Self { nets })
    }

    /// Longest-prefix match
    pub fn find(&self, ip: IpAddr) -> Option<&GeoRecord> {
        self.nets
            .iter()
            .filter(|(net, _)| net.contains(&ip))
            .max_by_key(|(net, _)| net.prefix_len())
            .map(|(_, rec)| rec)
    }
}

/// Addresses that never go through the geolocation lookup
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB: &str = "1.2.0.0/16\thuadong\tshanghai\ttelecom\n\
                      1.2.3.0/24\thuadong\tshanghai\tunicom\n\
                      9.9.9.0/24\thuabei\tbeijing\tmobile\n";

    #[test]
    fn longest_prefix_wins() {
        let db = GeoDb::parse(DB).unwrap();
        let rec = db.find("1.2.3.4".parse().unwrap()).unwrap();
        assert_eq!(rec.isp, "unicom");
        let rec = db.find("1.2.9.4".parse().unwrap()).unwrap();
        assert_eq!(rec.isp, "telecom");
    }

    #[test]
    fn miss_is_none() {
        let db = GeoDb::parse(DB).unwrap();
        assert!(db.find("8.8.8.8".parse().unwrap()).is_none());
    }

    #[test]
    fn private_addresses() {
        assert!(is_private("192.168.1.1".parse().unwrap()));
        assert!(is_private("10.1.2.3".parse().unwrap()));
        assert!(is_private("127.0.0.1".parse().unwrap()));
        assert!(is_private("::1".parse().unwrap()));
        assert!(!is_private("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn bad_cidr_is_config_error() {
        assert!(GeoDb::parse("notacidr\ta\tb\tc\n").is_err());
    }
}
