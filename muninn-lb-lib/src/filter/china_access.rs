use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{Access, ChinaAccessRule, ServerConfig};
use crate::error::{ProxyError, Result};
use crate::geo::{is_private, GeoDb};

/// Gates connects on the source IP's geolocation. Rules are ranked by
/// specificity (number of non-empty fields among area/region/isp); the most
/// specific matching rule wins. Private addresses bypass the check.
pub struct ChinaAccessFilter {
    rules: Vec<ChinaAccessRule>,
    default_deny: bool,
    geo: Option<Arc<GeoDb>>,
}

impl ChinaAccessFilter {
    pub fn from_config(cfg: &ServerConfig, geo: Option<Arc<GeoDb>>) -> Option<Self> {
        let access = cfg.limit_china_access.as_ref()?;
        if access.rules.is_empty() {
            return None;
        }
        Some(Self {
            rules: access.rules.clone(),
            default_deny: access.default == Access::Deny,
            geo,
        })
    }

    pub fn on_connect(&self, peer: SocketAddr) -> Result<()> {
        let ip = peer.ip();
        if is_private(ip) {
            return Ok(());
        }

        let record = self.geo.as_ref().and_then(|db| db.find(ip));
        let verdict = match record {
            Some(record) => {
                let mut best: Option<(usize, Access)> = None;
                for rule in &self.rules {
                    let specificity = [&rule.area, &rule.region, &rule.isp]
                        .iter()
                        .filter(|f| !f.is_empty())
                        .count();
                    if specificity == 0 {
                        continue;
                    }
                    let matches = (rule.area.is_empty() || rule.area == record.area)
                        && (rule.region.is_empty() || rule.region == record.region)
                        && (rule.isp.is_empty() || rule.isp == record.isp);
                    if matches && best.is_none_or(|(s, _)| specificity >= s) {
                        best = Some((specificity, rule.access));
                    }
                }
                match best {
                    Some((_, access)) => access,
                    None => self.default_access(),
                }
            }
            None => {
                // an all-wildcard deny rule covers addresses outside the database
                let outside_denied = self
                    .rules
                    .iter()
                    .any(|r| {
                        r.area.is_empty()
                            && r.region.is_empty()
                            && r.isp.is_empty()
                            && r.access == Access::Deny
                    });
                if outside_denied {
                    Access::Deny
                } else {
                    self.default_access()
                }
            }
        };

        match verdict {
            Access::Allow => Ok(()),
            Access::Deny => Err(ProxyError::FilterDeny(format!("geo access denied for {ip}"))),
        }
    }

    fn default_access(&self) -> Access {
        if self.default_deny {
            Access::Deny
        } else {
            Access::Allow
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChinaAccessConfig;

    const DB: &str = "1.2.0.0/16\thuadong\tshanghai\ttelecom\n\
                      9.9.0.0/16\thuabei\tbeijing\tunicom\n";

    fn rule(area: &str, region: &str, isp: &str, access: Access) -> ChinaAccessRule {
        ChinaAccessRule {
            area: area.into(),
            region: region.into(),
            isp: isp.into(),
            access,
        }
    }

    fn filter(rules: Vec<ChinaAccessRule>, default: Access) -> ChinaAccessFilter {
        let cfg = ServerConfig {
            limit_china_access: Some(ChinaAccessConfig { default, rules }),
            ..Default::default()
        };
        let geo = Arc::new(GeoDb::parse(DB).unwrap());
        ChinaAccessFilter::from_config(&cfg, Some(geo)).unwrap()
    }

    fn peer(ip: &str) -> SocketAddr {
        format!("{ip}:40000").parse().unwrap()
    }

    #[test]
    fn most_specific_rule_wins() {
        let f = filter(
            vec![
                rule("huadong", "", "", Access::Allow),
                rule("huadong", "shanghai", "telecom", Access::Deny),
            ],
            Access::Allow,
        );
        assert!(f.on_connect(peer("1.2.3.4")).is_err());
    }

    #[test]
    fn unmatched_record_falls_back_to_default() {
        let f = filter(vec![rule("huadong", "", "", Access::Deny)], Access::Allow);
        // 9.9.x.x resolves to huabei, no rule hits
        assert!(f.on_connect(peer("9.9.1.1")).is_ok());

        let f = filter(vec![rule("huadong", "", "", Access::Allow)], Access::Deny);
        assert!(f.on_connect(peer("9.9.1.1")).is_err());
    }

    #[test]
    fn private_addresses_bypass() {
        let f = filter(vec![rule("", "", "", Access::Deny)], Access::Deny);
        assert!(f.on_connect(peer("192.168.0.3")).is_ok());
    }

    #[test]
    fn lookup_miss_with_wildcard_deny_rule_denies() {
        let f = filter(vec![rule("", "", "", Access::Deny)], Access::Allow);
        assert!(f.on_connect(peer("8.8.8.8")).is_err());
    }

    #[test]
    fn lookup_miss_without_wildcard_rule_applies_default() {
        let f = filter(vec![rule("huadong", "", "", Access::Deny)], Access::Allow);
        assert!(f.on_connect(peer("8.8.8.8")).is_ok());
    }
}
