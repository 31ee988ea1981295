use std::fmt::Write as _;

use crate::config::{Access, ContentMatchMode, RequestContentRule, ServerConfig};
use crate::error::{ProxyError, Result};

/// Inspects each client-to-backend chunk before it is forwarded. The first
/// matching rule decides; otherwise the default policy applies. Chunks that
/// are empty or whitespace-only bypass the filter.
pub struct RequestContentFilter {
    rules: Vec<RequestContentRule>,
    default_deny: bool,
}

impl RequestContentFilter {
    pub fn from_config(cfg: &ServerConfig) -> Option<Self> {
        let content = cfg.filter_request_content.as_ref()?;
        if content.rules.is_empty() {
            return None;
        }
        Some(Self {
            rules: content.rules.clone(),
            default_deny: content.default == Access::Deny,
        })
    }

    pub fn on_request(&self, chunk: &[u8]) -> Result<()> {
        if chunk.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }

        let mut hex: Option<String> = None;
        for rule in &self.rules {
            let hit = match rule.mode {
                ContentMatchMode::Raw => contains(chunk, rule.content.as_bytes()),
                ContentMatchMode::Hex => {
                    let encoded = hex.get_or_insert_with(|| hex_encode(chunk));
                    encoded.contains(&rule.content.to_ascii_lowercase())
                }
            };
            if hit {
                return match rule.access {
                    Access::Allow => Ok(()),
                    Access::Deny => Err(ProxyError::FilterDeny("content denied".to_string())),
                };
            }
        }

        if self.default_deny {
            return Err(ProxyError::FilterDeny("content denied by default".to_string()));
        }
        Ok(())
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

fn hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestContentConfig;

    fn rule(mode: ContentMatchMode, content: &str, access: Access) -> RequestContentRule {
        RequestContentRule { mode, content: content.into(), access }
    }

    fn filter(rules: Vec<RequestContentRule>, default: Access) -> RequestContentFilter {
        let cfg = ServerConfig {
            filter_request_content: Some(RequestContentConfig { default, rules }),
            ..Default::default()
        };
        RequestContentFilter::from_config(&cfg).unwrap()
    }

    #[test]
    fn raw_deny_rule_blocks_matching_chunk() {
        let f = filter(vec![rule(ContentMatchMode::Raw, "BAD", Access::Deny)], Access::Allow);
        assert!(f.on_request(b"prefix BAD suffix").is_err());
        assert!(f.on_request(b"all good here").is_ok());
    }

    #[test]
    fn first_hit_wins() {
        let f = filter(
            vec![
                rule(ContentMatchMode::Raw, "GET", Access::Allow),
                rule(ContentMatchMode::Raw, "GET /admin", Access::Deny),
            ],
            Access::Deny,
        );
        assert!(f.on_request(b"GET /admin HTTP/1.1").is_ok());
    }

    #[test]
    fn hex_rule_matches_encoded_payload() {
        // 0xdeadbeef in the middle of the chunk
        let payload = [0x00, 0xde, 0xad, 0xbe, 0xef, 0x00];
        let f = filter(vec![rule(ContentMatchMode::Hex, "deadbeef", Access::Deny)], Access::Allow);
        assert!(f.on_request(&payload).is_err());
    }

    #[test]
    fn default_deny_blocks_unmatched_chunks() {
        let f = filter(vec![rule(ContentMatchMode::Raw, "ok", Access::Allow)], Access::Deny);
        assert!(f.on_request(b"something else").is_err());
        assert!(f.on_request(b"this is ok").is_ok());
    }

    #[test]
    fn whitespace_only_chunks_bypass() {
        let f = filter(vec![rule(ContentMatchMode::Raw, " ", Access::Deny)], Access::Deny);
        assert!(f.on_request(b"").is_ok());
        assert!(f.on_request(b"  \r\n\t ").is_ok());
    }
}
