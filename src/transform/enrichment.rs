//! Enrichment rules
//!
//! A rule reads one field, derives data from it and writes the result to
//! another field. The two default rules always run first; configured rules
//! follow in configuration order.

use super::path::{json_kind, FieldPath};
use super::{useragent, RuleError};
use crate::config::EnrichmentRuleConfig;
use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;

pub const IP_LOOKUP: &str = "ip_lookup";
pub const USER_AGENT_PARSE: &str = "user_agent_parse";

const DEFAULT_IP_FROM: &str = "/source_ip";
const DEFAULT_IP_TO: &str = "/eventn_ctx/location";
const DEFAULT_UA_FROM: &str = "/eventn_ctx/user_agent";
const DEFAULT_UA_TO: &str = "/eventn_ctx/parsed_ua";

/// Geolocation capability backing `ip_lookup`
pub trait GeoResolver: Send + Sync + 'static {
    /// Location data for an address; `Ok(None)` when nothing is known.
    fn resolve(&self, ip: IpAddr) -> Result<Option<Map<String, Value>>, String>;
}

/// Resolver that knows nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGeoResolver;

impl GeoResolver for NoopGeoResolver {
    fn resolve(&self, _ip: IpAddr) -> Result<Option<Map<String, Value>>, String> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentKind {
    IpLookup,
    UserAgentParse,
}

impl EnrichmentKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            IP_LOOKUP => Some(EnrichmentKind::IpLookup),
            USER_AGENT_PARSE => Some(EnrichmentKind::UserAgentParse),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentKind::IpLookup => IP_LOOKUP,
            EnrichmentKind::UserAgentParse => USER_AGENT_PARSE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentRule {
    kind: EnrichmentKind,
    from: FieldPath,
    to: FieldPath,
}

impl EnrichmentRule {
    fn builtin(kind: EnrichmentKind, from: &str, to: &str) -> Self {
        EnrichmentRule {
            kind,
            from: FieldPath::parse(from).expect("built-in enrichment path is valid"),
            to: FieldPath::parse(to).expect("built-in enrichment path is valid"),
        }
    }

    /// `ip_lookup` from `/source_ip` to `/eventn_ctx/location`
    pub fn default_ip_rule() -> Self {
        Self::builtin(EnrichmentKind::IpLookup, DEFAULT_IP_FROM, DEFAULT_IP_TO)
    }

    /// `user_agent_parse` from `/eventn_ctx/user_agent` to `/eventn_ctx/parsed_ua`
    pub fn default_ua_rule() -> Self {
        Self::builtin(EnrichmentKind::UserAgentParse, DEFAULT_UA_FROM, DEFAULT_UA_TO)
    }

    pub fn default_rules() -> Vec<Self> {
        vec![Self::default_ip_rule(), Self::default_ua_rule()]
    }

    pub fn from_config(config: &EnrichmentRuleConfig) -> Result<Self, RuleError> {
        let invalid = |reason: &str| RuleError::Enrichment {
            rule: config.to_string(),
            reason: reason.to_string(),
        };

        let kind = EnrichmentKind::parse(config.name.trim())
            .ok_or_else(|| invalid(&format!("unknown rule name: {}", config.name)))?;
        let from = FieldPath::parse(&config.from)
            .ok_or_else(|| invalid("'from' must be a non-empty path starting with /"))?;
        let to = FieldPath::parse(&config.to)
            .ok_or_else(|| invalid("'to' must be a non-empty path starting with /"))?;
        if from == to {
            return Err(invalid("'from' and 'to' must differ"));
        }

        Ok(EnrichmentRule { kind, from, to })
    }

    pub fn kind(&self) -> EnrichmentKind {
        self.kind
    }

    /// Apply to an event in place. A missing source field is a no-op.
    pub fn apply(&self, event: &mut Map<String, Value>, geo: &dyn GeoResolver) -> Result<(), String> {
        let Some(source) = self.from.get(event) else {
            return Ok(());
        };
        let Some(text) = source.as_str() else {
            return Err(format!("{} is a {}, expected string", self.from, json_kind(source)));
        };

        let derived = match self.kind {
            EnrichmentKind::IpLookup => {
                let ip: IpAddr = text
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid ip address: {}", text))?;
                match geo.resolve(ip)? {
                    Some(location) => Value::Object(location),
                    None => return Ok(()),
                }
            }
            EnrichmentKind::UserAgentParse => {
                if text.trim().is_empty() {
                    return Ok(());
                }
                useragent::parse(text).to_json()
            }
        };
        self.to.set(event, derived)
    }
}

impl fmt::Display for EnrichmentRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "name: {} from: {} to: {}", self.kind.as_str(), self.from, self.to)
    }
}
