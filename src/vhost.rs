//! Virtual-host table.
//!
//! A JSON config file lists rewrite rules; the first rule whose
//! prefix/suffix/keyword all match the inbound path wins and supplies the
//! origin URL plus the caching knobs for that request. Each rule owns a
//! dedicated upstream client so timeouts, redirect limits, and dial
//! overrides are per-upstream. The table is swapped atomically on reload.

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};

use crate::fetch::{HttpFetcher, Origin};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VhostRule {
    pub prefix: String,
    pub suffix: String,
    pub keyword: String,
    pub replace: String,
    pub target: String,
    pub host: String,
    #[serde(rename = "withQuery")]
    pub with_query: bool,
    #[serde(rename = "strictCache")]
    pub strict_cache: bool,
    #[serde(rename = "cachesec")]
    pub cache_sec: u32,
    pub timeout: u32,
    #[serde(rename = "maxredirect")]
    pub max_redirect: u32,
}

impl VhostRule {
    fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix) && path.ends_with(&self.suffix) && path.contains(&self.keyword)
    }

    fn rewrite(&self, path: &str) -> String {
        let rewritten = if self.keyword.is_empty() {
            path.to_owned()
        } else {
            path.replacen(&self.keyword, &self.replace, 1)
        };
        format!("{}{}", self.target, rewritten)
    }
}

struct Vhost {
    rule: VhostRule,
    origin: Arc<HttpFetcher>,
}

/// Everything the coordinator needs for one matched request.
pub struct ResolvedRoute {
    pub url: String,
    pub with_query: bool,
    pub strict_cache: bool,
    /// TTL in seconds applied to chunks and metadata for this request.
    pub cache_ttl: i64,
    pub origin: Arc<dyn Origin>,
}

pub struct VhostTable {
    path: PathBuf,
    rules: RwLock<Arc<Vec<Vhost>>>,
}

impl VhostTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rules: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Parse the config file, build the per-rule clients, and swap the
    /// active rule set. On error the previous rules stay in effect.
    pub fn reload(&self) -> anyhow::Result<usize> {
        let raw = std::fs::read(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        let parsed: Vec<VhostRule> = serde_json::from_slice(&raw)
            .with_context(|| format!("parse {}", self.path.display()))?;
        let mut rules = Vec::with_capacity(parsed.len());
        for mut rule in parsed {
            if rule.timeout == 0 {
                rule.timeout = 60;
            }
            if rule.max_redirect == 0 {
                rule.max_redirect = 3;
            }
            let client = build_client(&rule)
                .with_context(|| format!("build client for target {}", rule.target))?;
            rules.push(Vhost {
                origin: Arc::new(HttpFetcher::new(client)),
                rule,
            });
        }
        let count = rules.len();
        *self.rules.write() = Arc::new(rules);
        info!(rules = count, path = %self.path.display(), "vhost table loaded");
        Ok(count)
    }

    /// Resolve an inbound path; first matching rule wins.
    pub fn resolve(&self, path: &str) -> Option<ResolvedRoute> {
        let rules = self.rules.read().clone();
        for vhost in rules.iter() {
            if vhost.rule.matches(path) {
                return Some(ResolvedRoute {
                    url: vhost.rule.rewrite(path),
                    with_query: vhost.rule.with_query,
                    strict_cache: vhost.rule.strict_cache,
                    cache_ttl: i64::from(vhost.rule.cache_sec),
                    origin: vhost.origin.clone(),
                });
            }
        }
        None
    }
}

fn build_client(rule: &VhostRule) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(u64::from(rule.timeout)))
        .redirect(reqwest::redirect::Policy::limited(rule.max_redirect as usize))
        // Targets are often addressed through rewritten hosts or raw IPs
        // whose certificates cannot match.
        .danger_accept_invalid_certs(true)
        .pool_idle_timeout(Duration::from_secs(90));
    if !rule.host.is_empty() {
        let url = reqwest::Url::parse(&rule.target)
            .with_context(|| format!("parse target {}", rule.target))?;
        if let Some(domain) = url.host_str() {
            let port = url.port_or_known_default().unwrap_or(80);
            let dial = if has_port(&rule.host) {
                rule.host.clone()
            } else {
                format!("{}:{}", rule.host, port)
            };
            // Resolved once at config load; a reload re-resolves.
            match dial.to_socket_addrs() {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        builder = builder.resolve(domain, addr);
                    }
                }
                Err(err) => warn!(%err, host = %dial, "dial override unresolvable, using dns"),
            }
        }
    }
    Ok(builder.build()?)
}

fn has_port(host: &str) -> bool {
    let colon = host.rfind(':').map_or(-1, |i| i as i64);
    let bracket = host.rfind(']').map_or(-1, |i| i as i64);
    colon > bracket
}
