//! Per-repository allow/deny policy.
//!
//! Two independent ordered rule lists answer `proxy_allowed` and
//! `cache_allowed` for an `org/name` slug. Rules are evaluated in declaration
//! order, first match wins, and an empty or non-matching list allows.
//! Patterns are either globs (`*` and `?`) or full-anchored regexes.

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::RuleConfig;

// ---------------------------------------------------------------------------
// Compiled rules
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Rule {
    pattern: Regex,
    allow: bool,
}

#[derive(Debug, Default)]
pub struct RuleList {
    rules: Vec<Rule>,
}

impl RuleList {
    pub fn compile(configs: &[RuleConfig]) -> Result<Self> {
        let mut rules = Vec::with_capacity(configs.len());
        for config in configs {
            let source = if config.use_regex {
                // Anchor so a rule matches the whole slug, not a substring.
                format!("^(?:{})$", config.repo)
            } else {
                glob_to_regex(&config.repo)
            };
            let pattern = Regex::new(&source)
                .with_context(|| format!("invalid rule pattern: {}", config.repo))?;
            rules.push(Rule {
                pattern,
                allow: config.allow,
            });
        }
        Ok(Self { rules })
    }

    /// First matching rule decides; no match allows.
    pub fn allows(&self, repo: &str) -> bool {
        for rule in &self.rules {
            if rule.pattern.is_match(repo) {
                return rule.allow;
            }
        }
        true
    }
}

/// Translate a glob with `*` and `?` into an anchored regex.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

// ---------------------------------------------------------------------------
// PolicyEngine
// ---------------------------------------------------------------------------

/// Immutable policy built once at startup from config.
#[derive(Debug)]
pub struct PolicyEngine {
    proxy: RuleList,
    cache: RuleList,
}

impl PolicyEngine {
    pub fn new(proxy: &[RuleConfig], cache: &[RuleConfig]) -> Result<Self> {
        Ok(Self {
            proxy: RuleList::compile(proxy).context("compiling proxy rules")?,
            cache: RuleList::compile(cache).context("compiling cache rules")?,
        })
    }

    /// May this repository be proxied at all?
    pub fn proxy_allowed(&self, repo: &str) -> bool {
        self.proxy.allows(repo)
    }

    /// May responses for this repository be written to disk? Denial only
    /// suppresses the tee; the request is still served pass-through.
    pub fn cache_allowed(&self, repo: &str) -> bool {
        self.cache.allows(repo)
    }
}
