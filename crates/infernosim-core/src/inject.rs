//! Fault-injection rules for the stub dependency proxy.
//!
//! A rule is written as a space-separated set of `key=value` pairs, e.g.
//! `dep=worldtimeapi.org latency=+200ms timeout=50ms retries=2`. Rules are
//! keyed by dependency identifier (host with the port stripped); lookup is
//! first-match in insertion order. The recognized key set is closed: unknown
//! keys are collected and rejected with a validation error that enumerates
//! both the supported and the unsupported keys.

use std::fmt;
use std::time::Duration;

/// The exhaustive set of recognized rule keys.
pub const SUPPORTED_KEYS: &[&str] = &["dep", "latency", "timeout", "retries"];

/// One fault-injection rule, keyed by dependency host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionRule {
    /// Dependency identifier: host without port.
    pub dep: String,
    /// Extra latency added before serving the captured response.
    pub add_latency: Duration,
    /// When non-zero, sleep this long and answer 504 instead of serving.
    pub timeout: Duration,
    /// When set to `n`, the first `n` attempts per dependency are answered
    /// with 502 to force the service into its retry path. `None` disables
    /// forced retries.
    pub retry_limit: Option<u32>,
}

impl InjectionRule {
    fn new(dep: String) -> Self {
        Self {
            dep,
            add_latency: Duration::ZERO,
            timeout: Duration::ZERO,
            retry_limit: None,
        }
    }
}

impl fmt::Display for InjectionRule {
    /// Renders the recognized subset back into rule syntax. Reparsing the
    /// rendered form yields an equal rule.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dep={}", self.dep)?;
        if self.add_latency > Duration::ZERO {
            write!(f, " latency=+{}", fmt_duration(self.add_latency))?;
        }
        if self.timeout > Duration::ZERO {
            write!(f, " timeout={}", fmt_duration(self.timeout))?;
        }
        if let Some(n) = self.retry_limit {
            write!(f, " retries={n}")?;
        }
        Ok(())
    }
}

/// Formats a duration in `<number><unit>` syntax with no interior spaces, so
/// the output stays a single rule token.
fn fmt_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string().replace(' ', "")
}

/// Errors from parsing injection rule strings.
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    /// A token was not a `key=value` pair.
    #[error("bad inject token {token:?}: expected key=value")]
    MalformedToken {
        /// The offending token.
        token: String,
    },

    /// A recognized key carried an unparseable value.
    #[error("bad {key} value {value:?} in inject rule")]
    InvalidValue {
        /// The key whose value failed to parse.
        key: &'static str,
        /// The raw value.
        value: String,
    },

    /// A rule omitted the required `dep=` key.
    #[error("inject rule {rule:?} is missing dep=<host>")]
    MissingDep {
        /// The raw rule string.
        rule: String,
    },

    /// One or more keys were outside the recognized set.
    #[error(
        "unsupported inject key(s) {{{}}}; supported keys are {{{}}}",
        unsupported.join(", "),
        SUPPORTED_KEYS.join(", ")
    )]
    UnsupportedKeys {
        /// The unrecognized keys, in first-seen order.
        unsupported: Vec<String>,
    },
}

/// Parses one rule per input string.
///
/// Value errors fail fast; unknown keys are collected across all inputs and
/// reported together once the scan completes.
pub fn parse_rules(raw_rules: &[String]) -> Result<Vec<InjectionRule>, InjectError> {
    let mut rules = Vec::with_capacity(raw_rules.len());
    let mut unsupported: Vec<String> = Vec::new();

    for raw in raw_rules {
        let mut rule = InjectionRule::new(String::new());
        for token in raw.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                return Err(InjectError::MalformedToken {
                    token: token.to_string(),
                });
            };
            match key {
                "dep" => rule.dep = value.to_string(),
                "latency" => {
                    let trimmed = value.strip_prefix('+').unwrap_or(value);
                    rule.add_latency = humantime::parse_duration(trimmed).map_err(|_| {
                        InjectError::InvalidValue {
                            key: "latency",
                            value: value.to_string(),
                        }
                    })?;
                }
                "timeout" => {
                    rule.timeout = humantime::parse_duration(value).map_err(|_| {
                        InjectError::InvalidValue {
                            key: "timeout",
                            value: value.to_string(),
                        }
                    })?;
                }
                "retries" => {
                    let n: u32 = value.parse().map_err(|_| InjectError::InvalidValue {
                        key: "retries",
                        value: value.to_string(),
                    })?;
                    rule.retry_limit = Some(n);
                }
                other => {
                    if !unsupported.iter().any(|k| k == other) {
                        unsupported.push(other.to_string());
                    }
                }
            }
        }
        if rule.dep.is_empty() {
            return Err(InjectError::MissingDep { rule: raw.clone() });
        }
        rules.push(rule);
    }

    if !unsupported.is_empty() {
        return Err(InjectError::UnsupportedKeys { unsupported });
    }
    Ok(rules)
}

/// Returns the first rule matching `dep`, by insertion order.
///
/// `dep` is compared against the rule key after port stripping, so callers
/// may pass either a bare host or `host:port`.
#[must_use]
pub fn match_rule<'r>(dep: &str, rules: &'r [InjectionRule]) -> Option<&'r InjectionRule> {
    let key = host_key(dep);
    rules.iter().find(|r| r.dep == key)
}

/// Strips the port from a `host:port` pair, tolerating bracketed IPv6
/// literals and bare hosts.
#[must_use]
pub fn host_key(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    if let Some((head, tail)) = host.rsplit_once(':') {
        if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) && !head.contains(':') {
            return head;
        }
    }
    host
}

/// Coarse label for which injection classes a rule set exercises, reported
/// in the replay summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionsApplied {
    /// No rules, or rules with neither latency nor timeout.
    None,
    /// At least one latency rule.
    Latency,
    /// At least one timeout rule.
    Timeout,
    /// Both classes present.
    LatencyAndTimeout,
}

impl InjectionsApplied {
    /// Derives the label from a parsed rule set.
    #[must_use]
    pub fn from_rules(rules: &[InjectionRule]) -> Self {
        let latency = rules.iter().any(|r| r.add_latency > Duration::ZERO);
        let timeout = rules.iter().any(|r| r.timeout > Duration::ZERO);
        match (latency, timeout) {
            (true, true) => Self::LatencyAndTimeout,
            (true, false) => Self::Latency,
            (false, true) => Self::Timeout,
            (false, false) => Self::None,
        }
    }

    /// Summary-surface spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Latency => "latency",
            Self::Timeout => "timeout",
            Self::LatencyAndTimeout => "latency+timeout",
        }
    }
}
