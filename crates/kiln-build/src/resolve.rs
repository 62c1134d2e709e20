//! Variant resolution: flag requests + forced-off set -> build configuration.
//!
//! Requests arrive from several mechanisms with a fixed precedence
//! (`kiln.toml` < environment < command line). Within one mechanism a flag
//! may not be requested both on and off.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;

use kiln_targets::{CapabilityFlag, ForceReason, ForcedOff};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ResolveError;

/// Environment variable prefix for flag requests (`KILN_FLAG_AVX2=off`).
pub const ENV_FLAG_PREFIX: &str = "KILN_FLAG_";

/// Where a flag request came from. Later variants take precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestSource {
    Manifest,
    Environment,
    CommandLine,
}

impl fmt::Display for RequestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestSource::Manifest => f.write_str("kiln.toml"),
            RequestSource::Environment => f.write_str("environment"),
            RequestSource::CommandLine => f.write_str("command line"),
        }
    }
}

/// Parse a flag state. `None` means "no request" (use the default).
pub fn parse_flag_state(value: &str) -> Option<Option<bool>> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "t" | "true" | "y" | "yes" => Some(Some(true)),
        "0" | "off" | "f" | "false" | "n" | "no" => Some(Some(false)),
        "default" | "auto" => Some(None),
        _ => None,
    }
}

/// Parse a `name=state` request such as `avx2=off`.
pub fn parse_flag_request(request: &str) -> Result<(CapabilityFlag, Option<bool>), ResolveError> {
    let invalid = |reason: String| ResolveError::InvalidFlagRequest {
        request: request.to_string(),
        reason,
    };

    if request.contains(char::REPLACEMENT_CHARACTER) {
        return Err(invalid("not valid UTF-8".into()));
    }
    let (name, value) = request
        .split_once('=')
        .ok_or_else(|| invalid("expected NAME=on|off".into()))?;
    let flag: CapabilityFlag = name.parse().map_err(|e| invalid(format!("{e}")))?;
    let state = parse_flag_state(value)
        .ok_or_else(|| invalid(format!("'{}' is not on, off or default", value.trim())))?;
    Ok((flag, state))
}

/// A raw `name=state` request and the mechanism it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagRequest {
    pub source: RequestSource,
    pub text: String,
}

impl FlagRequest {
    pub fn new(source: RequestSource, text: impl Into<String>) -> Self {
        Self {
            source,
            text: text.into(),
        }
    }
}

/// Turn `KILN_FLAG_<NAME>=<state>` variables into requests.
///
/// Takes OS strings so that unrelated variables holding non-UTF-8 data are
/// skipped. A `KILN_FLAG_` variable that is not valid UTF-8 still becomes a
/// request, which is then rejected as invalid when collected.
pub fn env_flag_requests<I, K, V>(vars: I) -> Vec<FlagRequest>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    vars.into_iter()
        .filter_map(|(key, value)| {
            let name = key
                .as_ref()
                .as_encoded_bytes()
                .strip_prefix(ENV_FLAG_PREFIX.as_bytes())?;
            let name = String::from_utf8_lossy(name);
            let value = value.as_ref().to_string_lossy();
            Some(FlagRequest::new(
                RequestSource::Environment,
                format!("{}={}", name.to_ascii_lowercase(), value),
            ))
        })
        .collect()
}

/// Flag requests collected from every mechanism.
#[derive(Debug, Clone, Default)]
pub struct FlagRequests {
    by_source: BTreeMap<(CapabilityFlag, RequestSource), bool>,
}

impl FlagRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request. `None` leaves the flag at its default for this source.
    pub fn request(
        &mut self,
        source: RequestSource,
        flag: CapabilityFlag,
        state: Option<bool>,
    ) -> Result<(), ResolveError> {
        let Some(enabled) = state else {
            return Ok(());
        };
        match self.by_source.get(&(flag, source)) {
            Some(&existing) if existing != enabled => Err(ResolveError::ConfigurationConflict {
                flag,
                source_kind: source,
            }),
            _ => {
                self.by_source.insert((flag, source), enabled);
                Ok(())
            }
        }
    }

    /// Record a `name=state` request string.
    pub fn request_str(
        &mut self,
        source: RequestSource,
        request: &str,
    ) -> Result<(), ResolveError> {
        let (flag, state) = parse_flag_request(request)?;
        self.request(source, flag, state)
    }

    /// Collect a list of raw requests, in order.
    pub fn collect<'a, I>(requests: I) -> Result<Self, ResolveError>
    where
        I: IntoIterator<Item = &'a FlagRequest>,
    {
        let mut out = Self::new();
        for r in requests {
            out.request_str(r.source, &r.text)?;
        }
        Ok(out)
    }

    /// The winning request for a flag and the mechanism it came from.
    pub fn effective(&self, flag: CapabilityFlag) -> Option<(bool, RequestSource)> {
        self.by_source
            .range((flag, RequestSource::Manifest)..=(flag, RequestSource::CommandLine))
            .next_back()
            .map(|(&(_, source), &enabled)| (enabled, source))
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }
}

/// How a flag's final value was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Provenance {
    Forced { reason: ForceReason },
    Requested { source: RequestSource },
    Default,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Forced { reason } => write!(f, "forced ({reason})"),
            Provenance::Requested { source } => write!(f, "requested ({source})"),
            Provenance::Default => f.write_str("default"),
        }
    }
}

/// The final value of one flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedFlag {
    pub flag: CapabilityFlag,
    pub enabled: bool,
    pub provenance: Provenance,
    /// A request that policy overrode, if any.
    pub overridden_request: Option<bool>,
}

/// The immutable per-run mapping from capability flag to on/off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildConfiguration {
    flags: Vec<ResolvedFlag>,
}

impl BuildConfiguration {
    pub fn is_enabled(&self, flag: CapabilityFlag) -> bool {
        self.get(flag).is_some_and(|r| r.enabled)
    }

    pub fn get(&self, flag: CapabilityFlag) -> Option<&ResolvedFlag> {
        self.flags.iter().find(|r| r.flag == flag)
    }

    /// Every flag in [`CapabilityFlag::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = &ResolvedFlag> {
        self.flags.iter()
    }

    pub fn enabled_flags(&self) -> Vec<CapabilityFlag> {
        self.flags
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.flag)
            .collect()
    }
}

impl fmt::Display for BuildConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.flags {
            writeln!(
                f,
                "  {:<6} {:<4} {}",
                r.flag,
                if r.enabled { "on" } else { "off" },
                r.provenance
            )?;
        }
        Ok(())
    }
}

/// Resolve every flag. Forced-off wins, then the winning request, then the default.
pub fn resolve(requests: &FlagRequests, forced: &ForcedOff) -> BuildConfiguration {
    let flags = CapabilityFlag::ALL
        .into_iter()
        .map(|flag| {
            let requested = requests.effective(flag);
            if let Some(reason) = forced.reason(flag) {
                if let Some((true, source)) = requested {
                    warn!(
                        target: "kiln::resolve",
                        %flag,
                        %source,
                        %reason,
                        "request to enable flag overridden: forced off"
                    );
                }
                return ResolvedFlag {
                    flag,
                    enabled: false,
                    provenance: Provenance::Forced { reason },
                    overridden_request: requested.map(|(enabled, _)| enabled),
                };
            }
            match requested {
                Some((enabled, source)) => ResolvedFlag {
                    flag,
                    enabled,
                    provenance: Provenance::Requested { source },
                    overridden_request: None,
                },
                None => ResolvedFlag {
                    flag,
                    enabled: flag.default_enabled(),
                    provenance: Provenance::Default,
                    overridden_request: None,
                },
            }
        })
        .collect::<Vec<_>>();

    let config = BuildConfiguration { flags };
    debug!(
        target: "kiln::resolve",
        enabled = ?config.enabled_flags(),
        "resolved build configuration"
    );
    config
}
