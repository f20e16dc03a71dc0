// src/config/providers.rs
//! Static provider configuration: rate limits, call templates and the symbols
//! each call type is fetched for.
//!
//! The set is loaded once per process and shared read-only. Enumeration order
//! (providers as listed, call types lexicographically, symbols as listed) is
//! stable across invocations, which is what checkpoint resumption relies on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::task::{Task, KEY_SEPARATOR};

pub const ENV_PROVIDERS_CONFIG_PATH: &str = "PROVIDERS_CONFIG_PATH";
pub const DEFAULT_PROVIDERS_TOML: &str = "config/providers.toml";
pub const DEFAULT_PROVIDERS_JSON: &str = "config/providers.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub per_minute: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_hour: Option<u32>,
}

impl RateLimit {
    pub fn per_minute(per_minute: u32) -> Self {
        Self {
            per_minute,
            per_hour: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesOrder {
    Asc,
    Desc,
}

/// Where the series lives in a provider response. Forwarded untouched to the
/// storage side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseShape {
    pub order: SeriesOrder,
    #[serde(default)]
    pub array: bool,
    #[serde(default)]
    pub series_property: String,
    pub date_property: String,
    pub value_property: String,
}

/// Provider request shape with `${...}` placeholders, see [`crate::template`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTemplate {
    pub url: String,
    pub function: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    pub response: ResponseShape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallConfig {
    #[serde(flatten)]
    pub template: CallTemplate,
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub provider: String,
    #[serde(default)]
    pub disabled: bool,
    pub rate_limit: RateLimit,
    pub calls: BTreeMap<String, CallConfig>,
}

impl ProviderConfig {
    /// All tasks of this provider in enumeration order.
    pub fn tasks(&self) -> impl Iterator<Item = Task> + '_ {
        self.calls.iter().flat_map(move |(call_type, call)| {
            call.symbols.iter().map(move |symbol| Task {
                provider: self.provider.clone(),
                call_type: call_type.clone(),
                symbol: symbol.clone(),
                call_template: call.template.clone(),
            })
        })
    }

    pub fn task_count(&self) -> usize {
        self.calls.values().map(|c| c.symbols.len()).sum()
    }

    fn validate(&mut self) -> Result<()> {
        check_key_part("provider name", &self.provider)?;
        if self.rate_limit.per_minute == 0 {
            return Err(PipelineError::InvalidProvider(format!(
                "{}: rateLimit.perMinute must be at least 1",
                self.provider
            )));
        }
        if self.rate_limit.per_hour == Some(0) {
            return Err(PipelineError::InvalidProvider(format!(
                "{}: rateLimit.perHour must be at least 1",
                self.provider
            )));
        }
        for (call_type, call) in self.calls.iter_mut() {
            check_key_part("call type", call_type)?;
            check_key_part("function", &call.template.function)?;
            for symbol in &call.symbols {
                check_key_part("symbol", symbol)?;
            }
            let before = call.symbols.len();
            let mut seen = HashSet::new();
            call.symbols.retain(|s| seen.insert(s.clone()));
            if call.symbols.len() != before {
                tracing::warn!(
                    provider = %self.provider,
                    call_type = %call_type,
                    dropped = before - call.symbols.len(),
                    "duplicate symbols dropped"
                );
            }
        }
        Ok(())
    }
}

fn check_key_part(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PipelineError::InvalidProvider(format!("empty {what}")));
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(PipelineError::InvalidProvider(format!(
            "{what} {value:?} must not contain '{KEY_SEPARATOR}'"
        )));
    }
    Ok(())
}

/// Immutable, validated provider set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderSet {
    providers: Vec<ProviderConfig>,
}

#[derive(Deserialize)]
struct ProvidersFile {
    providers: Vec<ProviderConfig>,
}

impl ProviderSet {
    pub fn new(mut providers: Vec<ProviderConfig>) -> Result<Self> {
        let mut names = HashSet::new();
        for p in providers.iter_mut() {
            p.validate()?;
            if !names.insert(p.provider.clone()) {
                return Err(PipelineError::InvalidProvider(format!(
                    "provider {} configured twice",
                    p.provider
                )));
            }
        }
        Ok(Self { providers })
    }

    /// Load from an explicit path. Supports TOML (`[[providers]]`) or JSON
    /// (either `{"providers": [...]}` or a bare array).
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let providers = parse_providers(&content, &ext).map_err(|message| PipelineError::Parse {
            path: path.display().to_string(),
            message,
        })?;
        Self::new(providers)
    }

    /// Load using env var + fallbacks:
    /// 1) $PROVIDERS_CONFIG_PATH
    /// 2) config/providers.toml
    /// 3) config/providers.json
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PROVIDERS_CONFIG_PATH) {
            let pb = PathBuf::from(&p);
            if !pb.exists() {
                return Err(PipelineError::InvalidSetting {
                    field: ENV_PROVIDERS_CONFIG_PATH,
                    value: p,
                });
            }
            return Self::load_from(&pb);
        }
        for candidate in [DEFAULT_PROVIDERS_TOML, DEFAULT_PROVIDERS_JSON] {
            let pb = PathBuf::from(candidate);
            if pb.exists() {
                return Self::load_from(&pb);
            }
        }
        Err(PipelineError::MissingSetting(ENV_PROVIDERS_CONFIG_PATH))
    }

    /// Returns a copy with the named providers disabled.
    pub fn disable<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        for p in self.providers.iter_mut() {
            if names.iter().any(|n| n.as_ref() == p.provider) {
                p.disabled = true;
            }
        }
        self
    }

    /// Returns a copy with every provider except the named ones disabled.
    pub fn only<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        for p in self.providers.iter_mut() {
            p.disabled = !names.iter().any(|n| n.as_ref() == p.provider);
        }
        self
    }

    pub fn all(&self) -> &[ProviderConfig] {
        &self.providers
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| !p.disabled)
    }

    pub fn get(&self, provider: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.provider == provider)
    }

    pub fn rate_limits(&self) -> BTreeMap<String, RateLimit> {
        self.enabled()
            .map(|p| (p.provider.clone(), p.rate_limit))
            .collect()
    }

    /// Names referenced as `${secrets.NAME}` anywhere in the templates.
    pub fn secret_names(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for p in &self.providers {
            for call in p.calls.values() {
                let t = &call.template;
                let strings = std::iter::once(&t.url).chain(
                    t.parameters
                        .values()
                        .chain(t.headers.values())
                        .filter_map(|v| match v {
                            Value::String(s) => Some(s),
                            _ => None,
                        }),
                );
                for s in strings {
                    out.extend(crate::template::secret_references(s));
                }
            }
        }
        out
    }
}

fn parse_providers(s: &str, hint_ext: &str) -> std::result::Result<Vec<ProviderConfig>, String> {
    if hint_ext == "toml" {
        let f: ProvidersFile = toml::from_str(s).map_err(|e| e.to_string())?;
        return Ok(f.providers);
    }
    if let Ok(f) = serde_json::from_str::<ProvidersFile>(s) {
        return Ok(f.providers);
    }
    match serde_json::from_str::<Vec<ProviderConfig>>(s) {
        Ok(v) => Ok(v),
        Err(json_err) => {
            // Unknown extension: last resort is TOML.
            toml::from_str::<ProvidersFile>(s)
                .map(|f| f.providers)
                .map_err(|_| json_err.to_string())
        }
    }
}
