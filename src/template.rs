// src/template.rs
//! Typed `${...}` substitution for provider call templates.
//!
//! Supported tokens: `${symbol}`, `${function}`, `${startDate}`, `${endDate}`
//! and `${secrets.NAME}`. Anything else is an error; nothing is evaluated.

use chrono::NaiveDate;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::config::CallTemplate;

const DATE_FORMAT: &str = "%Y-%m-%d";
const SECRETS_PREFIX: &str = "secrets.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template token ${{{0}}}")]
    UnboundToken(String),
    #[error("secret {0} is not available")]
    MissingSecret(String),
    #[error("unsupported value for {0}: only strings, numbers and booleans can be sent")]
    UnsupportedValue(String),
}

/// Secret values bound into templates. Never printed.
#[derive(Clone, Default)]
pub struct Secrets(BTreeMap<String, String>);

impl Secrets {
    pub fn from_env<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = BTreeMap::new();
        for n in names {
            let n = n.as_ref();
            match std::env::var(n) {
                Ok(v) => {
                    out.insert(n.to_string(), v);
                }
                Err(_) => tracing::warn!(secret = n, "secret referenced by templates is not set"),
            }
        }
        Self(out)
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.0.insert(name.to_string(), value.to_string());
        self
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Bindings<'a> {
    pub symbol: &'a str,
    pub function: &'a str,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub secrets: &'a Secrets,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

fn token_regex() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_.]+)\}").expect("template token regex"))
}

pub fn resolve(template: &CallTemplate, b: &Bindings<'_>) -> Result<ResolvedRequest, TemplateError> {
    Ok(ResolvedRequest {
        url: substitute(&template.url, b)?,
        query: resolve_map(&template.parameters, b)?,
        headers: resolve_map(&template.headers, b)?,
    })
}

fn resolve_map(
    map: &BTreeMap<String, Value>,
    b: &Bindings<'_>,
) -> Result<Vec<(String, String)>, TemplateError> {
    map.iter()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => substitute(s, b)?,
                Value::Number(n) => n.to_string(),
                Value::Bool(x) => x.to_string(),
                _ => return Err(TemplateError::UnsupportedValue(k.clone())),
            };
            Ok((k.clone(), value))
        })
        .collect()
}

pub fn substitute(raw: &str, b: &Bindings<'_>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(raw.len());
    let mut last = 0;
    for caps in token_regex().captures_iter(raw) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&raw[last..whole.start()]);
        out.push_str(&lookup(&caps[1], b)?);
        last = whole.end();
    }
    out.push_str(&raw[last..]);
    Ok(out)
}

fn lookup(token: &str, b: &Bindings<'_>) -> Result<String, TemplateError> {
    match token {
        "symbol" => Ok(b.symbol.to_string()),
        "function" => Ok(b.function.to_string()),
        "startDate" => Ok(b.start_date.format(DATE_FORMAT).to_string()),
        "endDate" => Ok(b.end_date.format(DATE_FORMAT).to_string()),
        t => match t.strip_prefix(SECRETS_PREFIX) {
            Some(name) => b
                .secrets
                .get(name)
                .map(str::to_string)
                .ok_or_else(|| TemplateError::MissingSecret(name.to_string())),
            None => Err(TemplateError::UnboundToken(t.to_string())),
        },
    }
}

/// Secret names referenced in a raw template string.
pub(crate) fn secret_references(raw: &str) -> Vec<String> {
    token_regex()
        .captures_iter(raw)
        .filter_map(|c| c[1].strip_prefix(SECRETS_PREFIX).map(str::to_string))
        .collect()
}
