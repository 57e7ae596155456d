// Copyright 2020 Joyent, Inc.

//! Origin-based access control.
//!
//! A procedure's policy is a whitelist and a blacklist of wildcard origin
//! patterns.  `*` matches any run of characters, including none; every other
//! character matches itself.  An origin is authorized when it matches some
//! whitelist pattern and no blacklist pattern.

use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde_derive::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const MATCH_ALL: &str = "*";

/// A wildcard pattern compiled to an anchored regular expression.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OriginPattern {
    source: String,
    regex: Regex,
}

impl OriginPattern {
    pub fn new(pattern: &str) -> Result<OriginPattern, ConfigError> {
        let body: Vec<String> = pattern.split('*').map(regex::escape).collect();
        let regex = Regex::new(&format!("^{}$", body.join(".*")))?;

        Ok(OriginPattern {
            source: String::from(pattern),
            regex,
        })
    }

    pub fn match_all() -> OriginPattern {
        OriginPattern {
            source: String::from(MATCH_ALL),
            regex: Regex::new("^.*$").expect("static pattern"),
        }
    }

    pub fn matches(&self, origin: &str) -> bool {
        self.regex.is_match(origin)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl FromStr for OriginPattern {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OriginPattern::new(s)
    }
}

impl TryFrom<String> for OriginPattern {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        OriginPattern::new(&s)
    }
}

impl From<OriginPattern> for String {
    fn from(pattern: OriginPattern) -> String {
        pattern.source
    }
}

impl PartialEq for OriginPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl fmt::Debug for OriginPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OriginPattern({:?})", self.source)
    }
}

impl fmt::Display for OriginPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    pub whitelist: Vec<OriginPattern>,
    pub blacklist: Vec<OriginPattern>,
}

impl AccessPolicy {
    pub fn new<W, B>(whitelist: W, blacklist: B) -> Result<AccessPolicy, ConfigError>
    where
        W: IntoIterator,
        W::Item: AsRef<str>,
        B: IntoIterator,
        B::Item: AsRef<str>,
    {
        let whitelist = whitelist
            .into_iter()
            .map(|p| OriginPattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let blacklist = blacklist
            .into_iter()
            .map(|p| OriginPattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AccessPolicy {
            whitelist,
            blacklist,
        })
    }

    pub fn authorize(&self, origin: &str) -> bool {
        let whitelisted = self.whitelist.iter().any(|p| p.matches(origin));
        let blacklisted = self.blacklist.iter().any(|p| p.matches(origin));

        whitelisted && !blacklisted
    }
}

impl Default for AccessPolicy {
    fn default() -> Self {
        AccessPolicy {
            whitelist: vec![OriginPattern::match_all()],
            blacklist: Vec::new(),
        }
    }
}
