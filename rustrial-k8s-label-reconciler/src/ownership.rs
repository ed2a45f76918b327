use crate::errors::ControllerError;
use regex::Regex;

/// The label key prefixes resource patches may claim ownership of.
///
/// A resource patch may only declare ownership patterns of the exact form
/// `{prefix}/.*` for one of these prefixes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct AllowedPrefixSet {
    prefixes: Vec<String>,
}

impl AllowedPrefixSet {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tmp: Vec<String> = Vec::new();
        for prefix in prefixes {
            let prefix = prefix.as_ref().trim();
            let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
            if !prefix.is_empty() && !tmp.iter().any(|p| p == prefix) {
                tmp.push(prefix.to_string());
            }
        }
        Self { prefixes: tmp }
    }

    /// Parse a comma separated list of prefixes.
    pub fn parse(value: &str) -> Self {
        Self::new(value.split(","))
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.prefixes.iter().map(|v| v.as_str())
    }

    fn allows(&self, pattern: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            pattern
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest == "/.*")
        })
    }

    /// Verify that every ownership pattern is derived from an allowed prefix.
    ///
    /// Fails on the first offending pattern, in which case the whole resource
    /// patch must be rejected.
    pub fn validate<S: AsRef<str>>(&self, patterns: &[S]) -> Result<(), ControllerError> {
        match patterns.iter().find(|p| !self.allows(p.as_ref())) {
            Some(pattern) => Err(ControllerError::RejectedOwnership(
                pattern.as_ref().to_string(),
            )),
            None => Ok(()),
        }
    }
}

impl std::fmt::Display for AllowedPrefixSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.iter().collect::<Vec<&str>>().join(","))
    }
}

/// Compiled ownership patterns of a single resource patch.
#[derive(Clone, Debug)]
pub(crate) struct OwnershipMatcher {
    patterns: Vec<Regex>,
}

impl OwnershipMatcher {
    /// Compile the ownership patterns, each anchored to match the complete label key.
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ControllerError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(format!("^(?:{})$", p.as_ref()).as_str()).map_err(|source| {
                    ControllerError::InvalidOwnershipRegex {
                        pattern: p.as_ref().to_string(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<Regex>, ControllerError>>()?;
        Ok(Self { patterns })
    }

    pub fn is_owned(&self, key: &str) -> bool {
        self.patterns.iter().any(|r| r.is_match(key))
    }
}
