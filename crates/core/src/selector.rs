//! Equality-based label selectors (`app=web,tier!=db,canary,!legacy`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("empty requirement in selector: {0:?}")]
    Empty(String),
    #[error("invalid label key {key:?} in selector")]
    InvalidKey { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let get = |k: &str| labels.and_then(|l| l.get(k));
        match self {
            Requirement::Equals(k, v) => get(k).is_some_and(|x| x == v),
            // kube semantics: a missing label satisfies `!=`
            Requirement::NotEquals(k, v) => get(k).map_or(true, |x| x != v),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::DoesNotExist(k) => get(k).is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Requirement::Exists(k) => write!(f, "{}", k),
            Requirement::DoesNotExist(k) => write!(f, "!{}", k),
        }
    }
}

/// A conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

fn check_key(key: &str) -> Result<String, SelectorError> {
    let ok = !key.is_empty()
        && key.len() <= 317
        && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if ok { Ok(key.to_string()) } else { Err(SelectorError::InvalidKey { key: key.to_string() }) }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut requirements = Vec::new();
        if s.trim().is_empty() {
            return Ok(Self { requirements });
        }
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(SelectorError::Empty(s.to_string()));
            }
            let req = if let Some((k, v)) = part.split_once("!=") {
                Requirement::NotEquals(check_key(k.trim())?, v.trim().to_string())
            } else if let Some((k, v)) = part.split_once("==") {
                Requirement::Equals(check_key(k.trim())?, v.trim().to_string())
            } else if let Some((k, v)) = part.split_once('=') {
                Requirement::Equals(check_key(k.trim())?, v.trim().to_string())
            } else if let Some(k) = part.strip_prefix('!') {
                Requirement::DoesNotExist(check_key(k.trim())?)
            } else {
                Requirement::Exists(check_key(part)?)
            };
            requirements.push(req);
        }
        Ok(Self { requirements })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for r in &self.requirements {
            if !first { f.write_str(",")?; }
            write!(f, "{}", r)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_all_requirement_forms() {
        let sel: LabelSelector = "app=web, tier!=db,canary,!legacy,env==prod".parse().expect("ok");
        assert_eq!(
            sel.requirements(),
            &[
                Requirement::Equals("app".into(), "web".into()),
                Requirement::NotEquals("tier".into(), "db".into()),
                Requirement::Exists("canary".into()),
                Requirement::DoesNotExist("legacy".into()),
                Requirement::Equals("env".into(), "prod".into()),
            ]
        );
        assert_eq!(sel.to_string(), "app=web,tier!=db,canary,!legacy,env=prod");
    }

    #[test]
    fn matches_conjunction() {
        let sel: LabelSelector = "app=web,!legacy".parse().expect("ok");
        assert!(sel.matches(Some(&labels(&[("app", "web")]))));
        assert!(!sel.matches(Some(&labels(&[("app", "web"), ("legacy", "1")]))));
        assert!(!sel.matches(None));
    }

    #[test]
    fn not_equals_matches_missing_label() {
        let sel: LabelSelector = "tier!=db".parse().expect("ok");
        assert!(sel.matches(None));
        assert!(!sel.matches(Some(&labels(&[("tier", "db")]))));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel: LabelSelector = "  ".parse().expect("ok");
        assert!(sel.is_empty());
        assert!(sel.matches(None));
    }

    #[test]
    fn rejects_bad_input() {
        assert!("app=web,,x".parse::<LabelSelector>().is_err());
        assert!("a b=c".parse::<LabelSelector>().is_err());
        assert!("=v".parse::<LabelSelector>().is_err());
    }
}
