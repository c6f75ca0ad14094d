//! Regex-driven key transformations. Applied left to right; an empty output
//! suppresses enqueueing.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyTransformationConfig {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub regex: String,
    #[serde(default)]
    pub replacement: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Replace,
    Drop,
    Keep,
}

#[derive(Debug, Clone)]
pub struct KeyTransformation {
    action: Action,
    regex: Regex,
    replacement: String,
}

impl KeyTransformation {
    pub fn new(config: &KeyTransformationConfig) -> Result<Self> {
        let action = match config.action.as_str() {
            "" | "replace" => Action::Replace,
            "drop" => Action::Drop,
            "keep" => Action::Keep,
            other => bail!("unknown key transformation action {:?}", other),
        };

        let regex_str = if config.regex.is_empty() {
            "(.*)"
        } else {
            &config.regex
        };
        let regex = Regex::new(regex_str).context("compiling key transformation regex")?;

        let replacement = if config.replacement.is_empty() {
            "$1".to_string()
        } else {
            config.replacement.clone()
        };

        Ok(KeyTransformation {
            action,
            regex,
            replacement,
        })
    }

    pub fn transform(&self, key: &str) -> String {
        match self.action {
            Action::Replace => match self.regex.captures(key) {
                Some(caps) => {
                    let mut out = String::new();
                    caps.expand(&self.replacement, &mut out);
                    out
                }
                None => key.to_string(),
            },
            Action::Drop => {
                if self.regex.is_match(key) {
                    String::new()
                } else {
                    key.to_string()
                }
            }
            Action::Keep => {
                if self.regex.is_match(key) {
                    key.to_string()
                } else {
                    String::new()
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeyTransformations(Vec<KeyTransformation>);

impl KeyTransformations {
    pub fn new(configs: &[KeyTransformationConfig]) -> Result<Self> {
        configs
            .iter()
            .map(KeyTransformation::new)
            .collect::<Result<Vec<_>>>()
            .map(KeyTransformations)
    }

    pub fn transform(&self, key: &str) -> String {
        self.0
            .iter()
            .fold(key.to_string(), |cur, t| t.transform(&cur))
    }
}
