//! Supported languages and the images that run them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Resolves a language identifier to the image and command that run it.
pub trait TagResolver: Send + Sync {
    /// Image tag for the language.
    fn image_for(&self, language: &str) -> Option<String>;

    /// Command run inside the sandbox, relative to the working directory.
    fn command_for(&self, language: &str) -> Option<Vec<String>>;
}

/// Decides whether a language identifier is supported.
pub trait LanguageValidator: Send + Sync {
    fn is_supported(&self, language: &str) -> bool;
}

/// One entry of the `[languages]` config table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub image: String,
    pub command: Vec<String>,
}

impl LanguageSpec {
    fn new(image: &str, command: &[&str]) -> Self {
        Self {
            image: image.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Table of supported languages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageCatalog {
    languages: BTreeMap<String, LanguageSpec>,
}

impl Default for LanguageCatalog {
    fn default() -> Self {
        let languages = BTreeMap::from([
            (
                "python".to_string(),
                LanguageSpec::new("python:3.12-slim", &["python3", "-u", "main.py"]),
            ),
            (
                "node".to_string(),
                LanguageSpec::new("node:20-slim", &["node", "index.js"]),
            ),
            (
                "ruby".to_string(),
                LanguageSpec::new("ruby:3.3-slim", &["ruby", "main.rb"]),
            ),
            (
                "bash".to_string(),
                LanguageSpec::new("bash:5", &["bash", "main.sh"]),
            ),
        ]);
        Self { languages }
    }
}

impl LanguageCatalog {
    pub fn new(languages: BTreeMap<String, LanguageSpec>) -> Self {
        Self { languages }
    }

    pub fn get(&self, language: &str) -> Option<&LanguageSpec> {
        self.languages.get(language)
    }

    /// All configured images, for the startup image check.
    pub fn images(&self) -> impl Iterator<Item = &str> {
        self.languages.values().map(|spec| spec.image.as_str())
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

impl TagResolver for LanguageCatalog {
    fn image_for(&self, language: &str) -> Option<String> {
        self.get(language).map(|spec| spec.image.clone())
    }

    fn command_for(&self, language: &str) -> Option<Vec<String>> {
        self.get(language).map(|spec| spec.command.clone())
    }
}

impl LanguageValidator for LanguageCatalog {
    fn is_supported(&self, language: &str) -> bool {
        self.languages.contains_key(language)
    }
}
