use std::{collections::HashMap, fmt, str::FromStr};
use serde::{Deserialize, Serialize};

use crate::prelude::*;


/// Message shown for every error key that has no entry in the catalog.
pub(crate) const DEFAULT_MESSAGE: &str = "An error occurred. Please contact support.";

/// Languages error messages can be written in.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LangKey {
    #[serde(alias = "*")]
    Default,
    En,
    De,
}

impl LangKey {
    /// Picks the first supported language from the value of an
    /// `Accept-Language` header. Quality values are ignored; the header is
    /// expected to be ordered by preference, which browsers do.
    pub(crate) fn from_accept_language(header: &str) -> Self {
        header.split(',')
            .filter_map(|part| part.split(';').next())
            .filter_map(|tag| tag.trim().split('-').next())
            .find_map(|primary| primary.to_ascii_lowercase().parse::<LangKey>().ok())
            .unwrap_or(LangKey::Default)
    }
}

impl fmt::Display for LangKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl AsRef<str> for LangKey {
    fn as_ref(&self) -> &str {
        match self {
            LangKey::Default => "default",
            LangKey::En => "en",
            LangKey::De => "de",
        }
    }
}

impl FromStr for LangKey {
    type Err = serde::de::value::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::deserialize(serde::de::value::BorrowedStrDeserializer::new(s))
    }
}


#[derive(Debug, thiserror::Error)]
pub(crate) enum CatalogError {
    #[error("error message catalog is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("error message catalog must include the 'default' language")]
    MissingDefault,
}

/// Maps error keys to human readable messages, per language. Loaded once at
/// startup and never changed afterwards.
#[derive(Debug)]
pub(crate) struct Catalog(HashMap<LangKey, HashMap<String, String>>);

impl Catalog {
    /// Parses the catalog that is compiled into the binary.
    pub(crate) fn embedded() -> Result<Self, CatalogError> {
        Self::from_json(include_str!("error_messages.json"))
    }

    pub(crate) fn from_json(json: &str) -> Result<Self, CatalogError> {
        let map: HashMap<LangKey, HashMap<String, String>> = serde_json::from_str(json)?;
        if !map.contains_key(&LangKey::Default) {
            return Err(CatalogError::MissingDefault);
        }

        let num_keys = map[&LangKey::Default].len();
        debug!("Loaded error message catalog ({num_keys} keys, {} languages)", map.len());
        Ok(Self(map))
    }

    /// Returns the message for `key` in `lang`, falling back to the default
    /// language and then to [`DEFAULT_MESSAGE`]. Empty messages count as
    /// missing.
    pub(crate) fn message(&self, lang: LangKey, key: &str) -> &str {
        let lookup = |lang: LangKey| self.0.get(&lang)
            .and_then(|messages| messages.get(key))
            .map(String::as_str)
            .filter(|msg| !msg.is_empty());

        lookup(lang)
            .or_else(|| lookup(LangKey::Default))
            .unwrap_or(DEFAULT_MESSAGE)
    }

    /// Iterates over all keys of the default language.
    #[cfg(test)]
    pub(crate) fn keys(&self) -> impl Iterator<Item = &str> {
        self.0[&LangKey::Default].keys().map(String::as_str)
    }
}


#[cfg(test)]
mod tests {
    use super::{Catalog, CatalogError, DEFAULT_MESSAGE, LangKey};

    const JSON: &str = r#"{
        "default": { "errorA": "A happened", "errorEmpty": "" },
        "de": { "errorA": "A ist passiert" }
    }"#;

    #[test]
    fn embedded_catalog_is_valid() {
        let catalog = Catalog::embedded().unwrap();
        assert!(catalog.keys().any(|k| k == "errorNoteNotFound"));
        for key in catalog.keys() {
            assert_ne!(catalog.message(LangKey::Default, key), DEFAULT_MESSAGE);
            assert_ne!(catalog.message(LangKey::De, key), DEFAULT_MESSAGE);
        }
    }

    #[test]
    fn lookup_falls_back_to_default_language() {
        let catalog = Catalog::from_json(JSON).unwrap();
        assert_eq!(catalog.message(LangKey::De, "errorA"), "A ist passiert");
        assert_eq!(catalog.message(LangKey::En, "errorA"), "A happened");
        assert_eq!(catalog.message(LangKey::Default, "errorA"), "A happened");
    }

    #[test]
    fn missing_key_yields_default_message() {
        let catalog = Catalog::from_json(JSON).unwrap();
        assert_eq!(catalog.message(LangKey::De, "errorNope"), DEFAULT_MESSAGE);
        assert_eq!(catalog.message(LangKey::Default, "errorEmpty"), DEFAULT_MESSAGE);
        assert_eq!(catalog.message(LangKey::Default, ""), DEFAULT_MESSAGE);
    }

    #[test]
    fn malformed_catalogs_are_rejected() {
        assert!(matches!(Catalog::from_json("{ nope"), Err(CatalogError::Json(_))));
        assert!(matches!(Catalog::from_json(r#"{ "xx": {} }"#), Err(CatalogError::Json(_))));
        assert!(matches!(
            Catalog::from_json(r#"{ "en": { "a": "b" } }"#),
            Err(CatalogError::MissingDefault),
        ));
    }

    #[test]
    fn language_from_accept_language() {
        assert_eq!(LangKey::from_accept_language("de-CH, en;q=0.8"), LangKey::De);
        assert_eq!(LangKey::from_accept_language("fr-FR,EN-us;q=0.7"), LangKey::En);
        assert_eq!(LangKey::from_accept_language("fr"), LangKey::Default);
        assert_eq!(LangKey::from_accept_language(""), LangKey::Default);
        assert_eq!(LangKey::from_accept_language("*"), LangKey::Default);
    }
}
