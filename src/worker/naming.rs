//! Process names as recorded in the ledger: `schema.TableName` for tables,
//! the step name for callables.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::ConfigError;

/// Strips configured namespace prefixes from schema names.
#[derive(Debug, Clone)]
pub struct PrefixStripper {
    pattern: Regex,
}

impl PrefixStripper {
    /// Compile `prefixes` as one regex alternation.
    pub fn new(prefixes: &[String]) -> Result<Self, ConfigError> {
        let pattern = Regex::new(&prefixes.join("|")).map_err(|e| ConfigError::InvalidValue {
            key: "namespace_prefixes".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { pattern })
    }

    /// Schema name without backticks and without any prefix match.
    pub fn strip(&self, schema: &str) -> String {
        self.pattern
            .replace_all(schema.trim_matches('`'), "")
            .into_owned()
    }

    /// `schema.TableName` for a schema and a raw table name.
    pub fn process_name(&self, schema: &str, table: &str) -> String {
        format!(
            "{}.{}",
            self.strip(schema),
            to_camel_case(table.trim_matches('`'))
        )
    }

    /// Process name from a `` `schema`.`table` `` identifier.
    pub fn process_name_for(&self, full_table_name: &str) -> Option<String> {
        let (schema, table) = full_table_name.split_once('.')?;
        Some(self.process_name(schema, table))
    }
}

/// Start of the string or a separator run, followed by a letter.
static WORD_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[_\W])+[a-zA-Z]").expect("literal pattern"));

/// Convert a table name to CamelCase.
///
/// Each match of `(^|[_\W])+[a-zA-Z]` collapses into its letter, uppercased.
/// Separators followed by anything other than a letter are kept.
pub fn to_camel_case(name: &str) -> String {
    WORD_START
        .replace_all(name, |caps: &Captures| {
            caps[0]
                .chars()
                .last()
                .map(|c| c.to_ascii_uppercase().to_string())
                .unwrap_or_default()
        })
        .into_owned()
}
