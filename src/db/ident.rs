//! Identifier allow-list applied before any name reaches generated SQL.
//!
//! Table, column, schema, function, trigger and index names come from live schema
//! introspection and are spliced into DDL/DML text, so nothing but a plain
//! `[A-Za-z_][A-Za-z0-9_]*` name of at most 63 bytes (the Postgres identifier limit) is
//! ever accepted.

use crate::error::CastorError;
use std::fmt;

/// Postgres truncates longer identifiers silently, which could make two derived names collide.
pub const MAX_IDENT_LEN: usize = 63;

/// A validated SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    /// Validates `name`; `what` names the kind of object for the error message.
    pub fn parse(name: &str, what: &'static str) -> Result<Self, CastorError> {
        if is_valid(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(CastorError::rejected(what, name))
        }
    }

    /// Constant names known to be valid (`main`, `public`).
    pub(crate) fn from_static(name: &'static str) -> Self {
        debug_assert!(is_valid(name), "invalid static identifier {name:?}");
        Self(name.to_string())
    }

    /// Builds a derived name (e.g. `trg_mirror_<table>_ai`) and validates the result.
    pub fn derived(
        prefix: &str,
        base: &Ident,
        suffix: &str,
        what: &'static str,
    ) -> Result<Self, CastorError> {
        Self::parse(&format!("{prefix}{}{suffix}", base.0), what)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for SQLite and Postgres.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0.replace('"', "\"\""))
    }

    /// Single-quoted string literal of the name, for catalog lookups inside generated bodies.
    pub fn literal(&self) -> String {
        format!("'{}'", self.0.replace('\'', "''"))
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ident {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn is_valid(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IDENT_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `schema.table`, both quoted.
pub fn qualified(schema: &Ident, table: &Ident) -> String {
    format!("{}.{}", schema.quoted(), table.quoted())
}

/// Comma-separated quoted list, optionally prefixed (`NEW.`, `OLD.`, `EXCLUDED.`).
pub fn column_list(columns: &[Ident], prefix: &str) -> String {
    columns
        .iter()
        .map(|c| format!("{prefix}{}", c.quoted()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validates a Postgres type as printed by `format_type()`.
///
/// Accepts words, spaces, dots, an optional numeric modifier such as `(10,2)` and array
/// brackets: `character varying(100)`, `numeric(12,2)`, `timestamp without time zone`,
/// `integer[]`.
pub fn validate_type_name(type_name: &str) -> Result<&str, CastorError> {
    let rejected = || CastorError::rejected("type", type_name);

    let (base, rest) = match type_name.find('(') {
        Some(i) => (&type_name[..i], &type_name[i..]),
        None => match type_name.find('[') {
            Some(i) => (&type_name[..i], &type_name[i..]),
            None => (type_name, ""),
        },
    };

    let base = base.trim_end();
    let mut chars = base.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !first_ok
        || !base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ' || c == '.')
    {
        return Err(rejected());
    }

    let rest = match rest.strip_prefix('(') {
        Some(after) => {
            let close = after.find(')').ok_or_else(rejected)?;
            let modifier = &after[..close];
            let modifier_ok = !modifier.is_empty()
                && modifier
                    .split(',')
                    .all(|part| !part.trim().is_empty() && part.trim().chars().all(|c| c.is_ascii_digit()));
            if !modifier_ok {
                return Err(rejected());
            }
            &after[close + 1..]
        }
        None => rest,
    };

    let mut brackets = rest;
    while let Some(after) = brackets.strip_prefix("[]") {
        brackets = after;
    }
    if !brackets.is_empty() {
        return Err(rejected());
    }

    Ok(type_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        for name in ["cargos", "_private", "Table1", "id_cargo", "a"] {
            assert!(Ident::parse(name, "table").is_ok(), "{name} should be accepted");
        }
    }

    #[test]
    fn rejects_everything_else() {
        for name in [
            "",
            "1abc",
            "bad-name",
            "drop table x;--",
            "a b",
            "quo\"te",
            "semi;colon",
            "tábla",
            "x.y",
        ] {
            let err = Ident::parse(name, "table").unwrap_err();
            assert!(
                matches!(err, CastorError::IdentifierRejected { what: "table", .. }),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_names_over_the_postgres_limit() {
        let long = "a".repeat(MAX_IDENT_LEN + 1);
        assert!(Ident::parse(&long, "table").is_err());
        assert!(Ident::parse(&"a".repeat(MAX_IDENT_LEN), "table").is_ok());
    }

    #[test]
    fn derived_names_are_validated_too() {
        let table = Ident::parse(&"t".repeat(60), "table").unwrap();
        assert!(Ident::derived("trg_mirror_", &table, "_ai", "trigger").is_err());

        let table = Ident::parse("cargos", "table").unwrap();
        let trigger = Ident::derived("trg_mirror_", &table, "_ai", "trigger").unwrap();
        assert_eq!(trigger.as_str(), "trg_mirror_cargos_ai");
    }

    #[test]
    fn quoting_and_lists() {
        let schema = Ident::parse("mirror", "schema").unwrap();
        let table = Ident::parse("cargos", "table").unwrap();
        assert_eq!(qualified(&schema, &table), "\"mirror\".\"cargos\"");
        assert_eq!(table.literal(), "'cargos'");

        let cols = vec![
            Ident::parse("id_cargo", "column").unwrap(),
            Ident::parse("nombre_cargo", "column").unwrap(),
        ];
        assert_eq!(column_list(&cols, ""), "\"id_cargo\", \"nombre_cargo\"");
        assert_eq!(
            column_list(&cols, "NEW."),
            "NEW.\"id_cargo\", NEW.\"nombre_cargo\""
        );
    }

    #[test]
    fn type_names() {
        for ok in [
            "integer",
            "character varying(100)",
            "numeric(12,2)",
            "numeric(12, 2)",
            "timestamp without time zone",
            "integer[]",
            "text[][]",
            "public.my_enum",
        ] {
            assert!(validate_type_name(ok).is_ok(), "{ok:?} should be accepted");
        }
        for bad in [
            "",
            "integer; drop table x",
            "text)",
            "numeric(a)",
            "numeric()",
            "int[1]",
            "varchar(10) default 'x'",
        ] {
            assert!(validate_type_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
