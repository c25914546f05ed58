use crate::db::ConnectionTarget;
use castor_schema::{Dialect, MirrorMode};
use std::path::Path;

/// Picks the mirroring strategy from the primary dialect and configuration.
///
/// A Postgres primary with its own mirror DSN is replicated by infrastructure (`External`);
/// without one the mirror is a schema inside the primary (`Schema`). SQLite mirrors are
/// attached files and need a path.
pub fn detect(
    primary: &ConnectionTarget,
    explicit_mirror_url: Option<&str>,
    mirror_path: Option<&Path>,
) -> MirrorMode {
    match primary.dialect() {
        Dialect::Postgres if explicit_mirror_url.is_some_and(|u| !u.trim().is_empty()) => {
            MirrorMode::External
        }
        Dialect::Postgres => MirrorMode::Schema,
        Dialect::Sqlite if mirror_path.is_some() => MirrorMode::Attached,
        Dialect::Sqlite => MirrorMode::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castor_schema::Role;

    fn primary(dsn: &str) -> ConnectionTarget {
        ConnectionTarget::new(Role::Primary, dsn).unwrap()
    }

    #[test]
    fn postgres_modes() {
        let pg = primary("postgres://app@db-primary/hr");
        assert_eq!(
            detect(&pg, Some("postgres://app@db-mirror/hr"), None),
            MirrorMode::External
        );
        assert_eq!(detect(&pg, None, None), MirrorMode::Schema);
        assert_eq!(detect(&pg, Some("  "), None), MirrorMode::Schema);
    }

    #[test]
    fn sqlite_modes() {
        let lite = primary("sqlite://data.db");
        assert_eq!(
            detect(&lite, None, Some(Path::new("data_mirror.db"))),
            MirrorMode::Attached
        );
        assert_eq!(detect(&lite, None, None), MirrorMode::Unknown);
    }
}
