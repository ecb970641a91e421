//! Migration units.
//!
//! A unit is a named, ordered pair of forward and reverse operation lists.
//! Names are `<timestamp>_<description>`. Units are ordered by name, and
//! every unit in a set must use the same timestamp width, so name order is
//! timestamp order.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::error::{MigrateError, Result};
use crate::operations::Operation;

/// Which operation list of a unit is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Apply `forward`.
    Forward,
    /// Apply `reverse`.
    Reverse,
}

/// One named, reversible schema/data change.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationUnit {
    name: String,
    forward: Vec<Operation>,
    reverse: Vec<Operation>,
}

impl MigrationUnit {
    /// Creates a unit with explicitly authored reverse operations.
    pub fn new(
        name: impl Into<String>,
        forward: Vec<Operation>,
        reverse: Vec<Operation>,
    ) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            forward,
            reverse,
        })
    }

    /// Creates a unit whose reverse list is derived from `forward`.
    ///
    /// Each forward operation is inverted and the inverses run in the
    /// opposite order. Fails if any operation has no mechanical inverse.
    pub fn auto_reversed(name: impl Into<String>, forward: Vec<Operation>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        let reverse = forward
            .iter()
            .rev()
            .map(Operation::reverse)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| MigrateError::NotReversible(name.clone()))?;
        Ok(Self {
            name,
            forward,
            reverse,
        })
    }

    /// Unit name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Timestamp prefix of the name.
    #[must_use]
    pub fn timestamp(&self) -> &str {
        self.name
            .split_once('_')
            .map_or(self.name.as_str(), |(ts, _)| ts)
    }

    /// Forward operations.
    #[must_use]
    pub fn forward(&self) -> &[Operation] {
        &self.forward
    }

    /// Reverse operations.
    #[must_use]
    pub fn reverse(&self) -> &[Operation] {
        &self.reverse
    }

    /// The operation list for a direction.
    #[must_use]
    pub fn operations(&self, direction: Direction) -> &[Operation] {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Reverse => &self.reverse,
        }
    }

    /// SHA-256 over the canonical JSON form of both operation lists.
    ///
    /// Stored in the ledger to detect units edited after being applied.
    pub fn checksum(&self) -> Result<String> {
        let canonical = serde_json::to_vec(&(&self.forward, &self.reverse))?;
        Ok(format!("{:x}", Sha256::digest(&canonical)))
    }
}

/// Checks that a name is `<digits>_<description>`.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| MigrateError::InvalidMigrationName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let (timestamp, description) = name
        .split_once('_')
        .ok_or_else(|| invalid("expected <timestamp>_<description>"))?;

    if timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("timestamp prefix must be ASCII digits"));
    }
    if description.is_empty() {
        return Err(invalid("description is empty"));
    }
    if !description
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(invalid(
            "description may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

/// Returns the units sorted by name, rejecting duplicate names and
/// timestamps of differing widths (`9_a` would sort after `10_b`).
pub fn ordered(units: &[MigrationUnit]) -> Result<Vec<&MigrationUnit>> {
    let mut seen = HashSet::new();
    for unit in units {
        if !seen.insert(unit.name()) {
            return Err(MigrateError::DuplicateMigrationName(unit.name().to_string()));
        }
    }
    if let Some(first) = units.first() {
        let width = first.timestamp().len();
        if let Some(odd) = units.iter().find(|u| u.timestamp().len() != width) {
            return Err(MigrateError::InvalidMigrationName {
                name: odd.name().to_string(),
                reason: format!(
                    "timestamp has {} digits but '{}' has {}",
                    odd.timestamp().len(),
                    first.name(),
                    width
                ),
            });
        }
    }
    let mut sorted: Vec<&MigrationUnit> = units.iter().collect();
    sorted.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(sorted)
}

/// Trait for migration units compiled into the binary.
///
/// ```rust,ignore
/// struct CreateThemes;
///
/// impl LedgerMigration for CreateThemes {
///     const NAME: &'static str = "20180102093122_create_themes";
///
///     fn forward() -> Vec<Operation> {
///         vec![Operation::create_table(
///             "Themes",
///             vec![ColumnSchema::new("Id", SqlType::Uuid).primary_key()],
///             vec!["Id".to_string()],
///         )]
///     }
/// }
/// ```
pub trait LedgerMigration {
    /// Unit name (`<timestamp>_<description>`).
    const NAME: &'static str;

    /// Forward operations.
    fn forward() -> Vec<Operation>;

    /// Reverse operations; `None` derives them from [`LedgerMigration::forward`].
    fn reverse() -> Option<Vec<Operation>> {
        None
    }

    /// Builds the unit.
    fn to_unit() -> Result<MigrationUnit> {
        match Self::reverse() {
            Some(reverse) => MigrationUnit::new(Self::NAME, Self::forward(), reverse),
            None => MigrationUnit::auto_reversed(Self::NAME, Self::forward()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, SqlType};

    fn themes_table() -> Operation {
        Operation::create_table(
            "Themes",
            vec![
                ColumnSchema::new("Id", SqlType::Uuid).primary_key(),
                ColumnSchema::new("Title", SqlType::Text).not_null(),
            ],
            vec!["Id".to_string()],
        )
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("20180102093122_initial").is_ok());
        assert!(validate_name("0001_add-slug").is_ok());

        for bad in ["initial", "_initial", "2018x_initial", "20180102_", "2018_a b"] {
            assert!(
                matches!(
                    validate_name(bad),
                    Err(MigrateError::InvalidMigrationName { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_timestamp() {
        let unit = MigrationUnit::new("20180102093122_initial_create", vec![], vec![]).unwrap();
        assert_eq!(unit.timestamp(), "20180102093122");
    }

    #[test]
    fn test_auto_reversed_inverts_in_reverse_order() {
        let unit = MigrationUnit::auto_reversed(
            "0001_themes",
            vec![
                themes_table(),
                Operation::insert_row("Themes", [("Id", "t1"), ("Title", "Science")]),
            ],
        )
        .unwrap();

        assert_eq!(
            unit.reverse(),
            &[
                Operation::delete_row("Themes", "Id", "t1"),
                Operation::drop_table("Themes"),
            ]
        );
    }

    #[test]
    fn test_auto_reversed_rejects_destructive_ops() {
        let result = MigrationUnit::auto_reversed("0002_drop", vec![Operation::drop_table("Themes")]);
        assert!(matches!(result, Err(MigrateError::NotReversible(name)) if name == "0002_drop"));
    }

    #[test]
    fn test_ordered_sorts_and_rejects_duplicates() {
        let a = MigrationUnit::new("0002_b", vec![], vec![]).unwrap();
        let b = MigrationUnit::new("0001_a", vec![], vec![]).unwrap();
        let units = vec![a.clone(), b];

        let names: Vec<&str> = ordered(&units).unwrap().iter().map(|u| u.name()).collect();
        assert_eq!(names, vec!["0001_a", "0002_b"]);

        let dupes = vec![a.clone(), a];
        assert!(matches!(
            ordered(&dupes),
            Err(MigrateError::DuplicateMigrationName(name)) if name == "0002_b"
        ));
    }

    #[test]
    fn test_ordered_rejects_mixed_timestamp_widths() {
        let units = vec![
            MigrationUnit::new("9_a", vec![], vec![]).unwrap(),
            MigrationUnit::new("10_b", vec![], vec![]).unwrap(),
        ];

        assert!(matches!(
            ordered(&units),
            Err(MigrateError::InvalidMigrationName { name, .. }) if name == "10_b"
        ));
    }

    #[test]
    fn test_checksum_tracks_content() {
        let one = MigrationUnit::auto_reversed("0001_themes", vec![themes_table()]).unwrap();
        let same = MigrationUnit::auto_reversed("0001_themes", vec![themes_table()]).unwrap();
        let edited = MigrationUnit::auto_reversed(
            "0001_themes",
            vec![themes_table(), Operation::insert_row("Themes", [("Id", "t1")])],
        )
        .unwrap();

        assert_eq!(one.checksum().unwrap(), same.checksum().unwrap());
        assert_ne!(one.checksum().unwrap(), edited.checksum().unwrap());
        assert_eq!(one.checksum().unwrap().len(), 64);
    }

    struct CreateThemes;

    impl LedgerMigration for CreateThemes {
        const NAME: &'static str = "20180102093122_create_themes";

        fn forward() -> Vec<Operation> {
            vec![themes_table()]
        }
    }

    #[test]
    fn test_ledger_migration_trait() {
        let unit = CreateThemes::to_unit().unwrap();
        assert_eq!(unit.name(), "20180102093122_create_themes");
        assert_eq!(unit.forward().len(), 1);
        assert_eq!(unit.reverse(), &[Operation::drop_table("Themes")]);
    }
}
