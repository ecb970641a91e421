//! Live schema introspection for SQLite.
//!
//! Reads table structure back out of a database through the `pragma_*`
//! table-valued functions and `sqlite_master`. The executor uses this to
//! rebuild tables for constraint changes SQLite cannot express with
//! `ALTER TABLE`; snapshots compare database state before and after a
//! unit's round trip.

use std::collections::BTreeMap;

use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

use crate::schema::ForeignKeySchema;

/// A column as reported by `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    /// Column name.
    pub name: String,
    /// Declared type, verbatim.
    pub decl_type: String,
    /// Whether the column is NOT NULL.
    pub not_null: bool,
    /// Default expression text, verbatim.
    pub default_sql: Option<String>,
    /// 1-based position in the primary key, 0 if not part of it.
    pub pk_position: i64,
}

/// A foreign key as reported by `pragma_foreign_key_list`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LiveForeignKey {
    /// Local columns.
    pub columns: Vec<String>,
    /// Referenced table.
    pub references_table: String,
    /// Referenced columns; empty when the parent primary key is implied.
    pub references_columns: Vec<String>,
    /// ON UPDATE action.
    pub on_update: String,
    /// ON DELETE action.
    pub on_delete: String,
}

impl From<&ForeignKeySchema> for LiveForeignKey {
    fn from(fk: &ForeignKeySchema) -> Self {
        Self {
            columns: fk.columns.clone(),
            references_table: fk.references_table.clone(),
            references_columns: fk.references_columns.clone(),
            on_update: fk.on_update.to_sql().to_string(),
            on_delete: fk.on_delete.to_sql().to_string(),
        }
    }
}

/// The structure of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTable {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<LiveColumn>,
    /// Foreign keys, sorted.
    pub foreign_keys: Vec<LiveForeignKey>,
    /// Column lists of UNIQUE constraints declared with the table, sorted.
    pub unique_constraints: Vec<Vec<String>>,
    /// `CREATE INDEX` statements of explicitly created indexes, sorted.
    pub index_sql: Vec<String>,
    /// Whether the primary key was declared AUTOINCREMENT.
    pub autoincrement: bool,
    /// Whether the table carries CHECK constraints.
    pub has_check: bool,
}

impl LiveTable {
    /// Primary key columns in key order.
    #[must_use]
    pub fn primary_key(&self) -> Vec<&str> {
        let mut pk: Vec<&LiveColumn> = self.columns.iter().filter(|c| c.pk_position > 0).collect();
        pk.sort_by_key(|c| c.pk_position);
        pk.into_iter().map(|c| c.name.as_str()).collect()
    }

    /// Position of the foreign key declared on exactly these columns.
    #[must_use]
    pub fn foreign_key_position(&self, columns: &[String]) -> Option<usize> {
        self.foreign_keys.iter().position(|fk| fk.columns == columns)
    }
}

/// Structure and contents of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSnapshot {
    /// Table structure.
    pub structure: LiveTable,
    /// Every row, each value rendered with SQLite's `quote()`, in sorted order.
    pub rows: Vec<Vec<String>>,
}

/// Structure and contents of every user table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseSnapshot {
    /// Tables by name.
    pub tables: BTreeMap<String, TableSnapshot>,
}

impl DatabaseSnapshot {
    /// Describes the first difference between two snapshots, if any.
    #[must_use]
    pub fn diff(&self, other: &Self) -> Option<String> {
        for name in self.tables.keys() {
            if !other.tables.contains_key(name) {
                return Some(format!("table '{}' is missing", name));
            }
        }
        for (name, after) in &other.tables {
            let Some(before) = self.tables.get(name) else {
                return Some(format!("table '{}' was not removed", name));
            };
            if before.structure != after.structure {
                return Some(format!("structure of table '{}' differs", name));
            }
            if before.rows != after.rows {
                return Some(format!(
                    "rows of table '{}' differ ({} before, {} after)",
                    name,
                    before.rows.len(),
                    after.rows.len()
                ));
            }
        }
        None
    }
}

/// Reads a table's structure; `None` if no such table exists.
pub async fn table(conn: &mut SqliteConnection, name: &str) -> sqlx::Result<Option<LiveTable>> {
    let create_sql: Option<(String,)> =
        sqlx::query_as("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
    let Some((create_sql,)) = create_sql else {
        return Ok(None);
    };
    let upper = create_sql.to_ascii_uppercase();

    let columns = sqlx::query_as::<_, (String, String, i64, Option<String>, i64)>(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?) ORDER BY cid",
    )
    .bind(name)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|(name, decl_type, not_null, default_sql, pk_position)| LiveColumn {
        name,
        decl_type,
        not_null: not_null != 0,
        default_sql,
        pk_position,
    })
    .collect();

    let fk_rows: Vec<(i64, String, String, Option<String>, String, String)> = sqlx::query_as(
        "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete \
         FROM pragma_foreign_key_list(?) ORDER BY id, seq",
    )
    .bind(name)
    .fetch_all(&mut *conn)
    .await?;

    let mut grouped: BTreeMap<i64, LiveForeignKey> = BTreeMap::new();
    for (id, parent, from, to, on_update, on_delete) in fk_rows {
        let fk = grouped.entry(id).or_insert_with(|| LiveForeignKey {
            columns: Vec::new(),
            references_table: parent,
            references_columns: Vec::new(),
            on_update,
            on_delete,
        });
        fk.columns.push(from);
        if let Some(to) = to {
            fk.references_columns.push(to);
        }
    }
    let mut foreign_keys: Vec<LiveForeignKey> = grouped.into_values().collect();
    foreign_keys.sort();

    let indexes: Vec<(String, String)> =
        sqlx::query_as("SELECT name, origin FROM pragma_index_list(?)")
            .bind(name)
            .fetch_all(&mut *conn)
            .await?;

    let mut unique_constraints = Vec::new();
    let mut index_sql = Vec::new();
    for (index_name, origin) in indexes {
        match origin.as_str() {
            "u" => {
                let cols: Vec<(Option<String>,)> =
                    sqlx::query_as("SELECT name FROM pragma_index_info(?) ORDER BY seqno")
                        .bind(&index_name)
                        .fetch_all(&mut *conn)
                        .await?;
                unique_constraints.push(cols.into_iter().filter_map(|(c,)| c).collect());
            }
            "c" => {
                let sql: Option<(Option<String>,)> = sqlx::query_as(
                    "SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?",
                )
                .bind(&index_name)
                .fetch_optional(&mut *conn)
                .await?;
                if let Some((Some(sql),)) = sql {
                    index_sql.push(sql);
                }
            }
            _ => {}
        }
    }
    unique_constraints.sort();
    index_sql.sort();

    Ok(Some(LiveTable {
        name: name.to_string(),
        columns,
        foreign_keys,
        unique_constraints,
        index_sql,
        autoincrement: upper.contains("AUTOINCREMENT"),
        has_check: declares_check(&upper),
    }))
}

/// Whether uppercased `CREATE TABLE` text contains a `CHECK (` clause.
///
/// Quoted identifiers and string literals are skipped, so a column named
/// `"Checked"` does not count.
fn declares_check(upper: &str) -> bool {
    let bytes = upper.as_bytes();
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if matches!(b, b'"' | b'\'' | b'`' | b'[') => {
                quote = Some(if b == b'[' { b']' } else { b });
            }
            None if bytes[i..].starts_with(b"CHECK")
                && (i == 0 || !is_word_byte(bytes[i - 1]))
                && bytes[i + 5..]
                    .iter()
                    .find(|c| !c.is_ascii_whitespace())
                    == Some(&b'(') =>
            {
                return true;
            }
            None => {}
        }
    }
    false
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Names of all user tables, sorted.
pub async fn table_names(conn: &mut SqliteConnection) -> sqlx::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Other tables holding a foreign key to `name`, with its ON DELETE action.
pub async fn referencing_tables(
    conn: &mut SqliteConnection,
    name: &str,
) -> sqlx::Result<Vec<(String, String)>> {
    sqlx::query_as(
        "SELECT DISTINCT m.name, f.on_delete \
         FROM sqlite_master AS m, pragma_foreign_key_list(m.name) AS f \
         WHERE m.type = 'table' AND f.\"table\" = ? COLLATE NOCASE AND m.name <> ? COLLATE NOCASE \
         ORDER BY m.name",
    )
    .bind(name)
    .bind(name)
    .fetch_all(&mut *conn)
    .await
}

/// Reads every row of a table, values rendered as SQL literals, sorted.
pub async fn rows(conn: &mut SqliteConnection, table: &LiveTable) -> sqlx::Result<Vec<Vec<String>>> {
    if table.columns.is_empty() {
        return Ok(Vec::new());
    }
    let quoted: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("quote(\"{}\")", c.name.replace('"', "\"\"")))
        .collect();
    let order: Vec<String> = (1..=table.columns.len()).map(|i| i.to_string()).collect();
    let sql = format!(
        "SELECT {} FROM \"{}\" ORDER BY {}",
        quoted.join(", "),
        table.name.replace('"', "\"\""),
        order.join(", ")
    );

    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| {
            (0..table.columns.len())
                .map(|i| row.try_get::<String, _>(i))
                .collect::<sqlx::Result<Vec<String>>>()
        })
        .collect()
}

/// Captures structure and rows of every user table not in `exclude`.
pub async fn snapshot(
    conn: &mut SqliteConnection,
    exclude: &[&str],
) -> sqlx::Result<DatabaseSnapshot> {
    let mut tables = BTreeMap::new();
    for name in table_names(conn).await? {
        if exclude.contains(&name.as_str()) {
            continue;
        }
        if let Some(structure) = table(conn, &name).await? {
            let rows = rows(conn, &structure).await?;
            tables.insert(name, TableSnapshot { structure, rows });
        }
    }
    Ok(DatabaseSnapshot { tables })
}
