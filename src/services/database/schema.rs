use anyhow::{Context, Result};
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};

use super::manager::DatabaseManager;
use super::types::{
    Cardinality, Column, DatabaseSchema, ForeignKey, Index, IndexKind, IndexRow, Relationship,
    TableEntity,
};

impl DatabaseManager {
    /// Reflect every table of the connection's current database.
    pub(crate) async fn introspect(&self, pool: &MySqlPool) -> Result<DatabaseSchema> {
        let table_names = self.fetch_table_names(pool).await?;

        let mut tables = Vec::with_capacity(table_names.len());
        for name in table_names {
            let columns = self
                .fetch_columns(&name, pool)
                .await
                .with_context(|| format!("reading columns of {}", name))?;
            let index_rows = self
                .fetch_index_rows(&name, pool)
                .await
                .with_context(|| format!("reading indexes of {}", name))?;
            let foreign_keys = self
                .fetch_foreign_keys(&name, pool)
                .await
                .with_context(|| format!("reading foreign keys of {}", name))?;

            tables.push(TableEntity {
                name,
                columns,
                indexes: fold_index_rows(index_rows),
                foreign_keys,
            });
        }

        let relationships = infer_relationships(&tables);
        Ok(DatabaseSchema {
            tables,
            relationships,
        })
    }

    async fn fetch_table_names(&self, pool: &MySqlPool) -> Result<Vec<String>> {
        let query = r#"
            SELECT CAST(TABLE_NAME AS CHAR) AS table_name
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE()
            ORDER BY TABLE_NAME
        "#;

        let rows = sqlx::query(query)
            .fetch_all(pool)
            .await
            .context("listing tables")?;

        rows.iter()
            .map(|row| row.try_get("table_name").map_err(Into::into))
            .collect()
    }

    async fn fetch_columns(&self, table_name: &str, pool: &MySqlPool) -> Result<Vec<Column>> {
        let query = r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(COLUMN_TYPE AS CHAR) AS column_type,
                CAST(IS_NULLABLE AS CHAR) AS is_nullable,
                CAST(COLUMN_KEY AS CHAR) AS column_key,
                CAST(COLUMN_DEFAULT AS CHAR) AS column_default
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#;

        let rows = sqlx::query(query).bind(table_name).fetch_all(pool).await?;

        rows.iter()
            .map(|row| -> Result<Column> {
                let is_nullable: String = row.try_get("is_nullable")?;
                Ok(Column {
                    name: row.try_get("column_name")?,
                    column_type: row.try_get("column_type")?,
                    nullable: is_nullable == "YES",
                    key: row.try_get::<Option<String>, _>("column_key")?.unwrap_or_default(),
                    default: row.try_get("column_default")?,
                })
            })
            .collect()
    }

    async fn fetch_index_rows(&self, table_name: &str, pool: &MySqlPool) -> Result<Vec<IndexRow>> {
        let query = r#"
            SELECT
                CAST(INDEX_NAME AS CHAR) AS index_name,
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(NON_UNIQUE AS SIGNED) AS non_unique,
                CAST(INDEX_TYPE AS CHAR) AS index_type,
                CAST(INDEX_COMMENT AS CHAR) AS index_comment,
                CAST(CARDINALITY AS SIGNED) AS cardinality,
                CAST(NULLABLE AS CHAR) AS nullable,
                CAST(COLLATION AS CHAR) AS collation,
                CAST(SUB_PART AS SIGNED) AS sub_part
            FROM information_schema.STATISTICS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY (INDEX_NAME = 'PRIMARY') DESC, INDEX_NAME, SEQ_IN_INDEX
        "#;

        let rows = sqlx::query(query).bind(table_name).fetch_all(pool).await?;
        rows.iter().map(decode_index_row).collect()
    }

    async fn fetch_foreign_keys(&self, table_name: &str, pool: &MySqlPool) -> Result<Vec<ForeignKey>> {
        let query = r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(REFERENCED_TABLE_NAME AS CHAR) AS referenced_table,
                CAST(REFERENCED_COLUMN_NAME AS CHAR) AS referenced_column
            FROM information_schema.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = DATABASE()
                AND TABLE_NAME = ?
                AND REFERENCED_TABLE_NAME IS NOT NULL
            ORDER BY CONSTRAINT_NAME, ORDINAL_POSITION
        "#;

        let rows = sqlx::query(query).bind(table_name).fetch_all(pool).await?;

        rows.iter()
            .map(|row| -> Result<ForeignKey> {
                Ok(ForeignKey {
                    column: row.try_get("column_name")?,
                    referenced_table: row.try_get("referenced_table")?,
                    referenced_column: row.try_get("referenced_column")?,
                })
            })
            .collect()
    }
}

fn decode_index_row(row: &MySqlRow) -> Result<IndexRow> {
    let nullable: Option<String> = row.try_get("nullable")?;
    Ok(IndexRow {
        index_name: row.try_get("index_name")?,
        // Functional indexes have no column name
        column_name: row
            .try_get::<Option<String>, _>("column_name")?
            .unwrap_or_else(|| "(expression)".to_string()),
        non_unique: row.try_get::<i64, _>("non_unique")? != 0,
        index_type: row.try_get::<Option<String>, _>("index_type")?.unwrap_or_default(),
        index_comment: row
            .try_get::<Option<String>, _>("index_comment")?
            .unwrap_or_default(),
        cardinality: row.try_get("cardinality")?,
        nullable: nullable.as_deref() == Some("YES"),
        collation: row.try_get("collation")?,
        sub_part: row.try_get("sub_part")?,
    })
}

/// Fold one-row-per-column index metadata into one entry per index name.
/// Entries keep the order in which each index first appears, and columns keep
/// row order.
pub(crate) fn fold_index_rows(rows: Vec<IndexRow>) -> Vec<Index> {
    let mut folded: Vec<(Index, Vec<IndexRow>)> = Vec::new();

    for row in rows {
        match folded.iter_mut().find(|(index, _)| index.name == row.index_name) {
            Some((index, members)) => {
                index.columns.push(row.column_name.clone());
                members.push(row);
            }
            None => {
                let index = Index {
                    name: row.index_name.clone(),
                    columns: vec![row.column_name.clone()],
                    kind: index_kind(&row),
                    method: (!row.index_type.is_empty()).then(|| row.index_type.to_uppercase()),
                    comment: None,
                };
                folded.push((index, vec![row]));
            }
        }
    }

    folded
        .into_iter()
        .map(|(mut index, members)| {
            index.comment = index_comment(&members);
            index
        })
        .collect()
}

fn index_kind(row: &IndexRow) -> IndexKind {
    if row.index_name == "PRIMARY" {
        IndexKind::Primary
    } else if !row.non_unique {
        IndexKind::Unique
    } else if row.index_type.eq_ignore_ascii_case("FULLTEXT") {
        IndexKind::Fulltext
    } else {
        IndexKind::Index
    }
}

/// Human-readable summary of whatever statistics the server reported.
fn index_comment(rows: &[IndexRow]) -> Option<String> {
    let mut parts = Vec::new();

    if let Some(first) = rows.first() {
        let comment = first.index_comment.trim();
        if !comment.is_empty() {
            parts.push(comment.to_string());
        }
    }

    // Cardinality of the full key is reported on its last column
    if let Some(cardinality) = rows.iter().filter_map(|r| r.cardinality).max() {
        parts.push(format!("cardinality {}", cardinality));
    }

    let nullable: Vec<&str> = rows
        .iter()
        .filter(|r| r.nullable)
        .map(|r| r.column_name.as_str())
        .collect();
    if !nullable.is_empty() {
        parts.push(format!("nullable {}", nullable.join(", ")));
    }

    let descending: Vec<&str> = rows
        .iter()
        .filter(|r| r.collation.as_deref() == Some("D"))
        .map(|r| r.column_name.as_str())
        .collect();
    if !descending.is_empty() {
        parts.push(format!("descending {}", descending.join(", ")));
    }

    let prefixes: Vec<String> = rows
        .iter()
        .filter_map(|r| r.sub_part.map(|len| format!("{}({})", r.column_name, len)))
        .collect();
    if !prefixes.is_empty() {
        parts.push(format!("prefix {}", prefixes.join(", ")));
    }

    (!parts.is_empty()).then(|| parts.join("; "))
}

/// Derive relationship edges from foreign keys. Keys whose referenced table or
/// either endpoint column is unknown are skipped.
pub(crate) fn infer_relationships(tables: &[TableEntity]) -> Vec<Relationship> {
    let mut relationships = Vec::new();

    for table in tables {
        for fk in &table.foreign_keys {
            let Some(target) = tables.iter().find(|t| t.name == fk.referenced_table) else {
                continue;
            };
            let (Some(from), Some(to)) = (table.column(&fk.column), target.column(&fk.referenced_column))
            else {
                continue;
            };

            relationships.push(Relationship {
                from_table: table.name.clone(),
                from_column: fk.column.clone(),
                to_table: target.name.clone(),
                to_column: fk.referenced_column.clone(),
                cardinality: cardinality(from, to),
            });
        }
    }

    relationships
}

/// Cardinality as read from the referencing side.
fn cardinality(from: &Column, to: &Column) -> Cardinality {
    match (from.is_unique(), to.is_unique()) {
        (true, true) => Cardinality::OneToOne,
        (false, true) => Cardinality::ManyToOne,
        (true, false) => Cardinality::OneToMany,
        (false, false) => Cardinality::ManyToMany,
    }
}
