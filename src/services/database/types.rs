use serde::{Deserialize, Serialize};
use std::fmt;

/// Column key roles reported by MySQL that make a column unique.
const UNIQUE_KEY_ROLES: [&str; 2] = ["PRI", "UNI"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Full column type as reported by the server, e.g. `varchar(255)`
    pub column_type: String,
    pub nullable: bool,
    /// `PRI`, `UNI`, `MUL` or empty
    pub key: String,
    pub default: Option<String>,
}

impl Column {
    pub fn is_unique(&self) -> bool {
        UNIQUE_KEY_ROLES.contains(&self.key.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexKind {
    Primary,
    Unique,
    Index,
    Fulltext,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexKind::Primary => "PRIMARY",
            IndexKind::Unique => "UNIQUE",
            IndexKind::Index => "INDEX",
            IndexKind::Fulltext => "FULLTEXT",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    /// Indexed columns in key order
    pub columns: Vec<String>,
    pub kind: IndexKind,
    /// Storage method such as `BTREE` or `HASH`
    pub method: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntity {
    pub name: String,
    pub columns: Vec<Column>,
    pub indexes: Vec<Index>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableEntity {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Inferred from key uniqueness; MySQL does not report cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Cardinality::OneToOne => "one-to-one",
            Cardinality::OneToMany => "one-to-many",
            Cardinality::ManyToOne => "many-to-one",
            Cardinality::ManyToMany => "many-to-many",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub tables: Vec<TableEntity>,
    pub relationships: Vec<Relationship>,
}

impl DatabaseSchema {
    pub fn table(&self, name: &str) -> Option<&TableEntity> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// One row of `information_schema.STATISTICS`: one indexed column.
#[derive(Debug, Clone, Default)]
pub(crate) struct IndexRow {
    pub index_name: String,
    pub column_name: String,
    pub non_unique: bool,
    pub index_type: String,
    pub index_comment: String,
    pub cardinality: Option<i64>,
    pub nullable: bool,
    /// `A` ascending, `D` descending, none when unsorted
    pub collation: Option<String>,
    /// Indexed prefix length for partially indexed string columns
    pub sub_part: Option<i64>,
}
