//! Renders a schema snapshot and a request into the system/user prompt pair
//! sent to every backend.

use crate::services::database::{Column, DatabaseSchema, ForeignKey, Index, TableEntity};

const SYSTEM_HEADER: &str =
    "You are a SQL expert. Generate MySQL queries based on the following database schema:";

const OUTPUT_CONTRACT: &str = "\
Generate SQL queries with the following structure:

-- Summary
-- Process Overview
-- Index Usage
-- Key Tables & Columns

{SQL}

The SQL should:
- Use appropriate indexes
- Follow MySQL best practices
- Consider table relationships

Do not add any additional explanations or notes beyond the specified structure. No supplementary explanations are needed.
Do not use markdown code blocks (```sql or ```) in your response. Provide the SQL directly without any markdown formatting.";

/// Placeholder for a table section with no entries
const NONE: &str = "(none)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
}

/// Response language requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseLanguage {
    #[default]
    English,
    Japanese,
}

impl ResponseLanguage {
    /// Unknown locales fall back to English.
    pub fn from_locale(locale: &str) -> Self {
        let primary = locale
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match primary.as_str() {
            "ja" => ResponseLanguage::Japanese,
            _ => ResponseLanguage::English,
        }
    }

    fn directive(self) -> &'static str {
        match self {
            ResponseLanguage::English => "Please respond in English.",
            ResponseLanguage::Japanese => "日本語で回答してください。",
        }
    }
}

pub fn compile(schema: &DatabaseSchema, user_prompt: &str, locale: &str) -> CompiledPrompt {
    CompiledPrompt {
        system_prompt: system_prompt(schema, ResponseLanguage::from_locale(locale)),
        user_prompt: format!(
            "Generate a MySQL query for the following request:\n{}",
            user_prompt
        ),
    }
}

fn system_prompt(schema: &DatabaseSchema, language: ResponseLanguage) -> String {
    let tables = schema
        .tables
        .iter()
        .map(render_table)
        .collect::<Vec<_>>()
        .join("\n\n");

    let relationships = schema
        .relationships
        .iter()
        .map(|rel| {
            format!(
                "{}.{} -> {}.{} ({})",
                rel.from_table, rel.from_column, rel.to_table, rel.to_column, rel.cardinality
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    [
        SYSTEM_HEADER,
        "",
        tables.as_str(),
        "",
        "Relationships:",
        if relationships.is_empty() {
            NONE
        } else {
            relationships.as_str()
        },
        "",
        OUTPUT_CONTRACT,
        "",
        language.directive(),
    ]
    .join("\n")
}

fn render_table(table: &TableEntity) -> String {
    format!(
        "Table: {}\n  Columns:\n    {}\n  Indexes:\n    {}\n  Foreign Keys:\n    {}",
        table.name,
        render_list(&table.columns, render_column),
        render_list(&table.indexes, render_index),
        render_list(&table.foreign_keys, render_foreign_key),
    )
}

fn render_list<T>(items: &[T], render: fn(&T) -> String) -> String {
    if items.is_empty() {
        return NONE.to_string();
    }
    items.iter().map(render).collect::<Vec<_>>().join("\n    ")
}

fn render_column(col: &Column) -> String {
    let mut line = format!(
        "{} {} {}",
        col.name,
        col.column_type,
        if col.nullable { "NULL" } else { "NOT NULL" }
    );
    if !col.key.is_empty() {
        line.push_str(&format!(" ({})", col.key));
    }
    line
}

fn render_index(idx: &Index) -> String {
    let mut line = format!("{} INDEX {} ({})", idx.kind, idx.name, idx.columns.join(", "));
    if let Some(method) = &idx.method {
        line.push_str(&format!(" USING {}", method));
    }
    if let Some(comment) = &idx.comment {
        line.push_str(&format!(" - {}", comment));
    }
    line
}

fn render_foreign_key(fk: &ForeignKey) -> String {
    format!(
        "FOREIGN KEY {} REFERENCES {}({})",
        fk.column, fk.referenced_table, fk.referenced_column
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::{Cardinality, IndexKind, Relationship};

    fn column(name: &str, column_type: &str, nullable: bool, key: &str) -> Column {
        Column {
            name: name.to_string(),
            column_type: column_type.to_string(),
            nullable,
            key: key.to_string(),
            default: None,
        }
    }

    fn shop_schema() -> DatabaseSchema {
        let users = TableEntity {
            name: "users".to_string(),
            columns: vec![
                column("id", "int", false, "PRI"),
                column("email", "varchar(255)", true, "UNI"),
            ],
            indexes: vec![Index {
                name: "PRIMARY".to_string(),
                columns: vec!["id".to_string()],
                kind: IndexKind::Primary,
                method: Some("BTREE".to_string()),
                comment: Some("cardinality 42".to_string()),
            }],
            foreign_keys: vec![],
        };
        let orders = TableEntity {
            name: "orders".to_string(),
            columns: vec![
                column("id", "int", false, "PRI"),
                column("user_id", "int", false, "MUL"),
            ],
            indexes: vec![Index {
                name: "idx_user".to_string(),
                columns: vec!["user_id".to_string(), "id".to_string()],
                kind: IndexKind::Index,
                method: None,
                comment: None,
            }],
            foreign_keys: vec![ForeignKey {
                column: "user_id".to_string(),
                referenced_table: "users".to_string(),
                referenced_column: "id".to_string(),
            }],
        };
        DatabaseSchema {
            tables: vec![users, orders],
            relationships: vec![Relationship {
                from_table: "orders".to_string(),
                from_column: "user_id".to_string(),
                to_table: "users".to_string(),
                to_column: "id".to_string(),
                cardinality: Cardinality::ManyToOne,
            }],
        }
    }

    #[test]
    fn test_table_block_rendering() {
        let prompt = compile(&shop_schema(), "list users", "en");
        let system = &prompt.system_prompt;

        assert!(system.contains(
            "Table: users\n  Columns:\n    id int NOT NULL (PRI)\n    email varchar(255) NULL (UNI)"
        ));
        assert!(system.contains(
            "  Indexes:\n    PRIMARY INDEX PRIMARY (id) USING BTREE - cardinality 42\n  Foreign Keys:\n    (none)"
        ));
        assert!(system.contains("    INDEX INDEX idx_user (user_id, id)\n"));
        assert!(system.contains("    FOREIGN KEY user_id REFERENCES users(id)"));
        assert!(system.contains("Relationships:\norders.user_id -> users.id (many-to-one)\n"));
    }

    #[test]
    fn test_output_contract_and_language_last() {
        let prompt = compile(&shop_schema(), "list users", "ja");
        let system = &prompt.system_prompt;

        let summary = system.find("-- Summary").unwrap();
        let overview = system.find("-- Process Overview").unwrap();
        let usage = system.find("-- Index Usage").unwrap();
        let key_tables = system.find("-- Key Tables & Columns").unwrap();
        assert!(summary < overview && overview < usage && usage < key_tables);
        assert!(system.contains("Do not use markdown code blocks"));
        assert!(system.ends_with("日本語で回答してください。"));

        let english = compile(&shop_schema(), "list users", "fr-FR");
        assert!(english.system_prompt.ends_with("Please respond in English."));
    }

    #[test]
    fn test_user_prompt_and_determinism() {
        let schema = shop_schema();
        let a = compile(&schema, "top 10 customers by spend", "en");
        let b = compile(&schema, "top 10 customers by spend", "en");
        assert_eq!(a, b);
        assert_eq!(
            a.user_prompt,
            "Generate a MySQL query for the following request:\ntop 10 customers by spend"
        );
    }

    #[test]
    fn test_empty_schema() {
        let prompt = compile(&DatabaseSchema::default(), "anything", "en");
        assert!(prompt.system_prompt.contains("Relationships:\n(none)"));
    }

    #[test]
    fn test_locale_parsing() {
        assert_eq!(ResponseLanguage::from_locale("ja_JP"), ResponseLanguage::Japanese);
        assert_eq!(ResponseLanguage::from_locale("JA"), ResponseLanguage::Japanese);
        assert_eq!(ResponseLanguage::from_locale(""), ResponseLanguage::English);
    }
}
