use serde::{Deserialize, Serialize};

pub const DEFAULT_TENANT_COLUMN: &str = "org_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub columns: Vec<String>,
}

impl TableDef {
    pub fn new(name: &str, description: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: Some(description.to_string()),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// The queryable tables. Built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaCatalog {
    tables: Vec<TableDef>,
    tenant_column: String,
    allowed_schemas: Vec<String>,
}

impl SchemaCatalog {
    pub fn new(tables: Vec<TableDef>, tenant_column: impl Into<String>) -> Self {
        Self {
            tables,
            tenant_column: tenant_column.into(),
            allowed_schemas: vec!["public".to_string()],
        }
    }

    pub fn with_allowed_schemas(mut self, schemas: Vec<String>) -> Self {
        self.allowed_schemas = schemas.into_iter().map(|s| s.to_lowercase()).collect();
        self
    }

    /// Demo workspace schema: a small project-tracking warehouse.
    pub fn builtin() -> Self {
        Self::new(
            vec![
                TableDef::new(
                    "projects",
                    "Client projects",
                    &[
                        "id",
                        "org_id",
                        "name",
                        "status",
                        "customer_id",
                        "budget",
                        "start_date",
                        "due_date",
                        "created_at",
                    ],
                ),
                TableDef::new(
                    "tasks",
                    "Work items that belong to a project",
                    &[
                        "id",
                        "org_id",
                        "project_id",
                        "title",
                        "status",
                        "priority",
                        "assignee_id",
                        "estimate_hours",
                        "due_date",
                        "completed_at",
                        "created_at",
                    ],
                ),
                TableDef::new(
                    "customers",
                    "Companies the organization bills",
                    &["id", "org_id", "name", "industry", "country", "created_at"],
                ),
                TableDef::new(
                    "invoices",
                    "Invoices issued to customers",
                    &[
                        "id",
                        "org_id",
                        "customer_id",
                        "project_id",
                        "amount",
                        "currency",
                        "status",
                        "issued_at",
                        "paid_at",
                    ],
                ),
                TableDef::new(
                    "time_entries",
                    "Hours logged against tasks",
                    &[
                        "id",
                        "org_id",
                        "task_id",
                        "user_id",
                        "hours",
                        "billable",
                        "entry_date",
                    ],
                ),
                TableDef::new(
                    "users",
                    "Members of the organization",
                    &["id", "org_id", "name", "email", "role", "created_at"],
                ),
            ],
            DEFAULT_TENANT_COLUMN,
        )
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn tenant_column(&self) -> &str {
        &self.tenant_column
    }

    pub fn is_allowed(&self, table: &str) -> bool {
        self.tables
            .iter()
            .any(|t| t.name.eq_ignore_ascii_case(table))
    }

    pub fn allows_schema(&self, schema: &str) -> bool {
        let schema = schema.to_lowercase();
        self.allowed_schemas.iter().any(|s| *s == schema)
    }

    /// Table → visible columns. The tenant column is never listed.
    pub fn describe(&self) -> Vec<(&str, Vec<&str>)> {
        self.tables
            .iter()
            .map(|table| {
                let columns = table
                    .columns
                    .iter()
                    .map(String::as_str)
                    .filter(|c| !c.eq_ignore_ascii_case(&self.tenant_column))
                    .collect();
                (table.name.as_str(), columns)
            })
            .collect()
    }
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
