use chrono::{DateTime, Utc};

use askdb_guard::SchemaCatalog;
use askdb_tools::{DESCRIBE_SCHEMA, EXECUTE_SQL};

/// System prompt for one request.
pub fn system_instructions(
    catalog: &SchemaCatalog,
    preferred_table: Option<&str>,
    max_rows: u64,
    now: DateTime<Utc>,
) -> String {
    let mut schema = String::new();
    for table in catalog.tables() {
        let columns: Vec<&str> = table
            .columns
            .iter()
            .map(String::as_str)
            .filter(|c| !c.eq_ignore_ascii_case(catalog.tenant_column()))
            .collect();
        schema.push_str(&format!("- {}({})", table.name, columns.join(", ")));
        if let Some(description) = &table.description {
            schema.push_str(&format!(": {description}"));
        }
        schema.push('\n');
    }

    let mut parts = vec![
        "You answer questions about the user's workspace data by querying it with SQL."
            .to_string(),
        format!("Today is {}.", now.format("%Y-%m-%d")),
        format!("Tables:\n{schema}"),
        format!(
            "Rules:\n\
             - Use the `{EXECUTE_SQL}` tool with a single SELECT statement. Never modify data.\n\
             - Rows are already restricted to the user's organization; do not filter by organization yourself.\n\
             - At most {max_rows} rows are returned per query. Prefer aggregates over listing rows.\n\
             - Call `{DESCRIBE_SCHEMA}` if you are unsure about a column.\n\
             - If a query is rejected or fails, fix it and try again, or explain what went wrong.\n\
             - Answer in plain language and keep it short. Do not show SQL unless asked."
        ),
    ];
    if let Some(table) = preferred_table {
        parts.push(format!(
            "The user is currently looking at the `{table}` table; prefer it when the question is ambiguous."
        ));
    }
    parts.join("\n\n")
}
