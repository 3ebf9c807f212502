use askdb_guard::{
    guard, GuardOptions, GuardResult, GuardViolation, SchemaCatalog, MAX_SQL_CHARS,
};

fn acme(sql: &str) -> Result<GuardResult, GuardViolation> {
    guard(sql, &GuardOptions::new("acme", 100), &SchemaCatalog::builtin())
}

#[test]
fn tenant_literal_in_model_sql_cannot_widen_scope() {
    let result = acme("SELECT * FROM projects WHERE org_id = 'other' OR 1 = 1").expect("accepted");
    assert_eq!(
        result.sql,
        "SELECT * FROM projects WHERE (org_id = 'other' OR 1 = 1) AND projects.org_id = 'acme' LIMIT 100"
    );
    assert!(result.org_injected);
}

#[test]
fn tenant_tautology_still_gets_a_bound_predicate() {
    let result = acme("SELECT * FROM projects WHERE org_id = org_id").expect("accepted");
    assert_eq!(
        result.sql,
        "SELECT * FROM projects WHERE (org_id = org_id) AND projects.org_id = 'acme' LIMIT 100"
    );
}

#[test]
fn tenant_negation_still_gets_a_bound_predicate() {
    let result = acme("SELECT * FROM projects p WHERE p.org_id != 'other'").expect("accepted");
    assert_eq!(
        result.sql,
        "SELECT * FROM projects AS p WHERE (p.org_id <> 'other') AND p.org_id = 'acme' LIMIT 100"
    );
}

#[test]
fn join_binds_every_table_by_alias() {
    let result = acme(
        "SELECT p.name, t.title FROM projects p JOIN tasks t ON t.project_id = p.id",
    )
    .expect("accepted");
    assert_eq!(
        result.sql,
        "SELECT p.name, t.title FROM projects AS p JOIN tasks AS t ON t.project_id = p.id \
         WHERE p.org_id = 'acme' AND t.org_id = 'acme' LIMIT 100"
    );
    assert_eq!(
        result.tables_used,
        vec!["projects".to_string(), "tasks".to_string()]
    );
}

#[test]
fn self_join_binds_both_aliases() {
    let result = acme("SELECT a.id FROM tasks a LEFT JOIN tasks b ON a.id = b.id").expect("accepted");
    assert!(result.sql.contains("a.org_id = 'acme' AND b.org_id = 'acme'"));
    assert_eq!(result.tables_used, vec!["tasks".to_string()]);
}

#[test]
fn subqueries_are_scoped_independently() {
    let result = acme(
        "SELECT name FROM customers WHERE id IN (SELECT customer_id FROM invoices WHERE amount > 1000)",
    )
    .expect("accepted");
    assert_eq!(
        result.sql,
        "SELECT name FROM customers WHERE (id IN (SELECT customer_id FROM invoices \
         WHERE (amount > 1000) AND invoices.org_id = 'acme')) AND customers.org_id = 'acme' LIMIT 100"
    );
}

#[test]
fn derived_table_is_scoped_inside() {
    let result = acme(
        "SELECT s.status, s.n FROM (SELECT status, count(*) AS n FROM tasks GROUP BY status) s",
    )
    .expect("accepted");
    assert_eq!(
        result.sql,
        "SELECT s.status, s.n FROM (SELECT status, count(*) AS n FROM tasks \
         WHERE tasks.org_id = 'acme' GROUP BY status) AS s LIMIT 100"
    );
}

#[test]
fn every_set_operation_branch_is_scoped() {
    let result = acme("SELECT id FROM projects UNION SELECT id FROM tasks").expect("accepted");
    assert_eq!(
        result.sql,
        "SELECT id FROM projects WHERE projects.org_id = 'acme' UNION \
         SELECT id FROM tasks WHERE tasks.org_id = 'acme' LIMIT 100"
    );
}

#[test]
fn disallowed_tables_are_found_anywhere() {
    for sql in [
        "SELECT * FROM secrets",
        "SELECT * FROM projects JOIN secrets ON secrets.id = projects.id",
        "WITH s AS (SELECT * FROM secrets) SELECT * FROM s",
        "SELECT * FROM projects WHERE id IN (SELECT project_id FROM secrets)",
        "SELECT (SELECT max(id) FROM secrets) FROM projects",
        "SELECT * FROM projects WHERE EXISTS (SELECT 1 FROM secrets)",
    ] {
        assert_eq!(
            acme(sql).expect_err(sql),
            GuardViolation::DisallowedTable {
                table: "secrets".to_string()
            },
            "{sql}"
        );
    }
}

#[test]
fn limit_is_clamped_not_raised() {
    assert_eq!(acme("SELECT * FROM tasks LIMIT 5").expect("ok").limit_applied, 5);
    let big = acme("SELECT * FROM tasks LIMIT 5000").expect("ok");
    assert_eq!(big.limit_applied, 100);
    assert!(big.sql.ends_with("LIMIT 100"));
}

#[test]
fn only_outermost_limit_is_touched() {
    let result = acme(
        "SELECT * FROM (SELECT id FROM tasks ORDER BY id LIMIT 3) recent",
    )
    .expect("accepted");
    assert!(result.sql.contains("ORDER BY id LIMIT 3)"), "{}", result.sql);
    assert!(result.sql.ends_with("LIMIT 100"));
}

#[test]
fn comments_cannot_smuggle_statements() {
    let result = acme("SELECT id FROM projects -- ; DROP TABLE projects").expect("accepted");
    assert!(!result.sql.contains("DROP"));
    assert_eq!(
        acme("SELECT id FROM projects /* x */ ; DELETE FROM projects").expect_err("rejected"),
        GuardViolation::MultiStatement
    );
}

#[test]
fn empty_and_unparseable_input() {
    assert_eq!(acme("   ").expect_err("empty"), GuardViolation::InvalidSqlInput);
    assert_eq!(
        acme("SELECT FROM WHERE").expect_err("garbage").code(),
        "SQL_PARSE_ERROR"
    );
    assert_eq!(
        acme("SELECT 'unterminated").expect_err("lex").code(),
        "SQL_PARSE_ERROR"
    );
}

#[test]
fn result_serializes_in_camel_case() {
    let result = acme("SELECT id FROM users").expect("accepted");
    let value = serde_json::to_value(&result).expect("json");
    assert_eq!(value["limitApplied"], 100);
    assert_eq!(value["orgInjected"], true);
    assert_eq!(value["tablesUsed"][0], "users");
}

#[test]
fn custom_tenant_column_is_used() {
    let catalog = SchemaCatalog::new(
        vec![askdb_guard::TableDef::new("events", "Audit events", &["id", "tenant", "kind"])],
        "tenant",
    );
    let result = guard(
        "SELECT kind FROM events",
        &GuardOptions::new("t-9", 10),
        &catalog,
    )
    .expect("accepted");
    assert_eq!(
        result.sql,
        "SELECT kind FROM events WHERE events.tenant = 't-9' LIMIT 10"
    );
}

#[test]
fn oversized_input_is_refused_before_parsing() {
    let sql = format!(
        "SELECT id FROM projects WHERE name = '{}'",
        "x".repeat(MAX_SQL_CHARS)
    );
    let err = acme(&sql).expect_err("too long");
    assert_eq!(err.code(), "INVALID_SQL_INPUT");
    assert!(matches!(err, GuardViolation::InputTooLong { .. }));
}

#[test]
fn long_operator_chains_are_bounded() {
    let short = format!("SELECT id FROM projects WHERE id = 1{}", " OR id = 1".repeat(100));
    assert!(acme(&short).expect("accepted").org_injected);

    let long = format!("SELECT id FROM projects WHERE id = 1{}", " OR id = 1".repeat(1_000));
    assert!(long.chars().count() < MAX_SQL_CHARS);
    assert_eq!(acme(&long).expect_err("too many operators").code(), "SQL_PARSE_ERROR");

    let casts = format!("SELECT id{} FROM projects", "::int".repeat(1_000));
    assert_eq!(acme(&casts).expect_err("too many casts").code(), "SQL_PARSE_ERROR");
}
