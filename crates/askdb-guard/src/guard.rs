use serde::Serialize;

use crate::ast::*;
use crate::catalog::SchemaCatalog;
use crate::error::GuardViolation;
use crate::lexer::Lexer;
use crate::parser::{ParseErrorKind, Parser};
use crate::render::{render_query, RenderOptions};
use crate::token::{Token, TokenKind};

const SYSTEM_SCHEMAS: [&str; 6] = [
    "information_schema",
    "pg_catalog",
    "system",
    "mysql",
    "performance_schema",
    "sys",
];

/// Longest candidate statement accepted, in characters.
pub const MAX_SQL_CHARS: usize = 16_384;

const SYSTEM_TABLES: [&str; 3] = ["sqlite_master", "sqlite_schema", "sqlite_temp_master"];

/// Server-side functions that reach outside the tenant's rows.
const SYSTEM_FUNCTIONS: [&str; 9] = [
    "current_setting",
    "set_config",
    "dblink",
    "lo_import",
    "lo_export",
    "load_extension",
    "readfile",
    "writefile",
    "sleep",
];

#[derive(Debug, Clone)]
pub struct GuardOptions {
    pub tenant_id: String,
    pub max_rows: u64,
    /// Double backslashes inside string literals when rendering (ClickHouse).
    pub backslash_escapes: bool,
}

impl GuardOptions {
    pub fn new(tenant_id: impl Into<String>, max_rows: u64) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            max_rows,
            backslash_escapes: false,
        }
    }

    pub fn with_backslash_escapes(mut self, enabled: bool) -> Self {
        self.backslash_escapes = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardResult {
    pub sql: String,
    pub tables_used: Vec<String>,
    pub limit_applied: u64,
    pub org_injected: bool,
}

/// Validate a model-authored statement and rewrite it so it can only read
/// the caller's tenant rows, bounded by `max_rows`.
///
/// Every decision is written to the `askdb.guard` audit target.
pub fn guard(
    sql: &str,
    options: &GuardOptions,
    catalog: &SchemaCatalog,
) -> Result<GuardResult, GuardViolation> {
    match guard_statement(sql, options, catalog) {
        Ok(result) => {
            tracing::info!(
                target: "askdb.guard",
                tenant_id = %options.tenant_id,
                original = %sql,
                rewritten = %result.sql,
                tables = ?result.tables_used,
                limit_applied = result.limit_applied,
                org_injected = result.org_injected,
                "query accepted"
            );
            Ok(result)
        }
        Err(violation) => {
            tracing::warn!(
                target: "askdb.guard",
                tenant_id = %options.tenant_id,
                original = %sql,
                code = violation.code(),
                reason = %violation,
                "query rejected"
            );
            Err(violation)
        }
    }
}

fn guard_statement(
    sql: &str,
    options: &GuardOptions,
    catalog: &SchemaCatalog,
) -> Result<GuardResult, GuardViolation> {
    let sql = sql.trim();
    if sql.is_empty() {
        return Err(GuardViolation::InvalidSqlInput);
    }
    if sql.chars().count() > MAX_SQL_CHARS {
        return Err(GuardViolation::InputTooLong {
            max_chars: MAX_SQL_CHARS,
        });
    }

    let tokens = Lexer::new(sql).tokenize().map_err(|errors| {
        let message = errors
            .first()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "invalid input".to_string());
        GuardViolation::parse(message)
    })?;
    reject_multiple_statements(&tokens)?;
    if !matches!(
        tokens.first().map(|t| &t.kind),
        Some(TokenKind::Select | TokenKind::With | TokenKind::LParen)
    ) {
        return Err(GuardViolation::InvalidQueryType);
    }

    let mut query = Parser::new(tokens)
        .parse_single_query()
        .map_err(|err| match err.kind {
            ParseErrorKind::NotAQuery => GuardViolation::InvalidQueryType,
            ParseErrorKind::Syntax => GuardViolation::parse(err.to_string()),
        })?;

    let mut rewriter = TenantRewriter::new(catalog.tenant_column(), &options.tenant_id);
    rewriter.query(&mut query);
    check_objects(&rewriter.tables, &rewriter.functions, catalog)?;

    let mut tables_used: Vec<String> = Vec::new();
    for table in &rewriter.tables {
        let name = table.name().normalized();
        if !tables_used.contains(&name) {
            tables_used.push(name);
        }
    }

    let limit_applied = apply_row_cap(&mut query, options.max_rows);
    let sql = render_query(
        &query,
        RenderOptions {
            backslash_escapes: options.backslash_escapes,
        },
    );

    Ok(GuardResult {
        sql,
        tables_used,
        limit_applied,
        org_injected: rewriter.injected > 0,
    })
}

fn reject_multiple_statements(tokens: &[Token]) -> Result<(), GuardViolation> {
    let mut iter = tokens.iter().peekable();
    while let Some(token) = iter.next() {
        if token.kind == TokenKind::Semicolon {
            if let Some(next) = iter.peek() {
                if next.kind != TokenKind::Eof {
                    return Err(GuardViolation::MultiStatement);
                }
            }
        }
    }
    Ok(())
}

fn is_system_schema(ident: &Ident) -> bool {
    SYSTEM_SCHEMAS.contains(&ident.normalized().as_str())
}

fn is_system_table(name: &ObjectName) -> bool {
    if name.qualifiers().iter().any(is_system_schema) {
        return true;
    }
    let table = name.name().normalized();
    SYSTEM_TABLES.contains(&table.as_str()) || table.starts_with("pg_") || table.starts_with("sqlite_")
}

fn is_system_function(name: &ObjectName) -> bool {
    if name.qualifiers().iter().any(is_system_schema) {
        return true;
    }
    let function = name.name().normalized();
    function.starts_with("pg_") || SYSTEM_FUNCTIONS.contains(&function.as_str())
}

fn check_objects(
    tables: &[ObjectName],
    functions: &[ObjectName],
    catalog: &SchemaCatalog,
) -> Result<(), GuardViolation> {
    if let Some(object) = tables
        .iter()
        .find(|t| is_system_table(t))
        .or_else(|| functions.iter().find(|f| is_system_function(f)))
    {
        return Err(GuardViolation::SystemSchemaAccess {
            object: object.dotted(),
        });
    }

    for table in tables {
        let schema_ok = match table.qualifiers() {
            [] => true,
            [schema] => catalog.allows_schema(&schema.value),
            _ => false,
        };
        if !schema_ok || !catalog.is_allowed(&table.name().value) {
            return Err(GuardViolation::DisallowedTable {
                table: table.dotted(),
            });
        }
    }
    Ok(())
}

/// Clamp the outermost LIMIT to `max_rows`, adding one when absent.
fn apply_row_cap(query: &mut Query, max_rows: u64) -> u64 {
    let existing = match &query.limit {
        Some(Expr::Value(Value::Number(n))) => n.parse::<u64>().ok(),
        _ => None,
    };
    let applied = existing.map_or(max_rows, |n| n.min(max_rows));
    query.limit = Some(Expr::Value(Value::Number(applied.to_string())));
    applied
}

/// Walks the whole tree once: records physical tables and called functions,
/// and ANDs a tenant predicate into every SELECT that reads a table.
struct TenantRewriter<'a> {
    tenant_column: &'a str,
    tenant_id: &'a str,
    /// CTE names visible at the current position, innermost last.
    cte_scopes: Vec<Vec<String>>,
    tables: Vec<ObjectName>,
    functions: Vec<ObjectName>,
    injected: usize,
}

impl<'a> TenantRewriter<'a> {
    fn new(tenant_column: &'a str, tenant_id: &'a str) -> Self {
        Self {
            tenant_column,
            tenant_id,
            cte_scopes: Vec::new(),
            tables: Vec::new(),
            functions: Vec::new(),
            injected: 0,
        }
    }

    fn is_cte(&self, name: &ObjectName) -> bool {
        if name.0.len() != 1 {
            return false;
        }
        let name = name.name().normalized();
        self.cte_scopes
            .iter()
            .any(|scope| scope.iter().any(|cte| *cte == name))
    }

    fn query(&mut self, query: &mut Query) {
        let scoped = match &mut query.with {
            Some(with) => {
                if with.recursive {
                    self.cte_scopes
                        .push(with.ctes.iter().map(|c| c.name.normalized()).collect());
                    for cte in &mut with.ctes {
                        self.query(&mut cte.query);
                    }
                } else {
                    // A plain CTE only sees the ones declared before it.
                    self.cte_scopes.push(Vec::new());
                    for cte in &mut with.ctes {
                        self.query(&mut cte.query);
                        if let Some(scope) = self.cte_scopes.last_mut() {
                            scope.push(cte.name.normalized());
                        }
                    }
                }
                true
            }
            None => false,
        };

        self.set_expr(&mut query.body);
        for item in &mut query.order_by {
            self.expr(&mut item.expr);
        }
        if let Some(limit) = &mut query.limit {
            self.expr(limit);
        }
        if let Some(offset) = &mut query.offset {
            self.expr(offset);
        }

        if scoped {
            self.cte_scopes.pop();
        }
    }

    fn set_expr(&mut self, body: &mut SetExpr) {
        match body {
            SetExpr::Select(select) => self.select(select),
            SetExpr::Query(query) => self.query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.set_expr(left);
                self.set_expr(right);
            }
        }
    }

    fn select(&mut self, select: &mut Select) {
        let mut bindings: Vec<Ident> = Vec::new();
        for table in &mut select.from {
            self.table_with_joins(table, &mut bindings);
        }
        for item in &mut select.projection {
            if let SelectItem::Expr { expr, .. } = item {
                self.expr(expr);
            }
        }
        if let Some(selection) = &mut select.selection {
            self.expr(selection);
        }
        for expr in &mut select.group_by {
            self.expr(expr);
        }
        if let Some(having) = &mut select.having {
            self.expr(having);
        }

        let mut predicates = bindings.into_iter().map(|b| self.tenant_predicate(b));
        let Some(first) = predicates.next() else {
            return;
        };
        let mut filter = match select.selection.take() {
            Some(existing) => existing.parenthesized().and(first),
            None => first,
        };
        let mut count = 1;
        for predicate in predicates {
            filter = filter.and(predicate);
            count += 1;
        }
        select.selection = Some(filter);
        self.injected += count;
    }

    fn tenant_predicate(&self, binding: Ident) -> Expr {
        Expr::BinaryOp {
            left: Box::new(Expr::CompoundIdentifier(vec![
                binding,
                Ident::new(self.tenant_column),
            ])),
            op: BinaryOperator::Eq,
            right: Box::new(Expr::Value(Value::String(self.tenant_id.to_string()))),
        }
    }

    fn table_with_joins(&mut self, table: &mut TableWithJoins, bindings: &mut Vec<Ident>) {
        self.table_factor(&mut table.relation, bindings);
        for join in &mut table.joins {
            self.table_factor(&mut join.relation, bindings);
            match &mut join.operator {
                JoinOperator::Inner(JoinConstraint::On(expr))
                | JoinOperator::LeftOuter(JoinConstraint::On(expr))
                | JoinOperator::RightOuter(JoinConstraint::On(expr))
                | JoinOperator::FullOuter(JoinConstraint::On(expr)) => self.expr(expr),
                _ => {}
            }
        }
    }

    fn table_factor(&mut self, factor: &mut TableFactor, bindings: &mut Vec<Ident>) {
        match factor {
            TableFactor::Table { name, alias } => {
                if self.is_cte(name) {
                    return;
                }
                self.tables.push(name.clone());
                let binding = alias
                    .as_ref()
                    .map(|a| a.name.clone())
                    .unwrap_or_else(|| name.name().clone());
                let key = binding.normalized();
                if !bindings.iter().any(|b| b.normalized() == key) {
                    bindings.push(binding);
                }
            }
            TableFactor::Derived { subquery, .. } => self.query(subquery),
            TableFactor::NestedJoin(inner) => self.table_with_joins(inner, bindings),
        }
    }

    fn exprs(&mut self, exprs: &mut [Expr]) {
        for expr in exprs {
            self.expr(expr);
        }
    }

    fn expr(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Identifier(_)
            | Expr::CompoundIdentifier(_)
            | Expr::Value(_)
            | Expr::TypedString { .. } => {}
            Expr::Interval { value, .. } => self.expr(value),
            Expr::BinaryOp { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            Expr::UnaryOp { expr, .. }
            | Expr::Nested(expr)
            | Expr::Is { expr, .. }
            | Expr::Cast { expr, .. }
            | Expr::Extract { expr, .. } => self.expr(expr),
            Expr::InList { expr, list, .. } => {
                self.expr(expr);
                self.exprs(list);
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.expr(expr);
                self.query(subquery);
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.expr(expr);
                self.expr(low);
                self.expr(high);
            }
            Expr::Like { expr, pattern, .. } => {
                self.expr(expr);
                self.expr(pattern);
            }
            Expr::Function(function) => {
                self.functions.push(function.name.clone());
                if let FunctionArgs::List { args, .. } = &mut function.args {
                    self.exprs(args);
                }
                if let Some(window) = &mut function.over {
                    self.exprs(&mut window.partition_by);
                    for item in &mut window.order_by {
                        self.expr(&mut item.expr);
                    }
                }
            }
            Expr::Case {
                operand,
                conditions,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.expr(operand);
                }
                for (condition, result) in conditions {
                    self.expr(condition);
                    self.expr(result);
                }
                if let Some(else_result) = else_result {
                    self.expr(else_result);
                }
            }
            Expr::Exists { subquery, .. } | Expr::Subquery(subquery) => self.query(subquery),
        }
    }
}
