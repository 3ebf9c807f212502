//! Serializes a (rewritten) query tree back to SQL text.
//!
//! Explicit parentheses survive parsing as `Expr::Nested`, so binary
//! operators can be emitted without re-deriving precedence.

use crate::ast::*;
use crate::token::TokenKind;

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    /// Escape `\` inside string literals and quoted identifiers for engines
    /// that treat it as an escape character (ClickHouse, MySQL).
    pub backslash_escapes: bool,
}

pub fn render_query(query: &Query, options: RenderOptions) -> String {
    let mut renderer = Renderer {
        out: String::new(),
        options,
    };
    renderer.query(query);
    renderer.out
}

#[cfg(test)]
pub fn render_expr(expr: &Expr, options: RenderOptions) -> String {
    let mut renderer = Renderer {
        out: String::new(),
        options,
    };
    renderer.expr(expr);
    renderer.out
}

pub fn quote_string(value: &str, options: RenderOptions) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' if options.backslash_escapes => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn is_plain_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !TokenKind::is_keyword(value)
}

struct Renderer {
    out: String,
    options: RenderOptions,
}

impl Renderer {
    fn push(&mut self, text: &str) {
        self.out.push_str(text);
    }

    fn ident(&mut self, ident: &Ident) {
        let quote = match ident.quote {
            Some(quote) => quote,
            None if is_plain_identifier(&ident.value) => {
                self.out.push_str(&ident.value);
                return;
            }
            None => '"',
        };
        self.out.push(quote);
        for c in ident.value.chars() {
            if c == quote || (c == '\\' && self.options.backslash_escapes) {
                self.out.push(c);
            }
            self.out.push(c);
        }
        self.out.push(quote);
    }

    fn idents(&mut self, idents: &[Ident], separator: &str) {
        for (idx, ident) in idents.iter().enumerate() {
            if idx > 0 {
                self.push(separator);
            }
            self.ident(ident);
        }
    }

    fn object_name(&mut self, name: &ObjectName) {
        self.idents(&name.0, ".");
    }

    fn comma_separated<T>(&mut self, items: &[T], mut each: impl FnMut(&mut Self, &T)) {
        for (idx, item) in items.iter().enumerate() {
            if idx > 0 {
                self.push(", ");
            }
            each(self, item);
        }
    }

    fn query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            self.push("WITH ");
            if with.recursive {
                self.push("RECURSIVE ");
            }
            self.comma_separated(&with.ctes, |r, cte| {
                r.ident(&cte.name);
                if !cte.columns.is_empty() {
                    r.push(" (");
                    r.idents(&cte.columns, ", ");
                    r.push(")");
                }
                r.push(" AS (");
                r.query(&cte.query);
                r.push(")");
            });
            self.push(" ");
        }
        self.set_expr(&query.body);
        if !query.order_by.is_empty() {
            self.push(" ORDER BY ");
            self.order_by(&query.order_by);
        }
        if let Some(limit) = &query.limit {
            self.push(" LIMIT ");
            self.expr(limit);
        }
        if let Some(offset) = &query.offset {
            self.push(" OFFSET ");
            self.expr(offset);
        }
    }

    fn set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => self.select(select),
            SetExpr::Query(query) => {
                self.push("(");
                self.query(query);
                self.push(")");
            }
            SetExpr::SetOperation {
                op,
                all,
                left,
                right,
            } => {
                self.set_expr(left);
                self.push(match op {
                    SetOperator::Union => " UNION ",
                    SetOperator::Intersect => " INTERSECT ",
                    SetOperator::Except => " EXCEPT ",
                });
                if *all {
                    self.push("ALL ");
                }
                // The parser only nests to the right for INTERSECT, which
                // already binds tighter than UNION and EXCEPT.
                self.set_expr(right);
            }
        }
    }

    fn select(&mut self, select: &Select) {
        self.push("SELECT ");
        if select.distinct {
            self.push("DISTINCT ");
        }
        self.comma_separated(&select.projection, |r, item| match item {
            SelectItem::Wildcard => r.push("*"),
            SelectItem::QualifiedWildcard(name) => {
                r.object_name(name);
                r.push(".*");
            }
            SelectItem::Expr { expr, alias } => {
                r.expr(expr);
                if let Some(alias) = alias {
                    r.push(" AS ");
                    r.ident(alias);
                }
            }
        });
        if !select.from.is_empty() {
            self.push(" FROM ");
            self.comma_separated(&select.from, |r, table| r.table_with_joins(table));
        }
        if let Some(selection) = &select.selection {
            self.push(" WHERE ");
            self.expr(selection);
        }
        if !select.group_by.is_empty() {
            self.push(" GROUP BY ");
            self.comma_separated(&select.group_by, |r, expr| r.expr(expr));
        }
        if let Some(having) = &select.having {
            self.push(" HAVING ");
            self.expr(having);
        }
    }

    fn table_with_joins(&mut self, table: &TableWithJoins) {
        self.table_factor(&table.relation);
        for join in &table.joins {
            let (keyword, constraint) = match &join.operator {
                JoinOperator::Inner(c) => (" JOIN ", Some(c)),
                JoinOperator::LeftOuter(c) => (" LEFT JOIN ", Some(c)),
                JoinOperator::RightOuter(c) => (" RIGHT JOIN ", Some(c)),
                JoinOperator::FullOuter(c) => (" FULL JOIN ", Some(c)),
                JoinOperator::Cross => (" CROSS JOIN ", None),
            };
            self.push(keyword);
            self.table_factor(&join.relation);
            match constraint {
                Some(JoinConstraint::On(expr)) => {
                    self.push(" ON ");
                    self.expr(expr);
                }
                Some(JoinConstraint::Using(columns)) => {
                    self.push(" USING (");
                    self.idents(columns, ", ");
                    self.push(")");
                }
                Some(JoinConstraint::None) | None => {}
            }
        }
    }

    fn table_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, alias } => {
                self.object_name(name);
                self.table_alias(alias.as_ref());
            }
            TableFactor::Derived { subquery, alias } => {
                self.push("(");
                self.query(subquery);
                self.push(")");
                self.table_alias(alias.as_ref());
            }
            TableFactor::NestedJoin(inner) => {
                self.push("(");
                self.table_with_joins(inner);
                self.push(")");
            }
        }
    }

    fn table_alias(&mut self, alias: Option<&TableAlias>) {
        let Some(alias) = alias else {
            return;
        };
        self.push(" AS ");
        self.ident(&alias.name);
        if !alias.columns.is_empty() {
            self.push(" (");
            self.idents(&alias.columns, ", ");
            self.push(")");
        }
    }

    fn order_by(&mut self, items: &[OrderByExpr]) {
        self.comma_separated(items, |r, item| {
            r.expr(&item.expr);
            match item.asc {
                Some(true) => r.push(" ASC"),
                Some(false) => r.push(" DESC"),
                None => {}
            }
            match item.nulls_first {
                Some(true) => r.push(" NULLS FIRST"),
                Some(false) => r.push(" NULLS LAST"),
                None => {}
            }
        });
    }

    fn value(&mut self, value: &Value) {
        match value {
            Value::Number(n) => self.push(n),
            Value::String(s) => {
                let quoted = quote_string(s, self.options);
                self.push(&quoted);
            }
            Value::Boolean(true) => self.push("TRUE"),
            Value::Boolean(false) => self.push("FALSE"),
            Value::Null => self.push("NULL"),
        }
    }

    fn subquery(&mut self, query: &Query) {
        self.push("(");
        self.query(query);
        self.push(")");
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Identifier(ident) => self.ident(ident),
            Expr::CompoundIdentifier(parts) => self.idents(parts, "."),
            Expr::Value(value) => self.value(value),
            Expr::TypedString { data_type, value } => {
                self.push(data_type);
                self.push(" ");
                let quoted = quote_string(value, self.options);
                self.push(&quoted);
            }
            Expr::Interval { value, unit } => {
                self.push("INTERVAL ");
                self.expr(value);
                if let Some(unit) = unit {
                    self.push(" ");
                    self.push(unit);
                }
            }
            Expr::BinaryOp { left, op, right } => {
                self.expr(left);
                self.push(" ");
                self.push(op.as_str());
                self.push(" ");
                self.expr(right);
            }
            Expr::UnaryOp { op, expr } => {
                match op {
                    UnaryOperator::Not => self.push("NOT "),
                    UnaryOperator::Minus => self.push("-"),
                    UnaryOperator::Plus => self.push("+"),
                }
                self.expr(expr);
            }
            Expr::Nested(inner) => {
                self.push("(");
                self.expr(inner);
                self.push(")");
            }
            Expr::Is {
                expr,
                negated,
                target,
            } => {
                self.expr(expr);
                self.push(if *negated { " IS NOT " } else { " IS " });
                self.push(match target {
                    IsTarget::Null => "NULL",
                    IsTarget::True => "TRUE",
                    IsTarget::False => "FALSE",
                });
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                self.expr(expr);
                self.push(if *negated { " NOT IN (" } else { " IN (" });
                self.comma_separated(list, |r, item| r.expr(item));
                self.push(")");
            }
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                self.expr(expr);
                self.push(if *negated { " NOT IN " } else { " IN " });
                self.subquery(subquery);
            }
            Expr::Between {
                expr,
                negated,
                low,
                high,
            } => {
                self.expr(expr);
                self.push(if *negated { " NOT BETWEEN " } else { " BETWEEN " });
                self.expr(low);
                self.push(" AND ");
                self.expr(high);
            }
            Expr::Like {
                expr,
                negated,
                case_insensitive,
                pattern,
            } => {
                self.expr(expr);
                if *negated {
                    self.push(" NOT");
                }
                self.push(if *case_insensitive { " ILIKE " } else { " LIKE " });
                self.expr(pattern);
            }
            Expr::Function(function) => self.function(function),
            Expr::Case {
                operand,
                conditions,
                else_result,
            } => {
                self.push("CASE");
                if let Some(operand) = operand {
                    self.push(" ");
                    self.expr(operand);
                }
                for (condition, result) in conditions {
                    self.push(" WHEN ");
                    self.expr(condition);
                    self.push(" THEN ");
                    self.expr(result);
                }
                if let Some(else_result) = else_result {
                    self.push(" ELSE ");
                    self.expr(else_result);
                }
                self.push(" END");
            }
            Expr::Cast {
                expr,
                data_type,
                shorthand,
            } => {
                if *shorthand {
                    self.expr(expr);
                    self.push("::");
                    self.push(data_type);
                } else {
                    self.push("CAST(");
                    self.expr(expr);
                    self.push(" AS ");
                    self.push(data_type);
                    self.push(")");
                }
            }
            Expr::Extract { field, expr } => {
                self.push("EXTRACT(");
                self.push(field);
                self.push(" FROM ");
                self.expr(expr);
                self.push(")");
            }
            Expr::Exists { subquery, negated } => {
                if *negated {
                    self.push("NOT ");
                }
                self.push("EXISTS ");
                self.subquery(subquery);
            }
            Expr::Subquery(query) => self.subquery(query),
        }
    }

    fn function(&mut self, function: &Function) {
        self.object_name(&function.name);
        self.push("(");
        match &function.args {
            FunctionArgs::Star => self.push("*"),
            FunctionArgs::List { distinct, args } => {
                if *distinct {
                    self.push("DISTINCT ");
                }
                self.comma_separated(args, |r, arg| r.expr(arg));
            }
        }
        self.push(")");
        let Some(window) = &function.over else {
            return;
        };
        self.push(" OVER (");
        let mut needs_space = false;
        if !window.partition_by.is_empty() {
            self.push("PARTITION BY ");
            self.comma_separated(&window.partition_by, |r, expr| r.expr(expr));
            needs_space = true;
        }
        if !window.order_by.is_empty() {
            if needs_space {
                self.push(" ");
            }
            self.push("ORDER BY ");
            self.order_by(&window.order_by);
            needs_space = true;
        }
        if let Some(frame) = &window.frame {
            if needs_space {
                self.push(" ");
            }
            self.push(frame);
        }
        self.push(")");
    }
}
