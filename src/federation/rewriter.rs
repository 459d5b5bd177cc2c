// SPDX-License-Identifier: Apache-2.0

//! Source-identity rewriter.
//!
//! Resolves which model a command targets, decides how many source-bound
//! instances it fans out to, and replaces every reference to the
//! source-identity pseudo-column with the literal of one binding.

use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;

use sqlparser::ast::{
    visit_expressions, visit_expressions_mut, BinaryOperator, Expr, FromTable, FunctionArg,
    FunctionArguments, GroupByExpr, Ident, Insert, ObjectName, ObjectNamePart, Query, Select,
    SelectItem, SetExpr, Statement, TableFactor, TableObject, TableWithJoins, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::context::Determinism;
use crate::engine::error::{EngineError, EngineResult};

use super::metadata::{MetadataLookup, SourceIdentityMetadata, TableMetadata};
use super::types::{CommandKind, SourceBinding};

/// Parses a single command.
pub fn parse_command(sql: &str) -> EngineResult<Statement> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql.trim())
        .map_err(|e| EngineError::syntax_error(format!("Failed to parse command: {e}")))?;

    if statements.len() != 1 {
        return Err(EngineError::validation("Commands must be a single statement"));
    }
    Ok(statements.remove(0))
}

/// Parses a `;`-separated batch, preserving statement order.
pub fn parse_batch(sql: &str) -> EngineResult<Vec<Statement>> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql.trim())
        .map_err(|e| EngineError::syntax_error(format!("Failed to parse batch: {e}")))?;
    if statements.is_empty() {
        return Err(EngineError::validation("Batch contains no statements"));
    }
    Ok(statements)
}

/// Classifies a statement for the merge stage.
pub fn command_kind(statement: &Statement) -> EngineResult<CommandKind> {
    match statement {
        Statement::Query(_) => Ok(CommandKind::Query),
        Statement::Insert(_) => Ok(CommandKind::Insert),
        Statement::Update(_) => Ok(CommandKind::Update),
        Statement::Delete(_) => Ok(CommandKind::Delete),
        Statement::Call(_) => Ok(CommandKind::Procedure),
        other => Err(EngineError::not_supported(format!(
            "Unsupported command for multi-source execution: {other}"
        ))),
    }
}

/// How broadly the plan of a statement may be reused, judged by the
/// functions it calls.
pub fn classify_determinism(statement: &Statement) -> Determinism {
    let mut level = Determinism::Deterministic;
    let _ = visit_expressions(statement, |expr| {
        if let Expr::Function(func) = expr {
            let name = func.name.to_string().to_uppercase();
            level = level.max(function_determinism(&name));
        }
        ControlFlow::<()>::Continue(())
    });
    level
}

fn function_determinism(name: &str) -> Determinism {
    match name {
        "RAND" | "RANDOM" | "UUID" | "NEWID" => Determinism::Nondeterministic,
        "NOW" | "CURRENT_TIMESTAMP" | "CURRENT_DATE" | "CURRENT_TIME" | "CURTIME" => {
            Determinism::CommandDeterministic
        }
        "SESSION_ID" => Determinism::SessionDeterministic,
        "USER" | "CURRENT_USER" | "SESSION_USER" => Determinism::UserDeterministic,
        _ => Determinism::Deterministic,
    }
}

/// What a command targets, resolved against metadata.
#[derive(Debug, Clone)]
pub struct CommandScope {
    pub model: String,
    pub kind: CommandKind,
    pub multi_source: bool,
    pub bindings: Vec<SourceBinding>,
    /// Lowercased names and aliases that qualify a multi-source table
    qualifiers: HashSet<String>,
}

impl CommandScope {
    fn qualifies(&self, qualifier: &str) -> bool {
        self.qualifiers.contains(&qualifier.to_lowercase())
    }
}

/// One source-bound command.
#[derive(Debug, Clone)]
pub struct InstanceCommand {
    pub binding: SourceBinding,
    pub statement: Statement,
}

/// Result of fanning one command out.
#[derive(Debug, Clone)]
pub struct Expansion {
    pub scope: CommandScope,
    pub instances: Vec<InstanceCommand>,
}

/// Per-instance parameter set: everything that differs between instances.
///
/// Built once per instance and consumed by `apply`.
#[derive(Debug)]
pub struct CriteriaDesc {
    binding: SourceBinding,
    /// Target rows for a routed multi-row INSERT, pseudo-column value removed
    insert_rows: Option<Vec<Vec<Expr>>>,
    /// Index of the pseudo-column in the INSERT rows, and in the column list
    /// when one is written
    insert_column: Option<usize>,
    /// Drop the `source => 'x'` argument of a procedure call
    strip_source_argument: bool,
}

impl CriteriaDesc {
    fn for_binding(binding: SourceBinding) -> Self {
        Self {
            binding,
            insert_rows: None,
            insert_column: None,
            strip_source_argument: false,
        }
    }

    pub fn literal(&self) -> &str {
        self.binding.literal()
    }

    /// Produces the source-bound command for this instance.
    pub fn apply(
        self,
        rewriter: &QueryRewriter,
        statement: &Statement,
        scope: &CommandScope,
    ) -> EngineResult<InstanceCommand> {
        let mut rewritten = rewriter.substitute(statement, scope, self.binding.literal())?;

        if let (Some(index), Some(rows)) = (self.insert_column, self.insert_rows) {
            if let Statement::Insert(insert) = &mut rewritten {
                if index < insert.columns.len() {
                    insert.columns.remove(index);
                }
                if let Some(source) = insert.source.as_mut() {
                    if let SetExpr::Values(values) = source.body.as_mut() {
                        values.rows = rows;
                    }
                }
            }
        }

        if self.strip_source_argument {
            if let Statement::Call(func) = &mut rewritten {
                if let FunctionArguments::List(list) = &mut func.args {
                    list.args
                        .retain(|arg| named_argument(arg, rewriter.column_name()).is_none());
                }
            }
        }

        Ok(InstanceCommand {
            binding: self.binding,
            statement: rewritten,
        })
    }
}

/// A table reference as written in the command
#[derive(Debug, Clone)]
struct TableRef {
    parts: Vec<String>,
    alias: Option<String>,
}

impl TableRef {
    fn new(name: &ObjectName, alias: Option<&Ident>) -> Self {
        Self {
            parts: name_parts(name),
            alias: alias.map(|a| a.value.clone()),
        }
    }

    fn dotted(&self) -> String {
        self.parts.join(".")
    }
}

fn part_value(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(ident) => ident.value.clone(),
        _ => String::new(),
    }
}

fn name_parts(name: &ObjectName) -> Vec<String> {
    name.0.iter().map(part_value).collect()
}

pub struct QueryRewriter {
    metadata: Arc<SourceIdentityMetadata>,
}

impl QueryRewriter {
    pub fn new(metadata: Arc<SourceIdentityMetadata>) -> Self {
        Self { metadata }
    }

    pub fn column_name(&self) -> &str {
        self.metadata.source_column_name()
    }

    /// Resolves the model and bindings a command runs against.
    pub fn resolve_scope(&self, statement: &Statement) -> EngineResult<CommandScope> {
        let kind = command_kind(statement)?;
        if kind == CommandKind::Procedure {
            return self.procedure_scope(statement);
        }

        let refs = collect_statement_refs(statement)?;
        let mut model: Option<String> = None;
        let mut qualifiers = HashSet::new();

        for table_ref in refs.tables {
            if table_ref.parts.len() == 1 && refs.ctes.contains(&table_ref.parts[0].to_lowercase()) {
                continue;
            }
            let dotted = table_ref.dotted();
            let table = self
                .metadata
                .table(&dotted)
                .ok_or_else(|| EngineError::configuration(format!("Unknown table '{dotted}'")))?;

            match &model {
                Some(current) if !current.eq_ignore_ascii_case(&table.model) => {
                    return Err(EngineError::not_supported(format!(
                        "Command mixes models '{current}' and '{}'",
                        table.model
                    )));
                }
                None => model = Some(table.model.clone()),
                _ => {}
            }

            if self.metadata.is_multi_source_table(&table) {
                qualifiers.insert(table.name.to_lowercase());
                qualifiers.insert(table.full_name().to_lowercase());
                qualifiers.insert(dotted.to_lowercase());
                if let Some(alias) = table_ref.alias {
                    qualifiers.insert(alias.to_lowercase());
                }
            }
        }

        // A derived table or CTE carrying the pseudo-column qualifies it too.
        for (name, columns) in &refs.views {
            if columns
                .iter()
                .any(|c| c == "*" || self.metadata.is_source_column_name(c))
            {
                qualifiers.insert(name.clone());
            }
        }

        let model =
            model.ok_or_else(|| EngineError::validation("Command does not reference any table"))?;
        self.scope_for(model, kind, qualifiers)
    }

    fn procedure_scope(&self, statement: &Statement) -> EngineResult<CommandScope> {
        let Statement::Call(func) = statement else {
            return Err(EngineError::internal("procedure scope requested for non-CALL"));
        };
        let parts = name_parts(&func.name);
        if parts.len() < 2 {
            return Err(EngineError::configuration(format!(
                "Procedure '{}' must be qualified by its model",
                func.name
            )));
        }
        let model = parts[parts.len() - 2].clone();
        self.scope_for(model, CommandKind::Procedure, HashSet::new())
    }

    fn scope_for(
        &self,
        model: String,
        kind: CommandKind,
        qualifiers: HashSet<String>,
    ) -> EngineResult<CommandScope> {
        let registry = self.metadata.registry();
        let bindings = registry
            .bindings(&model)
            .ok_or_else(|| {
                EngineError::configuration(format!(
                    "No source binding registered for model '{model}'"
                ))
            })?
            .to_vec();

        Ok(CommandScope {
            multi_source: registry.is_multi_source(&model),
            model,
            kind,
            bindings,
            qualifiers,
        })
    }

    /// Produces the source-bound instances needed to satisfy `statement`.
    pub fn expand(&self, statement: &Statement) -> EngineResult<Expansion> {
        let (scope, criteria) = self.route(statement)?;
        let instances = criteria
            .into_iter()
            .map(|desc| desc.apply(self, statement, &scope))
            .collect::<EngineResult<Vec<_>>>()?;

        tracing::debug!(
            model = %scope.model,
            kind = ?scope.kind,
            instances = instances.len(),
            "Expanded command"
        );
        Ok(Expansion { scope, instances })
    }

    /// Decides which bindings `statement` must run against, without
    /// rewriting it yet.
    pub fn route(&self, statement: &Statement) -> EngineResult<(CommandScope, Vec<CriteriaDesc>)> {
        let scope = self.resolve_scope(statement)?;
        let criteria = self.criteria(statement, &scope)?;
        Ok((scope, criteria))
    }

    fn criteria(&self, statement: &Statement, scope: &CommandScope) -> EngineResult<Vec<CriteriaDesc>> {
        if !scope.multi_source {
            return Ok(scope
                .bindings
                .iter()
                .take(1)
                .cloned()
                .map(CriteriaDesc::for_binding)
                .collect());
        }

        match statement {
            Statement::Query(query) => {
                let constraint = match query.body.as_ref() {
                    SetExpr::Select(select) => self.route_by_predicate(select.selection.as_ref(), scope)?,
                    _ => None,
                };
                Ok(self.targets(scope, constraint))
            }
            Statement::Update(update) => {
                for assignment in &update.assignments {
                    let target = assignment.target.to_string();
                    let column = target.rsplit('.').next().unwrap_or(&target);
                    if self.metadata.is_source_column_name(column.trim_matches('"')) {
                        return Err(EngineError::configuration(format!(
                            "Cannot assign the source column '{}'",
                            self.column_name()
                        )));
                    }
                }
                let constraint = self.route_by_predicate(update.selection.as_ref(), scope)?;
                Ok(self.targets(scope, constraint))
            }
            Statement::Delete(delete) => {
                let constraint = self.route_by_predicate(delete.selection.as_ref(), scope)?;
                Ok(self.targets(scope, constraint))
            }
            Statement::Insert(insert) => {
                let values = match insert.source.as_deref().map(|q| q.body.as_ref()) {
                    Some(SetExpr::Values(values)) => Some(values),
                    _ => None,
                };
                let named = insert
                    .columns
                    .iter()
                    .position(|c| self.metadata.is_source_column_name(&c.value));

                match (named, values) {
                    (Some(index), Some(values)) => self.route_insert_rows(&values.rows, index, scope),
                    (Some(_), None) => Err(EngineError::configuration(format!(
                        "INSERT naming '{}' must use a VALUES list",
                        self.column_name()
                    ))),
                    (None, Some(values)) if insert.columns.is_empty() => {
                        match self.positional_source_index(insert, &values.rows) {
                            Some(index) => self.route_insert_rows(&values.rows, index, scope),
                            None => Ok(self.targets(scope, None)),
                        }
                    }
                    (None, _) => Ok(self.targets(scope, None)),
                }
            }
            Statement::Call(func) => {
                let mut routed = None;
                if let FunctionArguments::List(list) = &func.args {
                    for arg in &list.args {
                        if let Some(value) = named_argument(arg, self.column_name()) {
                            let literal = literal_text(value).ok_or_else(|| {
                                EngineError::configuration(format!(
                                    "Argument '{}' must be a literal",
                                    self.column_name()
                                ))
                            })?;
                            routed = Some(BTreeSet::from([literal]));
                        }
                    }
                }
                let mut criteria = self.targets(scope, routed.clone());
                if routed.is_some() {
                    for desc in &mut criteria {
                        desc.strip_source_argument = true;
                    }
                }
                Ok(criteria)
            }
            _ => Err(EngineError::not_supported(format!(
                "Unsupported command for multi-source execution: {statement}"
            ))),
        }
    }

    fn targets(&self, scope: &CommandScope, constraint: Option<BTreeSet<String>>) -> Vec<CriteriaDesc> {
        scope
            .bindings
            .iter()
            .filter(|binding| {
                constraint
                    .as_ref()
                    .map(|allowed| allowed.contains(binding.literal()))
                    .unwrap_or(true)
            })
            .cloned()
            .map(CriteriaDesc::for_binding)
            .collect()
    }

    /// Position of the pseudo-column in an INSERT without a column list.
    ///
    /// Only when every row supplies a value for every column of the target,
    /// pseudo-column included. Shorter rows fan out unchanged.
    fn positional_source_index(&self, insert: &Insert, rows: &[Vec<Expr>]) -> Option<usize> {
        let TableObject::TableName(name) = &insert.table else {
            return None;
        };
        let table = self.metadata.table(&name_parts(name).join("."))?;
        if !self.metadata.is_multi_source_table(&table) {
            return None;
        }
        let index = table.columns.iter().position(|c| c.synthetic)?;
        let width = table.columns.len();
        (!rows.is_empty() && rows.iter().all(|row| row.len() == width)).then_some(index)
    }

    fn route_insert_rows(
        &self,
        rows: &[Vec<Expr>],
        index: usize,
        scope: &CommandScope,
    ) -> EngineResult<Vec<CriteriaDesc>> {
        let mut criteria: Vec<CriteriaDesc> = Vec::new();
        for row in rows {
            let value = row.get(index).ok_or_else(|| {
                EngineError::validation("INSERT row has fewer values than columns")
            })?;
            let literal = literal_text(value).ok_or_else(|| {
                EngineError::configuration(format!(
                    "Value for '{}' must be a literal, found {value}",
                    self.column_name()
                ))
            })?;
            let Some(binding) = self.metadata.registry().binding_for(&scope.model, &literal) else {
                tracing::debug!(%literal, "INSERT row targets no known source, dropped");
                continue;
            };

            let mut target_row = row.clone();
            target_row.remove(index);

            match criteria.iter_mut().find(|c| c.binding == *binding) {
                Some(desc) => desc.insert_rows.get_or_insert_with(Vec::new).push(target_row),
                None => {
                    let mut desc = CriteriaDesc::for_binding(binding.clone());
                    desc.insert_column = Some(index);
                    desc.insert_rows = Some(vec![target_row]);
                    criteria.push(desc);
                }
            }
        }
        criteria.sort_by_key(|c| c.binding.ordinal);
        Ok(criteria)
    }

    /// Reads the top-level conjuncts of a WHERE clause for constraints on the
    /// pseudo-column. `None` means unconstrained.
    fn route_by_predicate(
        &self,
        selection: Option<&Expr>,
        scope: &CommandScope,
    ) -> EngineResult<Option<BTreeSet<String>>> {
        let Some(selection) = selection else {
            return Ok(None);
        };

        let mut conjuncts = Vec::new();
        split_conjuncts(selection, &mut conjuncts);

        let mut constraint: Option<BTreeSet<String>> = None;
        for conjunct in conjuncts {
            let Some(allowed) = self.conjunct_constraint(conjunct, scope)? else {
                continue;
            };
            constraint = Some(match constraint {
                Some(current) => current.intersection(&allowed).cloned().collect(),
                None => allowed,
            });
        }
        Ok(constraint)
    }

    fn conjunct_constraint(
        &self,
        expr: &Expr,
        scope: &CommandScope,
    ) -> EngineResult<Option<BTreeSet<String>>> {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Eq,
                right,
            } => {
                if self.is_source_ref(left, scope)? {
                    return Ok(literal_text(right).map(|l| BTreeSet::from([l])));
                }
                if self.is_source_ref(right, scope)? {
                    return Ok(literal_text(left).map(|l| BTreeSet::from([l])));
                }
                Ok(None)
            }
            Expr::InList {
                expr,
                list,
                negated: false,
            } if self.is_source_ref(expr, scope)? => {
                let literals: Option<BTreeSet<String>> = list.iter().map(literal_text).collect();
                Ok(literals)
            }
            Expr::Nested(inner) => self.conjunct_constraint(inner, scope),
            _ => Ok(None),
        }
    }

    /// True when `expr` is exactly a reference to the pseudo-column.
    ///
    /// A qualified reference whose qualifier names no multi-source table in
    /// the command is rejected rather than silently left alone.
    pub fn is_source_ref(&self, expr: &Expr, scope: &CommandScope) -> EngineResult<bool> {
        if !scope.multi_source {
            return Ok(false);
        }
        match expr {
            Expr::Identifier(ident) => Ok(self.metadata.is_source_column_name(&ident.value)),
            Expr::CompoundIdentifier(idents) => {
                let Some((last, qualifier)) = idents.split_last() else {
                    return Ok(false);
                };
                if !self.metadata.is_source_column_name(&last.value) {
                    return Ok(false);
                }
                let qualifier = qualifier
                    .iter()
                    .map(|i| i.value.as_str())
                    .collect::<Vec<_>>()
                    .join(".");
                if scope.qualifies(&qualifier) {
                    Ok(true)
                } else {
                    Err(EngineError::configuration(format!(
                        "Malformed source column reference '{expr}'"
                    )))
                }
            }
            _ => Ok(false),
        }
    }

    /// Replaces every pseudo-column reference with `literal`.
    ///
    /// Wildcards over multi-source tables are expanded first so the
    /// pseudo-column is materialized in the projection. Running it again on
    /// its own output changes nothing.
    pub fn substitute(
        &self,
        statement: &Statement,
        scope: &CommandScope,
        literal: &str,
    ) -> EngineResult<Statement> {
        let mut rewritten = statement.clone();
        if !scope.multi_source {
            return Ok(rewritten);
        }

        if let Statement::Query(query) = &mut rewritten {
            self.expand_projection(query, scope)?;
            self.drop_source_groups(query, scope)?;
        }

        let mut failure = None;
        let _ = visit_expressions_mut(&mut rewritten, |expr| {
            match self.is_source_ref(expr, scope) {
                Ok(true) => *expr = string_literal(literal),
                Ok(false) => {}
                Err(err) => {
                    failure = Some(err);
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(rewritten),
        }
    }

    /// Removes GROUP BY entries on the pseudo-column, which is constant within
    /// one instance. The merge stage groups on the projected value.
    fn drop_source_groups(&self, query: &mut Query, scope: &CommandScope) -> EngineResult<()> {
        if let Some(with) = query.with.as_mut() {
            for cte in &mut with.cte_tables {
                self.drop_source_groups(&mut cte.query, scope)?;
            }
        }
        self.drop_set_expr_groups(&mut query.body, scope)
    }

    fn drop_set_expr_groups(&self, body: &mut SetExpr, scope: &CommandScope) -> EngineResult<()> {
        match body {
            SetExpr::Select(select) => {
                if let GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
                    let mut kept = Vec::with_capacity(exprs.len());
                    for expr in std::mem::take(exprs) {
                        if !self.is_source_ref(&expr, scope)? {
                            kept.push(expr);
                        }
                    }
                    *exprs = kept;
                }
                Ok(())
            }
            SetExpr::Query(query) => self.drop_source_groups(query, scope),
            SetExpr::SetOperation { left, right, .. } => {
                self.drop_set_expr_groups(left, scope)?;
                self.drop_set_expr_groups(right, scope)
            }
            _ => Ok(()),
        }
    }

    /// Expands wildcards over known tables and names projected pseudo-column
    /// references, for every SELECT of the top-level body.
    pub fn expand_projection(&self, query: &mut Query, scope: &CommandScope) -> EngineResult<()> {
        if !scope.multi_source {
            return Ok(());
        }
        self.expand_set_expr(&mut query.body, scope)
    }

    fn expand_set_expr(&self, body: &mut SetExpr, scope: &CommandScope) -> EngineResult<()> {
        match body {
            SetExpr::Select(select) => self.expand_select(select, scope),
            SetExpr::Query(query) => self.expand_set_expr(&mut query.body, scope),
            SetExpr::SetOperation { left, right, .. } => {
                self.expand_set_expr(left, scope)?;
                self.expand_set_expr(right, scope)
            }
            _ => Ok(()),
        }
    }

    fn expand_select(&self, select: &mut Select, scope: &CommandScope) -> EngineResult<()> {
        let sources = self.from_tables(select);
        let qualify = sources.as_ref().map(|s| s.len() > 1).unwrap_or(false);
        let mut projection = Vec::with_capacity(select.projection.len());

        for item in std::mem::take(&mut select.projection) {
            match item {
                SelectItem::Wildcard(options) => match &sources {
                    Some(tables) => {
                        for (qualifier, table) in tables {
                            self.push_table_columns(&mut projection, qualifier, table, qualify);
                        }
                    }
                    None => projection.push(SelectItem::Wildcard(options)),
                },
                item @ SelectItem::QualifiedWildcard(..) => {
                    let text = item.to_string();
                    let wanted = text.trim_end_matches(".*").trim_matches('"').to_lowercase();
                    let matched = sources.as_ref().and_then(|tables| {
                        tables.iter().find(|(qualifier, table)| {
                            qualifier.to_lowercase() == wanted
                                || table.full_name().to_lowercase() == wanted
                        })
                    });
                    match matched {
                        Some((qualifier, table)) => {
                            self.push_table_columns(&mut projection, qualifier, table, qualify)
                        }
                        None => projection.push(item),
                    }
                }
                SelectItem::UnnamedExpr(expr) => {
                    if self.is_source_ref(&expr, scope)? {
                        projection.push(SelectItem::ExprWithAlias {
                            expr,
                            alias: Ident::new(self.column_name()),
                        });
                    } else {
                        projection.push(SelectItem::UnnamedExpr(expr));
                    }
                }
                other => projection.push(other),
            }
        }

        select.projection = projection;
        Ok(())
    }

    fn push_table_columns(
        &self,
        projection: &mut Vec<SelectItem>,
        qualifier: &str,
        table: &TableMetadata,
        qualify: bool,
    ) {
        for column in &table.columns {
            let expr = if qualify {
                Expr::CompoundIdentifier(vec![Ident::new(qualifier), Ident::new(&column.name)])
            } else {
                Expr::Identifier(Ident::new(&column.name))
            };
            if column.synthetic {
                projection.push(SelectItem::ExprWithAlias {
                    expr,
                    alias: Ident::new(&column.name),
                });
            } else {
                projection.push(SelectItem::UnnamedExpr(expr));
            }
        }
    }

    /// Tables of a FROM clause with the qualifier each is visible under.
    /// `None` when any relation is not a plain table.
    fn from_tables(&self, select: &Select) -> Option<Vec<(String, TableMetadata)>> {
        let mut tables = Vec::new();
        for twj in &select.from {
            let factors = std::iter::once(&twj.relation).chain(twj.joins.iter().map(|j| &j.relation));
            for factor in factors {
                let TableFactor::Table { name, alias, .. } = factor else {
                    return None;
                };
                let parts = name_parts(name);
                let table = self.metadata.table(&parts.join("."))?;
                let qualifier = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| parts.last().cloned().unwrap_or_default());
                tables.push((qualifier, table));
            }
        }
        Some(tables)
    }
}

fn string_literal(literal: &str) -> Expr {
    Expr::value(SqlValue::SingleQuotedString(literal.to_string()))
}

/// The value of a literal expression, as text.
pub fn literal_text(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Value(value) => match &value.value {
            SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => Some(s.clone()),
            SqlValue::Number(n, _) => Some(n.clone()),
            _ => None,
        },
        Expr::Nested(inner) => literal_text(inner),
        _ => None,
    }
}

fn split_conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            split_conjuncts(left, out);
            split_conjuncts(right, out);
        }
        Expr::Nested(inner) if matches!(inner.as_ref(), Expr::BinaryOp { op: BinaryOperator::And, .. }) => {
            split_conjuncts(inner, out)
        }
        other => out.push(other),
    }
}

fn named_argument<'a>(arg: &'a FunctionArg, name: &str) -> Option<&'a Expr> {
    match arg {
        FunctionArg::Named {
            name: arg_name,
            arg: sqlparser::ast::FunctionArgExpr::Expr(expr),
            ..
        } if arg_name.value.eq_ignore_ascii_case(name) => Some(expr),
        _ => None,
    }
}

// --- AST Walking ---

/// Everything the FROM clauses and WITH clauses of a statement name.
#[derive(Default)]
struct StatementRefs {
    tables: Vec<TableRef>,
    /// Lowercased CTE names
    ctes: HashSet<String>,
    /// Derived-table aliases and CTE names, with the column names each projects
    views: Vec<(String, Vec<String>)>,
}

impl StatementRefs {
    fn add_view(&mut self, name: &Ident, query: &Query) {
        self.views
            .push((name.value.to_lowercase(), projected_names(&query.body)));
    }
}

/// Output names of a query body. A wildcard is reported as `*`.
fn projected_names(body: &SetExpr) -> Vec<String> {
    match body {
        SetExpr::Select(select) => select
            .projection
            .iter()
            .filter_map(|item| match item {
                SelectItem::UnnamedExpr(Expr::Identifier(ident)) => Some(ident.value.clone()),
                SelectItem::UnnamedExpr(Expr::CompoundIdentifier(idents)) => {
                    idents.last().map(|i| i.value.clone())
                }
                SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.clone()),
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => Some("*".to_string()),
                _ => None,
            })
            .collect(),
        SetExpr::Query(query) => projected_names(&query.body),
        SetExpr::SetOperation { left, .. } => projected_names(left),
        _ => Vec::new(),
    }
}

/// Collects every table reference of a statement, plus the CTEs and derived
/// tables it defines.
fn collect_statement_refs(statement: &Statement) -> EngineResult<StatementRefs> {
    let mut refs = StatementRefs::default();

    match statement {
        Statement::Query(query) => collect_query_refs(query, &mut refs),
        Statement::Insert(insert) => {
            match &insert.table {
                TableObject::TableName(name) => refs.tables.push(TableRef::new(name, None)),
                _ => return Err(EngineError::not_supported("INSERT into a table function")),
            }
            if let Some(source) = &insert.source {
                collect_query_refs(source, &mut refs);
            }
        }
        Statement::Update(update) => collect_twj_refs(&update.table, &mut refs),
        Statement::Delete(delete) => {
            let tables = match &delete.from {
                FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
            };
            for twj in tables {
                collect_twj_refs(twj, &mut refs);
            }
        }
        _ => {}
    }

    // Subqueries anywhere in expressions (WHERE, projection, SET values, ...)
    let _ = visit_expressions(statement, |expr| {
        match expr {
            Expr::Subquery(query)
            | Expr::Exists { subquery: query, .. }
            | Expr::InSubquery { subquery: query, .. } => collect_query_refs(query, &mut refs),
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });

    Ok(refs)
}

fn collect_query_refs(query: &Query, refs: &mut StatementRefs) {
    if let Some(ref with) = query.with {
        for cte in &with.cte_tables {
            refs.ctes.insert(cte.alias.name.value.to_lowercase());
            refs.add_view(&cte.alias.name, &cte.query);
            collect_query_refs(&cte.query, refs);
        }
    }
    collect_set_expr_refs(&query.body, refs);
}

fn collect_set_expr_refs(set_expr: &SetExpr, refs: &mut StatementRefs) {
    match set_expr {
        SetExpr::Select(select) => {
            for twj in &select.from {
                collect_twj_refs(twj, refs);
            }
        }
        SetExpr::Query(query) => collect_query_refs(query, refs),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr_refs(left, refs);
            collect_set_expr_refs(right, refs);
        }
        _ => {}
    }
}

fn collect_twj_refs(twj: &TableWithJoins, refs: &mut StatementRefs) {
    collect_table_factor_refs(&twj.relation, refs);
    for join in &twj.joins {
        collect_table_factor_refs(&join.relation, refs);
    }
}

fn collect_table_factor_refs(factor: &TableFactor, refs: &mut StatementRefs) {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            refs.tables
                .push(TableRef::new(name, alias.as_ref().map(|a| &a.name)));
        }
        TableFactor::Derived {
            subquery, alias, ..
        } => {
            if let Some(alias) = alias {
                refs.add_view(&alias.name, subquery);
            }
            collect_query_refs(subquery, refs);
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => collect_twj_refs(table_with_joins, refs),
        _ => {}
    }
}
