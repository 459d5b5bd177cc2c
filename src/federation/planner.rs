// SPDX-License-Identifier: Apache-2.0

//! Plan expansion.
//!
//! Turns one command into N source-bound instances plus the merge stage that
//! restores what could not be pushed to the sources. Ordering, distinctness,
//! limits and aggregates are only left in the instance commands when a single
//! instance runs and the capability lookup allows it.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use sqlparser::ast::{
    visit_expressions, Distinct, DuplicateTreatment, Expr, Function, FunctionArguments, GroupByExpr,
    Ident, LimitClause, ObjectName, OrderByExpr, OrderByKind, Query, Select, SelectItem, SetExpr,
    SetOperator, SetQuantifier, Statement, Value as SqlValue,
};

use crate::context::Determinism;
use crate::engine::error::{EngineError, EngineResult};

use super::capabilities::{Capability, CapabilityLookup};
use super::merge::{AggregateSlot, AggregateSpec, MergeSpec, SortKey};
use super::rewriter::{classify_determinism, CommandScope, InstanceCommand, QueryRewriter};
use super::types::{Collation, CommandKind};

/// Execution shape for one command.
#[derive(Debug, Clone)]
pub struct FederatedPlan {
    pub model: String,
    pub kind: CommandKind,
    pub multi_source: bool,
    pub instances: Vec<InstanceCommand>,
    pub merge: MergeSpec,
    /// Output column names for queries
    pub columns: Vec<String>,
    pub determinism: Determinism,
}

impl FederatedPlan {
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Source-bound SQL of every instance, in binding order.
    pub fn instance_sql(&self) -> Vec<String> {
        self.instances
            .iter()
            .map(|instance| instance.statement.to_string())
            .collect()
    }
}

#[derive(Debug, Clone)]
struct OutputColumn {
    name: String,
    expr: Option<Expr>,
}

pub struct PlanExpander {
    rewriter: Arc<QueryRewriter>,
    capabilities: Arc<dyn CapabilityLookup>,
    collation: Collation,
}

impl PlanExpander {
    pub fn new(
        rewriter: Arc<QueryRewriter>,
        capabilities: Arc<dyn CapabilityLookup>,
        collation: Collation,
    ) -> Self {
        Self {
            rewriter,
            capabilities,
            collation,
        }
    }

    pub fn rewriter(&self) -> &QueryRewriter {
        &self.rewriter
    }

    pub fn plan(&self, statement: &Statement) -> EngineResult<FederatedPlan> {
        let (scope, criteria) = self.rewriter.route(statement)?;
        let fan_out = criteria.len();

        let (template, merge, columns) = match scope.kind {
            CommandKind::Query => self.plan_query(statement, &scope, fan_out)?,
            CommandKind::Procedure => {
                if !self
                    .capabilities
                    .supports(&scope.model, Capability::ProcedureCalls)
                {
                    return Err(EngineError::not_supported(format!(
                        "Model '{}' does not accept procedure calls",
                        scope.model
                    )));
                }
                (statement.clone(), MergeSpec::default(), Vec::new())
            }
            _ => (statement.clone(), MergeSpec::default(), Vec::new()),
        };

        let instances = criteria
            .into_iter()
            .map(|desc| desc.apply(&self.rewriter, &template, &scope))
            .collect::<EngineResult<Vec<_>>>()?;

        tracing::debug!(
            model = %scope.model,
            instances = instances.len(),
            passthrough = merge.is_passthrough(),
            "Planned command"
        );

        Ok(FederatedPlan {
            model: scope.model,
            kind: scope.kind,
            multi_source: scope.multi_source,
            instances,
            merge,
            columns,
            determinism: classify_determinism(statement),
        })
    }

    /// Plans an ordered batch of update-class statements. A batch of more
    /// than one statement needs `BatchedUpdates` on every model it touches.
    pub fn plan_batch(&self, statements: &[Statement]) -> EngineResult<Vec<FederatedPlan>> {
        let batched = statements.len() > 1;
        statements
            .iter()
            .map(|statement| {
                let plan = self.plan(statement)?;
                if !plan.kind.is_update() {
                    return Err(EngineError::validation(
                        "Batches may only contain INSERT, UPDATE or DELETE statements",
                    ));
                }
                if batched
                    && !self
                        .capabilities
                        .supports(&plan.model, Capability::BatchedUpdates)
                {
                    return Err(EngineError::not_supported(format!(
                        "Model '{}' does not accept batched updates",
                        plan.model
                    )));
                }
                Ok(plan)
            })
            .collect()
    }

    fn plan_query(
        &self,
        statement: &Statement,
        scope: &CommandScope,
        fan_out: usize,
    ) -> EngineResult<(Statement, MergeSpec, Vec<String>)> {
        let Statement::Query(query) = statement else {
            return Err(EngineError::internal("query plan requested for non-query"));
        };
        let mut query: Query = (**query).clone();
        self.rewriter.expand_projection(&mut query, scope)?;

        let outputs = output_columns(&query.body);
        let split = fan_out != 1;
        let post = |capability| split || !self.capabilities.supports(&scope.model, capability);

        let mut merge = MergeSpec {
            collation: self.collation,
            ..MergeSpec::default()
        };

        if matches!(query.body.as_ref(), SetExpr::SetOperation { .. }) && post(Capability::Union) {
            merge.distinct = flatten_union(&mut query.body)?;
        }

        if let SetExpr::Select(select) = query.body.as_mut() {
            if let Some(used) = aggregate_kinds(select)? {
                let unsupported = used.iter().any(|c| !self.capabilities.supports(&scope.model, *c));
                if split || unsupported {
                    merge.aggregate = Some(decompose_aggregates(select)?);
                }
            }

            if select.distinct.is_some() && post(Capability::SelectDistinct) {
                if matches!(select.distinct, Some(Distinct::On(_))) {
                    return Err(EngineError::not_supported(
                        "DISTINCT ON cannot be merged across sources",
                    ));
                }
                select.distinct = None;
                merge.distinct = true;
            }
        }

        let order_exprs = order_by_exprs(&query)?;
        let sort_after_merge = !order_exprs.is_empty()
            && (post(Capability::OrderBy) || merge.aggregate.is_some());
        if sort_after_merge {
            query.order_by = None;
            merge.order_by = self.resolve_sort_keys(&order_exprs, &outputs, &mut query, &merge)?;
            if merge.order_by.iter().any(|key| key.index >= outputs.len()) {
                merge.visible_columns = Some(outputs.len());
            }
        }

        let (limit, offset) = limit_offset(&query)?;
        if limit.is_some() || offset.is_some() {
            let limit_after_merge = split
                || merge.distinct
                || merge.aggregate.is_some()
                || sort_after_merge
                || (limit.is_some() && !self.capabilities.supports(&scope.model, Capability::RowLimit))
                || (offset.is_some()
                    && !self.capabilities.supports(&scope.model, Capability::RowOffset));
            if limit_after_merge {
                query.limit_clause = None;
                merge.limit = limit;
                merge.offset = offset;
            }
        }
        if query.fetch.is_some() && split {
            return Err(EngineError::not_supported(
                "FETCH FIRST cannot be merged across sources, use LIMIT",
            ));
        }

        let columns = outputs.into_iter().map(|o| o.name).collect();
        Ok((Statement::Query(Box::new(query)), merge, columns))
    }

    fn resolve_sort_keys(
        &self,
        order_exprs: &[OrderByExpr],
        outputs: &[OutputColumn],
        query: &mut Query,
        merge: &MergeSpec,
    ) -> EngineResult<Vec<SortKey>> {
        let mut keys = Vec::with_capacity(order_exprs.len());
        for order in order_exprs {
            let ascending = order.options.asc.unwrap_or(true);
            let nulls_first = order.options.nulls_first;

            if let Some(index) = resolve_output(&order.expr, outputs)? {
                keys.push(SortKey::new(index, ascending, nulls_first));
                continue;
            }

            // Sort-only column: append to the instance projection, drop after merge.
            let hidden_allowed = !merge.distinct
                && merge.aggregate.is_none()
                && outputs.iter().all(|o| o.expr.is_some());
            match query.body.as_mut() {
                SetExpr::Select(select) if hidden_allowed => {
                    select
                        .projection
                        .push(SelectItem::UnnamedExpr(order.expr.clone()));
                    keys.push(SortKey::new(select.projection.len() - 1, ascending, nulls_first));
                }
                _ => {
                    return Err(EngineError::not_supported(format!(
                        "ORDER BY {} must name a projected column when merging across sources",
                        order.expr
                    )))
                }
            }
        }
        Ok(keys)
    }
}

fn output_columns(body: &SetExpr) -> Vec<OutputColumn> {
    match body {
        SetExpr::Select(select) => select.projection.iter().map(output_column).collect(),
        SetExpr::Query(query) => output_columns(&query.body),
        SetExpr::SetOperation { left, .. } => output_columns(left),
        SetExpr::Values(values) => values
            .rows
            .first()
            .map(|row| {
                (1..=row.len())
                    .map(|i| OutputColumn {
                        name: format!("column{i}"),
                        expr: None,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn output_column(item: &SelectItem) -> OutputColumn {
    match item {
        SelectItem::UnnamedExpr(expr) => OutputColumn {
            name: expr_name(expr),
            expr: Some(expr.clone()),
        },
        SelectItem::ExprWithAlias { expr, alias } => OutputColumn {
            name: alias.value.clone(),
            expr: Some(expr.clone()),
        },
        other => OutputColumn {
            name: other.to_string(),
            expr: None,
        },
    }
}

fn expr_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(idents) => idents
            .last()
            .map(|i| i.value.clone())
            .unwrap_or_default(),
        other => other.to_string(),
    }
}

fn same_expr(a: &Expr, b: &Expr) -> bool {
    if a.to_string().eq_ignore_ascii_case(&b.to_string()) {
        return true;
    }
    match (a, b) {
        (
            Expr::Identifier(_) | Expr::CompoundIdentifier(_),
            Expr::Identifier(_) | Expr::CompoundIdentifier(_),
        ) => expr_name(a).eq_ignore_ascii_case(&expr_name(b)),
        _ => false,
    }
}

/// Finds the output column an ORDER BY expression refers to: 1-based
/// ordinal, output name or alias, or the projected expression itself.
fn resolve_output(expr: &Expr, outputs: &[OutputColumn]) -> EngineResult<Option<usize>> {
    if let Expr::Value(value) = expr {
        if let SqlValue::Number(n, _) = &value.value {
            let position: usize = n
                .parse()
                .map_err(|_| EngineError::validation(format!("Invalid ORDER BY position {n}")))?;
            if position == 0 || position > outputs.len() {
                return Err(EngineError::validation(format!(
                    "ORDER BY position {position} is not in the select list"
                )));
            }
            return Ok(Some(position - 1));
        }
    }

    let text = expr.to_string();
    if let Some(index) = outputs.iter().position(|o| {
        o.expr
            .as_ref()
            .map(|e| e.to_string().eq_ignore_ascii_case(&text))
            .unwrap_or(false)
    }) {
        return Ok(Some(index));
    }

    let name = match expr {
        Expr::Identifier(ident) => Some(ident.value.as_str()),
        Expr::CompoundIdentifier(idents) => idents.last().map(|i| i.value.as_str()),
        _ => None,
    };
    Ok(name.and_then(|name| outputs.iter().position(|o| o.name.eq_ignore_ascii_case(name))))
}

fn order_by_exprs(query: &Query) -> EngineResult<Vec<OrderByExpr>> {
    match &query.order_by {
        None => Ok(Vec::new()),
        Some(order_by) => match &order_by.kind {
            OrderByKind::Expressions(exprs) => Ok(exprs.clone()),
            _ => Err(EngineError::not_supported(
                "ORDER BY ALL cannot be merged across sources",
            )),
        },
    }
}

fn literal_count(expr: &Expr) -> EngineResult<u64> {
    if let Expr::Value(value) = expr {
        if let SqlValue::Number(n, _) = &value.value {
            return n
                .parse()
                .map_err(|_| EngineError::validation(format!("Invalid row count {n}")));
        }
    }
    Err(EngineError::not_supported(format!(
        "Row count '{expr}' must be a numeric literal"
    )))
}

fn limit_offset(query: &Query) -> EngineResult<(Option<u64>, Option<u64>)> {
    match &query.limit_clause {
        None => Ok((None, None)),
        Some(LimitClause::LimitOffset { limit, offset, .. }) => {
            let limit = limit.as_ref().map(literal_count).transpose()?;
            let offset = offset
                .as_ref()
                .map(|o| literal_count(&o.value))
                .transpose()?;
            Ok((limit, offset))
        }
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => {
            Ok((Some(literal_count(limit)?), Some(literal_count(offset)?)))
        }
    }
}

// --- Set operations ---

fn is_all(quantifier: &SetQuantifier) -> bool {
    matches!(quantifier, SetQuantifier::All | SetQuantifier::AllByName)
}

/// Rewrites a top-level UNION chain to UNION ALL. Returns true when the
/// original chain removed duplicates, which the merge stage now has to do.
fn flatten_union(body: &mut SetExpr) -> EngineResult<bool> {
    let distinct = match body {
        SetExpr::SetOperation {
            op: SetOperator::Union,
            set_quantifier,
            ..
        } => !is_all(set_quantifier),
        SetExpr::SetOperation { op, .. } => {
            return Err(EngineError::not_supported(format!(
                "{op} cannot be merged across sources"
            )))
        }
        _ => return Ok(false),
    };

    if distinct {
        union_all(body)?;
        return Ok(true);
    }
    if let SetExpr::SetOperation { left, right, .. } = body {
        if has_distinct_union(left)? || has_distinct_union(right)? {
            return Err(EngineError::not_supported(
                "UNION nested under UNION ALL cannot be merged across sources",
            ));
        }
    }
    Ok(false)
}

fn union_all(body: &mut SetExpr) -> EngineResult<()> {
    match body {
        SetExpr::SetOperation {
            op: SetOperator::Union,
            set_quantifier,
            left,
            right,
        } => {
            *set_quantifier = match set_quantifier {
                SetQuantifier::ByName | SetQuantifier::DistinctByName | SetQuantifier::AllByName => {
                    SetQuantifier::AllByName
                }
                _ => SetQuantifier::All,
            };
            union_all(left)?;
            union_all(right)
        }
        SetExpr::SetOperation { op, .. } => Err(EngineError::not_supported(format!(
            "{op} cannot be merged across sources"
        ))),
        SetExpr::Query(query) => union_all(&mut query.body),
        _ => Ok(()),
    }
}

fn has_distinct_union(body: &SetExpr) -> EngineResult<bool> {
    match body {
        SetExpr::SetOperation {
            op: SetOperator::Union,
            set_quantifier,
            left,
            right,
        } => Ok(!is_all(set_quantifier) || has_distinct_union(left)? || has_distinct_union(right)?),
        SetExpr::SetOperation { op, .. } => Err(EngineError::not_supported(format!(
            "{op} cannot be merged across sources"
        ))),
        SetExpr::Query(query) => has_distinct_union(&query.body),
        _ => Ok(false),
    }
}

// --- Aggregates ---

fn aggregate_name(expr: &Expr) -> Option<(String, &Function)> {
    let Expr::Function(func) = expr else {
        return None;
    };
    let name = func.name.to_string().to_uppercase();
    matches!(name.as_str(), "COUNT" | "SUM" | "MIN" | "MAX" | "AVG").then_some((name, func))
}

fn contains_aggregate(expr: &Expr) -> bool {
    visit_expressions(expr, |e| {
        if aggregate_name(e).is_some() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })
    .is_break()
}

fn group_exprs(select: &Select) -> EngineResult<Vec<Expr>> {
    match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => Ok(exprs.clone()),
        GroupByExpr::All(_) => Err(EngineError::not_supported(
            "GROUP BY ALL cannot be merged across sources",
        )),
    }
}

/// Capabilities needed to push the aggregates of `select` down, or `None`
/// when it is not an aggregate query.
fn aggregate_kinds(select: &Select) -> EngineResult<Option<HashSet<Capability>>> {
    let groups = group_exprs(select)?;
    let mut used = HashSet::new();
    for item in &select.projection {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
            _ => continue,
        };
        let _ = visit_expressions(expr, |e| {
            if let Some((name, _)) = aggregate_name(e) {
                used.insert(match name.as_str() {
                    "COUNT" => Capability::AggregatesCount,
                    "SUM" => Capability::AggregatesSum,
                    "AVG" => Capability::AggregatesAvg,
                    _ => Capability::AggregatesMinMax,
                });
            }
            ControlFlow::<()>::Continue(())
        });
    }
    if used.is_empty() && groups.is_empty() {
        return Ok(None);
    }
    Ok(Some(used))
}

fn renamed(func: &Function, name: &str) -> Expr {
    let mut func = func.clone();
    func.name = ObjectName::from(vec![Ident::new(name)]);
    Expr::Function(func)
}

/// Rewrites the projection of `select` into partial aggregates each instance
/// can compute, and describes how to combine them.
fn decompose_aggregates(select: &mut Select) -> EngineResult<AggregateSpec> {
    if select.having.is_some() {
        return Err(EngineError::not_supported(
            "HAVING cannot be merged across sources",
        ));
    }
    let groups = group_exprs(select)?;

    let mut partial: Vec<SelectItem> = Vec::new();
    let mut outputs = Vec::with_capacity(select.projection.len());
    let mut group_key = Vec::new();
    let mut projected_groups = Vec::new();

    for item in &select.projection {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
            other => {
                return Err(EngineError::not_supported(format!(
                    "'{other}' cannot be merged across sources"
                )))
            }
        };

        if let Some((name, func)) = aggregate_name(expr) {
            if func.over.is_some() || func.filter.is_some() {
                return Err(EngineError::not_supported(format!(
                    "Windowed or filtered aggregate '{expr}' cannot be merged across sources"
                )));
            }
            if let FunctionArguments::List(list) = &func.args {
                if matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct)) {
                    return Err(EngineError::not_supported(format!(
                        "DISTINCT aggregate '{expr}' cannot be merged across sources"
                    )));
                }
            }

            let index = partial.len();
            let slot = match name.as_str() {
                "COUNT" => AggregateSlot::Count { partial: index },
                "SUM" => AggregateSlot::Sum { partial: index },
                "MIN" => AggregateSlot::Min { partial: index },
                "MAX" => AggregateSlot::Max { partial: index },
                _ => {
                    partial.push(SelectItem::UnnamedExpr(renamed(func, "SUM")));
                    partial.push(SelectItem::UnnamedExpr(renamed(func, "COUNT")));
                    outputs.push(AggregateSlot::Avg {
                        sum: index,
                        count: index + 1,
                    });
                    continue;
                }
            };
            partial.push(SelectItem::UnnamedExpr(expr.clone()));
            outputs.push(slot);
        } else if let Some(group) = groups.iter().position(|g| same_expr(g, expr)) {
            let index = partial.len();
            partial.push(item.clone());
            outputs.push(AggregateSlot::Group { partial: index });
            group_key.push(index);
            projected_groups.push(group);
        } else if contains_aggregate(expr) {
            return Err(EngineError::not_supported(format!(
                "Aggregate expression '{expr}' cannot be merged across sources"
            )));
        } else {
            return Err(EngineError::validation(format!(
                "'{expr}' is neither grouped nor aggregated"
            )));
        }
    }

    for (position, group) in groups.iter().enumerate() {
        if !projected_groups.contains(&position) {
            group_key.push(partial.len());
            partial.push(SelectItem::UnnamedExpr(group.clone()));
        }
    }

    select.projection = partial;
    Ok(AggregateSpec {
        group_key,
        outputs,
        grouped: !groups.is_empty(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::bindings::SourceBindingRegistry;
    use crate::federation::capabilities::{CapabilityOverride, StaticCapabilities};
    use crate::federation::metadata::{InMemoryMetadata, SourceIdentityMetadata};
    use crate::federation::rewriter::parse_command;

    fn expander() -> PlanExpander {
        expander_with(StaticCapabilities::full())
    }

    fn expander_with(delegate: StaticCapabilities) -> PlanExpander {
        let inner = Arc::new(InMemoryMetadata::new());
        inner.add_table("multi", "t", &[("col1", "string", true), ("col2", "string", true)]);
        inner.add_table("multi", "u", &[("col1", "string", true)]);
        inner.add_table("plain", "p", &[("id", "integer", false), ("name", "string", true)]);

        let mut registry = SourceBindingRegistry::new();
        registry.register_multi_source("multi", ["a", "b"]).unwrap();
        registry.register_single_source("plain", "p1");
        let registry = Arc::new(registry);

        let metadata = Arc::new(SourceIdentityMetadata::new(inner, registry.clone(), "SOURCE_NAME"));
        let capabilities = Arc::new(CapabilityOverride::new(Arc::new(delegate), registry));
        PlanExpander::new(
            Arc::new(QueryRewriter::new(metadata)),
            capabilities,
            Collation::Binary,
        )
    }

    fn plan(sql: &str) -> FederatedPlan {
        expander().plan(&parse_command(sql).unwrap()).unwrap()
    }

    #[test]
    fn order_by_is_applied_after_merge() {
        let plan = plan("SELECT * FROM t ORDER BY col1");
        assert_eq!(
            plan.instance_sql(),
            vec![
                "SELECT col1, col2, 'a' AS SOURCE_NAME FROM t",
                "SELECT col1, col2, 'b' AS SOURCE_NAME FROM t",
            ]
        );
        assert_eq!(plan.columns, vec!["col1", "col2", "SOURCE_NAME"]);
        assert_eq!(plan.merge.order_by, vec![SortKey::new(0, true, None)]);
    }

    #[test]
    fn distinct_and_limit_move_to_merge() {
        let plan = plan("SELECT DISTINCT * FROM t ORDER BY col1 LIMIT 1");
        assert_eq!(plan.instance_sql()[0], "SELECT col1, col2, 'a' AS SOURCE_NAME FROM t");
        assert!(plan.merge.distinct);
        assert_eq!(plan.merge.limit, Some(1));
        assert_eq!(plan.merge.offset, None);
    }

    #[test]
    fn routed_query_still_sorts_after_merge() {
        let plan = plan("SELECT col1 FROM t WHERE source_name = 'b' ORDER BY col1 DESC LIMIT 2 OFFSET 1");
        assert_eq!(plan.instance_sql(), vec!["SELECT col1 FROM t WHERE 'b' = 'b'"]);
        assert_eq!(plan.merge.order_by, vec![SortKey::new(0, false, None)]);
        assert_eq!((plan.merge.limit, plan.merge.offset), (Some(2), Some(1)));
    }

    #[test]
    fn single_source_model_pushes_everything_down() {
        let sql = "SELECT DISTINCT name FROM p ORDER BY name LIMIT 3";
        let plan = plan(sql);
        assert!(!plan.multi_source);
        assert_eq!(plan.instance_sql(), vec![sql]);
        assert!(plan.merge.is_passthrough());
    }

    #[test]
    fn sort_only_columns_are_appended_then_hidden() {
        let plan = plan("SELECT col1 FROM t ORDER BY col2 DESC, 1");
        assert_eq!(plan.instance_sql()[1], "SELECT col1, col2 FROM t");
        assert_eq!(
            plan.merge.order_by,
            vec![SortKey::new(1, false, None), SortKey::new(0, true, None)]
        );
        assert_eq!(plan.merge.visible_columns, Some(1));
    }

    #[test]
    fn sort_only_columns_conflict_with_distinct() {
        let err = expander()
            .plan(&parse_command("SELECT DISTINCT col1 FROM t ORDER BY col2").unwrap())
            .unwrap_err();
        assert!(matches!(err, EngineError::NotSupported { .. }));
    }

    #[test]
    fn avg_is_decomposed_into_sum_and_count() {
        let plan = plan("SELECT col1, AVG(col2) AS mean, COUNT(*) FROM t GROUP BY col1 ORDER BY mean");
        assert_eq!(
            plan.instance_sql()[0],
            "SELECT col1, SUM(col2), COUNT(col2), COUNT(*) FROM t GROUP BY col1"
        );
        let aggregate = plan.merge.aggregate.unwrap();
        assert_eq!(aggregate.group_key, vec![0]);
        assert_eq!(
            aggregate.outputs,
            vec![
                AggregateSlot::Group { partial: 0 },
                AggregateSlot::Avg { sum: 1, count: 2 },
                AggregateSlot::Count { partial: 3 },
            ]
        );
        assert_eq!(plan.columns, vec!["col1", "mean", "COUNT(*)"]);
        assert_eq!(plan.merge.order_by, vec![SortKey::new(1, true, None)]);
    }

    #[test]
    fn unprojected_group_keys_become_hidden_partials() {
        let plan = plan("SELECT COUNT(*) FROM t GROUP BY col2");
        assert_eq!(plan.instance_sql()[0], "SELECT COUNT(*), col2 FROM t GROUP BY col2");
        let aggregate = plan.merge.aggregate.unwrap();
        assert_eq!(aggregate.group_key, vec![1]);
        assert_eq!(aggregate.outputs, vec![AggregateSlot::Count { partial: 0 }]);
    }

    #[test]
    fn unmergeable_aggregates_are_rejected() {
        for sql in [
            "SELECT col1, COUNT(*) FROM t GROUP BY col1 HAVING COUNT(*) > 1",
            "SELECT COUNT(DISTINCT col1) FROM t",
            "SELECT COUNT(*) + 1 FROM t",
        ] {
            let err = expander().plan(&parse_command(sql).unwrap()).unwrap_err();
            assert!(matches!(err, EngineError::NotSupported { .. }), "{sql}: {err}");
        }
    }

    #[test]
    fn union_becomes_union_all_plus_dedup() {
        let distinct = plan("SELECT col1 FROM t UNION SELECT col1 FROM u");
        assert_eq!(
            distinct.instance_sql()[0],
            "SELECT col1 FROM t UNION ALL SELECT col1 FROM u"
        );
        assert!(distinct.merge.distinct);

        let all = plan("SELECT col1 FROM t UNION ALL SELECT col1 FROM u");
        assert!(!all.merge.distinct);
    }

    #[test]
    fn zero_instance_plan_keeps_output_shape() {
        let plan = plan("SELECT * FROM t WHERE source_name = 'nope'");
        assert_eq!(plan.instance_count(), 0);
        assert_eq!(plan.columns, vec!["col1", "col2", "SOURCE_NAME"]);
    }

    #[test]
    fn batches_reject_queries() {
        let statements = vec![
            parse_command("DELETE FROM t").unwrap(),
            parse_command("SELECT col1 FROM t").unwrap(),
        ];
        assert!(expander().plan_batch(&statements).is_err());
    }

    #[test]
    fn batches_need_batched_updates() {
        let without = Capability::ALL
            .into_iter()
            .filter(|c| *c != Capability::BatchedUpdates);
        let expander = expander_with(StaticCapabilities::full().with_model("multi", without));

        let pair = vec![
            parse_command("DELETE FROM t").unwrap(),
            parse_command("INSERT INTO t (col1) VALUES ('x')").unwrap(),
        ];
        assert!(matches!(
            expander.plan_batch(&pair),
            Err(EngineError::NotSupported { .. })
        ));
        // A single statement is not a batch.
        assert_eq!(expander.plan_batch(&pair[..1]).unwrap().len(), 1);
        assert_eq!(self::expander().plan_batch(&pair).unwrap().len(), 2);
    }

    #[test]
    fn procedure_calls_need_the_capability() {
        let without = Capability::ALL
            .into_iter()
            .filter(|c| *c != Capability::ProcedureCalls);
        let expander = expander_with(StaticCapabilities::full().with_model("multi", without));
        assert!(matches!(
            expander.plan(&parse_command("CALL multi.refresh(1)").unwrap()),
            Err(EngineError::NotSupported { .. })
        ));
    }

    #[test]
    fn plan_records_determinism() {
        assert_eq!(plan("SELECT rand() FROM t").determinism, Determinism::Nondeterministic);
    }
}
