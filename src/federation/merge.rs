// SPDX-License-Identifier: Apache-2.0

//! Post-merge processing.
//!
//! Re-applies, over the concatenated rows of every instance, the operations
//! that no single source could apply: aggregate recombination, ORDER BY,
//! DISTINCT and LIMIT/OFFSET, in that order.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::engine::types::{Row, Value};

use super::types::Collation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SortKey {
    /// Column index in the merged row
    pub index: usize,
    pub ascending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    /// NULLs sort low unless the command says otherwise.
    pub fn new(index: usize, ascending: bool, nulls_first: Option<bool>) -> Self {
        Self {
            index,
            ascending,
            nulls_first: nulls_first.unwrap_or(ascending),
        }
    }
}

/// How one output column of an aggregate query is rebuilt from partial columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AggregateSlot {
    Group { partial: usize },
    Count { partial: usize },
    Sum { partial: usize },
    Min { partial: usize },
    Max { partial: usize },
    Avg { sum: usize, count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateSpec {
    /// Partial columns forming the group key
    pub group_key: Vec<usize>,
    /// One slot per output column, in output order
    pub outputs: Vec<AggregateSlot>,
    /// True when the command has GROUP BY; false means exactly one output row
    pub grouped: bool,
}

/// Everything the merge stage does after all instances drained.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeSpec {
    pub aggregate: Option<AggregateSpec>,
    pub order_by: Vec<SortKey>,
    pub distinct: bool,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    /// Number of leading columns returned to the caller, when sort-only
    /// columns were appended to the instance projection
    pub visible_columns: Option<usize>,
    pub collation: Collation,
}

impl MergeSpec {
    /// True when rows can be handed back exactly as concatenated.
    pub fn is_passthrough(&self) -> bool {
        self.aggregate.is_none()
            && self.order_by.is_empty()
            && !self.distinct
            && self.offset.is_none()
            && self.limit.is_none()
            && self.visible_columns.is_none()
    }

    pub fn apply(&self, rows: Vec<Row>) -> Vec<Row> {
        let mut rows = match &self.aggregate {
            Some(spec) => combine_aggregates(rows, spec, self.collation),
            None => rows,
        };

        if !self.order_by.is_empty() {
            sort_rows(&mut rows, &self.order_by, self.collation);
        }
        if self.distinct {
            rows = dedup_rows(rows, self.collation);
        }
        rows = apply_limit(rows, self.offset, self.limit);

        if let Some(visible) = self.visible_columns {
            for row in &mut rows {
                row.values.truncate(visible);
            }
        }
        rows
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::Text(_) => 3,
        Value::Bytes(_) => 4,
        Value::Json(_) => 5,
        Value::Array(_) => 6,
    }
}

/// Total order over non-null values. Mixed types order by type.
pub fn compare_values(a: &Value, b: &Value, collation: Collation) -> Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Text(x), Value::Text(y)) => match collation {
            Collation::Binary => x.cmp(y),
            Collation::CaseInsensitive => x
                .to_lowercase()
                .cmp(&y.to_lowercase())
                .then_with(|| x.cmp(y)),
        },
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y) {
                let ord = compare_nullable(left, right, collation, true);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Json(x), Value::Json(y)) => x.to_string().cmp(&y.to_string()),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => type_rank(a).cmp(&type_rank(b)),
        },
    }
}

fn compare_nullable(a: &Value, b: &Value, collation: Collation, nulls_first: bool) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => {
            if nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, true) => {
            if nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, false) => compare_values(a, b, collation),
    }
}

fn compare_rows(a: &Row, b: &Row, keys: &[SortKey], collation: Collation) -> Ordering {
    for key in keys {
        let left = a.values.get(key.index).unwrap_or(&Value::Null);
        let right = b.values.get(key.index).unwrap_or(&Value::Null);
        let ord = match (left.is_null(), right.is_null()) {
            (false, false) => {
                let ord = compare_values(left, right, collation);
                if key.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            }
            _ => compare_nullable(left, right, collation, key.nulls_first),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Stable sort: rows with equal keys keep their arrival order.
pub fn sort_rows(rows: &mut [Row], keys: &[SortKey], collation: Collation) {
    rows.sort_by(|a, b| compare_rows(a, b, keys, collation));
}

fn normalized(value: &Value, collation: Collation) -> Value {
    match (value, collation) {
        (Value::Text(text), Collation::CaseInsensitive) => Value::Text(text.to_lowercase()),
        (Value::Float(f), _) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            Value::Int(*f as i64)
        }
        (other, _) => other.clone(),
    }
}

fn row_key(values: &[Value], collation: Collation) -> String {
    let normalized: Vec<Value> = values.iter().map(|v| normalized(v, collation)).collect();
    serde_json::to_string(&normalized).unwrap_or_else(|_| format!("{normalized:?}"))
}

/// Full-row deduplication keeping the first occurrence.
pub fn dedup_rows(rows: Vec<Row>, collation: Collation) -> Vec<Row> {
    let mut seen = HashSet::with_capacity(rows.len());
    rows.into_iter()
        .filter(|row| seen.insert(row_key(&row.values, collation)))
        .collect()
}

pub fn apply_limit(rows: Vec<Row>, offset: Option<u64>, limit: Option<u64>) -> Vec<Row> {
    let offset = offset.unwrap_or(0) as usize;
    let iter = rows.into_iter().skip(offset);
    match limit {
        Some(limit) => iter.take(limit as usize).collect(),
        None => iter.collect(),
    }
}

fn add_values(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Null, other) | (other, Value::Null) => other.clone(),
        (Value::Int(x), Value::Int(y)) => match x.checked_add(*y) {
            Some(sum) => Value::Int(sum),
            None => Value::Float(*x as f64 + *y as f64),
        },
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Value::Float(x + y),
            _ => Value::Null,
        },
    }
}

fn pick(a: &Value, b: &Value, collation: Collation, want: Ordering) -> Value {
    match (a.is_null(), b.is_null()) {
        (true, _) => b.clone(),
        (_, true) => a.clone(),
        _ if compare_values(b, a, collation) == want => b.clone(),
        _ => a.clone(),
    }
}

#[derive(Debug, Clone)]
struct Accumulator {
    values: Vec<Value>,
}

impl Accumulator {
    fn empty(spec: &AggregateSpec) -> Self {
        let values = spec
            .outputs
            .iter()
            .map(|slot| match slot {
                AggregateSlot::Count { .. } => Value::Int(0),
                AggregateSlot::Avg { .. } => Value::Array(vec![Value::Null, Value::Int(0)]),
                _ => Value::Null,
            })
            .collect();
        Self { values }
    }

    fn fold(&mut self, row: &Row, spec: &AggregateSpec, collation: Collation) {
        let column = |index: usize| row.values.get(index).unwrap_or(&Value::Null);
        for (slot, acc) in spec.outputs.iter().zip(self.values.iter_mut()) {
            *acc = match *slot {
                AggregateSlot::Group { partial } => column(partial).clone(),
                AggregateSlot::Count { partial } | AggregateSlot::Sum { partial } => {
                    add_values(acc, column(partial))
                }
                AggregateSlot::Min { partial } => pick(acc, column(partial), collation, Ordering::Less),
                AggregateSlot::Max { partial } => {
                    pick(acc, column(partial), collation, Ordering::Greater)
                }
                AggregateSlot::Avg { sum, count } => {
                    let (total, n) = match acc {
                        Value::Array(parts) if parts.len() == 2 => (parts[0].clone(), parts[1].clone()),
                        _ => (Value::Null, Value::Int(0)),
                    };
                    Value::Array(vec![
                        add_values(&total, column(sum)),
                        add_values(&n, column(count)),
                    ])
                }
            };
        }
    }

    fn finish(self, spec: &AggregateSpec) -> Row {
        let values = self
            .values
            .into_iter()
            .zip(&spec.outputs)
            .map(|(value, slot)| match (slot, value) {
                (AggregateSlot::Avg { .. }, Value::Array(parts)) if parts.len() == 2 => {
                    match (parts[0].as_f64(), parts[1].as_f64()) {
                        (Some(total), Some(n)) if n > 0.0 => Value::Float(total / n),
                        _ => Value::Null,
                    }
                }
                (AggregateSlot::Avg { .. }, _) => Value::Null,
                (_, other) => other,
            })
            .collect();
        Row::new(values)
    }
}

/// Re-groups partial aggregate rows and combines them into final rows.
///
/// Groups keep the order in which their first partial row arrived.
pub fn combine_aggregates(rows: Vec<Row>, spec: &AggregateSpec, collation: Collation) -> Vec<Row> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Accumulator> = HashMap::new();

    for row in &rows {
        let key_values: Vec<Value> = spec
            .group_key
            .iter()
            .map(|&i| row.values.get(i).cloned().unwrap_or(Value::Null))
            .collect();
        let key = row_key(&key_values, collation);
        let acc = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Accumulator::empty(spec)
        });
        acc.fold(row, spec, collation);
    }

    if order.is_empty() && !spec.grouped {
        return vec![Accumulator::empty(spec).finish(spec)];
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .map(|acc| acc.finish(spec))
        .collect()
}

/// Sums per-instance affected-row counts.
pub fn sum_update_counts<I: IntoIterator<Item = u64>>(counts: I) -> u64 {
    counts.into_iter().fold(0u64, |total, count| total.saturating_add(count))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(data: &[[&str; 3]]) -> Vec<Row> {
        data.iter().map(|r| Row::from(*r)).collect()
    }

    #[test]
    fn sorts_by_key_then_keeps_arrival_order() {
        let mut merged = rows(&[["y", "z", "a"], ["x", "z", "a"], ["e", "z", "b"], ["f", "z", "b"]]);
        sort_rows(&mut merged, &[SortKey::new(0, true, None)], Collation::Binary);
        assert_eq!(
            merged,
            rows(&[["e", "z", "b"], ["f", "z", "b"], ["x", "z", "a"], ["y", "z", "a"]])
        );
    }

    #[test]
    fn nulls_sort_low_by_default() {
        let mut data = vec![
            Row::new(vec![Value::Int(2)]),
            Row::new(vec![Value::Null]),
            Row::new(vec![Value::Int(1)]),
        ];
        sort_rows(&mut data, &[SortKey::new(0, true, None)], Collation::Binary);
        assert_eq!(data[0].values[0], Value::Null);

        sort_rows(&mut data, &[SortKey::new(0, false, None)], Collation::Binary);
        assert_eq!(data[0].values[0], Value::Int(2));
        assert_eq!(data[2].values[0], Value::Null);

        sort_rows(&mut data, &[SortKey::new(0, false, Some(true))], Collation::Binary);
        assert_eq!(data[0].values[0], Value::Null);
    }

    #[test]
    fn collation_controls_text_order_and_equality() {
        let mut data = vec![Row::from(["b"]), Row::from(["B"]), Row::from(["a"])];
        sort_rows(&mut data, &[SortKey::new(0, true, None)], Collation::Binary);
        assert_eq!(data, vec![Row::from(["B"]), Row::from(["a"]), Row::from(["b"])]);

        sort_rows(&mut data, &[SortKey::new(0, true, None)], Collation::CaseInsensitive);
        assert_eq!(data[0], Row::from(["a"]));

        assert_eq!(dedup_rows(data.clone(), Collation::CaseInsensitive).len(), 2);
        assert_eq!(dedup_rows(data, Collation::Binary).len(), 3);
    }

    #[test]
    fn numeric_types_compare_by_value() {
        assert_eq!(
            compare_values(&Value::Int(2), &Value::Float(1.5), Collation::Binary),
            Ordering::Greater
        );
        assert_eq!(
            dedup_rows(
                vec![Row::new(vec![Value::Int(1)]), Row::new(vec![Value::Float(1.0)])],
                Collation::Binary
            )
            .len(),
            1
        );
    }

    #[test]
    fn limit_applies_after_sort_and_dedup() {
        let spec = MergeSpec {
            order_by: vec![SortKey::new(0, true, None)],
            distinct: true,
            limit: Some(1),
            ..MergeSpec::default()
        };
        let merged = spec.apply(rows(&[
            ["y", "z", "a"],
            ["x", "z", "a"],
            ["e", "z", "b"],
            ["e", "z", "b"],
            ["f", "z", "b"],
        ]));
        assert_eq!(merged, rows(&[["e", "z", "b"]]));
    }

    #[test]
    fn offset_and_visible_columns() {
        let spec = MergeSpec {
            order_by: vec![SortKey::new(1, false, None)],
            offset: Some(1),
            visible_columns: Some(1),
            ..MergeSpec::default()
        };
        let merged = spec.apply(vec![
            Row::new(vec![Value::text("a"), Value::Int(1)]),
            Row::new(vec![Value::text("b"), Value::Int(3)]),
            Row::new(vec![Value::text("c"), Value::Int(2)]),
        ]);
        assert_eq!(merged, vec![Row::from(["c"]), Row::from(["a"])]);
    }

    #[test]
    fn combines_grouped_partials() {
        // partial columns: g, COUNT(*), SUM(x), SUM(y), COUNT(y), MIN(x)
        let spec = AggregateSpec {
            group_key: vec![0],
            outputs: vec![
                AggregateSlot::Group { partial: 0 },
                AggregateSlot::Count { partial: 1 },
                AggregateSlot::Sum { partial: 2 },
                AggregateSlot::Avg { sum: 3, count: 4 },
                AggregateSlot::Min { partial: 5 },
            ],
            grouped: true,
        };
        let partials = vec![
            Row::new(vec![Value::text("g1"), Value::Int(2), Value::Int(10), Value::Int(4), Value::Int(2), Value::Int(3)]),
            Row::new(vec![Value::text("g2"), Value::Int(1), Value::Int(5), Value::Int(9), Value::Int(1), Value::Int(5)]),
            Row::new(vec![Value::text("g1"), Value::Int(1), Value::Int(1), Value::Int(2), Value::Int(1), Value::Int(1)]),
        ];

        let combined = combine_aggregates(partials, &spec, Collation::Binary);
        assert_eq!(
            combined,
            vec![
                Row::new(vec![Value::text("g1"), Value::Int(3), Value::Int(11), Value::Float(2.0), Value::Int(1)]),
                Row::new(vec![Value::text("g2"), Value::Int(1), Value::Int(5), Value::Float(9.0), Value::Int(5)]),
            ]
        );
    }

    #[test]
    fn ungrouped_aggregate_over_nothing_yields_one_row() {
        let spec = AggregateSpec {
            group_key: Vec::new(),
            outputs: vec![
                AggregateSlot::Count { partial: 0 },
                AggregateSlot::Max { partial: 1 },
                AggregateSlot::Avg { sum: 2, count: 3 },
            ],
            grouped: false,
        };
        let combined = combine_aggregates(Vec::new(), &spec, Collation::Binary);
        assert_eq!(combined, vec![Row::new(vec![Value::Int(0), Value::Null, Value::Null])]);
    }

    #[test]
    fn update_counts_sum() {
        assert_eq!(sum_update_counts([1, 0, 2]), 3);
        assert_eq!(sum_update_counts(Vec::new()), 0);
    }
}
