//! Query planner
//!
//! For every candidate index the planner derives a key range from the
//! selector and rates the result; the best rated plan wins (later indexes
//! win ties, an explicit index hint always wins).
//!
//! Bounds are derived field by field until the first field where the
//! selector stops being an equality. Past that point the remaining index
//! fields get open bounds, and every selector clause that is not fully
//! expressed by the range is recorded in `in_memory_fields` so the storage
//! re-checks it after traversal.

use crate::index::{IndexBound, IndexEncoder};
use crate::query::MangoQuery;
use crate::query::SortDirection;
use crate::schema::{FieldType, Schema};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Points per leading bounded key
const POINTS_PER_KEY: u32 = 10;
/// Points per leading key with equal start and end
const POINTS_PER_EQUAL_KEY: u32 = 15;
/// Points when no re-sort is needed
const POINTS_NO_RESORT: u32 = 5;

/// How a query is executed against an index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Fields of the chosen index
    pub index: Vec<String>,
    /// Lower bound, one entry per index field
    pub start_keys: Vec<IndexBound>,
    /// Upper bound, one entry per index field
    pub end_keys: Vec<IndexBound>,
    /// Whether the lower bound is inclusive
    pub inclusive_start: bool,
    /// Whether the upper bound is inclusive
    pub inclusive_end: bool,
    /// Index order equals the requested sort order
    pub sort_satisfied_by_index: bool,
    /// No in-memory selector pass is needed
    pub selector_satisfied_by_index: bool,
    /// Selector keys that must be matched after traversal
    pub in_memory_fields: Vec<String>,
}

impl QueryPlan {
    fn quality(&self) -> u32 {
        let leading = |keys: &[IndexBound]| keys.iter().take_while(|k| !k.is_open()).count() as u32;
        let equal = self
            .start_keys
            .iter()
            .zip(&self.end_keys)
            .take_while(|(start, end)| !start.is_open() && start == end)
            .count() as u32;
        let mut quality = leading(&self.start_keys) * POINTS_PER_KEY
            + leading(&self.end_keys) * POINTS_PER_KEY
            + equal * POINTS_PER_EQUAL_KEY;
        if self.sort_satisfied_by_index {
            quality += POINTS_NO_RESORT;
        }
        quality
    }
}

/// Bounds one selector entry contributes to an index field
#[derive(Default)]
struct FieldRange {
    start: Option<Value>,
    end: Option<Value>,
    inclusive_start: bool,
    inclusive_end: bool,
    fully_expressed: bool,
}

impl FieldRange {
    fn from_matcher(
        matcher: &serde_json::Map<String, Value>,
        encoder: &IndexEncoder,
        position: usize,
    ) -> Self {
        let mut range = FieldRange {
            inclusive_start: true,
            inclusive_end: true,
            fully_expressed: true,
            ..Default::default()
        };
        for (op, operand) in matcher {
            if !encoder.accepts(position, operand) {
                range.fully_expressed = false;
                continue;
            }
            let (sets_start, sets_end) = match op.as_str() {
                "$eq" => (true, true),
                "$gt" | "$gte" => (true, false),
                "$lt" | "$lte" => (false, true),
                _ => {
                    range.fully_expressed = false;
                    continue;
                }
            };
            if (sets_start && range.start.is_some()) || (sets_end && range.end.is_some()) {
                range.fully_expressed = false;
            }
            // An inexact operand encodes onto a stored neighbour; keep that
            // neighbour in range and re-check the clause in memory.
            let exact = encoder.is_exact(position, operand);
            if !exact {
                range.fully_expressed = false;
            }
            if sets_start {
                range.start = Some(operand.clone());
                range.inclusive_start = op != "$gt" || !exact;
            }
            if sets_end {
                range.end = Some(operand.clone());
                range.inclusive_end = op != "$lt" || !exact;
            }
        }
        range
    }

    fn is_equality(&self) -> bool {
        self.start.is_some() && self.start == self.end && self.inclusive_start && self.inclusive_end
    }
}

fn relevant_fields<'a>(
    fields: impl Iterator<Item = &'a String>,
    sort_irrelevant: &HashSet<String>,
) -> Vec<&'a str> {
    fields
        .filter(|f| !sort_irrelevant.contains(*f))
        .map(String::as_str)
        .collect()
}

fn plan_for_index(
    schema: &Schema,
    query: &MangoQuery,
    index: &[String],
    sort_irrelevant: &HashSet<String>,
) -> Result<QueryPlan> {
    let encoder = IndexEncoder::new(schema, index)?;
    let mut start_keys = Vec::with_capacity(index.len());
    let mut end_keys = Vec::with_capacity(index.len());
    let mut inclusive_start = true;
    let mut inclusive_end = true;
    let mut precise = true;
    let mut covered: HashSet<&str> = HashSet::new();

    for (position, field) in index.iter().enumerate() {
        let open_start = if inclusive_start { IndexBound::Min } else { IndexBound::Max };
        let open_end = if inclusive_end { IndexBound::Max } else { IndexBound::Min };
        let matcher = if precise {
            query.selector.get(field).and_then(Value::as_object)
        } else {
            None
        };
        let Some(matcher) = matcher else {
            start_keys.push(open_start);
            end_keys.push(open_end);
            precise = false;
            continue;
        };

        let range = FieldRange::from_matcher(matcher, &encoder, position);
        start_keys.push(range.start.clone().map_or(open_start, IndexBound::Value));
        end_keys.push(range.end.clone().map_or(open_end, IndexBound::Value));
        inclusive_start &= range.inclusive_start;
        inclusive_end &= range.inclusive_end;
        if range.fully_expressed {
            covered.insert(field.as_str());
        }
        precise = range.is_equality();
    }

    let in_memory_fields: Vec<String> = query
        .selector
        .keys()
        .filter(|key| !covered.contains(key.as_str()))
        .cloned()
        .collect();

    let has_desc = query.sort.iter().any(|s| s.direction == SortDirection::Desc);
    let sort_fields = relevant_fields(query.sort.iter().map(|s| &s.field), sort_irrelevant);
    let index_fields = relevant_fields(index.iter(), sort_irrelevant);

    Ok(QueryPlan {
        index: index.to_vec(),
        start_keys,
        end_keys,
        inclusive_start,
        inclusive_end,
        sort_satisfied_by_index: !has_desc && sort_fields == index_fields,
        selector_satisfied_by_index: in_memory_fields.is_empty(),
        in_memory_fields,
    })
}

/// Pick the best index for a normalized query and derive its key range
pub fn plan_query(schema: &Schema, query: &MangoQuery) -> Result<QueryPlan> {
    let available = schema.query_indexes();
    let candidates = match &query.index {
        Some(hint) => {
            let fields = hint.fields();
            if !available.contains(&fields) {
                return Err(Error::query(format!(
                    "index {fields:?} is not defined in the schema"
                )));
            }
            vec![fields]
        }
        None => available,
    };

    // Equality on a boolean leaves a single value, so its position in the
    // sort does not change the order.
    let sort_irrelevant: HashSet<String> = query
        .selector
        .iter()
        .filter(|(field, matcher)| {
            schema
                .field(field)
                .is_some_and(|def| def.field_type == Some(FieldType::Boolean))
                && matcher.get("$eq").is_some()
        })
        .map(|(field, _)| field.clone())
        .collect();

    let mut best: Option<(u32, QueryPlan)> = None;
    for index in candidates {
        let plan = plan_for_index(schema, query, &index, &sort_irrelevant)?;
        let quality = plan.quality();
        if best.as_ref().is_none_or(|(current, _)| quality >= *current) {
            best = Some((quality, plan));
        }
    }
    best.map(|(_, plan)| plan)
        .ok_or_else(|| Error::internal("schema has no query index"))
}
