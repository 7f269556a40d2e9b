//! Plan command implementation.

use dstore_memory::{MemStore, MemoryConfig, ScanSource};
use dstore_model::{FilterOp, IndexDefinition, Key, KeyContext, KeyId, PropertyValue, Query};
use dstore_raw::StoreError;
use serde::Serialize;

/// Query and index description taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct PlanArgs {
    /// Entity kind, empty for kindless queries.
    pub kind: String,
    /// Declared composite indexes in text form.
    pub indexes: Vec<String>,
    /// Filters like `a=1` or `c<5`.
    pub filters: Vec<String>,
    /// Sort orders like `c` or `-c`.
    pub orders: Vec<String>,
    /// Ancestor key path.
    pub ancestor: Option<String>,
    /// Projected properties.
    pub projection: Vec<String>,
}

/// Outcome of planning one query.
#[derive(Debug, Serialize)]
pub struct PlanResult {
    /// The finalized query.
    pub query: String,
    /// The chosen access path, if one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanInfo>,
    /// The index that would serve the query, if none does.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_index: Option<MissingIndex>,
}

/// A chosen access path.
#[derive(Debug, Serialize)]
pub struct PlanInfo {
    /// Scanned index, `entities` for the entity map, or the intersected
    /// built-in indexes joined by ` & `.
    pub source: String,
    /// `forward` or `reverse`.
    pub direction: &'static str,
    /// Leading equality columns.
    pub eq_columns: usize,
    /// Trailing columns the query does not need.
    pub extras: usize,
}

/// An index the query needs.
#[derive(Debug, Serialize)]
pub struct MissingIndex {
    /// Definition in text form.
    pub definition: String,
    /// Definition as an index configuration entry.
    pub yaml: String,
}

/// Runs the plan command.
pub fn run(args: &PlanArgs, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = explain(args)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Plans the described query against a store declaring the given indexes.
pub fn explain(args: &PlanArgs) -> Result<PlanResult, Box<dyn std::error::Error>> {
    let indexes = args
        .indexes
        .iter()
        .map(|d| d.parse::<IndexDefinition>())
        .collect::<Result<Vec<_>, _>>()?;
    let config = MemoryConfig::new().indexes(indexes);
    let key_context = config.key_context.clone();
    let store = MemStore::new(config);

    let fq = build_query(args, &key_context)?.finalize()?;
    let mut result = PlanResult {
        query: fq.to_string(),
        plan: None,
        missing_index: None,
    };

    match store.explain(&fq) {
        Ok(plan) => {
            result.plan = Some(PlanInfo {
                source: match plan.source() {
                    ScanSource::Entities => "entities".to_string(),
                    ScanSource::Index(def) => def.to_string(),
                    ScanSource::MergeJoin(defs) => defs
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(" & "),
                },
                direction: if plan.is_reverse() { "reverse" } else { "forward" },
                eq_columns: plan.eq_columns(),
                extras: plan.extras(),
            });
        }
        Err(err) => match err.root() {
            StoreError::MissingIndex { suggested } => {
                result.missing_index = Some(MissingIndex {
                    definition: suggested.to_string(),
                    yaml: suggested.to_yaml(),
                });
            }
            _ => return Err(err.into()),
        },
    }

    Ok(result)
}

fn build_query(args: &PlanArgs, kc: &KeyContext) -> Result<Query, Box<dyn std::error::Error>> {
    let mut q = Query::new(args.kind.as_str());
    if let Some(path) = &args.ancestor {
        q = q.ancestor(parse_key(path, kc)?);
    }
    for f in &args.filters {
        q = match parse_filter(f)? {
            (prop, None, value) => q.eq(prop, value),
            (prop, Some(op), value) => q.filter(prop, op, value),
        };
    }
    for order in &args.orders {
        q = q.order(order);
    }
    if !args.projection.is_empty() {
        q = q.project(args.projection.iter().cloned());
    }
    Ok(q)
}

/// Splits `prop<op>value`. Equality yields no operator.
fn parse_filter(s: &str) -> Result<(String, Option<FilterOp>, PropertyValue), String> {
    let at = s
        .find(|c: char| matches!(c, '<' | '>' | '='))
        .ok_or_else(|| format!("filter {s:?} has no operator"))?;
    let (prop, rest) = s.split_at(at);
    let (op, value) = if let Some(v) = rest.strip_prefix("<=") {
        (Some(FilterOp::Le), v)
    } else if let Some(v) = rest.strip_prefix(">=") {
        (Some(FilterOp::Ge), v)
    } else if let Some(v) = rest.strip_prefix('<') {
        (Some(FilterOp::Lt), v)
    } else if let Some(v) = rest.strip_prefix('>') {
        (Some(FilterOp::Gt), v)
    } else {
        (None, &rest[1..])
    };
    let prop = prop.trim();
    if prop.is_empty() {
        return Err(format!("filter {s:?} has no property"));
    }
    Ok((prop.to_string(), op, parse_value(value)))
}

fn parse_value(s: &str) -> PropertyValue {
    let s = s.trim();
    if let Some(text) = s.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        return PropertyValue::Text(text.to_string());
    }
    if let Ok(i) = s.parse::<i64>() {
        return PropertyValue::Int(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return PropertyValue::Float(f);
    }
    match s {
        "true" => PropertyValue::Bool(true),
        "false" => PropertyValue::Bool(false),
        _ => PropertyValue::Text(s.to_string()),
    }
}

/// Parses `Kind:id/Kind:id`. Integer ids are numeric, anything else a name.
fn parse_key(path: &str, kc: &KeyContext) -> Result<Key, String> {
    let mut key: Option<Key> = None;
    for token in path.split('/') {
        let (kind, id) = token
            .split_once(':')
            .ok_or_else(|| format!("key token {token:?} is not Kind:id"))?;
        let id = match id.parse::<i64>() {
            Ok(n) => KeyId::Int(n),
            Err(_) => KeyId::Name(id.trim_matches('"').to_string()),
        };
        key = Some(match key {
            Some(parent) => parent.child(kind, id),
            None => kc.key(kind, id),
        });
    }
    key.ok_or_else(|| "empty key path".to_string())
}

fn print_text_output(result: &PlanResult) {
    println!("Query: {}", result.query);
    if let Some(plan) = &result.plan {
        println!("Plan:");
        println!("  Source:         {}", plan.source);
        println!("  Direction:      {}", plan.direction);
        println!("  Equality cols:  {}", plan.eq_columns);
        println!("  Extra cols:     {}", plan.extras);
    }
    if let Some(missing) = &result.missing_index {
        println!("No index can serve this query. Declare {}:", missing.definition);
        print!("{}", missing.yaml);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(kind: &str) -> PlanArgs {
        PlanArgs {
            kind: kind.to_string(),
            ..PlanArgs::default()
        }
    }

    #[test]
    fn filters_parse_operators_and_values() {
        let (p, op, v) = parse_filter("c<=5").unwrap();
        assert_eq!((p.as_str(), op), ("c", Some(FilterOp::Le)));
        assert_eq!(v, PropertyValue::Int(5));

        let (_, op, v) = parse_filter("name=\"x y\"").unwrap();
        assert_eq!(op, None);
        assert_eq!(v, PropertyValue::Text("x y".to_string()));

        assert!(parse_filter("nothing").is_err());
        assert!(parse_filter("=1").is_err());
    }

    #[test]
    fn key_paths_parse() {
        let kc = KeyContext::default();
        let key = parse_key("Parent:1/Child:abc", &kc).unwrap();
        assert_eq!(key, kc.key("Parent", 1).child("Child", "abc"));
    }

    #[test]
    fn declared_index_is_chosen() {
        let a = PlanArgs {
            indexes: vec!["Item:a,b,-c".to_string()],
            filters: vec!["a=1".into(), "b=2".into(), "c<5".into()],
            orders: vec!["-c".into()],
            ..args("Item")
        };
        let result = explain(&a).unwrap();
        let plan = result.plan.unwrap();
        assert_eq!(plan.source, "Item:a,b,-c");
        assert_eq!(plan.direction, "forward");
        assert!(result.missing_index.is_none());
    }

    #[test]
    fn missing_index_is_suggested() {
        let a = PlanArgs {
            filters: vec!["b=2".into(), "a=1".into()],
            orders: vec!["-c".into()],
            ..args("Item")
        };
        let result = explain(&a).unwrap();
        assert!(result.plan.is_none());
        let missing = result.missing_index.unwrap();
        assert_eq!(missing.definition, "Item:a,b,-c");
        assert!(missing.yaml.contains("direction: desc"));
    }

    #[test]
    fn equalities_without_composite_merge_builtins() {
        let a = PlanArgs {
            filters: vec!["a=1".into(), "b=2".into()],
            ..args("Item")
        };
        let result = explain(&a).unwrap();
        assert!(result.missing_index.is_none());
        assert_eq!(result.plan.unwrap().source, "Item:a & Item:b");
    }

    #[test]
    fn kindless_query_scans_entities() {
        let result = explain(&args("")).unwrap();
        assert_eq!(result.plan.unwrap().source, "entities");
    }
}
