//! Alias table construction: parses every alias source, orders them by
//! dependency (Kahn's algorithm, mirroring the BFS topological walk the
//! teacher's graph executor uses to order workflow nodes), and expands
//! each alias's AST against the aliases it depends on so that every
//! alias in the resulting table is fully self-contained — a step or
//! condition expression only ever substitutes one level deep.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::ast::Expr;
use super::parser;
use flowcore_workflow::error::WorkflowError;

/// Parses and topologically expands a workflow's alias table.
///
/// Returns a map from alias name to its fully-expanded `Expr`, ready to
/// be substituted into callers via `Expr::expand_aliases`.
pub fn build_alias_table(
    sources: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, Expr>, WorkflowError> {
    let mut parsed: BTreeMap<String, Expr> = BTreeMap::new();
    for (name, source) in sources {
        let expr = parser::parse(source)
            .map_err(|e| WorkflowError::located(format!("alias '{name}'"), e.to_string()))?;
        parsed.insert(name.clone(), expr);
    }

    // Build the dependency graph: an edge dep -> name exists whenever
    // `name`'s expression references the identifier `dep` and `dep` is
    // itself an alias.
    let mut in_degree: BTreeMap<String, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in parsed.keys() {
        in_degree.entry(name.clone()).or_insert(0);
    }
    for (name, expr) in &parsed {
        let mut refs = BTreeSet::new();
        expr.referenced_identifiers(&mut refs);
        for dep in refs {
            if dep == *name {
                return Err(WorkflowError::CircularAlias(format!(
                    "alias '{name}' references itself"
                )));
            }
            if parsed.contains_key(&dep) {
                dependents.entry(dep.clone()).or_default().push(name.clone());
                *in_degree.get_mut(name).unwrap() += 1;
            }
        }
    }

    let mut queue: VecDeque<String> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(n, _)| n.clone())
        .collect();
    let mut order = Vec::with_capacity(parsed.len());
    while let Some(name) = queue.pop_front() {
        order.push(name.clone());
        if let Some(children) = dependents.get(&name) {
            for child in children {
                let deg = in_degree.get_mut(child).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(child.clone());
                }
            }
        }
    }

    if order.len() != parsed.len() {
        let stuck: Vec<_> = in_degree
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(n, _)| n)
            .collect();
        return Err(WorkflowError::CircularAlias(stuck.join(", ")));
    }

    let mut expanded: BTreeMap<String, Expr> = BTreeMap::new();
    for name in order {
        let expr = parsed.get(&name).unwrap();
        expanded.insert(name.clone(), expr.expand_aliases(&expanded));
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn expands_transitive_dependency() {
        let table = sources(&[("found", "steps.fetch.count > 0"), ("ready", "found && enabled")]);
        let mut extra = table.clone();
        extra.insert("enabled".into(), "steps.fetch.success".into());
        let expanded = build_alias_table(&extra).unwrap();
        // `ready` should no longer reference `found` or `enabled` by name.
        let mut refs = BTreeSet::new();
        expanded.get("ready").unwrap().referenced_identifiers(&mut refs);
        assert!(!refs.contains("found"));
        assert!(!refs.contains("enabled"));
    }

    #[test]
    fn detects_self_reference() {
        let table = sources(&[("loopy", "loopy && true")]);
        assert!(matches!(
            build_alias_table(&table),
            Err(WorkflowError::CircularAlias(_))
        ));
    }

    #[test]
    fn detects_mutual_cycle() {
        let table = sources(&[("a", "b"), ("b", "a")]);
        assert!(matches!(
            build_alias_table(&table),
            Err(WorkflowError::CircularAlias(_))
        ));
    }

    #[test]
    fn independent_aliases_all_resolve() {
        let table = sources(&[("a", "1 == 1"), ("b", "2 == 2")]);
        let expanded = build_alias_table(&table).unwrap();
        assert_eq!(expanded.len(), 2);
    }
}
