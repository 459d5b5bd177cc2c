use std::sync::Arc;

use proptest::prelude::*;
use qorefed::federation::rewriter::parse_command;
use qorefed::federation::{
    Capability, CapabilityLookup, CapabilityOverride, InMemoryMetadata, QueryRewriter,
    SourceBindingRegistry, SourceIdentityMetadata, StaticCapabilities,
};

fn registry(k: usize) -> Arc<SourceBindingRegistry> {
    let mut registry = SourceBindingRegistry::new();
    registry
        .register_multi_source("multi", (0..k).map(|i| format!("s{i}")))
        .unwrap();
    registry.register_single_source("plain", "p");
    Arc::new(registry)
}

fn rewriter(k: usize) -> QueryRewriter {
    let metadata = InMemoryMetadata::new();
    metadata.add_table("multi", "t", &[("col1", "string", true), ("col2", "integer", true)]);
    metadata.add_table("plain", "p", &[("id", "integer", false)]);
    QueryRewriter::new(Arc::new(SourceIdentityMetadata::new(
        Arc::new(metadata),
        registry(k),
        "SOURCE_NAME",
    )))
}

const QUERIES: [&str; 5] = [
    "SELECT col1 FROM t",
    "SELECT * FROM t WHERE col2 > 3",
    "SELECT col1, SOURCE_NAME FROM t ORDER BY col1",
    "UPDATE t SET col2 = 1 WHERE SOURCE_NAME <> 'x'",
    "DELETE FROM t WHERE col1 = 'q'",
];

proptest! {
    #[test]
    fn unconstrained_commands_fan_out_to_every_binding(k in 1usize..8, q in 0usize..QUERIES.len()) {
        let rewriter = rewriter(k);
        let statement = parse_command(QUERIES[q]).unwrap();
        let expansion = rewriter.expand(&statement).unwrap();

        prop_assert_eq!(expansion.instances.len(), k);
        let mut literals: Vec<String> = expansion
            .instances
            .iter()
            .map(|i| i.binding.source_id.clone())
            .collect();
        literals.dedup();
        prop_assert_eq!(literals.len(), k);
        for instance in &expansion.instances {
            prop_assert!(!instance.statement.to_string().contains("SOURCE_NAME ="));
        }
    }

    #[test]
    fn literal_constraint_picks_at_most_one_binding(k in 1usize..8, pick in 0usize..10) {
        let rewriter = rewriter(k);
        let sql = format!("SELECT col1 FROM t WHERE SOURCE_NAME = 's{pick}'");
        let expansion = rewriter.expand(&parse_command(&sql).unwrap()).unwrap();

        if pick < k {
            prop_assert_eq!(expansion.instances.len(), 1);
            prop_assert_eq!(&expansion.instances[0].binding.source_id, &format!("s{pick}"));
        } else {
            prop_assert!(expansion.instances.is_empty());
        }
    }

    #[test]
    fn substitution_is_idempotent(k in 1usize..5, q in 0usize..QUERIES.len(), ordinal in 0usize..5) {
        let rewriter = rewriter(k);
        let statement = parse_command(QUERIES[q]).unwrap();
        let scope = rewriter.resolve_scope(&statement).unwrap();
        let literal = format!("s{}", ordinal % k);

        let once = rewriter.substitute(&statement, &scope, &literal).unwrap();
        let twice = rewriter.substitute(&once, &scope, &literal).unwrap();
        prop_assert_eq!(once.to_string(), twice.to_string());
    }

    #[test]
    fn override_hides_only_unsafe_pushdowns(idx in 0usize..Capability::ALL.len(), supported in any::<bool>()) {
        let capability = Capability::ALL[idx];
        let delegate = if supported {
            StaticCapabilities::full()
        } else {
            StaticCapabilities::default()
        };
        let lookup = CapabilityOverride::new(Arc::new(delegate), registry(2));

        let forced_off = matches!(
            capability,
            Capability::Union | Capability::OrderBy | Capability::SelectDistinct | Capability::AggregatesAvg
        );
        prop_assert_eq!(lookup.supports("multi", capability), supported && !forced_off);
        prop_assert_eq!(lookup.supports("plain", capability), supported);
    }
}
