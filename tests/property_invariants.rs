//! Property-based tests (proptest) for the quantified kernel invariants:
//! type soundness of derived tuples, order-independence of the derivation
//! set, and store round-trips.

use proptest::prelude::*;
use std::collections::BTreeSet;
use stratalog::{Kernel, QueryOptions, Term};

const NODES: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

fn edge_strategy() -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0..NODES.len(), 0..NODES.len()), 0..20)
}

fn closure_kernel(edges: &[(usize, usize)]) -> Kernel {
    let kernel = Kernel::new();
    kernel
        .load_schema(
            "Decl edge(X, Y) bound [/name, /name].
             Decl path(X, Y) bound [/name, /name].
             path(X, Y) :- edge(X, Y).
             path(X, Z) :- edge(X, Y), path(Y, Z).",
        )
        .expect("schema loads");
    for (x, y) in edges {
        kernel
            .assert_fact("edge", vec![Term::name(NODES[*x]), Term::name(NODES[*y])])
            .expect("assert");
    }
    kernel
}

fn answer_set(kernel: &Kernel, goal: &str) -> BTreeSet<String> {
    kernel
        .query(goal, QueryOptions::default())
        .expect("query")
        .iter()
        .map(|answer| {
            let mut pairs: Vec<String> = answer
                .bindings
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            pairs.join(",")
        })
        .collect()
}

proptest! {
    /// Every derived tuple conforms to the declared type vector.
    #[test]
    fn prop_derived_tuples_are_type_sound(edges in edge_strategy()) {
        let kernel = closure_kernel(&edges);
        let result = kernel.query("path(X, Y)", QueryOptions::default()).expect("query");
        for answer in result.iter() {
            for value in answer.bindings.values() {
                prop_assert!(matches!(value, Term::Name(_)), "non-name in /name column");
            }
        }
    }

    /// The derivation set does not depend on fact assertion order.
    #[test]
    fn prop_fact_order_does_not_change_answer_set(edges in edge_strategy()) {
        let forward = closure_kernel(&edges);
        let mut reversed = edges.clone();
        reversed.reverse();
        let backward = closure_kernel(&reversed);
        prop_assert_eq!(
            answer_set(&forward, "path(X, Y)"),
            answer_set(&backward, "path(X, Y)")
        );
    }

    /// The derivation set does not depend on rule order in the schema.
    #[test]
    fn prop_rule_order_does_not_change_answer_set(edges in edge_strategy()) {
        let kernel_a = closure_kernel(&edges);

        let kernel_b = Kernel::new();
        kernel_b
            .load_schema(
                "Decl edge(X, Y) bound [/name, /name].
                 Decl path(X, Y) bound [/name, /name].
                 path(X, Z) :- edge(X, Y), path(Y, Z).
                 path(X, Y) :- edge(X, Y).",
            )
            .expect("schema loads");
        for (x, y) in &edges {
            kernel_b
                .assert_fact("edge", vec![Term::name(NODES[*x]), Term::name(NODES[*y])])
                .expect("assert");
        }
        prop_assert_eq!(
            answer_set(&kernel_a, "path(X, Y)"),
            answer_set(&kernel_b, "path(X, Y)")
        );
    }

    /// assert then retract returns the predicate to its prior state.
    #[test]
    fn prop_assert_retract_roundtrip(edges in edge_strategy(), extra in (0..NODES.len(), 0..NODES.len())) {
        let kernel = closure_kernel(&edges);
        let before_facts = kernel.facts("edge", 2).expect("facts");
        let before_paths = answer_set(&kernel, "path(X, Y)");

        let tuple = vec![Term::name(NODES[extra.0]), Term::name(NODES[extra.1])];
        let was_present = before_facts.contains(&tuple);

        kernel.assert_fact("edge", tuple.clone()).expect("assert");
        if !was_present {
            let removed = kernel.retract("edge", tuple.clone()).expect("retract");
            prop_assert_eq!(removed, 1);
        }

        prop_assert_eq!(kernel.facts("edge", 2).expect("facts"), before_facts);
        prop_assert_eq!(answer_set(&kernel, "path(X, Y)"), before_paths);
    }

    /// Negation answers are exactly the set difference, however facts arrive.
    #[test]
    fn prop_negation_is_set_difference(
        items in prop::collection::btree_set(0..NODES.len(), 0..6),
        excluded in prop::collection::btree_set(0..NODES.len(), 0..6),
    ) {
        let kernel = Kernel::new();
        kernel
            .load_schema(
                "Decl item(X) bound [/name].
                 Decl excluded(X) bound [/name].
                 Decl allowed(X) bound [/name].
                 allowed(X) :- item(X), !excluded(X).",
            )
            .expect("schema loads");
        for i in &items {
            kernel.assert_fact("item", vec![Term::name(NODES[*i])]).expect("assert");
        }
        for i in &excluded {
            kernel.assert_fact("excluded", vec![Term::name(NODES[*i])]).expect("assert");
        }

        let expected: BTreeSet<String> = items
            .difference(&excluded)
            .map(|i| format!("X=/{}", NODES[*i]))
            .collect();
        prop_assert_eq!(answer_set(&kernel, "allowed(X)"), expected);
    }
}
