//! Incremental recomputation: asserts and retracts between queries
//! invalidate only the strata that transitively depend on the change.

use stratalog::{Kernel, PredState, QueryOptions, Term};

const TWO_ISLAND_SCHEMA: &str = "\
Decl edge(X, Y) bound [/name, /name].
Decl path(X, Y) bound [/name, /name].
Decl tag(X, T) bound [/name, /name].
Decl tagged(T) bound [/name].
path(X, Y) :- edge(X, Y).
path(X, Z) :- edge(X, Y), path(Y, Z).
tagged(T) :- tag(_, T).
";

fn pred_state(kernel: &Kernel, name: &str) -> PredState {
    kernel
        .statistics()
        .by_predicate
        .into_iter()
        .find(|p| p.name == name)
        .map(|p| p.state)
        .expect("predicate present")
}

#[test]
fn test_new_edge_extends_closure_on_next_query() {
    let kernel = Kernel::new();
    kernel.load_schema(TWO_ISLAND_SCHEMA).expect("load");
    for (x, y) in [("a", "b"), ("b", "c")] {
        kernel
            .assert_fact("edge", vec![Term::name(x), Term::name(y)])
            .expect("assert");
    }

    let before = kernel
        .query("path(/a, Z)", QueryOptions::default())
        .expect("query");
    assert_eq!(before.len(), 2);

    // New edge reachable two hops out.
    kernel
        .assert_fact("edge", vec![Term::name("c"), Term::name("d")])
        .expect("assert");
    let after = kernel
        .query("path(/a, Z)", QueryOptions::default())
        .expect("query");
    assert_eq!(after.len(), 3);
}

#[test]
fn test_unrelated_stratum_not_recomputed() {
    let kernel = Kernel::new();
    kernel.load_schema(TWO_ISLAND_SCHEMA).expect("load");
    kernel
        .assert_fact("edge", vec![Term::name("a"), Term::name("b")])
        .expect("assert");
    kernel
        .assert_fact("tag", vec![Term::name("a"), Term::name("urgent")])
        .expect("assert");

    // Saturate both islands.
    kernel
        .query("path(X, Y)", QueryOptions::default())
        .expect("query");
    kernel
        .query("tagged(T)", QueryOptions::default())
        .expect("query");
    assert_eq!(pred_state(&kernel, "tagged"), PredState::Saturated);
    assert_eq!(pred_state(&kernel, "path"), PredState::Saturated);

    // An edge change invalidates only the path island.
    kernel
        .assert_fact("edge", vec![Term::name("b"), Term::name("c")])
        .expect("assert");
    kernel
        .query("path(X, Y)", QueryOptions::default())
        .expect("query");

    assert_eq!(pred_state(&kernel, "path"), PredState::Saturated);
    // tagged was never invalidated, so its cache survived untouched.
    assert_eq!(pred_state(&kernel, "tagged"), PredState::Saturated);
}

#[test]
fn test_change_invalidates_closure_lazily() {
    let kernel = Kernel::new();
    kernel.load_schema(TWO_ISLAND_SCHEMA).expect("load");
    kernel
        .assert_fact("edge", vec![Term::name("a"), Term::name("b")])
        .expect("assert");
    kernel
        .query("path(X, Y)", QueryOptions::default())
        .expect("query");
    assert_eq!(pred_state(&kernel, "path"), PredState::Saturated);

    // The assert alone does not recompute anything; the next query does.
    kernel
        .assert_fact("edge", vec![Term::name("b"), Term::name("c")])
        .expect("assert");
    let result = kernel
        .query("path(/a, Z)", QueryOptions::default())
        .expect("query");
    assert_eq!(result.len(), 2);
}

#[test]
fn test_retract_discards_downstream_derivations() {
    let kernel = Kernel::new();
    kernel.load_schema(TWO_ISLAND_SCHEMA).expect("load");
    for (x, y) in [("a", "b"), ("b", "c"), ("c", "d")] {
        kernel
            .assert_fact("edge", vec![Term::name(x), Term::name(y)])
            .expect("assert");
    }
    assert_eq!(
        kernel
            .query("path(/a, Z)", QueryOptions::default())
            .expect("query")
            .len(),
        3
    );

    // Cutting the b->c edge severs everything past /b.
    kernel
        .retract("edge", vec![Term::name("b"), Term::name("c")])
        .expect("retract");
    let result = kernel
        .query("path(/a, Z)", QueryOptions::default())
        .expect("query");
    assert_eq!(result.len(), 1);
    assert_eq!(result.column("Z"), vec![Term::name("b")]);
}

#[test]
fn test_assert_retract_roundtrip_restores_observable_state() {
    let kernel = Kernel::new();
    kernel.load_schema(TWO_ISLAND_SCHEMA).expect("load");
    kernel
        .assert_fact("edge", vec![Term::name("a"), Term::name("b")])
        .expect("assert");

    let before = kernel.facts("edge", 2).expect("facts");
    let closure_before = kernel
        .query("path(X, Y)", QueryOptions::default())
        .expect("query")
        .len();

    kernel
        .assert_fact("edge", vec![Term::name("x"), Term::name("y")])
        .expect("assert");
    let removed = kernel
        .retract("edge", vec![Term::name("x"), Term::name("y")])
        .expect("retract");
    assert_eq!(removed, 1);

    assert_eq!(kernel.facts("edge", 2).expect("facts"), before);
    assert_eq!(
        kernel
            .query("path(X, Y)", QueryOptions::default())
            .expect("query")
            .len(),
        closure_before
    );
}

#[test]
fn test_duplicate_assert_is_noop() {
    let kernel = Kernel::new();
    kernel.load_schema(TWO_ISLAND_SCHEMA).expect("load");
    kernel
        .assert_fact("edge", vec![Term::name("a"), Term::name("b")])
        .expect("assert");
    kernel
        .assert_fact("edge", vec![Term::name("a"), Term::name("b")])
        .expect("duplicate assert");
    assert_eq!(kernel.facts("edge", 2).expect("facts").len(), 1);
}

#[test]
fn test_retract_missing_pattern_returns_zero() {
    let kernel = Kernel::new();
    kernel.load_schema(TWO_ISLAND_SCHEMA).expect("load");
    let removed = kernel
        .retract("edge", vec![Term::name("no"), Term::name("such")])
        .expect("retract");
    assert_eq!(removed, 0);
}

#[test]
fn test_registered_rule_only_invalidates_downstream() {
    let kernel = Kernel::new();
    kernel.load_schema(TWO_ISLAND_SCHEMA).expect("load");
    kernel
        .assert_fact("tag", vec![Term::name("a"), Term::name("urgent")])
        .expect("assert");
    kernel
        .query("tagged(T)", QueryOptions::default())
        .expect("query");

    // A new rule over edge/path does not disturb the tag island.
    kernel
        .register_rules(
            "Decl far(X, Y) bound [/name, /name].\n\
             far(X, Y) :- path(X, Y), X != Y.",
        )
        .expect("register");
    assert_eq!(pred_state(&kernel, "tagged"), PredState::Saturated);

    kernel
        .assert_fact("edge", vec![Term::name("a"), Term::name("b")])
        .expect("assert");
    let result = kernel
        .query("far(X, Y)", QueryOptions::default())
        .expect("query");
    assert_eq!(result.len(), 1);
}
