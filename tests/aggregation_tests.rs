//! Aggregation pipelines: `|> do fn:group_by(...), let X = fn:Agg(Y)`.

use stratalog::{Kernel, QueryOptions, Term};

fn cost_kernel() -> Kernel {
    let kernel = Kernel::new();
    kernel
        .load_schema(
            "Decl cost(Job, N) bound [/name, /number].
             Decl total(Sum) bound [/number].
             total(Sum) :- cost(_, N) |> do fn:group_by(), let Sum = fn:Sum(N).
             cost(/j1, 3). cost(/j2, 5). cost(/j3, 2).",
        )
        .expect("load");
    kernel
}

#[test]
fn test_global_sum() {
    let kernel = cost_kernel();
    let result = kernel
        .query("total(S)", QueryOptions::default())
        .expect("query");
    assert_eq!(result.len(), 1);
    assert_eq!(result.column("S"), vec![Term::Int(10)]);
}

#[test]
fn test_sum_tracks_edb_changes() {
    let kernel = cost_kernel();
    assert_eq!(
        kernel
            .query("total(S)", QueryOptions::default())
            .expect("query")
            .column("S"),
        vec![Term::Int(10)]
    );

    kernel
        .assert_fact("cost", vec![Term::name("j4"), Term::Int(7)])
        .expect("assert");
    assert_eq!(
        kernel
            .query("total(S)", QueryOptions::default())
            .expect("query")
            .column("S"),
        vec![Term::Int(17)]
    );

    kernel
        .retract("cost", vec![Term::name("j1"), Term::Var("N".to_string())])
        .expect("retract");
    assert_eq!(
        kernel
            .query("total(S)", QueryOptions::default())
            .expect("query")
            .column("S"),
        vec![Term::Int(14)]
    );
}

#[test]
fn test_group_by_columns() {
    let kernel = Kernel::new();
    kernel
        .load_schema(
            "Decl sample(Group, N) bound [/name, /number].
             Decl per_group(Group, Count, Total) bound [/name, /number, /number].
             per_group(G, C, T) :- sample(G, N)
                 |> do fn:group_by(G), let C = fn:Count(), let T = fn:Sum(N).
             sample(/x, 1). sample(/x, 2). sample(/y, 5).",
        )
        .expect("load");

    let result = kernel
        .query("per_group(/x, C, T)", QueryOptions::default())
        .expect("query");
    assert_eq!(result.len(), 1);
    assert_eq!(result.column("C"), vec![Term::Int(2)]);
    assert_eq!(result.column("T"), vec![Term::Int(3)]);

    let result = kernel
        .query("per_group(/y, C, T)", QueryOptions::default())
        .expect("query");
    assert_eq!(result.column("C"), vec![Term::Int(1)]);
    assert_eq!(result.column("T"), vec![Term::Int(5)]);
}

#[test]
fn test_min_max_avg() {
    let kernel = Kernel::new();
    kernel
        .load_schema(
            "Decl score(Agent, N) bound [/name, /number].
             Decl spread(Lo, Hi, Mean) bound [/number, /number, /number].
             spread(Lo, Hi, Mean) :- score(_, N)
                 |> do fn:group_by(), let Lo = fn:Min(N), let Hi = fn:Max(N), let Mean = fn:Avg(N).
             score(/a, 2). score(/b, 8). score(/c, 5).",
        )
        .expect("load");

    let result = kernel
        .query("spread(Lo, Hi, Mean)", QueryOptions::default())
        .expect("query");
    assert_eq!(result.len(), 1);
    assert_eq!(result.column("Lo"), vec![Term::Int(2)]);
    assert_eq!(result.column("Hi"), vec![Term::Int(8)]);
    assert_eq!(result.column("Mean"), vec![Term::Float(5.0)]);
}

#[test]
fn test_empty_input_produces_no_groups() {
    // With no bindings there are no groups, not a zero-valued row.
    let kernel = Kernel::new();
    kernel
        .load_schema(
            "Decl cost(Job, N) bound [/name, /number].
             Decl total(Sum) bound [/number].
             total(Sum) :- cost(_, N) |> do fn:group_by(), let Sum = fn:Sum(N).",
        )
        .expect("load");
    let result = kernel
        .query("total(S)", QueryOptions::default())
        .expect("query");
    assert!(result.is_empty());
}

#[test]
fn test_float_sum_propagates() {
    let kernel = Kernel::new();
    kernel
        .load_schema(
            "Decl confidence(Src, C) bound [/name, /number].
             Decl belief(Sum) bound [/number].
             belief(Sum) :- confidence(_, C) |> do fn:group_by(), let Sum = fn:Sum(C).
             confidence(/s1, 0.5). confidence(/s2, 0.25).",
        )
        .expect("load");
    let result = kernel
        .query("belief(S)", QueryOptions::default())
        .expect("query");
    assert_eq!(result.column("S"), vec![Term::Float(0.75)]);
}

#[test]
fn test_aggregate_over_derived_relation() {
    // The aggregated input is itself IDB; the stratifier must place the
    // aggregation above the closure's stratum.
    let kernel = Kernel::new();
    kernel
        .load_schema(
            "Decl edge(X, Y) bound [/name, /name].
             Decl path(X, Y) bound [/name, /name].
             Decl reachable_count(X, C) bound [/name, /number].
             path(X, Y) :- edge(X, Y).
             path(X, Z) :- edge(X, Y), path(Y, Z).
             reachable_count(X, C) :- path(X, _) |> do fn:group_by(X), let C = fn:Count().
             edge(/a, /b). edge(/b, /c).",
        )
        .expect("load");

    let result = kernel
        .query("reachable_count(/a, C)", QueryOptions::default())
        .expect("query");
    assert_eq!(result.column("C"), vec![Term::Int(2)]);
}

#[test]
fn test_count_requires_no_argument() {
    let kernel = Kernel::new();
    kernel
        .load_schema(
            "Decl item(X) bound [/name].
             Decl how_many(C) bound [/number].
             how_many(C) :- item(_) |> do fn:group_by(), let C = fn:Count().
             item(/a). item(/b). item(/c).",
        )
        .expect("load");
    let result = kernel
        .query("how_many(C)", QueryOptions::default())
        .expect("query");
    assert_eq!(result.column("C"), vec![Term::Int(3)]);
}

#[test]
fn test_sum_requires_argument() {
    let kernel = Kernel::new();
    let err = kernel
        .load_schema(
            "Decl item(X) bound [/name].
             Decl bad(S) bound [/number].
             bad(S) :- item(_) |> do fn:group_by(), let S = fn:Sum().",
        )
        .expect_err("fn:Sum without an argument");
    assert_eq!(err.kind(), "UnsafeRule");
}
