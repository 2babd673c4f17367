//! Schema lifecycle: dump/reload round-trips, conflicting declarations,
//! arity overloading, and schema file loading.

use stratalog::{Kernel, QueryOptions, Term};

#[test]
fn test_dump_reloads_equivalently() {
    let kernel = Kernel::new();
    kernel
        .load_schema(
            "Decl edge(X, Y) bound [/name, /name].
             Decl cost(Job, N) bound [/name, /number] descr [doc(\"price per job\")].
             Decl recent_commits(Limit, Hash) bound [/number, /string] descr [external(), mode('+', '-')].
             Decl anything(X).",
        )
        .expect("load");

    let dump = kernel.dump_schema();
    let again = Kernel::new();
    again.load_schema(&dump).expect("dump reparses");
    assert_eq!(again.dump_schema(), dump);
    assert_eq!(again.statistics().predicates, 4);
}

#[test]
fn test_conflicting_declarations_rejected() {
    let kernel = Kernel::new();
    let err = kernel
        .load_schema(
            "Decl cost(J, N) bound [/name, /number].
             Decl cost(J, N) bound [/name, /string].",
        )
        .expect_err("type vectors disagree");
    assert_eq!(err.kind(), "SchemaViolation");
}

#[test]
fn test_redeclaration_takes_strictest_types() {
    // The untyped declaration widens nothing: the stricter vector wins.
    let kernel = Kernel::new();
    kernel
        .load_schema(
            "Decl cost(J, N).
             Decl cost(J, N) bound [/name, /number].",
        )
        .expect("narrowing is fine");

    let err = kernel
        .assert_fact("cost", vec![Term::string("j1"), Term::Int(3)])
        .expect_err("first column must be a name");
    assert_eq!(err.kind(), "TypeMismatch");
}

#[test]
fn test_arity_overloading_is_distinct_predicates() {
    let kernel = Kernel::new();
    kernel
        .load_schema(
            "Decl task(Name, Phase, Status).
             Decl task(Name, Phase, Status, Owner, Priority).
             task(/build, /init, /pending).
             task(/build, /init, /pending, /coder, 1).",
        )
        .expect("both arities declared");

    assert_eq!(
        kernel
            .query("task(N, P, S)", QueryOptions::default())
            .expect("query")
            .len(),
        1
    );
    assert_eq!(
        kernel
            .query("task(N, P, S, O, Pr)", QueryOptions::default())
            .expect("query")
            .len(),
        1
    );

    // The undeclared 4-ary form stays invalid.
    let err = kernel
        .query("task(N, P, S, O)", QueryOptions::default())
        .expect_err("no 4-ary declaration");
    assert_eq!(err.kind(), "SchemaViolation");
}

#[test]
fn test_rules_over_undeclared_predicates_fail_load() {
    let kernel = Kernel::new();
    let err = kernel
        .load_schema("Decl p(X).\np(X) :- undeclared(X).")
        .expect_err("body predicate undeclared");
    assert_eq!(err.kind(), "SchemaViolation");
}

#[test]
fn test_facts_validated_at_load() {
    let kernel = Kernel::new();
    let err = kernel
        .load_schema(
            "Decl cost(J, N) bound [/name, /number].
             cost(/j1, \"three\").",
        )
        .expect_err("fact violates type vector");
    assert_eq!(err.kind(), "TypeMismatch");
}

#[test]
fn test_load_schema_from_file() {
    use std::io::Write as _;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("agent.mg");
    let mut file = std::fs::File::create(&path).expect("create");
    writeln!(
        file,
        "# agent policy\n\
         Decl phase(P) bound [/name].\n\
         Decl may_advance(P) bound [/name].\n\
         Decl blocked(P) bound [/name].\n\
         may_advance(P) :- phase(P), !blocked(P).\n\
         phase(/recon)."
    )
    .expect("write");

    let text = std::fs::read_to_string(&path).expect("read");
    let kernel = Kernel::new();
    kernel.load_schema(&text).expect("load from file text");
    let result = kernel
        .query("may_advance(P)", QueryOptions::default())
        .expect("query");
    assert_eq!(result.column("P"), vec![Term::name("recon")]);
}

#[test]
fn test_reload_replaces_prior_generation() {
    let kernel = Kernel::new();
    kernel
        .load_schema("Decl item(X).\nitem(/a).")
        .expect("first load");
    kernel
        .load_schema("Decl other(X).\nother(/b).")
        .expect("second load");

    // The first generation is gone entirely.
    let err = kernel
        .query("item(X)", QueryOptions::default())
        .expect_err("replaced");
    assert_eq!(err.kind(), "SchemaViolation");
    assert_eq!(
        kernel
            .query("other(X)", QueryOptions::default())
            .expect("query")
            .len(),
        1
    );
}

#[test]
fn test_queries_in_schema_text_are_ignored() {
    let kernel = Kernel::new();
    kernel
        .load_schema("Decl item(X).\nitem(/a).\nitem(X)?")
        .expect("load tolerates inline queries");
    assert_eq!(kernel.statistics().stored_facts, 1);
}
