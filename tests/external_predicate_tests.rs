//! External/virtual predicates: handler registration, mode enforcement,
//! failure outcomes, and per-fixpoint memoisation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stratalog::external::ExternalError;
use stratalog::{Kernel, Mode, QueryOptions, Term};

const COMMITS_SCHEMA: &str = "\
Decl recent_commits(Limit, Hash) bound [/number, /string] descr [external(), mode('+', '-')].
Decl hot_commit(H) bound [/string].
hot_commit(H) :- recent_commits(3, H).
";

fn commit_handler() -> Arc<dyn stratalog::ExternalHandler> {
    Arc::new(
        |bound: &[Term], _budget: Option<Duration>, emit: &mut dyn FnMut(Vec<Term>)| {
            let limit = bound[0].as_int().unwrap_or(0);
            for hash in ["a1b2c3", "d4e5f6", "a7b8c9"].iter().take(limit as usize) {
                emit(vec![Term::string(hash)]);
            }
            Ok(())
        },
    )
}

#[test]
fn test_handler_tuples_flow_into_rules() {
    let kernel = Kernel::new();
    kernel.load_schema(COMMITS_SCHEMA).expect("load");
    kernel
        .register_external("recent_commits", 2, &[Mode::Bound, Mode::Free], commit_handler())
        .expect("register");

    let result = kernel
        .query("hot_commit(H)", QueryOptions::default())
        .expect("query");
    let mut hashes: Vec<String> = result.column("H").iter().map(ToString::to_string).collect();
    hashes.sort();
    assert_eq!(hashes, vec!["\"a1b2c3\"", "\"a7b8c9\"", "\"d4e5f6\""]);
}

#[test]
fn test_registration_validates_declaration() {
    let kernel = Kernel::new();
    kernel.load_schema(COMMITS_SCHEMA).expect("load");

    // Wrong mode vector.
    let err = kernel
        .register_external("recent_commits", 2, &[Mode::Free, Mode::Free], commit_handler())
        .expect_err("mode mismatch");
    assert_eq!(err.kind(), "SchemaViolation");

    // Not declared external.
    let err = kernel
        .register_external("hot_commit", 1, &[Mode::Free], commit_handler())
        .expect_err("not external");
    assert_eq!(err.kind(), "SchemaViolation");

    // Undeclared predicate.
    let err = kernel
        .register_external("missing", 2, &[Mode::Bound, Mode::Free], commit_handler())
        .expect_err("undeclared");
    assert_eq!(err.kind(), "SchemaViolation");
}

#[test]
fn test_unavailable_handler_yields_zero_tuples_with_diagnostic() {
    let kernel = Kernel::new();
    kernel.load_schema(COMMITS_SCHEMA).expect("load");
    kernel
        .register_external(
            "recent_commits",
            2,
            &[Mode::Bound, Mode::Free],
            Arc::new(
                |_: &[Term], _: Option<Duration>, _: &mut dyn FnMut(Vec<Term>)| {
                    Err(ExternalError::Unavailable("index offline".to_string()))
                },
            ),
        )
        .expect("register");

    let result = kernel
        .query("hot_commit(H)", QueryOptions::default())
        .expect("query still succeeds");
    assert!(result.is_empty());
    assert!(result
        .diagnostics
        .iter()
        .any(|d| d.kind == "ExternalUnavailable"));
}

#[test]
fn test_invalid_tuples_skipped_and_reported() {
    let kernel = Kernel::new();
    kernel.load_schema(COMMITS_SCHEMA).expect("load");
    kernel
        .register_external(
            "recent_commits",
            2,
            &[Mode::Bound, Mode::Free],
            Arc::new(
                |_: &[Term], _: Option<Duration>, emit: &mut dyn FnMut(Vec<Term>)| {
                    emit(vec![Term::string("good1")]);
                    emit(vec![Term::Int(42)]); // /string column violated
                    emit(vec![Term::string("good2")]);
                    Ok(())
                },
            ),
        )
        .expect("register");

    let result = kernel
        .query("hot_commit(H)", QueryOptions::default())
        .expect("query");
    assert_eq!(result.len(), 2);
    assert!(result
        .diagnostics
        .iter()
        .any(|d| d.kind == "ExternalInvalid"));
}

#[test]
fn test_calls_memoised_per_fixpoint() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    let kernel = Kernel::new();
    kernel
        .load_schema(
            "Decl probe(K, V) bound [/number, /number] descr [external(), mode('+', '-')].
             Decl seed(K) bound [/number].
             Decl out_a(V) bound [/number].
             Decl out_b(V) bound [/number].
             out_a(V) :- seed(K), probe(K, V).
             out_b(V) :- seed(K), probe(K, V).
             seed(1).",
        )
        .expect("load");
    kernel
        .register_external(
            "probe",
            2,
            &[Mode::Bound, Mode::Free],
            Arc::new(
                |bound: &[Term], _: Option<Duration>, emit: &mut dyn FnMut(Vec<Term>)| {
                    CALLS.fetch_add(1, Ordering::SeqCst);
                    emit(vec![bound[0].clone()]);
                    Ok(())
                },
            ),
        )
        .expect("register");

    let result = kernel
        .query("out_a(V)", QueryOptions::default())
        .expect("query");
    assert_eq!(result.len(), 1);
    // Both rules call probe(1, V) within one fixpoint; the bridge runs once.
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn test_deterministic_handler_keeps_queries_repeatable() {
    let kernel = Kernel::new();
    kernel.load_schema(COMMITS_SCHEMA).expect("load");
    kernel
        .register_external("recent_commits", 2, &[Mode::Bound, Mode::Free], commit_handler())
        .expect("register");

    let a = kernel
        .query("hot_commit(H)", QueryOptions::default())
        .expect("query");
    let b = kernel
        .query("hot_commit(H)", QueryOptions::default())
        .expect("query");
    assert_eq!(a.len(), b.len());
}

#[test]
fn test_asserting_to_external_predicate_rejected() {
    let kernel = Kernel::new();
    kernel.load_schema(COMMITS_SCHEMA).expect("load");
    let err = kernel
        .assert_fact("recent_commits", vec![Term::Int(1), Term::string("x")])
        .expect_err("externals are not stored");
    assert_eq!(err.kind(), "SchemaViolation");
}

#[test]
fn test_querying_external_directly_rejected() {
    let kernel = Kernel::new();
    kernel.load_schema(COMMITS_SCHEMA).expect("load");
    kernel
        .register_external("recent_commits", 2, &[Mode::Bound, Mode::Free], commit_handler())
        .expect("register");
    let err = kernel
        .query("recent_commits(3, H)", QueryOptions::default())
        .expect_err("externals resolve only inside rule bodies");
    assert_eq!(err.kind(), "SchemaViolation");
}
