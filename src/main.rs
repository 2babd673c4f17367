//! # Stratalog REPL
//!
//! Interactive shell for the deductive kernel.
//!
//! ```bash
//! stratalog --schema rules/agent.mg
//! ```
//!
//! Input forms:
//! - `Decl name(...) ...`     register a declaration
//! - `head :- body.`          register a rule (re-stratifies)
//! - `pred(v1, v2).`          assert a fact
//! - `-pred(v1, _).`          retract matching facts (variables are wildcards)
//! - `pred(X, /a)?`           run a query
//! - `.help` `.preds` `.dump` `.stats` `.quarantine` `.quit`

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use stratalog::ast::Unit;
use stratalog::{Config, Kernel, QueryOptions};
use tracing_subscriber::EnvFilter;

#[derive(ClapParser, Debug)]
#[command(name = "stratalog", about = "Stratified Datalog knowledge kernel REPL")]
struct Args {
    /// Schema files to load at startup, in order.
    #[arg(short, long = "schema")]
    schema: Vec<String>,

    /// Configuration file (default: stratalog.toml in the working directory).
    #[arg(short, long)]
    config: Option<String>,

    /// Query deadline in milliseconds.
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Capture derivation provenance for every query.
    #[arg(long)]
    trace: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).context("loading configuration")?,
        None => Config::load().unwrap_or_default(),
    };
    if let Some(ms) = args.deadline_ms {
        config.query.default_deadline_ms = Some(ms);
    }
    if args.trace {
        config.query.trace = true;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    let kernel = Kernel::with_config(config);

    // Concatenate schema files into one load cycle so cross-file rules and
    // declarations resolve.
    if !args.schema.is_empty() {
        let mut source = String::new();
        for path in &args.schema {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading schema file {}", path))?;
            source.push_str(&text);
            source.push('\n');
        }
        kernel.load_schema(&source).context("loading schema")?;
        let stats = kernel.statistics();
        println!(
            "Loaded {} predicates, {} rules, {} strata, {} facts.",
            stats.predicates, stats.rules, stats.strata, stats.stored_facts
        );
    }

    println!("Stratalog knowledge kernel. Type .help for commands.");

    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline("stratalog> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                if line.starts_with('.') {
                    if !handle_meta(&kernel, line) {
                        break;
                    }
                } else {
                    handle_input(&kernel, line);
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("readline error: {}", err);
                break;
            }
        }
    }

    Ok(())
}

/// Returns false when the REPL should exit.
fn handle_meta(kernel: &Kernel, line: &str) -> bool {
    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or("");
    match command {
        ".quit" | ".exit" => return false,
        ".help" => {
            println!("Input:");
            println!("  Decl name(A, B) bound [/name, /number].   declare a predicate");
            println!("  head(X) :- body(X).                       register a rule");
            println!("  pred(/a, 1).                              assert a fact");
            println!("  -pred(/a, _).                             retract matching facts");
            println!("  pred(X, Y)?                               query");
            println!("Commands:");
            println!("  .preds       list declarations");
            println!("  .dump        dump the schema as source text");
            println!("  .stats       kernel statistics");
            println!("  .quarantine  list quarantined rules");
            println!("  .quit        exit");
        }
        ".preds" => {
            let stats = kernel.statistics();
            for pred in &stats.by_predicate {
                println!(
                    "  {}/{}  stratum {}  stored {}  derived {}{}",
                    pred.name,
                    pred.arity,
                    pred.stratum,
                    pred.stored,
                    pred.derived,
                    if pred.external { "  [external]" } else { "" }
                );
            }
        }
        ".dump" => print!("{}", kernel.dump_schema()),
        ".stats" => match serde_json::to_string_pretty(&kernel.statistics()) {
            Ok(json) => println!("{}", json),
            Err(err) => eprintln!("error: {}", err),
        },
        ".quarantine" => {
            let rules = kernel.quarantined_rules();
            if rules.is_empty() {
                println!("no quarantined rules");
            }
            for rule in rules {
                println!("  #{}: {}", rule.id, rule.text);
            }
        }
        other => println!("unknown command {} (try .help)", other),
    }
    true
}

fn handle_input(kernel: &Kernel, line: &str) {
    // Retraction sugar: a leading '-' deletes matching facts.
    if let Some(rest) = line.strip_prefix('-') {
        match stratalog::parser::parse_goal(rest) {
            Ok(atom) => match kernel.retract(&atom.pred, atom.args) {
                Ok(count) => println!("retracted {} tuple(s)", count),
                Err(err) => eprintln!("error: {}", err),
            },
            Err(err) => eprintln!("error: {}", err),
        }
        return;
    }

    let program = match stratalog::parser::parse_program(line) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("error: {}", err);
            return;
        }
    };

    for unit in program.units {
        match unit {
            Unit::Query(atom) => run_query(kernel, &atom),
            Unit::Decl(_) | Unit::Clause(_) => {
                // Declarations, rules, and facts all go through rule
                // registration, which re-stratifies as needed.
                let rendered = match &unit {
                    Unit::Decl(decl) => format!("declared {}/{}", decl.name, decl.arity()),
                    Unit::Clause(clause) if clause.is_fact() => {
                        format!("asserted {}", clause.head)
                    }
                    Unit::Clause(clause) => format!("registered rule for {}", clause.head.pred),
                    Unit::Query(_) => unreachable!("handled above"),
                };
                let source = stratalog::compile::render_unit(&unit);
                match kernel.register_rules(&source) {
                    Ok(()) => println!("{}", rendered),
                    Err(err) => eprintln!("error: {}", err),
                }
            }
        }
    }
}

fn run_query(kernel: &Kernel, atom: &stratalog::Atom) {
    match kernel.query_atom(atom, QueryOptions::default()) {
        Ok(result) => {
            if result.is_empty() {
                println!("no answers");
            }
            for answer in result.iter() {
                let mut pairs: Vec<String> = answer
                    .bindings
                    .iter()
                    .map(|(var, value)| format!("{} = {}", var, value))
                    .collect();
                pairs.sort();
                if pairs.is_empty() {
                    println!("yes");
                } else {
                    println!("{}", pairs.join(", "));
                }
            }
            for diagnostic in &result.diagnostics {
                eprintln!("[{}] {}", diagnostic.kind, diagnostic.message);
            }
        }
        Err(err) => eprintln!("error: {}", err),
    }
}
