//! Cedar CLI
//!
//! `cedar [-i] [-e <expr>] [file…]`: evaluate an expression, then files in
//! order, then drop into the read-eval-print loop when `-i` was given or
//! nothing else was.

use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cedar")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "The Cedar language", long_about = None)]
struct Cli {
    /// Enter an interactive session after evaluating files
    #[arg(short = 'i', long = "interactive")]
    interactive: bool,

    /// Evaluate an expression before any files
    #[arg(short = 'e', value_name = "EXPR")]
    expr: Option<String>,

    /// Source files evaluated in order
    files: Vec<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    cedar_runtime::init();

    if let Some(expr) = &cli.expr {
        let module = cedar_runtime::new_user_module("command-line");
        if let Err(thrown) = cedar_runtime::eval_str(expr, &module) {
            fatal(&thrown);
        }
    }

    for file in &cli.files {
        match cedar_runtime::modules::load_file(file) {
            Ok(_) => {}
            Err(thrown) => fatal(&thrown),
        }
    }

    if cli.interactive || (cli.expr.is_none() && cli.files.is_empty()) {
        repl();
    }
}

fn fatal(thrown: &cedar_core::Value) -> ! {
    eprintln!("fatal: {}", thrown.to_human_string());
    process::exit(1);
}

fn repl() {
    let module = cedar_runtime::new_user_module("repl");
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("fatal: cannot open terminal: {e}");
            process::exit(1);
        }
    };

    loop {
        match editor.readline("cedar> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                match cedar_runtime::eval_str(&line, &module) {
                    Ok(value) => println!("{}", value.to_repr_string()),
                    Err(thrown) => eprintln!("error: {}", thrown.to_human_string()),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("fatal: {e}");
                process::exit(1);
            }
        }
    }
}
