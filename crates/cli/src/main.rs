//! `gab`: the command-line front-end for the Gab runtime (spec 6.3).
//!
//! Four subcommands over the [`gab_runtime::engine`] host calls: `run` loads
//! and executes a source file, `exec` does the same for a literal program
//! string, `repl` drives an interactive read-eval-print loop, `help` prints
//! this text. Exit code `0` on success, `1` on a compile or runtime panic,
//! `2` for an unrecognized command (clap already enforces the last one).

use clap::{CommandFactory, Parser, Subcommand};
use gab_runtime::engine::{gab_create, gab_destroy, DiagFlags, Gab, GabError, GabOptions};
use gab_runtime::RuntimeError;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "gab", version, about = "Gab language runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load source/module at path, compile, execute.
    Run {
        path: PathBuf,
        #[command(flatten)]
        flags: Flags,
    },
    /// Compile and execute a literal program.
    Exec {
        source: String,
        #[command(flatten)]
        flags: Flags,
    },
    /// Interactive REPL.
    Repl {
        #[command(flatten)]
        flags: Flags,
    },
    /// List commands and flags.
    Help,
    /// Print a shell completion script for the given shell (hidden; not
    /// part of the documented surface, but a natural fit for the same
    /// derive-based `clap` setup every other subcommand is built from).
    #[command(hide = true)]
    Completions { shell: clap_complete::Shell },
}

#[derive(clap::Args, Clone, Copy, Default)]
struct Flags {
    /// Dump compiled bytecode stats before running.
    #[arg(short = 'd', long)]
    dump: bool,
    /// Suppress stderr diagnostic output.
    #[arg(short = 'q', long)]
    quiet: bool,
    /// Emit machine-parseable structured errors instead of pretty ones.
    #[arg(short = 's', long = "sterr")]
    sterr: bool,
    /// Compile only; don't run.
    #[arg(short = 'c', long)]
    check: bool,
}

impl Flags {
    fn diag(self) -> DiagFlags {
        let mut f = DiagFlags::NONE;
        if self.dump {
            f = f | DiagFlags::DUMP_BYTECODE;
        }
        if self.quiet {
            f = f | DiagFlags::ERR_QUIET;
        }
        if self.sterr {
            f = f | DiagFlags::ERR_STRUCTURED;
        }
        if self.check {
            f = f | DiagFlags::BUILD_CHECK;
        }
        f
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        None | Some(Command::Help) => {
            Cli::command().print_long_help().ok();
            ExitCode::from(0)
        }
        Some(Command::Run { path, flags }) => run_path(&path, flags),
        Some(Command::Exec { source, flags }) => run_source("<exec>", &source, flags),
        Some(Command::Repl { flags }) => repl(flags),
        Some(Command::Completions { shell }) => {
            clap_complete::generate(shell, &mut Cli::command(), "gab", &mut std::io::stdout());
            ExitCode::from(0)
        }
    }
}

fn run_path(path: &PathBuf, flags: Flags) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("gab: cannot read {}: {e}", path.display());
            return ExitCode::from(1);
        }
    };
    run_source(&path.display().to_string(), &source, flags)
}

fn run_source(name: &str, source: &str, flags: Flags) -> ExitCode {
    let gab = gab_create(GabOptions { module_search_paths: default_search_paths(), ..Default::default() });
    let diag = flags.diag();

    let result = if diag.contains(DiagFlags::BUILD_CHECK) {
        gab.compile(name, source, diag).map(|_| Vec::new())
    } else {
        gab.exec(name, source, Vec::new(), diag)
    };

    let code = match result {
        Ok(_) => ExitCode::from(0),
        Err(err) => {
            report(source, &err, diag);
            ExitCode::from(1)
        }
    };
    gab.wait_idle();
    if diag.contains(DiagFlags::DUMP_BYTECODE) {
        dump_heap_stats();
    }
    gab_destroy(gab);
    code
}

fn dump_heap_stats() {
    let stats = gab_runtime::memory_stats::heap_stats_registry().aggregate();
    eprintln!(
        "gab: heap: {} live, {} allocated, {} destroyed, {} cycle collections across {} threads",
        stats.live(),
        stats.total_allocated,
        stats.total_destroyed,
        stats.total_cycle_collections,
        stats.active_threads
    );
}

fn report(source: &str, err: &GabError, diag: DiagFlags) {
    if diag.contains(DiagFlags::ERR_QUIET) {
        return;
    }
    match err {
        GabError::Compile(errs) => {
            for e in errs {
                eprintln!("{e}");
            }
        }
        GabError::Runtime(e) => report_runtime(source, e, diag),
    }
}

fn report_runtime(source: &str, err: &RuntimeError, diag: DiagFlags) {
    if diag.contains(DiagFlags::ERR_STRUCTURED) {
        eprintln!("{}", err.structured());
    } else {
        eprintln!("{}", err.pretty(source));
    }
}

fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("./mod"), PathBuf::from(".")];
    if let Ok(prefix) = std::env::var("GAB_PREFIX") {
        paths.push(PathBuf::from(prefix).join("gab/modules"));
    }
    paths
}

fn repl(flags: Flags) -> ExitCode {
    let gab = gab_create(GabOptions { module_search_paths: default_search_paths(), ..Default::default() });
    let diag = flags.diag();
    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("gab: cannot start line editor: {e}");
            return ExitCode::from(1);
        }
    };
    let history_path = dirs_history_path();
    if let Some(path) = &history_path {
        let _ = editor.load_history(path);
    }

    let mut line_no = 0usize;
    loop {
        let prompt = format!("gab[{line_no}]> ");
        match editor.readline(&prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == ":quit" || trimmed == ":q" {
                    break;
                }
                let _ = editor.add_history_entry(&line);
                line_no += 1;
                let name = format!("<repl:{line_no}>");
                match gab.exec(&name, trimmed, Vec::new(), diag) {
                    Ok(results) => {
                        for v in results {
                            println!("=> {v:?}");
                        }
                    }
                    Err(err) => report(trimmed, &err, diag),
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("gab: readline error: {e}");
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        let _ = editor.save_history(path);
    }
    gab.wait_idle();
    if diag.contains(DiagFlags::DUMP_BYTECODE) {
        dump_heap_stats();
    }
    gab_destroy(gab);
    ExitCode::from(0)
}

fn dirs_history_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".gab_history"))
}
