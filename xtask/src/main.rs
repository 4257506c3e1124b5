//! xtask: Development tasks for tiersort
//!
//! Run with: `cargo xtask <command>`

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use xshell::{cmd, Shell};

/// Where Linux exposes POSIX shared memory objects.
const SHM_DIR: &str = "/dev/shm";
const SEGMENT_PREFIX: &str = "tiersort-";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Development tasks for tiersort")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests (workspace + fuzz harnesses)
    Test,
    /// Run fuzz tests with bolero
    Fuzz {
        /// Target to fuzz ("handoff" or "framing")
        /// If not specified, runs all fuzz harnesses in test mode (quick smoke test)
        target: Option<String>,
    },
    /// Run the pipeline once with a given worker count
    Demo {
        #[arg(short = 'n', long, default_value_t = 4)]
        workers: usize,
    },
    /// List shared memory segments left behind by tiersort runs
    Leaks {
        /// Remove them
        #[arg(long)]
        clean: bool,
    },
    /// Run clippy on all code
    Clippy,
    /// Check formatting
    Fmt {
        /// Fix formatting issues instead of just checking
        #[arg(long)]
        fix: bool,
    },
}

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // xtask lives one level below the workspace root
    let workspace_root = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .ok_or("xtask has no parent directory")?
        .to_path_buf();
    sh.change_dir(&workspace_root);

    match cli.command {
        Commands::Test => {
            println!("=== Running workspace tests ===");

            // Try nextest first, fall back to cargo test
            if cmd!(sh, "cargo nextest --version").quiet().run().is_ok() {
                println!("Using cargo-nextest");
                cmd!(sh, "cargo nextest run --workspace").run()?;
            } else {
                println!("cargo-nextest not found, using cargo test");
                cmd!(sh, "cargo test --workspace").run()?;
            }

            println!("\n=== Running fuzz harnesses (test mode) ===");
            sh.change_dir(workspace_root.join("fuzz"));
            cmd!(sh, "cargo test").run()?;

            let leaked = leaked_segments()?;
            if !leaked.is_empty() {
                for path in &leaked {
                    eprintln!("  leaked: {}", path.display());
                }
                return Err(format!("{} shared memory segment(s) leaked", leaked.len()).into());
            }

            println!("\n=== All tests passed ===");
        }
        Commands::Fuzz { target } => {
            sh.change_dir(workspace_root.join("fuzz"));

            if let Some(t) = target {
                println!("=== Fuzzing target: {t} ===");
                println!("Press Ctrl+C to stop.\n");

                // Check if cargo-bolero is installed
                if cmd!(sh, "cargo bolero --version").quiet().run().is_err() {
                    eprintln!("cargo-bolero not found. Install with:");
                    eprintln!("  cargo install cargo-bolero");
                    return Err("cargo-bolero not installed".into());
                }

                cmd!(sh, "cargo bolero test {t}").run()?;
            } else {
                println!("=== Running all fuzz harnesses in test mode ===");
                println!("(For real fuzzing, specify a target: cargo xtask fuzz handoff)\n");
                println!("Available targets:");
                println!("  - handoff  (segment lifecycle ledger vs. reference model)");
                println!("  - framing  (value and control frame decoding)\n");

                cmd!(sh, "cargo test").run()?;
            }
        }
        Commands::Demo { workers } => {
            let workers = workers.to_string();
            cmd!(sh, "cargo run --quiet -p tiersort -- --workers {workers}")
                .env("RUST_LOG", "debug")
                .run()?;
        }
        Commands::Leaks { clean } => {
            let leaked = leaked_segments()?;
            if leaked.is_empty() {
                println!("No tiersort segments in {SHM_DIR}");
            }
            for path in leaked {
                if clean {
                    std::fs::remove_file(&path)?;
                    println!("removed {}", path.display());
                } else {
                    println!("{}", path.display());
                }
            }
        }
        Commands::Clippy => {
            println!("=== Running clippy ===");
            cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;

            println!("\n=== Clippy on fuzz crate ===");
            sh.change_dir(workspace_root.join("fuzz"));
            cmd!(sh, "cargo clippy --all-targets -- -D warnings").run()?;
        }
        Commands::Fmt { fix } => {
            if fix {
                println!("=== Fixing formatting ===");
                cmd!(sh, "cargo fmt --all").run()?;
                sh.change_dir(workspace_root.join("fuzz"));
                cmd!(sh, "cargo fmt").run()?;
            } else {
                println!("=== Checking formatting ===");
                cmd!(sh, "cargo fmt --all -- --check").run()?;
                sh.change_dir(workspace_root.join("fuzz"));
                cmd!(sh, "cargo fmt -- --check").run()?;
            }
        }
    }

    Ok(())
}

/// Shared memory objects whose names carry the tiersort prefix.
fn leaked_segments() -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let dir = Path::new(SHM_DIR);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut leaked = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(SEGMENT_PREFIX))
        {
            leaked.push(entry.path());
        }
    }
    leaked.sort();
    Ok(leaked)
}
