use clap::{Parser, Subcommand, ValueEnum};
use scriptest::commands::Registry;
use scriptest::runner::{Outcome, RunParams, ScriptResult};
use scriptest::schema::WorkdirRoot;
use scriptest::{loader, schema};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with checkmarks
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

#[derive(Parser)]
#[command(name = "scriptest")]
#[command(about = "Script-driven integration tests for command-line programs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute test scripts
    Run {
        /// Path to scripts (file or directory)
        path: PathBuf,
        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
        /// Filter scripts by name (substring match)
        #[arg(short, long)]
        filter: Option<String>,
        /// Show the run log of every script and debug logging
        #[arg(short, long)]
        verbose: bool,
        /// Rewrite golden files in scripts when comparisons differ
        #[arg(short, long)]
        update: bool,
        /// Run scripts one at a time
        #[arg(long)]
        serial: bool,
        /// Per-script timeout in seconds (overrides suite config)
        #[arg(long)]
        timeout: Option<u64>,
        /// Directory for sandboxes (overrides suite config).
        /// Use "local" for .scriptest/<timestamp>/, or specify a path.
        #[arg(long)]
        workdir_root: Option<String>,
    },
    /// Parse scripts without running them
    Validate {
        /// Path to scripts (file or directory)
        path: PathBuf,
    },
    /// Scaffold a new script
    Init {
        /// Output path for the new script
        #[arg(default_value = "tests/testdata/example.txt")]
        path: PathBuf,
    },
    /// Output the suite config schema
    Schema,
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_env("SCRIPTEST_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            path,
            output,
            filter,
            verbose,
            update,
            serial,
            timeout,
            workdir_root,
        } => {
            setup_logging(verbose);
            std::process::exit(run(RunArgs {
                path,
                output,
                filter,
                verbose,
                update,
                serial,
                timeout,
                workdir_root,
            }));
        }
        Command::Validate { path } => {
            setup_logging(false);
            std::process::exit(validate(&path));
        }
        Command::Init { path } => {
            if let Err(e) = init(&path) {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
            println!("Created: {}", path.display());
        }
        Command::Schema => {
            let schema = schema::generate_schema();
            match serde_json::to_string_pretty(&schema) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error serializing schema: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

struct RunArgs {
    path: PathBuf,
    output: OutputFormat,
    filter: Option<String>,
    verbose: bool,
    update: bool,
    serial: bool,
    timeout: Option<u64>,
    workdir_root: Option<String>,
}

fn run(args: RunArgs) -> i32 {
    if !args.path.exists() {
        eprintln!("No scripts found at: {}", args.path.display());
        return 1;
    }

    let mut params = RunParams::new(&args.path);
    match loader::load_suite_config(&params.root()) {
        Ok(Some(config)) => params = params.with_config(&config),
        Ok(None) => {}
        Err(e) => {
            eprintln!("Error loading suite config: {e}");
            return 1;
        }
    }

    // CLI flags override the suite config
    if let Some(root) = args.workdir_root {
        let resolved = WorkdirRoot::from(root).resolve(&params.root());
        params = params.workdir_root(resolved);
    }
    if let Some(secs) = args.timeout {
        params = params.timeout(Duration::from_secs(secs));
    }
    if args.update {
        params = params.update_scripts(true);
    }
    if args.serial {
        params = params.serial(true);
    }
    if let Some(f) = &args.filter {
        if args.verbose {
            eprintln!("Filtering scripts by: {f:?}");
        }
        params = params.filter(f.clone());
    }

    let run_start = Instant::now();
    let results = match params.run_scripts() {
        Ok(results) => results,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };
    let total_time = run_start.elapsed();

    if results.is_empty() {
        eprintln!("No scripts found at: {}", args.path.display());
        return 1;
    }

    let count = |outcome: Outcome| results.iter().filter(|r| r.outcome == outcome).count();
    let (passed, failed, skipped) = (
        count(Outcome::Passed),
        count(Outcome::Failed),
        count(Outcome::Skipped),
    );

    match args.output {
        OutputFormat::Human => {
            for result in &results {
                print_human(result, args.verbose);
            }
            println!("\n{passed} passed, {failed} failed, {skipped} skipped");
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "passed": passed,
                "failed": failed,
                "skipped": skipped,
                "results": results,
            });
            match serde_json::to_string_pretty(&output) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error serializing results: {e}");
                    return 1;
                }
            }
        }
        OutputFormat::Junit => {
            print!("{}", format_junit_xml(&results, total_time));
        }
    }

    if failed > 0 { 1 } else { 0 }
}

fn print_human(result: &ScriptResult, verbose: bool) {
    match result.outcome {
        Outcome::Passed => {
            let updated = if result.updated { ", updated" } else { "" };
            println!("✓ {} ({:.2?}{updated})", result.name, result.duration);
        }
        Outcome::Skipped => {
            let reason = result.skip_reason.as_deref().unwrap_or_default();
            println!("- {} (skipped: {reason})", result.name);
        }
        Outcome::Failed => {
            println!("✗ {} ({:.2?})", result.name, result.duration);
            if let Some(failure) = &result.failure {
                println!("    {}", failure_location(result));
                for line in failure.message.lines() {
                    println!("    {line}");
                }
            }
        }
    }
    if verbose || result.outcome == Outcome::Failed {
        for line in result.log.lines() {
            println!("      {line}");
        }
    }
    for warning in &result.warnings {
        println!("    warning: {warning}");
    }
}

fn failure_location(result: &ScriptResult) -> String {
    match result.failure.as_ref().and_then(|f| f.line) {
        Some(line) => format!("{}:{line}", result.path.display()),
        None => result.path.display().to_string(),
    }
}

fn validate(path: &Path) -> i32 {
    let scripts = match loader::find_scripts(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error finding scripts: {e}");
            return 1;
        }
    };

    if scripts.is_empty() {
        eprintln!("No scripts found at: {}", path.display());
        return 1;
    }

    let builtins = Registry::builtin();
    let mut errors = 0;
    for script_path in &scripts {
        match loader::load_script(script_path) {
            Ok(script) => {
                println!(
                    "✓ {} ({} instructions, {} files)",
                    script_path.display(),
                    script.instructions.len(),
                    script.files.len()
                );
                for inst in script.instructions.iter().filter(|i| !builtins.contains(&i.name)) {
                    println!(
                        "    warning: line {}: {:?} is not a built-in command",
                        inst.line, inst.name
                    );
                }
            }
            Err(e) => {
                eprintln!("✗ {e}");
                errors += 1;
            }
        }
    }

    if errors > 0 {
        eprintln!("\n{errors} script(s) failed validation");
        return 1;
    }
    println!("\nAll {} script(s) valid", scripts.len());
    0
}

const TEMPLATE: &str = r#"# Lines starting with '#' are comments.
# The script runs in a fresh sandbox holding the files below.

exec echo hello world
stdout 'hello world'
! stderr .

exec cat greeting.txt
cmp stdout greeting.txt

-- greeting.txt --
hello from the archive
"#;

fn init(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("file already exists: {}", path.display()),
        ));
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, TEMPLATE)
}

/// Format results as JUnit XML.
fn format_junit_xml(results: &[ScriptResult], total_time: Duration) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let total = results.len();
    let failures = results.iter().filter(|r| r.outcome == Outcome::Failed).count();
    let skipped = results.iter().filter(|r| r.outcome == Outcome::Skipped).count();

    let _ = writeln!(
        xml,
        "<testsuites tests=\"{total}\" failures=\"{failures}\" time=\"{:.3}\">",
        total_time.as_secs_f64()
    );
    let _ = writeln!(
        xml,
        "  <testsuite name=\"scriptest\" tests=\"{total}\" failures=\"{failures}\" skipped=\"{skipped}\" time=\"{:.3}\">",
        total_time.as_secs_f64()
    );

    for result in results {
        let _ = writeln!(
            xml,
            "    <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\">",
            escape_xml(&result.name),
            escape_xml(&result.path.display().to_string()),
            result.duration.as_secs_f64()
        );

        match result.outcome {
            Outcome::Passed => {}
            Outcome::Skipped => {
                let reason = result.skip_reason.as_deref().unwrap_or_default();
                let _ = writeln!(xml, "      <skipped message=\"{}\"/>", escape_xml(reason));
            }
            Outcome::Failed => {
                let message = result
                    .failure
                    .as_ref()
                    .map(|f| f.message.lines().next().unwrap_or_default())
                    .unwrap_or("Script failed");
                let _ = writeln!(xml, "      <failure message=\"{}\">", escape_xml(message));
                let _ = writeln!(xml, "{}", escape_xml(&failure_location(result)));
                if let Some(failure) = &result.failure {
                    let _ = writeln!(xml, "{}", escape_xml(&failure.message));
                }
                xml.push_str("      </failure>\n");
            }
        }

        if !result.log.is_empty() {
            let _ = writeln!(
                xml,
                "      <system-out>{}</system-out>",
                escape_xml(&result.log)
            );
        }

        xml.push_str("    </testcase>\n");
    }

    xml.push_str("  </testsuite>\n");
    xml.push_str("</testsuites>\n");
    xml
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
