//! Script-driven integration tests for command-line programs.
//!
//! A test is a plain text script: instructions that run programs and check
//! files and output, followed by an archive of files to place in the
//! sandbox before the script starts.
//!
//! ```text
//! exec my-tool --config cfg.toml
//! stdout 'ready'
//! cmp out.txt want.txt
//!
//! -- cfg.toml --
//! mode = "test"
//! -- want.txt --
//! expected output
//! ```
//!
//! Run a directory of scripts with [`run`]:
//!
//! ```no_run
//! scriptest::run("tests/testdata")
//!     .command("greet", |ts, _neg, args| {
//!         ts.log(format!("hello {}", args.join(" ")));
//!         Ok(())
//!     })
//!     .execute()
//!     .unwrap();
//! ```

mod builtins;
pub mod commands;
pub mod compare;
pub mod condition;
pub mod env;
pub mod error;
pub mod loader;
pub mod process;
pub mod reexec;
pub mod runner;
pub mod schema;
pub mod script;
pub mod session;

pub use commands::{Command, NoNegate, Registry};
pub use error::{CommandError, Error, LoadError, ParseError, Result};
pub use runner::{Failure, Outcome, RunParams, ScriptResult};
pub use script::{Script, parse};
pub use session::Session;

/// Start building a run over the scripts in `dir`.
pub fn run(dir: impl Into<std::path::PathBuf>) -> RunParams {
    RunParams::new(dir)
}
