//! Run the current executable as a named helper program.
//!
//! A test binary registers programs with [`run_main`] and the same names with
//! [`RunParams::program`](crate::RunParams::program). When a script runs
//! `exec NAME args...`, the engine spawns the test binary itself with
//! [`PROGRAM_FLAG`] and `NAME`, and `run_main` routes to the program instead
//! of running the tests.
//!
//! ```no_run
//! use scriptest::reexec::{self, Program};
//!
//! fn hello(args: &[String]) -> i32 {
//!     println!("hello {}", args.join(" "));
//!     0
//! }
//!
//! fn main() {
//!     let programs: &[(&str, Program)] = &[("hello", hello)];
//!     reexec::run_main(programs, || {
//!         let result = scriptest::run("testdata").program("hello").execute();
//!         if result.is_ok() { 0 } else { 1 }
//!     })
//! }
//! ```

/// Argument that selects a helper program in a re-exec'd child.
pub const PROGRAM_FLAG: &str = "--scriptest-program";

/// A helper program: receives its arguments (without the program name) and
/// returns the process exit code.
pub type Program = fn(&[String]) -> i32;

/// Inspect an argument vector (including `argv[0]`). Returns the selected
/// program name and its arguments if this process was started as a helper.
pub fn dispatch<I>(args: I) -> Option<(String, Vec<String>)>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    if args.next()? != PROGRAM_FLAG {
        return None;
    }
    let name = args.next()?;
    Some((name, args.collect()))
}

/// Entry point for binaries that double as helper programs.
///
/// Runs the selected program if the process was re-exec'd, otherwise
/// `fallback`. Exits with whichever exit code results.
pub fn run_main<F>(programs: &[(&str, Program)], fallback: F) -> !
where
    F: FnOnce() -> i32,
{
    let code = match dispatch(std::env::args()) {
        Some((name, args)) => match programs.iter().find(|(n, _)| *n == name) {
            Some((_, program)) => program(&args),
            None => {
                eprintln!("unknown program {name:?}");
                2
            }
        },
        None => fallback(),
    };
    std::process::exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dispatch_selects_program() {
        let got = dispatch(argv(&["/bin/test", PROGRAM_FLAG, "printargs", "a", "b"]));
        assert_eq!(got, Some(("printargs".to_string(), argv(&["a", "b"]))));
    }

    #[test]
    fn dispatch_ignores_normal_invocations() {
        assert_eq!(dispatch(argv(&["/bin/test"])), None);
        assert_eq!(dispatch(argv(&["/bin/test", "--nocapture"])), None);
        assert_eq!(dispatch(argv(&["/bin/test", PROGRAM_FLAG])), None);
    }
}
