//! Built-in script commands.

use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::commands::{Command, NoNegate};
use crate::compare::{Compared, Comparison, compare, normalize};
use crate::error::CommandError;
use crate::process::{self, ProcessSpec, Signal};
use crate::reexec;
use crate::script::{self, Expect, Word};
use crate::session::Session;

type BuiltinFn = fn(&mut Session, bool, &[String]) -> Result<(), CommandError>;

/// Every built-in command by name.
pub(crate) fn all() -> Vec<(&'static str, Arc<dyn Command>)> {
    let negatable: [(&str, BuiltinFn); 7] = [
        ("cmp", cmd_cmp),
        ("cmpenv", cmd_cmpenv),
        ("exec", cmd_exec),
        ("exists", cmd_exists),
        ("grep", cmd_grep),
        ("stdout", cmd_stdout),
        ("stderr", cmd_stderr),
    ];
    let plain: [(&str, BuiltinFn); 13] = [
        ("cd", cmd_cd),
        ("chmod", cmd_chmod),
        ("cp", cmd_cp),
        ("env", cmd_env),
        ("kill", cmd_kill),
        ("mkdir", cmd_mkdir),
        ("mv", cmd_mv),
        ("rm", cmd_rm),
        ("skip", cmd_skip),
        ("stdin", cmd_stdin),
        ("stop", cmd_stop),
        ("unquote", cmd_unquote),
        ("wait", cmd_wait),
    ];

    let mut out: Vec<(&'static str, Arc<dyn Command>)> = Vec::new();
    for (name, f) in negatable {
        let cmd: Arc<dyn Command> = Arc::new(f);
        out.push((name, cmd));
    }
    for (name, f) in plain {
        let cmd: Arc<dyn Command> = Arc::new(NoNegate(f));
        out.push((name, cmd));
    }
    out
}

fn usage(ok: bool, text: &str) -> Result<(), CommandError> {
    if ok {
        Ok(())
    } else {
        Err(CommandError::usage(format!("usage: {text}")))
    }
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

fn cmd_cd(ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    usage(args.len() == 1, "cd dir")?;
    let dir = ts.mk_abs(&args[0]);
    if !dir.starts_with(ts.work_dir()) {
        return Err(CommandError::failed(format!(
            "cd {}: directory is outside the sandbox",
            args[0]
        )));
    }
    if !dir.is_dir() {
        return Err(CommandError::failed(format!(
            "cd {}: not a directory",
            args[0]
        )));
    }
    ts.set_cwd(dir);
    Ok(())
}

#[cfg(unix)]
fn cmd_chmod(ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    use std::os::unix::fs::PermissionsExt;

    usage(args.len() >= 2, "chmod perm paths...")?;
    let mode = u32::from_str_radix(&args[0], 8)
        .ok()
        .filter(|m| *m <= 0o777)
        .ok_or_else(|| CommandError::usage(format!("chmod: invalid mode {:?}", args[0])))?;
    for path in &args[1..] {
        std::fs::set_permissions(ts.mk_abs(path), std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn cmd_chmod(_ts: &mut Session, _neg: bool, _args: &[String]) -> Result<(), CommandError> {
    Err(CommandError::usage("chmod is not supported on this platform"))
}

fn cmd_cp(ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    let Some((dst, srcs)) = args.split_last().filter(|(_, srcs)| !srcs.is_empty()) else {
        return usage(false, "cp src... dst");
    };
    let dst_path = ts.mk_abs(dst);
    let dst_is_dir = dst_path.is_dir();
    if srcs.len() > 1 && !dst_is_dir {
        return Err(CommandError::failed(format!("cp: destination {dst} is not a directory")));
    }

    for src in srcs {
        let target = if dst_is_dir {
            let file_name = Path::new(src)
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| src.into());
            dst_path.join(file_name)
        } else {
            dst_path.clone()
        };
        match src.as_str() {
            "stdout" | "stderr" => std::fs::write(&target, ts.read_file(src)?)?,
            _ => {
                std::fs::copy(ts.mk_abs(src), &target)
                    .map_err(|e| CommandError::failed(format!("cp {src} {dst}: {e}")))?;
            }
        }
    }
    Ok(())
}

fn cmd_exists(ts: &mut Session, neg: bool, args: &[String]) -> Result<(), CommandError> {
    let (readonly, files) = match args.first().map(String::as_str) {
        Some("-readonly") => (true, &args[1..]),
        _ => (false, args),
    };
    usage(!files.is_empty(), "exists [-readonly] file...")?;

    // Negated, every file must be absent; reported as a natural failure so
    // that the negation turns it into success.
    if neg {
        if let Some(found) = files.iter().find(|f| ts.mk_abs(f).exists()) {
            ts.log(format!("{found} exists"));
            return Ok(());
        }
        return Err(CommandError::failed("no files exist"));
    }

    for file in files {
        let meta = std::fs::metadata(ts.mk_abs(file))
            .map_err(|_| CommandError::failed(format!("{file} does not exist")))?;
        if readonly && !meta.permissions().readonly() {
            return Err(CommandError::failed(format!("{file} exists but is writable")));
        }
    }
    Ok(())
}

fn cmd_mkdir(ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    usage(!args.is_empty(), "mkdir dir...")?;
    for dir in args {
        std::fs::create_dir_all(ts.mk_abs(dir))?;
    }
    Ok(())
}

fn cmd_mv(ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    usage(args.len() == 2, "mv old new")?;
    std::fs::rename(ts.mk_abs(&args[0]), ts.mk_abs(&args[1]))
        .map_err(|e| CommandError::failed(format!("mv {} {}: {e}", args[0], args[1])))
}

fn cmd_rm(ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    usage(!args.is_empty(), "rm file...")?;
    for arg in args {
        let path = ts.mk_abs(arg);
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CommandError::failed(format!("rm {arg}: {e}"))),
        }
    }
    Ok(())
}

fn cmd_unquote(ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    usage(!args.is_empty(), "unquote file...")?;
    for file in args {
        let text = ts.read_file(file)?;
        let mut out = String::with_capacity(text.len());
        for (i, line) in text.split_inclusive('\n').enumerate() {
            let rest = line.strip_prefix('>').ok_or_else(|| {
                CommandError::failed(format!("{file}:{}: line not quoted with '>'", i + 1))
            })?;
            out.push_str(rest);
        }
        std::fs::write(ts.mk_abs(file), out)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Environment and run control
// ---------------------------------------------------------------------------

fn cmd_env(ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    if args.is_empty() {
        let mut vars: Vec<String> = ts.env().iter().map(|(k, v)| format!("{k}={v}")).collect();
        vars.sort();
        ts.log(vars.join("\n"));
        return Ok(());
    }
    for arg in args {
        match crate::env::split_assignment(arg) {
            Some((key, value)) => ts.setenv(key, value),
            None => {
                let value = ts.getenv(arg);
                ts.log(format!("{arg}={value}"));
            }
        }
    }
    Ok(())
}

fn cmd_skip(_ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    Err(CommandError::Skip(args.join(" ")))
}

fn cmd_stop(_ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    Err(CommandError::Stop(args.join(" ")))
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

fn cmd_stdin(ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    usage(args.len() == 1, "stdin filename")?;
    let data = match args[0].as_str() {
        "stdout" | "stderr" => ts.read_file(&args[0])?.into_bytes(),
        file => std::fs::read(ts.mk_abs(file))
            .map_err(|e| CommandError::failed(format!("stdin {file}: {e}")))?,
    };
    ts.set_stdin(data);
    Ok(())
}

/// Split a trailing `&` or `&name&` off an exec argument list.
fn background_marker(args: &[String]) -> (&[String], Option<Option<String>>) {
    match args.split_last() {
        Some((last, rest)) if last == "&" => (rest, Some(None)),
        Some((last, rest)) if last.len() > 2 && last.starts_with('&') && last.ends_with('&') => {
            (rest, Some(Some(last[1..last.len() - 1].to_string())))
        }
        _ => (args, None),
    }
}

fn cmd_exec(ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    let (argv, background) = background_marker(args);
    usage(!argv.is_empty(), "exec program [args...] [&|&name&]")?;

    let mut argv = argv.to_vec();
    if ts.programs.contains(&argv[0]) {
        let exe = std::env::current_exe()?;
        argv.splice(
            0..0,
            [exe.display().to_string(), reexec::PROGRAM_FLAG.to_string()],
        );
    }

    let spec = ProcessSpec {
        argv,
        env: ts.env().clone(),
        cwd: ts.cwd().to_path_buf(),
        stdin: ts.take_stdin(),
    };

    if let Some(name) = background {
        if let Some(name) = &name
            && ts.background_cmds().iter().any(|p| p.name() == Some(name.as_str()))
        {
            return Err(CommandError::usage(format!(
                "duplicate background process name {name:?}"
            )));
        }
        let process = process::run_background(&spec, name, ts.expect)?;
        ts.push_background(process);
        ts.deferred = true;
        return Ok(());
    }

    let output = process::run_foreground(&spec, ts.deadline)?;
    ts.log_output(&output.stdout, &output.stderr);
    let success = output.success();
    let status = output.describe_status();
    ts.set_output(output.stdout, output.stderr);
    if success {
        Ok(())
    } else {
        Err(CommandError::failed(format!("{}: {status}", args[0])))
    }
}

fn cmd_wait(ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    usage(args.len() <= 1, "wait [name]")?;
    let mut pending = ts.take_background(args.first().map(String::as_str))?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut failures = Vec::new();

    while !pending.is_empty() {
        let mut timeout = ts.wait_timeout;
        if let Some(deadline) = ts.deadline {
            timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
        }
        let output = match pending[0].wait(timeout) {
            Ok(output) => output,
            Err(e) => {
                // Hand the survivors back so teardown can kill them.
                for process in pending {
                    ts.push_background(process);
                }
                return Err(e.into());
            }
        };
        let process = pending.remove(0);
        let label = process.name().unwrap_or_else(|| process.argv()[0].as_str());
        ts.log(format!("[background] {label}: {}", output.describe_status()));
        ts.log_output(&output.stdout, &output.stderr);

        match (process.expect(), output.success()) {
            (Expect::Success, false) => failures.push(format!(
                "{label}: unexpected command failure ({})",
                output.describe_status()
            )),
            (Expect::Failure, true) => failures.push(format!("{label}: unexpected command success")),
            _ => {}
        }
        stdout.push_str(&output.stdout);
        stderr.push_str(&output.stderr);
    }

    ts.set_output(stdout, stderr);
    if failures.is_empty() {
        Ok(())
    } else {
        Err(CommandError::failed(failures.join("\n")))
    }
}

fn cmd_kill(ts: &mut Session, _neg: bool, args: &[String]) -> Result<(), CommandError> {
    let (signal, rest) = match args.first() {
        Some(flag) if flag.starts_with('-') => {
            let signal = flag[1..].parse::<Signal>().map_err(CommandError::usage)?;
            (signal, &args[1..])
        }
        _ => (Signal::Kill, args),
    };
    usage(rest.len() <= 1, "kill [-SIGNAL] [name]")?;

    match rest.first() {
        Some(name) => {
            let process = ts
                .background_cmds()
                .iter_mut()
                .find(|p| p.name() == Some(name.as_str()))
                .ok_or_else(|| {
                    CommandError::usage(format!("no background process named {name:?}"))
                })?;
            process.signal(signal)?;
        }
        None => {
            let mut sent = 0;
            for process in ts.background_cmds() {
                if process.is_running()? {
                    process.signal(signal)?;
                    sent += 1;
                }
            }
            if sent == 0 {
                return Err(CommandError::failed("kill: no running background processes"));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Output assertions
// ---------------------------------------------------------------------------

fn cmd_cmp(ts: &mut Session, neg: bool, args: &[String]) -> Result<(), CommandError> {
    compare_files(ts, neg, args, false)
}

fn cmd_cmpenv(ts: &mut Session, neg: bool, args: &[String]) -> Result<(), CommandError> {
    compare_files(ts, neg, args, true)
}

fn compare_files(ts: &mut Session, neg: bool, args: &[String], env: bool) -> Result<(), CommandError> {
    let name = if env { "cmpenv" } else { "cmp" };
    usage(args.len() == 2, &format!("{name} file1 file2"))?;
    let (actual_name, expected_name) = (&args[0], &args[1]);

    let actual = ts.read_file(actual_name)?;
    let mut expected = ts.read_file(expected_name)?;
    if env {
        expected = ts.expand(&Word::new(expected));
    }
    let golden = match expected_name.as_str() {
        "stdout" | "stderr" => None,
        _ if env || neg => None,
        other => ts.golden_name(other),
    };

    let update = ts.update;
    if update
        && let Some(entry) = &golden
        && normalize(&actual) != normalize(&expected)
        && script::has_separator_line(&actual)
    {
        return Err(CommandError::failed(format!(
            "cannot update {entry}: {actual_name} contains a line that reads as an archive separator"
        )));
    }
    let cmp = Comparison {
        actual_name,
        actual: &actual,
        expected_name,
        expected: &expected,
        golden: golden.as_deref(),
    };
    match compare(&cmp, &mut ts.script, update) {
        Ok(Compared::Matched) => Ok(()),
        Ok(Compared::Updated) => {
            std::fs::write(ts.mk_abs(expected_name), &actual)?;
            ts.updated = true;
            ts.log(format!("updated {expected_name}"));
            Ok(())
        }
        Err(_) if neg => Err(CommandError::failed(format!(
            "{actual_name} and {expected_name} differ"
        ))),
        Err(mismatch) => Err(CommandError::failed(mismatch.to_string())),
    }
}

fn cmd_stdout(ts: &mut Session, neg: bool, args: &[String]) -> Result<(), CommandError> {
    let text = ts.stdout().to_string();
    match_text(ts, neg, args, "stdout", "stdout [-count=N] pattern", &text)
}

fn cmd_stderr(ts: &mut Session, neg: bool, args: &[String]) -> Result<(), CommandError> {
    let text = ts.stderr().to_string();
    match_text(ts, neg, args, "stderr", "stderr [-count=N] pattern", &text)
}

fn cmd_grep(ts: &mut Session, neg: bool, args: &[String]) -> Result<(), CommandError> {
    let text_args = match args.first() {
        Some(a) if a.starts_with("-count=") => args.len().saturating_sub(1),
        _ => args.len(),
    };
    let Some((file, pattern_args)) = args.split_last().filter(|_| text_args == 2) else {
        return usage(false, "grep [-count=N] pattern file");
    };
    let text = ts.read_file(file)?;
    match_text(ts, neg, pattern_args, file, "grep [-count=N] pattern file", &text)
}

fn match_text(
    ts: &mut Session,
    neg: bool,
    args: &[String],
    source: &str,
    usage_text: &str,
    text: &str,
) -> Result<(), CommandError> {
    let (count, rest) = match args.first() {
        Some(flag) if flag.starts_with("-count=") => {
            let n = flag["-count=".len()..]
                .parse::<usize>()
                .map_err(|_| CommandError::usage(format!("bad -count: {flag:?}")))?;
            (Some(n), &args[1..])
        }
        _ => (None, args),
    };
    usage(rest.len() == 1, usage_text)?;
    if count.is_some() && neg {
        return Err(CommandError::usage("cannot use -count= with negated match"));
    }

    let pattern = &rest[0];
    let re = Regex::new(&format!("(?m){pattern}"))
        .map_err(|e| CommandError::usage(format!("invalid regex {pattern:?}: {e}")))?;

    match count {
        Some(want) => {
            let got = re.find_iter(text).count();
            if got != want {
                return Err(CommandError::failed(format!(
                    "found {got} matches for `{pattern}` in {source}; want {want}"
                )));
            }
            Ok(())
        }
        None if re.is_match(text) => {
            if neg {
                ts.log(format!("[{source}]\n{text}"));
            }
            Ok(())
        }
        None => Err(CommandError::failed(format!(
            "no match for `{pattern}` found in {source}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse;
    use crate::session::SessionOptions;
    use std::time::Duration;

    fn session(src: &str) -> Session {
        let options = SessionOptions {
            wait_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        Session::new(parse(src).unwrap(), tempfile::tempdir().unwrap(), options).unwrap()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn background_marker_forms() {
        let plain = args(&["echo", "hi"]);
        assert_eq!(background_marker(&plain), (&plain[..], None));
        let bg = args(&["sleep", "1", "&"]);
        assert_eq!(background_marker(&bg), (&bg[..2], Some(None)));
        let named = args(&["sleep", "1", "&job&"]);
        assert_eq!(
            background_marker(&named),
            (&named[..2], Some(Some("job".to_string())))
        );
        let empty_name = args(&["x", "&&"]);
        assert_eq!(background_marker(&empty_name).1, None);
    }

    #[test]
    fn cd_stays_in_sandbox() {
        let mut ts = session("-- sub/f --\nx\n");
        cmd_cd(&mut ts, false, &args(&["sub"])).unwrap();
        assert!(ts.cwd().ends_with("sub"));
        cmd_cd(&mut ts, false, &args(&[".."])).unwrap();
        assert_eq!(ts.cwd(), ts.work_dir());
        assert!(cmd_cd(&mut ts, false, &args(&[".."])).is_err());
        assert!(cmd_cd(&mut ts, false, &args(&["missing"])).is_err());
    }

    #[test]
    fn exists_and_negated_exists() {
        let mut ts = session("-- a --\nx\n");
        assert!(cmd_exists(&mut ts, false, &args(&["a"])).is_ok());
        assert!(matches!(
            cmd_exists(&mut ts, false, &args(&["a", "b"])),
            Err(CommandError::Failed(_))
        ));
        // Negated: fails naturally only when none of the files exist.
        assert!(matches!(
            cmd_exists(&mut ts, true, &args(&["b", "c"])),
            Err(CommandError::Failed(_))
        ));
        assert!(cmd_exists(&mut ts, true, &args(&["b", "a"])).is_ok());
    }

    #[test]
    fn env_sets_and_queries() {
        let mut ts = session("");
        cmd_env(&mut ts, false, &args(&["A=1", "B=two=2"])).unwrap();
        assert_eq!(ts.getenv("A"), "1");
        assert_eq!(ts.getenv("B"), "two=2");
        cmd_env(&mut ts, false, &args(&["A"])).unwrap();
        assert!(ts.log_text().contains("A=1"));
    }

    #[test]
    fn cp_mv_rm_mkdir() {
        let mut ts = session("-- a --\nhello\n");
        cmd_mkdir(&mut ts, false, &args(&["d/e"])).unwrap();
        cmd_cp(&mut ts, false, &args(&["a", "b"])).unwrap();
        cmd_cp(&mut ts, false, &args(&["a", "b", "d"])).unwrap();
        cmd_mv(&mut ts, false, &args(&["b", "c"])).unwrap();
        let root = ts.work_dir().to_path_buf();
        assert_eq!(std::fs::read_to_string(root.join("c")).unwrap(), "hello\n");
        assert_eq!(std::fs::read_to_string(root.join("d/b")).unwrap(), "hello\n");
        assert!(!root.join("b").exists());
        cmd_rm(&mut ts, false, &args(&["c", "d", "never-existed"])).unwrap();
        assert!(!root.join("c").exists());
        assert!(!root.join("d").exists());
    }

    #[test]
    fn cp_multiple_sources_need_directory() {
        let mut ts = session("-- a --\n-- b --\n");
        assert!(cmd_cp(&mut ts, false, &args(&["a", "b", "c"])).is_err());
    }

    #[test]
    fn unquote_strips_prefix() {
        let mut ts = session("-- q --\n>line one\n>-- not a separator --\n");
        cmd_unquote(&mut ts, false, &args(&["q"])).unwrap();
        assert_eq!(
            std::fs::read_to_string(ts.work_dir().join("q")).unwrap(),
            "line one\n-- not a separator --\n"
        );
    }

    #[test]
    fn match_text_with_count() {
        let mut ts = session("");
        ts.set_output("a1\nb2\na3\n".to_string(), String::new());
        assert!(cmd_stdout(&mut ts, false, &args(&["^a"])).is_ok());
        assert!(cmd_stdout(&mut ts, false, &args(&["-count=2", "^a"])).is_ok());
        assert!(matches!(
            cmd_stdout(&mut ts, false, &args(&["-count=1", "^a"])),
            Err(CommandError::Failed(_))
        ));
        assert!(matches!(
            cmd_stdout(&mut ts, true, &args(&["-count=1", "^a"])),
            Err(CommandError::Usage(_))
        ));
        assert!(matches!(
            cmd_stderr(&mut ts, false, &args(&["."])),
            Err(CommandError::Failed(_))
        ));
        assert!(matches!(
            cmd_stdout(&mut ts, false, &args(&["("])),
            Err(CommandError::Usage(_))
        ));
    }

    #[test]
    fn grep_file() {
        let mut ts = session("-- f --\nfoo\nbar\n");
        assert!(cmd_grep(&mut ts, false, &args(&["^bar$", "f"])).is_ok());
        assert!(cmd_grep(&mut ts, false, &args(&["-count=1", "o+", "f"])).is_ok());
        assert!(cmd_grep(&mut ts, false, &args(&["baz", "f"])).is_err());
        assert!(matches!(
            cmd_grep(&mut ts, false, &args(&["f"])),
            Err(CommandError::Usage(_))
        ));
    }

    #[test]
    fn cmp_reports_diff() {
        let mut ts = session("-- got --\na\nb\n-- want --\na\nc\n");
        let err = cmd_cmp(&mut ts, false, &args(&["got", "want"])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("-c"), "{msg}");
        assert!(msg.contains("+b"), "{msg}");
        assert!(cmd_cmp(&mut ts, false, &args(&["got", "got"])).is_ok());
    }

    #[test]
    fn cmp_update_mode_rewrites_archive() {
        let mut ts = session("-- want --\nold\n");
        ts.update = true;
        ts.set_output("new\n".to_string(), String::new());
        cmd_cmp(&mut ts, false, &args(&["stdout", "want"])).unwrap();
        assert!(ts.updated);
        assert_eq!(ts.script.file("want").unwrap().data, b"new\n");
        assert_eq!(
            std::fs::read_to_string(ts.work_dir().join("want")).unwrap(),
            "new\n"
        );
    }

    #[test]
    fn cmp_update_resolves_parent_paths() {
        let mut ts = session("-- want --\nold\n-- sub/f --\n");
        ts.update = true;
        cmd_cd(&mut ts, false, &args(&["sub"])).unwrap();
        ts.set_output("new\n".to_string(), String::new());
        cmd_cmp(&mut ts, false, &args(&["stdout", "../want"])).unwrap();
        assert!(ts.updated);
        assert_eq!(ts.script.file("want").unwrap().data, b"new\n");
    }

    #[test]
    fn cmp_update_refuses_separator_lines() {
        let mut ts = session("-- want --\nold\n");
        ts.update = true;
        ts.set_output("a\n-- other --\nb\n".to_string(), String::new());
        let err = cmd_cmp(&mut ts, false, &args(&["stdout", "want"])).unwrap_err();
        assert!(err.to_string().contains("archive separator"), "{err}");
        assert!(!ts.updated);
        assert_eq!(ts.script.file("want").unwrap().data, b"old\n");
    }

    #[test]
    fn cmpenv_expands_expected() {
        let mut ts = session("-- want --\nwork=$WORK\n");
        let work = ts.getenv("WORK");
        ts.set_output(format!("work={work}\n"), String::new());
        cmd_cmpenv(&mut ts, false, &args(&["stdout", "want"])).unwrap();
    }

    #[test]
    fn skip_and_stop_halt() {
        let mut ts = session("");
        assert!(matches!(
            cmd_skip(&mut ts, false, &args(&["not", "here"])),
            Err(CommandError::Skip(ref m)) if m == "not here"
        ));
        assert!(matches!(
            cmd_stop(&mut ts, false, &[]),
            Err(CommandError::Stop(_))
        ));
    }

    #[test]
    #[cfg(unix)]
    fn exec_foreground_and_failure() {
        let mut ts = session("");
        cmd_exec(&mut ts, false, &args(&["echo", "hello"])).unwrap();
        assert_eq!(ts.stdout(), "hello\n");
        let err = cmd_exec(&mut ts, false, &args(&["sh", "-c", "echo oops >&2; exit 2"])).unwrap_err();
        assert!(matches!(err, CommandError::Failed(ref m) if m.contains("exit status 2")));
        assert_eq!(ts.stderr(), "oops\n");
    }

    #[test]
    #[cfg(unix)]
    fn exec_uses_session_env_and_cwd() {
        let mut ts = session("-- sub/x --\n");
        ts.setenv("GREETING", "hi");
        cmd_cd(&mut ts, false, &args(&["sub"])).unwrap();
        cmd_exec(&mut ts, false, &args(&["sh", "-c", "echo $GREETING; ls"])).unwrap();
        assert_eq!(ts.stdout(), "hi\nx\n");
    }

    #[test]
    #[cfg(unix)]
    fn exec_with_stdin() {
        let mut ts = session("-- in --\npiped\n");
        cmd_stdin(&mut ts, false, &args(&["in"])).unwrap();
        cmd_exec(&mut ts, false, &args(&["cat"])).unwrap();
        assert_eq!(ts.stdout(), "piped\n");
        // Consumed by the first exec.
        cmd_exec(&mut ts, false, &args(&["cat"])).unwrap();
        assert_eq!(ts.stdout(), "");
    }

    #[test]
    #[cfg(unix)]
    fn background_exec_and_wait() {
        let mut ts = session("");
        cmd_exec(&mut ts, false, &args(&["echo", "one", "&"])).unwrap();
        cmd_exec(&mut ts, false, &args(&["echo", "two", "&second&"])).unwrap();
        assert_eq!(ts.background_cmds().len(), 2);
        cmd_wait(&mut ts, false, &[]).unwrap();
        assert_eq!(ts.stdout(), "one\ntwo\n");
        assert!(ts.background_cmds().is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn wait_checks_background_expectation() {
        let mut ts = session("");
        ts.expect = Expect::Failure;
        cmd_exec(&mut ts, true, &args(&["true", "&"])).unwrap();
        ts.expect = Expect::Success;
        let err = cmd_wait(&mut ts, false, &[]).unwrap_err();
        assert!(err.to_string().contains("unexpected command success"));
    }

    #[test]
    #[cfg(unix)]
    fn kill_named_background() {
        let mut ts = session("");
        cmd_exec(&mut ts, false, &args(&["sleep", "10", "&sleeper&"])).unwrap();
        cmd_kill(&mut ts, false, &args(&["-TERM", "sleeper"])).unwrap();
        let err = cmd_wait(&mut ts, false, &args(&["sleeper"])).unwrap_err();
        assert!(err.to_string().contains("unexpected command failure"));
    }

    #[test]
    #[cfg(unix)]
    fn duplicate_background_name() {
        let mut ts = session("");
        cmd_exec(&mut ts, false, &args(&["sleep", "10", "&x&"])).unwrap();
        assert!(matches!(
            cmd_exec(&mut ts, false, &args(&["sleep", "10", "&x&"])),
            Err(CommandError::Usage(_))
        ));
    }
}
