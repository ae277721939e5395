//! Command registry.
//!
//! Every instruction is dispatched by name to a [`Command`]. Built-ins and
//! caller-supplied commands share one table; a name may be registered only
//! once.

use std::collections::HashMap;
use std::sync::Arc;

use crate::builtins;
use crate::error::{CommandError, Error};
use crate::session::Session;

/// A script command.
///
/// `neg` is true for `!`-prefixed instructions. Handlers normally ignore it:
/// the engine inverts a [`CommandError::Failed`] outcome itself. Handlers that
/// need to behave differently when negated (for example to skip printing a
/// diff) can look at it.
pub trait Command: Send + Sync {
    fn run(&self, ts: &mut Session, neg: bool, args: &[String]) -> Result<(), CommandError>;

    /// Whether `!` and `?` may prefix this command.
    fn negatable(&self) -> bool {
        true
    }
}

impl<F> Command for F
where
    F: Fn(&mut Session, bool, &[String]) -> Result<(), CommandError> + Send + Sync,
{
    fn run(&self, ts: &mut Session, neg: bool, args: &[String]) -> Result<(), CommandError> {
        self(ts, neg, args)
    }
}

/// A command that rejects `!` and `?`.
pub struct NoNegate<C>(pub C);

impl<C: Command> Command for NoNegate<C> {
    fn run(&self, ts: &mut Session, neg: bool, args: &[String]) -> Result<(), CommandError> {
        self.0.run(ts, neg, args)
    }

    fn negatable(&self) -> bool {
        false
    }
}

/// Name to command mapping for one run configuration.
#[derive(Clone)]
pub struct Registry {
    commands: HashMap<String, Arc<dyn Command>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.commands.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("commands", &names).finish()
    }
}

impl Registry {
    /// A registry holding only the built-in commands.
    pub fn builtin() -> Self {
        let commands = builtins::all()
            .into_iter()
            .map(|(name, cmd)| (name.to_string(), cmd))
            .collect();
        Registry { commands }
    }

    /// Built-ins plus `custom`. A custom name that is already taken is an
    /// error.
    pub fn with_custom<I>(custom: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (String, Arc<dyn Command>)>,
    {
        let mut registry = Self::builtin();
        for (name, cmd) in custom {
            registry.register(name, cmd)?;
        }
        Ok(registry)
    }

    /// Add a command, failing if the name is already registered.
    pub fn register(&mut self, name: impl Into<String>, cmd: Arc<dyn Command>) -> Result<(), Error> {
        let name = name.into();
        if self.commands.contains_key(&name) {
            return Err(Error::CommandCollision { name });
        }
        self.commands.insert(name, cmd);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Command>> {
        self.commands.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Session, _: bool, _: &[String]) -> Result<(), CommandError> {
        Ok(())
    }

    #[test]
    fn builtins_are_registered() {
        let registry = Registry::builtin();
        for name in ["cd", "cmp", "exec", "exists", "stdout", "stop", "skip", "wait", "kill"] {
            assert!(registry.contains(name), "missing builtin {name}");
        }
        assert!(registry.get("exec").unwrap().negatable());
        assert!(!registry.get("cd").unwrap().negatable());
    }

    #[test]
    fn custom_commands_are_added() {
        let registry =
            Registry::with_custom([("greet".to_string(), Arc::new(noop) as Arc<dyn Command>)])
                .unwrap();
        assert!(registry.contains("greet"));
        assert!(registry.contains("exec"));
    }

    #[test]
    fn collision_with_builtin_is_error() {
        let err = Registry::with_custom([("exec".to_string(), Arc::new(noop) as Arc<dyn Command>)])
            .unwrap_err();
        assert!(matches!(err, Error::CommandCollision { ref name } if name == "exec"));
    }

    #[test]
    fn no_negate_wrapper() {
        let cmd = NoNegate(noop);
        assert!(!cmd.negatable());
    }
}
