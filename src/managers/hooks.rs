//! Teardown hooks run at the end of every backup run

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use std::fmt;

/// Severity a hook is registered for
///
/// Ordered `Plumbing < Error < Info`. A hook runs when its level is at most
/// the configured notification level, so plumbing always runs, error hooks
/// run for both `error` and `info`, and info hooks only for `info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookLevel {
    Plumbing,
    Error,
    Info,
}

impl HookLevel {
    /// Map a configured notification level
    pub fn from_notification_level(level: &str) -> Result<Self> {
        match level {
            "error" => Ok(HookLevel::Error),
            "info" => Ok(HookLevel::Info),
            other => Err(anyhow!("unknown NOTIFICATION_LEVEL {}", other)),
        }
    }

    pub fn permits(self, configured: HookLevel) -> bool {
        self <= configured
    }
}

impl fmt::Display for HookLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookLevel::Plumbing => write!(f, "plumbing"),
            HookLevel::Error => write!(f, "error"),
            HookLevel::Info => write!(f, "info"),
        }
    }
}

/// Hook callback; receives the run error rendered with its cause chain
pub type HookAction = Box<dyn FnOnce(Option<String>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct Hook {
    pub level: HookLevel,
    pub name: String,
    action: HookAction,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("level", &self.level)
            .field("name", &self.name)
            .finish()
    }
}

/// Hooks registered over the course of a run
#[derive(Debug, Default)]
pub struct Hooks {
    hooks: Vec<Hook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, level: HookLevel, name: impl Into<String>, action: F)
    where
        F: FnOnce(Option<String>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.hooks.push(Hook {
            level,
            name: name.into(),
            action: Box::new(action),
        });
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every permitted hook, plumbing first, then in registration order
    ///
    /// All hooks run even if some fail; failures are joined into one error.
    pub async fn run(mut self, configured: HookLevel, run_error: Option<&anyhow::Error>) -> Result<()> {
        self.hooks.sort_by_key(|hook| hook.level);
        let rendered = run_error.map(|e| format!("{:#}", e));

        let mut failures = Vec::new();
        for hook in self.hooks {
            if !hook.level.permits(configured) {
                continue;
            }
            if let Err(e) = (hook.action)(rendered.clone()).await {
                failures.push(format!("error running hook {}: {:#}", hook.name, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(failures.join("\n")))
        }
    }
}

/// Merge the outcome of a run with the outcome of its hooks
///
/// A hook failure never hides the run error: when both failed the result
/// mentions both.
pub fn combine(run: Result<()>, hooks: Result<()>) -> Result<()> {
    match (run, hooks) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(run), Ok(())) => Err(run),
        (Ok(()), Err(hooks)) => Err(hooks.context("an error occurred calling the registered hooks")),
        (Err(run), Err(hooks)) => Err(anyhow!(
            "error {:#} executing the script, followed by {:#} calling the registered hooks",
            run,
            hooks
        )),
    }
}
