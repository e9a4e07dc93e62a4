//! Command execution abstraction for testability
//!
//! This module provides a trait-based abstraction for command execution,
//! enabling dependency injection and mocking for tests.

use super::command::CommandOptions;
use anyhow::Result;
use async_trait::async_trait;
use std::process::Output;

/// Abstraction for command execution, enabling mocking in tests
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command, failing on a non-zero exit status
    async fn run(&self, program: &str, args: &[String], opts: &CommandOptions) -> Result<Output>;

    /// Run a command and return stdout as string
    async fn run_stdout(&self, program: &str, args: &[String], opts: &CommandOptions) -> Result<String> {
        let output = self.run(program, args, opts).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Default implementation using real subprocess calls
#[derive(Debug, Clone, Default)]
pub struct RealExecutor;

impl RealExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for RealExecutor {
    async fn run(&self, program: &str, args: &[String], opts: &CommandOptions) -> Result<Output> {
        super::command::run_command(program, args, opts).await
    }
}

/// A mock executor for testing that records calls and returns configured responses
/// Available for use in external test crates
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Recorded command invocation
    #[derive(Clone, Debug)]
    pub struct CommandCall {
        pub program: String,
        pub args: Vec<String>,
        pub envs: Vec<(String, String)>,
        pub stdin: Option<Vec<u8>>,
    }

    impl CommandCall {
        /// Arguments joined by single spaces
        pub fn command_line(&self) -> String {
            self.args.join(" ")
        }

        pub fn env(&self, key: &str) -> Option<&str> {
            self.envs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        }
    }

    /// Response configuration for mock
    #[derive(Clone, Debug)]
    pub enum MockResponse {
        Success { stdout: String, stderr: String },
        Failure { stderr: String, exit_code: i32 },
        Timeout,
    }

    impl MockResponse {
        pub fn stdout(stdout: impl Into<String>) -> Self {
            MockResponse::Success {
                stdout: stdout.into(),
                stderr: String::new(),
            }
        }

        pub fn failure(stderr: impl Into<String>) -> Self {
            MockResponse::Failure {
                stderr: stderr.into(),
                exit_code: 1,
            }
        }
    }

    impl Default for MockResponse {
        fn default() -> Self {
            MockResponse::Success {
                stdout: String::new(),
                stderr: String::new(),
            }
        }
    }

    #[derive(Clone, Debug)]
    struct Expectation {
        program: String,
        /// Substring the joined arguments must contain
        args_contain: Option<String>,
        response: MockResponse,
    }

    /// Mock executor for testing
    #[derive(Clone, Default)]
    pub struct MockExecutor {
        /// Recorded command invocations
        pub calls: Arc<Mutex<Vec<CommandCall>>>,
        /// Configured responses, the most recently added match wins
        expectations: Arc<Mutex<Vec<Expectation>>>,
        /// Default response when no specific response is configured
        default_response: Arc<Mutex<MockResponse>>,
    }

    impl MockExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Configure a response for a specific program
        pub fn expect(self, program: &str, response: MockResponse) -> Self {
            self.expectations.lock().unwrap().push(Expectation {
                program: program.to_string(),
                args_contain: None,
                response,
            });
            self
        }

        /// Configure a response for a program whose arguments contain `needle`
        pub fn expect_args(self, program: &str, needle: &str, response: MockResponse) -> Self {
            self.expectations.lock().unwrap().push(Expectation {
                program: program.to_string(),
                args_contain: Some(needle.to_string()),
                response,
            });
            self
        }

        /// Set the default response for unconfigured programs
        pub fn with_default_response(self, response: MockResponse) -> Self {
            *self.default_response.lock().unwrap() = response;
            self
        }

        /// Get all recorded calls
        pub fn get_calls(&self) -> Vec<CommandCall> {
            self.calls.lock().unwrap().clone()
        }

        /// Calls to a specific program
        pub fn calls_to(&self, program: &str) -> Vec<CommandCall> {
            self.get_calls()
                .into_iter()
                .filter(|c| c.program == program)
                .collect()
        }

        /// Check if a program was called
        pub fn was_called(&self, program: &str) -> bool {
            self.call_count(program) > 0
        }

        /// Get number of calls to a specific program
        pub fn call_count(&self, program: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.program == program)
                .count()
        }

        fn record_call(&self, program: &str, args: &[String], opts: &CommandOptions) {
            self.calls.lock().unwrap().push(CommandCall {
                program: program.to_string(),
                args: args.to_vec(),
                envs: opts.envs.clone(),
                stdin: opts.stdin.clone(),
            });
        }

        fn get_response(&self, program: &str, args: &[String]) -> MockResponse {
            let joined = args.join(" ");
            self.expectations
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|e| {
                    e.program == program
                        && e.args_contain.as_ref().map_or(true, |n| joined.contains(n.as_str()))
                })
                .map(|e| e.response.clone())
                .unwrap_or_else(|| self.default_response.lock().unwrap().clone())
        }

        fn execute_response(&self, program: &str, response: MockResponse) -> Result<Output> {
            match response {
                MockResponse::Success { stdout, stderr } => Ok(Output {
                    status: std::process::ExitStatus::default(),
                    stdout: stdout.into_bytes(),
                    stderr: stderr.into_bytes(),
                }),
                MockResponse::Failure { stderr, exit_code } => {
                    anyhow::bail!("{} failed with exit code {:?}: {}", program, exit_code, stderr)
                }
                MockResponse::Timeout => {
                    anyhow::bail!("{} timed out", program)
                }
            }
        }
    }

    #[async_trait]
    impl CommandExecutor for MockExecutor {
        async fn run(&self, program: &str, args: &[String], opts: &CommandOptions) -> Result<Output> {
            self.record_call(program, args, opts);
            let response = self.get_response(program, args);
            self.execute_response(program, response)
        }
    }
}
