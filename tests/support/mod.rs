//! Hand-rolled fake for the `tests/` boundary.
//!
//! `ProcessRunner`'s `mockall::automock` output is only generated while the
//! library itself is compiled under `cfg(test)`, so it isn't visible to
//! these integration tests (each file here is its own crate linked against
//! the already-built `kopi_docka` rlib). `ScriptedRunner` plays the same
//! role by hand: a list of predicate/response pairs checked in order, with
//! every invocation recorded for later assertions.

use std::sync::Mutex;

use async_trait::async_trait;
use kopi_docka::process_runner::{CommandOutput, CommandSpec, ProcessRunner};

type Matcher = Box<dyn Fn(&CommandSpec) -> bool + Send + Sync>;
type Response = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

pub fn ok(stdout: impl Into<Vec<u8>>) -> CommandOutput {
    CommandOutput { status: 0, stdout: stdout.into(), stderr: Vec::new() }
}

pub fn failed(stderr: impl Into<Vec<u8>>) -> CommandOutput {
    CommandOutput { status: 1, stdout: Vec::new(), stderr: stderr.into() }
}

pub struct ScriptedRunner {
    responders: Vec<(Matcher, Response)>,
    default: CommandOutput,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        ScriptedRunner { responders: Vec::new(), default: ok(Vec::new()), calls: Mutex::new(Vec::new()) }
    }

    /// Register a response for the first call whose spec matches `matcher`.
    /// Responders are checked in registration order; the first match wins.
    pub fn on(
        mut self,
        matcher: impl Fn(&CommandSpec) -> bool + Send + Sync + 'static,
        respond: impl Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
    ) -> Self {
        self.responders.push((Box::new(matcher), Box::new(respond)));
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, matcher: impl Fn(&CommandSpec) -> bool) -> Vec<CommandSpec> {
        self.calls().into_iter().filter(matcher).collect()
    }
}

/// Matches a `docker`/`kopia`/`tar` invocation by program name and a
/// substring that must appear somewhere in its argv, the level of
/// precision these scenarios actually need (exact positional matching
/// would be brittle against incidental arg-ordering changes).
pub fn argv_contains(spec: &CommandSpec, program: &str, needle: &str) -> bool {
    spec.program == program && spec.args.iter().any(|a| a.contains(needle))
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, spec: CommandSpec) -> std::io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        for (matcher, respond) in &self.responders {
            if matcher(&spec) {
                return Ok(respond(&spec));
            }
        }
        Ok(self.default.clone())
    }

    async fn which(&self, _program: &str) -> bool {
        true
    }
}
