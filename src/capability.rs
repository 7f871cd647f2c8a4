//! External function capabilities: units of work completed out-of-band.
//!
//! A capability carries per-call state only — no live handles, no references
//! back into the runner — so the whole thing serializes as plain data inside
//! the job checkpoint. Dispatch to a variant goes through the serde tag, a
//! fixed discriminator, never a runtime type-name comparison.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RunnerError;
use crate::value::ScriptValue;

/// Named parameters on the dispatch wire and at call sites
pub type ParamMap = HashMap<String, ScriptValue>;

/// The contract every capability variant implements.
pub trait ExternalFunction {
    /// Completion predicate.
    fn done(&self) -> bool;

    /// Current human-readable status.
    fn message(&self) -> String;

    /// Result exposed back to script variables once done.
    fn value(&self) -> ScriptValue;

    /// Validate and initialize from call-site arguments.
    fn setup(&mut self, params: &ParamMap) -> Result<(), RunnerError>;

    /// Wire descriptor sent to the remote executor, or `None` for
    /// capabilities that complete locally and are never dispatched.
    fn to_dispatch(&self) -> Option<(String, ParamMap)>;

    /// Absorb the executor's reported result.
    fn absorb_result(&mut self, data: &ParamMap) -> Result<(), RunnerError>;

    /// Called once per scheduler visit while the runner waits on this
    /// capability. Local capabilities make progress here.
    fn poll(&mut self) {}

    /// Compensating action for rollback. Default: cannot be undone.
    fn rollback(&mut self) -> Result<(), String> {
        Err(format!("{} cannot be undone", self.message()))
    }

    /// Deliver an out-of-band completion signal. `None` means this
    /// capability is not a signal receiver.
    fn signal(&mut self, _cookie: &str) -> Option<String> {
        None
    }
}

fn require_str(params: &ParamMap, key: &str) -> Result<String, RunnerError> {
    match params.get(key) {
        Some(ScriptValue::Str(s)) if !s.is_empty() => Ok(s.clone()),
        Some(other) => Err(RunnerError::Parameter(format!(
            "'{}' must be a non-empty string, got {}",
            key, other
        ))),
        None => Err(RunnerError::Parameter(format!("'{}' is required", key))),
    }
}

/// Remote command execution on the part's host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshExec {
    pub host: String,
    pub cmd: String,
    pub rc: Option<i64>,
}

impl ExternalFunction for SshExec {
    fn done(&self) -> bool {
        self.rc.is_some()
    }

    fn message(&self) -> String {
        match self.rc {
            Some(rc) => format!("execution returned \"{}\"", rc),
            None => "waiting for execution results".to_string(),
        }
    }

    fn value(&self) -> ScriptValue {
        match self.rc {
            Some(rc) => ScriptValue::Int(rc),
            None => ScriptValue::Null,
        }
    }

    fn setup(&mut self, params: &ParamMap) -> Result<(), RunnerError> {
        self.host = require_str(params, "host")?;
        self.cmd = require_str(params, "cmd")?;
        self.rc = None;
        Ok(())
    }

    fn to_dispatch(&self) -> Option<(String, ParamMap)> {
        let mut params = ParamMap::new();
        params.insert("host".to_string(), ScriptValue::Str(self.host.clone()));
        params.insert("cmd".to_string(), ScriptValue::Str(self.cmd.clone()));
        Some(("ssh.exec".to_string(), params))
    }

    fn absorb_result(&mut self, data: &ParamMap) -> Result<(), RunnerError> {
        match data.get("rc").and_then(ScriptValue::as_i64) {
            Some(rc) => {
                self.rc = Some(rc);
                Ok(())
            }
            None => Err(RunnerError::Execution(
                "executor result is missing an integer 'rc'".to_string(),
            )),
        }
    }
}

/// Scheduler-local countdown: completes after `ticks` scheduler visits
/// without ever being dispatched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delay {
    pub remaining: i64,
}

impl ExternalFunction for Delay {
    fn done(&self) -> bool {
        self.remaining <= 0
    }

    fn message(&self) -> String {
        if self.done() {
            "delay elapsed".to_string()
        } else {
            format!("waiting {} more ticks", self.remaining)
        }
    }

    fn value(&self) -> ScriptValue {
        ScriptValue::Bool(self.done())
    }

    fn setup(&mut self, params: &ParamMap) -> Result<(), RunnerError> {
        let ticks = params
            .get("ticks")
            .and_then(ScriptValue::as_i64)
            .ok_or_else(|| RunnerError::Parameter("'ticks' must be an integer".to_string()))?;
        if ticks < 0 {
            return Err(RunnerError::Parameter(
                "'ticks' may not be negative".to_string(),
            ));
        }
        self.remaining = ticks;
        Ok(())
    }

    fn to_dispatch(&self) -> Option<(String, ParamMap)> {
        None
    }

    fn absorb_result(&mut self, _data: &ParamMap) -> Result<(), RunnerError> {
        Err(RunnerError::Execution(
            "delay does not accept executor results".to_string(),
        ))
    }

    fn poll(&mut self) {
        if self.remaining > 0 {
            self.remaining -= 1;
        }
    }

    fn rollback(&mut self) -> Result<(), String> {
        // Nothing happened remotely; a delay rolls back for free.
        Ok(())
    }
}

/// Blocks until `signalComplete` delivers the expected cookie.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalWait {
    pub expected: String,
    pub received: bool,
}

impl ExternalFunction for SignalWait {
    fn done(&self) -> bool {
        self.received
    }

    fn message(&self) -> String {
        if self.received {
            "signal received".to_string()
        } else {
            "waiting for signal".to_string()
        }
    }

    fn value(&self) -> ScriptValue {
        ScriptValue::Bool(self.received)
    }

    fn setup(&mut self, params: &ParamMap) -> Result<(), RunnerError> {
        self.expected = require_str(params, "cookie")?;
        self.received = false;
        Ok(())
    }

    fn to_dispatch(&self) -> Option<(String, ParamMap)> {
        None
    }

    fn absorb_result(&mut self, _data: &ParamMap) -> Result<(), RunnerError> {
        Err(RunnerError::Execution(
            "signal.wait completes via signalComplete, not executor results".to_string(),
        ))
    }

    fn signal(&mut self, cookie: &str) -> Option<String> {
        if cookie == self.expected {
            self.received = true;
            Some("Accepted".to_string())
        } else {
            Some("Bad Cookie".to_string())
        }
    }
}

/// The fixed set of capability variants, serialized with an explicit
/// discriminator so checkpoints restore by tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Capability {
    SshExec(SshExec),
    Delay(Delay),
    SignalWait(SignalWait),
}

impl Capability {
    /// Instantiate and set up a capability for a `module.function` call site.
    pub fn create(
        module: &str,
        function: &str,
        params: &ParamMap,
    ) -> Result<Capability, RunnerError> {
        let mut capability = match (module, function) {
            ("ssh", "exec") => Capability::SshExec(SshExec::default()),
            ("delay", "wait") => Capability::Delay(Delay::default()),
            ("signal", "wait") => Capability::SignalWait(SignalWait::default()),
            _ => {
                return Err(RunnerError::NotDefined(format!(
                    "no external function '{}.{}'",
                    module, function
                )));
            }
        };
        capability.setup(params)?;
        debug!(module, function, "capability created");
        Ok(capability)
    }

    /// The module providing this capability, as scripts name it.
    pub fn module(&self) -> &'static str {
        match self {
            Capability::SshExec(_) => "ssh",
            Capability::Delay(_) => "delay",
            Capability::SignalWait(_) => "signal",
        }
    }

    fn inner(&self) -> &dyn ExternalFunction {
        match self {
            Capability::SshExec(c) => c,
            Capability::Delay(c) => c,
            Capability::SignalWait(c) => c,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ExternalFunction {
        match self {
            Capability::SshExec(c) => c,
            Capability::Delay(c) => c,
            Capability::SignalWait(c) => c,
        }
    }
}

impl ExternalFunction for Capability {
    fn done(&self) -> bool {
        self.inner().done()
    }

    fn message(&self) -> String {
        self.inner().message()
    }

    fn value(&self) -> ScriptValue {
        self.inner().value()
    }

    fn setup(&mut self, params: &ParamMap) -> Result<(), RunnerError> {
        self.inner_mut().setup(params)
    }

    fn to_dispatch(&self) -> Option<(String, ParamMap)> {
        self.inner().to_dispatch()
    }

    fn absorb_result(&mut self, data: &ParamMap) -> Result<(), RunnerError> {
        self.inner_mut().absorb_result(data)
    }

    fn poll(&mut self) {
        self.inner_mut().poll()
    }

    fn rollback(&mut self) -> Result<(), String> {
        self.inner_mut().rollback()
    }

    fn signal(&mut self, cookie: &str) -> Option<String> {
        self.inner_mut().signal(cookie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, ScriptValue)]) -> ParamMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn ssh_exec_lifecycle() {
        let mut cap = Capability::create(
            "ssh",
            "exec",
            &params(&[
                ("host", ScriptValue::Str("mill-04".into())),
                ("cmd", ScriptValue::Str("make unit".into())),
            ]),
        )
        .unwrap();

        assert!(!cap.done());
        let (name, wire) = cap.to_dispatch().unwrap();
        assert_eq!(name, "ssh.exec");
        assert_eq!(wire.get("host"), Some(&ScriptValue::Str("mill-04".into())));

        cap.absorb_result(&params(&[("rc", ScriptValue::Int(0))]))
            .unwrap();
        assert!(cap.done());
        assert_eq!(cap.value(), ScriptValue::Int(0));
    }

    #[test]
    fn ssh_exec_requires_host() {
        let err = Capability::create(
            "ssh",
            "exec",
            &params(&[("cmd", ScriptValue::Str("true".into()))]),
        )
        .unwrap_err();
        assert!(matches!(err, RunnerError::Parameter(_)));
    }

    #[test]
    fn ssh_result_without_rc_is_execution_fault() {
        let mut cap = SshExec {
            host: "a".into(),
            cmd: "b".into(),
            rc: None,
        };
        let err = cap
            .absorb_result(&params(&[("status", ScriptValue::Str("ok".into()))]))
            .unwrap_err();
        assert!(matches!(err, RunnerError::Execution(_)));
    }

    #[test]
    fn delay_counts_down_locally() {
        let mut cap =
            Capability::create("delay", "wait", &params(&[("ticks", ScriptValue::Int(2))]))
                .unwrap();
        assert!(cap.to_dispatch().is_none());
        assert!(!cap.done());
        cap.poll();
        cap.poll();
        assert!(cap.done());
    }

    #[test]
    fn signal_wait_matches_cookie() {
        let mut cap = Capability::create(
            "signal",
            "wait",
            &params(&[("cookie", ScriptValue::Str("c-1".into()))]),
        )
        .unwrap();
        assert_eq!(cap.signal("wrong"), Some("Bad Cookie".to_string()));
        assert!(!cap.done());
        assert_eq!(cap.signal("c-1"), Some("Accepted".to_string()));
        assert!(cap.done());
    }

    #[test]
    fn unknown_function_is_not_defined() {
        let err = Capability::create("lathe", "spin", &ParamMap::new()).unwrap_err();
        assert!(matches!(err, RunnerError::NotDefined(_)));
    }

    #[test]
    fn checkpoint_tag_round_trip() {
        let cap = Capability::SshExec(SshExec {
            host: "mill-04".into(),
            cmd: "true".into(),
            rc: Some(0),
        });
        let json = serde_json::to_string(&cap).unwrap();
        assert!(json.contains("\"kind\":\"SshExec\""));
        let back: Capability = serde_json::from_str(&json).unwrap();
        assert!(back.done());
    }
}
