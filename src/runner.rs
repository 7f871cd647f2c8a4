//! Resumable script runner.
//!
//! A [`Runner`] interprets a compiled [`Program`] one suspension at a time.
//! The whole machine — program, position, variables, in-flight capability,
//! dispatch cookie, invocation history — is plain serializable data, so a
//! checkpoint is a single JSON blob and restore is plain deserialization.
//! Results arrive out-of-band through [`Runner::receive_result`], gated by a
//! single-use cookie.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::capability::{Capability, ExternalFunction, ParamMap};
use crate::error::{clip_message, RunnerError};
use crate::script::ast::{BinaryOp, Builtin, Expression, Instruction, Literal, UnaryOp};
use crate::script::Program;
use crate::value::ScriptValue;

/// Checkpoint format version. Restore rejects anything else.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Instructions one `run` call may execute before it is treated as a
/// runaway loop.
const STEP_BUDGET: u32 = 10_000;

/// A dispatchable unit of work for a remote executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stamped by the scheduler; the runner does not know its job id.
    pub job_id: i64,
    /// Single-use reconciliation cookie.
    pub cookie: String,
    /// Wire name of the external function, e.g. `ssh.exec`.
    pub function: String,
    pub params: ParamMap,
}

/// Outcome of delivering an executor result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Cookie matched and the data was absorbed.
    Accepted,
    /// Stale cookie or malformed data; the runner was not mutated.
    Rejected,
}

/// Introspection snapshot for operators.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub state: String,
    pub position: usize,
    pub waiting_on: Option<String>,
    pub dispatched: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActiveInvocation {
    capability: Capability,
    /// Variable receiving the capability value once done
    target: Option<String>,
    /// Outstanding dispatch cookie, if a task has been handed out
    cookie: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    program: Program,
    pc: usize,
    variables: HashMap<String, ScriptValue>,
    /// Read-only bindings exposed as `module.name`, e.g. `part.hostname`
    module_values: HashMap<String, HashMap<String, ScriptValue>>,
    active: Option<ActiveInvocation>,
    /// Completed invocations, oldest first, for rollback
    history: Vec<Capability>,
    done: bool,
    aborted: bool,
}

#[derive(Serialize, Deserialize)]
struct CheckpointEnvelope {
    version: u32,
    runner: Runner,
}

impl Runner {
    pub fn new(
        program: Program,
        module_values: HashMap<String, HashMap<String, ScriptValue>>,
    ) -> Self {
        Self {
            program,
            pc: 0,
            variables: HashMap::new(),
            module_values,
            active: None,
            history: Vec::new(),
            done: false,
            aborted: false,
        }
    }

    /// Serialize the full machine state as a versioned JSON blob.
    pub fn checkpoint(&self) -> Result<String, RunnerError> {
        let envelope = CheckpointEnvelope {
            version: CHECKPOINT_VERSION,
            runner: self.clone(),
        };
        serde_json::to_string(&envelope)
            .map_err(|e| RunnerError::internal("Checkpoint", e.to_string()))
    }

    /// Restore a runner from a checkpoint, rejecting version mismatches.
    pub fn restore(blob: &str) -> Result<Self, RunnerError> {
        let envelope: CheckpointEnvelope = serde_json::from_str(blob)
            .map_err(|e| RunnerError::internal("Checkpoint", e.to_string()))?;
        if envelope.version != CHECKPOINT_VERSION {
            return Err(RunnerError::internal(
                "Checkpoint",
                format!(
                    "unsupported checkpoint version {} (expected {})",
                    envelope.version, CHECKPOINT_VERSION
                ),
            ));
        }
        Ok(envelope.runner)
    }

    /// Advance until the next suspension point.
    ///
    /// `Ok(None)` means nothing new happened (still waiting, or already
    /// finished) and the caller must not overwrite the job's message.
    pub fn run(&mut self) -> Result<Option<String>, RunnerError> {
        if self.done || self.aborted {
            return Ok(None);
        }

        // Locally progressing capabilities move once per visit.
        if let Some(active) = &mut self.active {
            if !active.capability.done() {
                active.capability.poll();
            }
        }

        let mut steps: u32 = 0;
        loop {
            match self.active.take() {
                Some(active) if active.capability.done() => {
                    if let Some(target) = active.target.clone() {
                        self.variables.insert(target, active.capability.value());
                    }
                    self.history.push(active.capability);
                    self.pc += 1;
                }
                Some(active) => {
                    self.active = Some(active);
                    return Ok(None);
                }
                None => {}
            }

            steps += 1;
            if steps > STEP_BUDGET {
                return Err(RunnerError::Execution(format!(
                    "no suspension point after {} instructions",
                    STEP_BUDGET
                )));
            }

            let instruction = match self.program.get(self.pc) {
                Some(instruction) => instruction.clone(),
                None => {
                    // Completion carries no message of its own; the state
                    // change is the signal and the last message stands.
                    self.done = true;
                    debug!(position = self.pc, "script complete");
                    return Ok(None);
                }
            };

            match instruction {
                Instruction::Assign { target, expr } => {
                    let value = self.eval(&expr)?;
                    self.variables.insert(target, value);
                    self.pc += 1;
                }
                Instruction::Jump { dest } => {
                    self.pc = dest;
                }
                Instruction::JumpIfFalse { cond, dest } => {
                    if self.eval(&cond)?.is_truthy() {
                        self.pc += 1;
                    } else {
                        self.pc = dest;
                    }
                }
                Instruction::Builtin { builtin, msg } => {
                    let msg = clip_message(&self.eval(&msg)?.to_string());
                    match builtin {
                        Builtin::Pause => {
                            self.pc += 1;
                            return Err(RunnerError::Pause(msg));
                        }
                        Builtin::Fail => {
                            // Stay on the failed step so an operator reset
                            // re-evaluates it instead of sliding past it.
                            return Err(RunnerError::Execution(msg));
                        }
                        Builtin::Abort => {
                            self.aborted = true;
                            return Err(RunnerError::Unrecoverable(msg));
                        }
                        Builtin::Message => {
                            self.pc += 1;
                            return Ok(Some(msg));
                        }
                    }
                }
                Instruction::Invoke {
                    target,
                    module,
                    function,
                    args,
                } => {
                    let mut params = ParamMap::new();
                    for (key, expr) in &args {
                        params.insert(key.clone(), self.eval(expr)?);
                    }
                    let capability = Capability::create(&module, &function, &params)?;
                    let message = capability.message();
                    let immediate = capability.done();
                    self.active = Some(ActiveInvocation {
                        capability,
                        target,
                        cookie: None,
                    });
                    if immediate {
                        continue;
                    }
                    return Ok(Some(clip_message(&message)));
                }
            }
        }
    }

    /// Hand out the in-flight step as a task if its module is requested and
    /// no cookie is outstanding. The cookie is minted fresh and single-use.
    pub fn dispatchable(&mut self, module_list: &[String]) -> Option<Task> {
        let active = self.active.as_mut()?;
        if active.capability.done() || active.cookie.is_some() {
            return None;
        }
        if !module_list.iter().any(|m| m == active.capability.module()) {
            return None;
        }
        let (function, params) = active.capability.to_dispatch()?;
        let cookie = Uuid::new_v4().to_string();
        active.cookie = Some(cookie.clone());
        debug!(%function, "task dispatched");
        Some(Task {
            job_id: 0,
            cookie,
            function,
            params,
        })
    }

    /// Deliver an executor result. A stale cookie or malformed payload is
    /// rejected without mutating anything.
    pub fn receive_result(
        &mut self,
        cookie: &str,
        data: &ParamMap,
    ) -> (ReceiveOutcome, Option<String>) {
        let Some(active) = self.active.as_mut() else {
            return (ReceiveOutcome::Rejected, None);
        };
        if active.cookie.as_deref() != Some(cookie) {
            return (ReceiveOutcome::Rejected, None);
        }
        match active.capability.absorb_result(data) {
            Ok(()) => {
                active.cookie = None;
                let message = active.capability.message();
                debug!("result accepted");
                (ReceiveOutcome::Accepted, Some(clip_message(&message)))
            }
            Err(err) => (ReceiveOutcome::Rejected, Some(err.to_string())),
        }
    }

    /// True when `cookie` names the outstanding dispatch.
    pub fn cookie_matches(&self, cookie: &str) -> bool {
        self.active
            .as_ref()
            .and_then(|a| a.cookie.as_deref())
            .is_some_and(|c| c == cookie)
    }

    /// Invalidate the outstanding cookie so the step can be re-dispatched.
    pub fn clear_dispatched(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.cookie = None;
        }
    }

    /// Deliver an out-of-band signal to the in-flight capability.
    pub fn signal(&mut self, cookie: &str) -> Option<String> {
        self.active.as_mut()?.capability.signal(cookie)
    }

    /// Undo completed invocations newest-first. The first non-undoable step
    /// stops the walk; the caller must not persist the checkpoint then.
    /// A full walk resets the runner to the start of the script.
    pub fn rollback(&mut self) -> Result<(), String> {
        while let Some(mut capability) = self.history.pop() {
            if let Err(reason) = capability.rollback() {
                self.history.push(capability);
                return Err(reason);
            }
        }
        self.active = None;
        self.pc = 0;
        self.done = false;
        self.aborted = false;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn state_name(&self) -> String {
        if self.aborted {
            "aborted".to_string()
        } else if self.done {
            "done".to_string()
        } else if let Some(active) = &self.active {
            format!("waiting on {}", active.capability.module())
        } else {
            "running".to_string()
        }
    }

    pub fn variables(&self) -> &HashMap<String, ScriptValue> {
        &self.variables
    }

    pub fn status(&self) -> RunnerStatus {
        RunnerStatus {
            state: self.state_name(),
            position: self.pc,
            waiting_on: self.active.as_ref().map(|a| a.capability.message()),
            dispatched: self
                .active
                .as_ref()
                .is_some_and(|a| a.cookie.is_some()),
        }
    }

    fn eval(&self, expr: &Expression) -> Result<ScriptValue, RunnerError> {
        match expr {
            Expression::Literal(literal) => Ok(match literal {
                Literal::Null => ScriptValue::Null,
                Literal::Bool(b) => ScriptValue::Bool(*b),
                Literal::Int(i) => ScriptValue::Int(*i),
                Literal::Float(f) => ScriptValue::Float(*f),
                Literal::Str(s) => ScriptValue::Str(s.clone()),
            }),
            Expression::Variable(name) => self
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| RunnerError::NotDefined(format!("variable '{}'", name))),
            Expression::ModuleValue { module, name } => self
                .module_values
                .get(module)
                .and_then(|values| values.get(name))
                .cloned()
                .ok_or_else(|| RunnerError::NotDefined(format!("value '{}.{}'", module, name))),
            Expression::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(ScriptValue::List(values))
            }
            Expression::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(ScriptValue::Bool(!value.is_truthy())),
                    UnaryOp::Neg => match value {
                        ScriptValue::Int(i) => i
                            .checked_neg()
                            .map(ScriptValue::Int)
                            .ok_or_else(|| {
                                RunnerError::Execution("integer overflow".to_string())
                            }),
                        ScriptValue::Float(f) => Ok(ScriptValue::Float(-f)),
                        other => Err(RunnerError::Execution(format!(
                            "cannot negate {}",
                            other
                        ))),
                    },
                }
            }
            Expression::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let left = self.eval(left)?;
                    if !left.is_truthy() {
                        return Ok(ScriptValue::Bool(false));
                    }
                    Ok(ScriptValue::Bool(self.eval(right)?.is_truthy()))
                }
                BinaryOp::Or => {
                    let left = self.eval(left)?;
                    if left.is_truthy() {
                        return Ok(ScriptValue::Bool(true));
                    }
                    Ok(ScriptValue::Bool(self.eval(right)?.is_truthy()))
                }
                _ => {
                    let left = self.eval(left)?;
                    let right = self.eval(right)?;
                    apply_binary(*op, left, right)
                }
            },
        }
    }
}

fn apply_binary(
    op: BinaryOp,
    left: ScriptValue,
    right: ScriptValue,
) -> Result<ScriptValue, RunnerError> {
    use ScriptValue::{Float, Int, List, Str};

    match op {
        BinaryOp::Eq => return Ok(ScriptValue::Bool(left == right)),
        BinaryOp::Ne => return Ok(ScriptValue::Bool(left != right)),
        _ => {}
    }

    if let (BinaryOp::Add, Str(a), Str(b)) = (op, &left, &right) {
        return Ok(Str(format!("{}{}", a, b)));
    }
    if let (BinaryOp::Add, List(a), List(b)) = (op, &left, &right) {
        let mut items = a.clone();
        items.extend(b.iter().cloned());
        return Ok(List(items));
    }

    if let (Str(a), Str(b)) = (&left, &right) {
        let result = match op {
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            BinaryOp::Ge => a >= b,
            _ => {
                return Err(RunnerError::Execution(format!(
                    "cannot apply {:?} to strings",
                    op
                )))
            }
        };
        return Ok(ScriptValue::Bool(result));
    }

    if let (Int(a), Int(b)) = (&left, &right) {
        let (a, b) = (*a, *b);
        let overflow = || RunnerError::Execution("integer overflow".to_string());
        return match op {
            BinaryOp::Add => a.checked_add(b).map(Int).ok_or_else(overflow),
            BinaryOp::Sub => a.checked_sub(b).map(Int).ok_or_else(overflow),
            BinaryOp::Mul => a.checked_mul(b).map(Int).ok_or_else(overflow),
            BinaryOp::Div if b == 0 => {
                Err(RunnerError::Execution("division by zero".to_string()))
            }
            BinaryOp::Div => a.checked_div(b).map(Int).ok_or_else(overflow),
            BinaryOp::Mod if b == 0 => {
                Err(RunnerError::Execution("modulo by zero".to_string()))
            }
            BinaryOp::Mod => a.checked_rem(b).map(Int).ok_or_else(overflow),
            BinaryOp::Lt => Ok(ScriptValue::Bool(a < b)),
            BinaryOp::Le => Ok(ScriptValue::Bool(a <= b)),
            BinaryOp::Gt => Ok(ScriptValue::Bool(a > b)),
            BinaryOp::Ge => Ok(ScriptValue::Bool(a >= b)),
            _ => unreachable!("and/or/eq handled above"),
        };
    }

    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return match op {
            BinaryOp::Add => Ok(Float(a + b)),
            BinaryOp::Sub => Ok(Float(a - b)),
            BinaryOp::Mul => Ok(Float(a * b)),
            BinaryOp::Div if b == 0.0 => {
                Err(RunnerError::Execution("division by zero".to_string()))
            }
            BinaryOp::Div => Ok(Float(a / b)),
            BinaryOp::Mod if b == 0.0 => {
                Err(RunnerError::Execution("modulo by zero".to_string()))
            }
            BinaryOp::Mod => Ok(Float(a % b)),
            BinaryOp::Lt => Ok(ScriptValue::Bool(a < b)),
            BinaryOp::Le => Ok(ScriptValue::Bool(a <= b)),
            BinaryOp::Gt => Ok(ScriptValue::Bool(a > b)),
            BinaryOp::Ge => Ok(ScriptValue::Bool(a >= b)),
            _ => unreachable!("and/or/eq handled above"),
        };
    }

    Err(RunnerError::Execution(format!(
        "cannot apply {:?} to {} and {}",
        op, left, right
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::compile;

    fn runner_for(source: &str) -> Runner {
        Runner::new(compile(source).unwrap(), HashMap::new())
    }

    fn ssh_modules() -> Vec<String> {
        vec!["ssh".to_string()]
    }

    fn rc_result(rc: i64) -> ParamMap {
        let mut data = ParamMap::new();
        data.insert("rc".to_string(), ScriptValue::Int(rc));
        data
    }

    #[test]
    fn pure_script_runs_to_completion() {
        let mut runner = runner_for("x = 1\ny = x + 2");
        // Completion carries no message; the state change is the signal.
        assert_eq!(runner.run().unwrap(), None);
        assert!(runner.is_done());
        assert_eq!(runner.variables().get("y"), Some(&ScriptValue::Int(3)));
        // A finished runner stays quiet.
        assert_eq!(runner.run().unwrap(), None);
    }

    #[test]
    fn pause_suspends_and_resumes_after() {
        let mut runner = runner_for("pause( msg=\"check fixture\" )\nx = 1");
        match runner.run() {
            Err(RunnerError::Pause(msg)) => assert_eq!(msg, "check fixture"),
            other => panic!("expected pause, got {:?}", other),
        }
        runner.run().unwrap();
        assert!(runner.is_done());
        assert_eq!(runner.variables().get("x"), Some(&ScriptValue::Int(1)));
    }

    #[test]
    fn abort_is_terminal() {
        let mut runner = runner_for("abort( msg=\"scrapped\" )");
        assert!(matches!(
            runner.run(),
            Err(RunnerError::Unrecoverable(_))
        ));
        assert!(runner.is_aborted());
        assert_eq!(runner.run().unwrap(), None);
    }

    #[test]
    fn dispatch_and_receive_cycle() {
        let mut runner = runner_for(
            "rc = ssh.exec( host=\"mill-04\", cmd=\"burn-in\" )\nif rc == 0:\n    message( msg=\"passed\" )",
        );
        assert!(runner.run().unwrap().is_some());

        let task = runner.dispatchable(&ssh_modules()).unwrap();
        assert_eq!(task.function, "ssh.exec");
        // Cookie is outstanding, so nothing further dispatches.
        assert!(runner.dispatchable(&ssh_modules()).is_none());

        let (outcome, _) = runner.receive_result("not-the-cookie", &rc_result(0));
        assert_eq!(outcome, ReceiveOutcome::Rejected);
        assert!(runner.cookie_matches(&task.cookie));

        let (outcome, msg) = runner.receive_result(&task.cookie, &rc_result(0));
        assert_eq!(outcome, ReceiveOutcome::Accepted);
        assert!(msg.is_some());

        assert_eq!(runner.run().unwrap(), Some("passed".to_string()));
        assert_eq!(runner.run().unwrap(), None);
        assert!(runner.is_done());
        assert_eq!(
            runner.variables().get("rc"),
            Some(&ScriptValue::Int(0))
        );
    }

    #[test]
    fn dispatch_honors_module_list() {
        let mut runner = runner_for("rc = ssh.exec( host=\"a\", cmd=\"b\" )");
        runner.run().unwrap();
        assert!(runner.dispatchable(&["torque".to_string()]).is_none());
        assert!(runner.dispatchable(&ssh_modules()).is_some());
    }

    #[test]
    fn malformed_result_rejected_without_mutation() {
        let mut runner = runner_for("rc = ssh.exec( host=\"a\", cmd=\"b\" )");
        runner.run().unwrap();
        let task = runner.dispatchable(&ssh_modules()).unwrap();

        let mut bad = ParamMap::new();
        bad.insert("status".to_string(), ScriptValue::Str("ok".into()));
        let (outcome, _) = runner.receive_result(&task.cookie, &bad);
        assert_eq!(outcome, ReceiveOutcome::Rejected);

        // The cookie is still live and a good result still lands.
        let (outcome, _) = runner.receive_result(&task.cookie, &rc_result(1));
        assert_eq!(outcome, ReceiveOutcome::Accepted);
    }

    #[test]
    fn clear_dispatched_reissues_cookie() {
        let mut runner = runner_for("rc = ssh.exec( host=\"a\", cmd=\"b\" )");
        runner.run().unwrap();
        let first = runner.dispatchable(&ssh_modules()).unwrap();
        runner.clear_dispatched();
        assert!(!runner.cookie_matches(&first.cookie));

        let second = runner.dispatchable(&ssh_modules()).unwrap();
        assert_ne!(first.cookie, second.cookie);
        let (outcome, _) = runner.receive_result(&second.cookie, &rc_result(0));
        assert_eq!(outcome, ReceiveOutcome::Accepted);
    }

    #[test]
    fn checkpoint_survives_in_flight_dispatch() {
        let mut runner = runner_for("rc = ssh.exec( host=\"a\", cmd=\"b\" )");
        runner.run().unwrap();
        let task = runner.dispatchable(&ssh_modules()).unwrap();

        let blob = runner.checkpoint().unwrap();
        let mut restored = Runner::restore(&blob).unwrap();

        assert!(restored.cookie_matches(&task.cookie));
        let (outcome, _) = restored.receive_result(&task.cookie, &rc_result(0));
        assert_eq!(outcome, ReceiveOutcome::Accepted);
        restored.run().unwrap();
        assert!(restored.is_done());
    }

    #[test]
    fn restore_rejects_version_mismatch() {
        let runner = runner_for("x = 1");
        let blob = runner.checkpoint().unwrap();
        let tampered = blob.replace("\"version\":1", "\"version\":99");
        assert!(Runner::restore(&tampered).is_err());
    }

    #[test]
    fn integer_overflow_is_a_recoverable_fault() {
        let mut runner = runner_for("x = 9223372036854775807\ny = x + 1");
        match runner.run() {
            Err(err @ RunnerError::Execution(_)) => assert!(err.is_recoverable()),
            other => panic!("expected execution fault, got {:?}", other),
        }
    }

    #[test]
    fn fail_keeps_the_failed_step_current() {
        let mut runner = runner_for("fail( msg=\"bad solder\" )\nmessage( msg=\"ok\" )");
        match runner.run() {
            Err(RunnerError::Execution(msg)) => assert_eq!(msg, "bad solder"),
            other => panic!("expected execution fault, got {:?}", other),
        }
        // Running again re-raises the same failure; it is never skipped.
        assert!(matches!(runner.run(), Err(RunnerError::Execution(_))));
        assert!(!runner.is_done());
    }

    #[test]
    fn runaway_loop_hits_step_budget() {
        let mut runner = runner_for("while True:\n    x = 1");
        match runner.run() {
            Err(err @ RunnerError::Execution(_)) => assert!(err.is_recoverable()),
            other => panic!("expected execution fault, got {:?}", other),
        }
    }

    #[test]
    fn module_values_resolve() {
        let mut bindings = HashMap::new();
        bindings.insert(
            "hostname".to_string(),
            ScriptValue::Str("mill-04".to_string()),
        );
        let mut module_values = HashMap::new();
        module_values.insert("part".to_string(), bindings);

        let mut runner = Runner::new(compile("h = part.hostname").unwrap(), module_values);
        runner.run().unwrap();
        assert_eq!(
            runner.variables().get("h"),
            Some(&ScriptValue::Str("mill-04".to_string()))
        );
    }

    #[test]
    fn undefined_module_value_faults() {
        let mut runner = runner_for("h = part.hostname");
        assert!(matches!(runner.run(), Err(RunnerError::NotDefined(_))));
    }

    #[test]
    fn signal_wait_completes_via_signal() {
        let mut runner = runner_for("ok = signal.wait( cookie=\"gate-7\" )");
        runner.run().unwrap();
        assert!(runner.dispatchable(&ssh_modules()).is_none());

        assert_eq!(runner.signal("wrong"), Some("Bad Cookie".to_string()));
        assert_eq!(runner.signal("gate-7"), Some("Accepted".to_string()));
        runner.run().unwrap();
        assert!(runner.is_done());
        assert_eq!(
            runner.variables().get("ok"),
            Some(&ScriptValue::Bool(true))
        );
    }

    #[test]
    fn delay_completes_over_visits() {
        let mut runner = runner_for("d = delay.wait( ticks=2 )");
        assert!(runner.run().unwrap().is_some());
        assert_eq!(runner.run().unwrap(), None);
        // Third visit: countdown reaches zero and the script finishes.
        runner.run().unwrap();
        assert!(runner.is_done());
    }

    #[test]
    fn rollback_undoes_delay_but_not_ssh() {
        let mut runner = runner_for("d = delay.wait( ticks=0 )");
        runner.run().unwrap();
        assert!(runner.is_done());
        runner.rollback().unwrap();
        assert!(!runner.is_done());
        assert_eq!(runner.status().position, 0);

        let mut runner = runner_for("rc = ssh.exec( host=\"a\", cmd=\"b\" )");
        runner.run().unwrap();
        let task = runner.dispatchable(&ssh_modules()).unwrap();
        runner.receive_result(&task.cookie, &rc_result(0));
        runner.run().unwrap();
        assert!(runner.rollback().is_err());
    }

    #[test]
    fn builtin_message_is_clipped() {
        let long = "y".repeat(3000);
        let source = format!("message( msg=\"{}\" )", long);
        let mut runner = runner_for(&source);
        let msg = runner.run().unwrap().unwrap();
        assert_eq!(msg.chars().count(), crate::error::MAX_MESSAGE_LEN);
    }
}
