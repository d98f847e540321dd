use crate::authentication::{AuthError, Authentication};
use crate::config::{FuzzerSettings, default_max_navigation_steps};
use crate::flow::{Environment, Flow, FlowError, Output};
use crate::session::User;
use crate::source::{Extent, SourceError, ValueSource};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("Flow '{flow}' has no inputs to fuzz")]
    NoInputs { flow: String },
    #[error("Fuzzing point '{point}' not found in flow '{flow}'")]
    FuzzingPointNotFound { flow: String, point: String },
    #[error("Cannot reach stage '{target}': {reason}")]
    Navigation { target: String, reason: String },
    #[error("Value source failed: {0}")]
    Source(#[from] SourceError),
    #[error("Flow '{flow}' failed: {source}")]
    Flow {
        flow: String,
        #[source]
        source: FlowError,
    },
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("Value source never ends and nothing can cancel the run; share its cancel token first")]
    Unstoppable,
    #[error("A fuzzing worker panicked")]
    WorkerPanicked,
}

/// Shared flag to stop a running fuzzer between two iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether a clone of this token exists somewhere else.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.0) > 1
    }
}

/// Transforms every candidate right before it is used.
pub type Processor = Arc<dyn Fn(String) -> String + Send + Sync>;

/// What happened for one candidate value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzAttempt {
    pub value: String,
    pub status: u16,
    /// MD5 of the response body, hex encoded.
    pub body_hash: String,
    /// Whether no earlier attempt got the same body.
    pub new_response: bool,
    pub next_stage: Option<String>,
}

/// Outcome of a fuzzing run.
#[derive(Debug, Clone, Default)]
pub struct FuzzReport {
    attempts: Vec<FuzzAttempt>,
    seen: HashSet<String>,
    cancelled: bool,
}

impl FuzzReport {
    fn record(&mut self, mut attempt: FuzzAttempt) {
        attempt.new_response = self.seen.insert(attempt.body_hash.clone());
        if attempt.new_response {
            info!(
                "New response for '{}': HTTP {} ({})",
                attempt.value, attempt.status, attempt.body_hash
            );
        }
        self.attempts.push(attempt);
    }

    pub fn attempts(&self) -> &[FuzzAttempt] {
        &self.attempts
    }

    /// Number of different response bodies seen.
    pub fn distinct_responses(&self) -> usize {
        self.seen.len()
    }

    /// Whether the run was stopped through its [`CancelToken`].
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzMode {
    /// Replay a stand-alone function; the authentication process is not touched.
    Function,
    /// Replay an authentication stage, re-driving the process around it.
    Authentication,
}

/// Replays one flow with the value of one of its inputs replaced by each
/// candidate of a [`ValueSource`].
///
/// The fuzzer works on its own copy of the flow; the flow it was created
/// from is never modified.
pub struct Fuzz {
    flow: Flow,
    fuzzing_point: String,
    source: Box<dyn ValueSource>,
    processor: Option<Processor>,
    threads: usize,
    max_navigation_steps: usize,
    cancel: CancelToken,
}

impl fmt::Debug for Fuzz {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fuzz")
            .field("flow", &self.flow.name)
            .field("fuzzing_point", &self.fuzzing_point)
            .field("extent", &self.source.extent())
            .field("threads", &self.threads)
            .field("max_navigation_steps", &self.max_navigation_steps)
            .finish_non_exhaustive()
    }
}

impl Fuzz {
    pub fn new(flow: &Flow, fuzzing_point: impl Into<String>, source: Box<dyn ValueSource>) -> Self {
        Self {
            flow: flow.clone(),
            fuzzing_point: fuzzing_point.into(),
            source,
            processor: None,
            threads: 1,
            max_navigation_steps: default_max_navigation_steps(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: &FuzzerSettings) -> Self {
        self.threads = settings.threads.max(1);
        self.max_navigation_steps = settings.max_navigation_steps;
        self
    }

    pub fn with_processor(mut self, processor: impl Fn(String) -> String + Send + Sync + 'static) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    /// Number of workers for [`Fuzz::attack_function`]. Authentication mode
    /// always runs sequentially.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_max_navigation_steps(mut self, steps: usize) -> Self {
        self.max_navigation_steps = steps;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// An unbounded source only ends through the cancel token, so someone
    /// other than the fuzzer has to hold it.
    fn check_stoppable(&self) -> Result<(), FuzzError> {
        if self.source.extent() == Extent::Unbounded && !self.cancel.is_shared() {
            return Err(FuzzError::Unstoppable);
        }
        Ok(())
    }

    /// Resolves the copied flow against the session, then pins the fuzzing
    /// point so it stops resolving by itself.
    ///
    /// # Returns
    /// The value the fuzzing point resolved to before pinning.
    fn prepare(&mut self, user: &User, env: &Environment) -> Result<Option<String>, FuzzError> {
        self.check_stoppable()?;
        if !self.flow.request.has_inputs() {
            return Err(FuzzError::NoInputs {
                flow: self.flow.name.clone(),
            });
        }
        if self.flow.request.input_mut(&self.fuzzing_point).is_none() {
            return Err(FuzzError::FuzzingPointNotFound {
                flow: self.flow.name.clone(),
                point: self.fuzzing_point.clone(),
            });
        }

        self.flow
            .resolve_request(&user.to_map(), env)
            .map_err(|e| FuzzError::Flow {
                flow: self.flow.name.clone(),
                source: e.into(),
            })?;

        let point = self.flow.request.input_mut(&self.fuzzing_point).ok_or_else(|| {
            FuzzError::FuzzingPointNotFound {
                flow: self.flow.name.clone(),
                point: self.fuzzing_point.clone(),
            }
        })?;
        let original = point.value().map(str::to_string);
        point.pin();
        debug!("Fuzzing point '{}' starts from {:?}", self.fuzzing_point, original);
        Ok(original)
    }

    /// Fuzzes a flow outside the authentication process.
    ///
    /// Every iteration executes the copied flow with the next candidate,
    /// stores its outputs in the user's session and runs its operations. A
    /// stage selected by the operations is recorded but not followed.
    ///
    /// With more than one thread, each worker executes its own copy of the
    /// flow against a snapshot of the session; the outputs of one iteration
    /// are written back under a lock in a single step.
    pub fn attack_function(&mut self, user: &mut User, env: &Environment) -> Result<FuzzReport, FuzzError> {
        let original = self.prepare(user, env)?;
        info!(
            "Fuzzing '{}' of function '{}' with {} thread(s)",
            self.fuzzing_point, self.flow.name, self.threads
        );

        let Fuzz {
            flow,
            fuzzing_point,
            source,
            processor,
            threads,
            cancel,
            ..
        } = self;
        let values = source.values(original.as_deref())?;

        if *threads <= 1 {
            let mut report = FuzzReport::default();
            for value in values {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                let value = process(processor.as_ref(), value);
                let (attempt, outputs) = execute_candidate(flow, fuzzing_point, value, user, env)?;
                user.absorb(&outputs);
                report.record(attempt);
            }
            return Ok(report);
        }

        let values = Mutex::new(values);
        let shared_user = Mutex::new(user);
        let report = Mutex::new(FuzzReport::default());
        let failure: Mutex<Option<FuzzError>> = Mutex::new(None);
        let mut panicked = false;

        let (values, shared_user, report_ref, failure_ref) = (&values, &shared_user, &report, &failure);
        let (template, fuzzing_point, processor, cancel): (&Flow, &str, Option<&Processor>, &CancelToken) =
            (flow, fuzzing_point, processor.as_ref(), cancel);

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..*threads)
                .map(|worker| {
                    let mut flow = template.clone();
                    scope.spawn(move || {
                        loop {
                            if cancel.is_cancelled() {
                                report_ref.lock().unwrap_or_else(PoisonError::into_inner).cancelled = true;
                                break;
                            }
                            if failure_ref.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
                                break;
                            }
                            let next = values.lock().unwrap_or_else(PoisonError::into_inner).next();
                            let Some(value) = next else {
                                break;
                            };
                            let value = process(processor, value);
                            let snapshot: User = {
                                let guard = shared_user.lock().unwrap_or_else(PoisonError::into_inner);
                                (**guard).clone()
                            };
                            match execute_candidate(&mut flow, fuzzing_point, value, &snapshot, env) {
                                Ok((attempt, outputs)) => {
                                    shared_user
                                        .lock()
                                        .unwrap_or_else(PoisonError::into_inner)
                                        .absorb(&outputs);
                                    report_ref.lock().unwrap_or_else(PoisonError::into_inner).record(attempt);
                                }
                                Err(e) => {
                                    debug!("Worker {} stopping: {}", worker, e);
                                    failure_ref
                                        .lock()
                                        .unwrap_or_else(PoisonError::into_inner)
                                        .get_or_insert(e);
                                    break;
                                }
                            }
                        }
                    })
                })
                .collect();
            for handle in handles {
                if handle.join().is_err() {
                    panicked = true;
                }
            }
        });

        if panicked {
            return Err(FuzzError::WorkerPanicked);
        }
        if let Some(e) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(e);
        }
        Ok(report.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    /// Fuzzes a stage of the authentication process.
    ///
    /// The process is first driven forward until the fuzzed stage is the
    /// current one, so the session holds what a normal run would have
    /// produced by then. After each candidate, a selected next stage is
    /// followed until the process returns to the fuzzed stage.
    ///
    /// # Errors
    /// `FuzzError::Navigation` when the process ends, selects an unknown
    /// stage, or does not reach the fuzzed stage within the configured
    /// number of steps.
    pub fn attack_authentication(
        &mut self,
        authentication: &mut Authentication,
        user: &mut User,
        env: &Environment,
    ) -> Result<FuzzReport, FuzzError> {
        self.check_stoppable()?;
        let target = self.flow.name.clone();
        navigate_to(authentication, &target, self.max_navigation_steps, user, env)?;

        let original = self.prepare(user, env)?;
        info!("Fuzzing '{}' of authentication stage '{}'", self.fuzzing_point, target);

        let Fuzz {
            flow,
            fuzzing_point,
            source,
            processor,
            max_navigation_steps,
            cancel,
            ..
        } = self;
        let values = source.values(original.as_deref())?;

        let mut report = FuzzReport::default();
        for value in values {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let value = process(processor.as_ref(), value);
            let (attempt, outputs) = execute_candidate(flow, fuzzing_point, value, user, env)?;
            user.absorb(&outputs);
            let next = attempt.next_stage.clone();
            report.record(attempt);

            if let Some(next) = next {
                loop_back(authentication, next, &target, *max_navigation_steps, user, env)?;
            }
        }
        Ok(report)
    }
}

fn process(processor: Option<&Processor>, value: String) -> String {
    match processor {
        Some(processor) => processor(value),
        None => value,
    }
}

/// Runs one candidate through `flow`. The outputs are returned, not stored.
fn execute_candidate(
    flow: &mut Flow,
    fuzzing_point: &str,
    value: String,
    user: &User,
    env: &Environment,
) -> Result<(FuzzAttempt, Vec<Output>), FuzzError> {
    let flow_error = |flow: &Flow, source: FlowError| FuzzError::Flow {
        flow: flow.name.clone(),
        source,
    };

    let point = flow
        .request
        .input_mut(fuzzing_point)
        .ok_or_else(|| FuzzError::FuzzingPointNotFound {
            flow: flow.name.clone(),
            point: fuzzing_point.to_string(),
        })?;
    point.assign(value.clone());
    debug!("Trying '{}' = {:?}", fuzzing_point, value);

    let outputs = match flow.execute(user, env) {
        Ok(outputs) => outputs,
        Err(e) => return Err(flow_error(flow, e)),
    };
    let next_stage = match flow.run_operations() {
        Ok(next) => next,
        Err(e) => return Err(flow_error(flow, e.into())),
    };

    let (status, body_hash) = flow
        .response()
        .map(|r| (r.status, format!("{:x}", md5::compute(r.body.as_bytes()))))
        .unwrap_or_default();
    let attempt = FuzzAttempt {
        value,
        status,
        body_hash,
        new_response: false,
        next_stage,
    };
    Ok((attempt, outputs))
}

fn navigate_to(
    authentication: &mut Authentication,
    target: &str,
    max_steps: usize,
    user: &mut User,
    env: &Environment,
) -> Result<(), FuzzError> {
    let navigation = |reason: String| {
        error!("Cannot reach the {} stage: {}", target, reason);
        FuzzError::Navigation {
            target: target.to_string(),
            reason,
        }
    };

    if authentication.stage_index(target).is_none() {
        return Err(navigation("it is not an authentication stage".to_string()));
    }

    let mut steps = 0;
    loop {
        match authentication.current_stage_name() {
            Some(current) if current == target => return Ok(()),
            Some(_) => {}
            None => {
                return Err(navigation(
                    "the authentication process finished first".to_string(),
                ));
            }
        }
        if steps >= max_steps {
            return Err(navigation(format!("not reached within {max_steps} stages")));
        }
        match authentication.run_current_stage(user, env) {
            Ok(_) => {}
            Err(AuthError::StageNotDefined(id)) => {
                return Err(navigation(format!("stage {id} is not defined")));
            }
            Err(e) => return Err(e.into()),
        }
        steps += 1;
    }
}

fn loop_back(
    authentication: &mut Authentication,
    first: String,
    target: &str,
    max_steps: usize,
    user: &mut User,
    env: &Environment,
) -> Result<(), FuzzError> {
    let navigation = |reason: String| {
        error!(
            "Cannot reach the {} stage. Make sure the next stages lead back to it: {}",
            target, reason
        );
        FuzzError::Navigation {
            target: target.to_string(),
            reason,
        }
    };

    let mut next = first;
    let mut steps = 0;
    while next != target {
        if steps >= max_steps {
            return Err(navigation(format!("not reached again within {max_steps} stages")));
        }
        next = match authentication.run_stage(next.as_str(), user, env) {
            Ok(Some(name)) => name,
            Ok(None) => {
                return Err(navigation(
                    "the authentication process finished instead".to_string(),
                ));
            }
            Err(AuthError::StageNotDefined(id)) => {
                return Err(navigation(format!("stage {id} is not defined")));
            }
            Err(e) => return Err(e.into()),
        };
        steps += 1;
    }
    Ok(())
}
