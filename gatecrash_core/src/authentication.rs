use crate::flow::{Environment, Flow, FlowError};
use crate::session::User;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Stage {0} not defined")]
    StageNotDefined(StageId),
    #[error("Authentication process has already finished")]
    Finished,
    #[error("Stage '{stage}' failed: {source}")]
    Flow {
        stage: String,
        #[source]
        source: FlowError,
    },
}

/// A stage reference, by position or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageId {
    Index(usize),
    Name(String),
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageId::Index(index) => write!(f, "#{index}"),
            StageId::Name(name) => write!(f, "'{name}'"),
        }
    }
}

impl From<usize> for StageId {
    fn from(index: usize) -> Self {
        StageId::Index(index)
    }
}

impl From<&str> for StageId {
    fn from(name: &str) -> Self {
        StageId::Name(name.to_string())
    }
}

impl From<String> for StageId {
    fn from(name: String) -> Self {
        StageId::Name(name)
    }
}

/// The authentication process as a state machine over its stages.
///
/// The cursor points at the stage to run next; `None` means the process has
/// terminated. Each stage chooses its successor through its operations.
#[derive(Debug, Clone)]
pub struct Authentication {
    stages: Vec<Flow>,
    current: Option<usize>,
}

impl Authentication {
    pub fn new(stages: Vec<Flow>) -> Self {
        let current = if stages.is_empty() { None } else { Some(0) };
        Self { stages, current }
    }

    pub fn stages(&self) -> &[Flow] {
        &self.stages
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Index of the stage that runs next, `None` once terminated.
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn current_stage_name(&self) -> Option<&str> {
        self.current.map(|index| self.stages[index].name.as_str())
    }

    pub fn is_finished(&self) -> bool {
        self.current.is_none()
    }

    /// Rewinds the cursor to the first stage.
    pub fn reset(&mut self) {
        self.current = if self.stages.is_empty() { None } else { Some(0) };
    }

    fn index_of(&self, id: &StageId) -> Option<usize> {
        match id {
            StageId::Index(index) if *index < self.stages.len() => Some(*index),
            StageId::Index(_) => None,
            StageId::Name(name) => self.stage_index(name),
        }
    }

    /// Runs one stage for `user` and moves the cursor to the stage it selects.
    ///
    /// Outputs are written into the user's session in one step after the
    /// response has been processed.
    ///
    /// # Returns
    /// The name of the next stage, or `None` when the process is complete.
    /// A selected stage that does not exist terminates the process and is
    /// reported as [`AuthError::StageNotDefined`].
    pub fn run_stage(
        &mut self,
        id: impl Into<StageId>,
        user: &mut User,
        env: &Environment,
    ) -> Result<Option<String>, AuthError> {
        let id = id.into();
        let index = self.index_of(&id).ok_or(AuthError::StageNotDefined(id))?;
        let stage = &mut self.stages[index];
        info!("Running stage '{}'", stage.name);

        let outputs = stage.execute(user, env).map_err(|source| AuthError::Flow {
            stage: stage.name.clone(),
            source,
        })?;
        user.absorb(&outputs);
        let next = stage.run_operations().map_err(|e| AuthError::Flow {
            stage: stage.name.clone(),
            source: e.into(),
        })?;

        match &next {
            Some(name) => match self.stage_index(name) {
                Some(next_index) => self.current = Some(next_index),
                None => {
                    self.current = None;
                    return Err(AuthError::StageNotDefined(StageId::Name(name.clone())));
                }
            },
            None => {
                debug!("Authentication process complete");
                self.current = None;
            }
        }
        Ok(next)
    }

    pub fn run_current_stage(
        &mut self,
        user: &mut User,
        env: &Environment,
    ) -> Result<Option<String>, AuthError> {
        let index = self.current.ok_or(AuthError::Finished)?;
        self.run_stage(index, user, env)
    }

    /// Runs stages from the cursor until one ends the process.
    ///
    /// # Returns
    /// The names of the stages visited, in order.
    pub fn run_all(&mut self, user: &mut User, env: &Environment) -> Result<Vec<String>, AuthError> {
        let mut visited = Vec::new();
        while let Some(index) = self.current {
            visited.push(self.stages[index].name.clone());
            self.run_stage(index, user, env)?;
        }
        info!("Authenticated '{}' after {} stages", user.username, visited.len());
        Ok(visited)
    }
}
