use crate::flow::{Environment, Flow, FlowError};
use crate::session::User;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum FunctionError {
    #[error("Function '{0}' not defined")]
    NotDefined(String),
    #[error("Function '{function}' failed: {source}")]
    Flow {
        function: String,
        #[source]
        source: FlowError,
    },
}

/// Stand-alone flows that run outside the authentication process, usually
/// with the session it produced.
#[derive(Debug, Clone, Default)]
pub struct Functions {
    functions: Vec<Flow>,
}

impl Functions {
    pub fn new(functions: Vec<Flow>) -> Self {
        Self { functions }
    }

    pub fn get(&self, name: &str) -> Option<&Flow> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|f| f.name.as_str())
    }

    /// Runs a function for `user`, storing its outputs in the user's session.
    ///
    /// # Returns
    /// The stage name its operations selected, if any. Functions are not part
    /// of the authentication process, so the value is informational.
    pub fn run(&mut self, name: &str, user: &mut User, env: &Environment) -> Result<Option<String>, FunctionError> {
        let function = self
            .functions
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| FunctionError::NotDefined(name.to_string()))?;
        info!("Running function '{}'", name);

        let outputs = function.execute(user, env).map_err(|source| FunctionError::Flow {
            function: name.to_string(),
            source,
        })?;
        user.absorb(&outputs);
        function.run_operations().map_err(|e| FunctionError::Flow {
            function: name.to_string(),
            source: e.into(),
        })
    }
}
