use crate::http::{HttpClient, HttpRequest, HttpResponse, TransportError};
use crate::operation::{self, Operation, OperationContext, OperationError};
use crate::plugin::{Plugin, ResolveContext, SessionMap, ValueTarget};
use crate::request::{RequestError, RequestTemplate};
use crate::session::User;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("Operation failed: {0}")]
    Operation(#[from] OperationError),
}

/// Everything a stage needs from the outside world to run.
#[derive(Clone)]
pub struct Environment {
    pub client: Arc<dyn HttpClient>,
    pub base_url: Option<String>,
    pub user_agent: String,
}

impl Environment {
    pub fn new(client: Arc<dyn HttpClient>, base_url: Option<String>, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            base_url,
            user_agent: user_agent.into(),
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

/// A value extracted from a response, ready to be stored in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub name: String,
    pub target: ValueTarget,
    pub value: Option<String>,
}

/// One named request/response exchange.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Flow {
    pub name: String,
    pub request: RequestTemplate,
    #[serde(default)]
    pub outputs: Vec<Plugin>,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(skip)]
    response: Option<HttpResponse>,
}

impl Flow {
    pub fn new(name: impl Into<String>, request: RequestTemplate) -> Self {
        Self {
            name: name.into(),
            request,
            outputs: Vec::new(),
            operations: Vec::new(),
            response: None,
        }
    }

    pub fn with_output(mut self, plugin: Plugin) -> Self {
        self.outputs.push(plugin);
        self
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// The response of the last execution.
    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    /// Resolves the request template against `session` without sending it.
    pub fn resolve_request(&mut self, session: &SessionMap, env: &Environment) -> Result<HttpRequest, RequestError> {
        self.request.resolve(
            &ResolveContext::inputs(session),
            env.base_url.as_deref(),
            &env.user_agent,
        )
    }

    /// Sends the request built for `user` and extracts every output.
    ///
    /// The user is not modified; the caller decides where the returned
    /// outputs go.
    pub fn execute(&mut self, user: &User, env: &Environment) -> Result<Vec<Output>, FlowError> {
        let session = user.to_map();
        let request = self.resolve_request(&session, env)?;
        info!("Running flow '{}': {} {}", self.name, request.method, request.url);

        let response = env.client.send(&request)?;
        debug!("Flow '{}' got HTTP {}", self.name, response.status);

        let outputs = self.extract_outputs(&session, &response);
        self.response = Some(response);
        Ok(outputs)
    }

    fn extract_outputs(&mut self, session: &SessionMap, response: &HttpResponse) -> Vec<Output> {
        let ctx = ResolveContext::outputs(session, response);
        self.outputs
            .iter_mut()
            .map(|plugin| Output {
                value: plugin.resolve(&ctx),
                name: plugin.name().to_string(),
                target: plugin.target(),
            })
            .collect()
    }

    /// Values of the outputs extracted by the last execution, by name.
    pub fn output_values(&self) -> BTreeMap<String, String> {
        self.outputs
            .iter()
            .filter_map(|p| p.value().map(|v| (p.name().to_string(), v.to_string())))
            .collect()
    }

    /// Evaluates the operation forest against the last response.
    ///
    /// # Returns
    /// The name of the next stage, or `None` when no operation selected one.
    pub fn run_operations(&self) -> Result<Option<String>, OperationError> {
        let values = self.output_values();
        let ctx = OperationContext::new(self.response.as_ref(), &values);
        let next = operation::execute_actions(&self.operations, &ctx)?;
        debug!("Flow '{}' selected next stage {:?}", self.name, next);
        Ok(next)
    }
}
