pub mod application;
pub mod authentication;
pub mod config;
pub mod flow;
pub mod functions;
pub mod fuzz;
pub mod http;
pub mod operation;
pub mod parsers;
pub mod plugin;
pub mod project;
pub mod request;
pub mod session;
pub mod source;

#[cfg(test)]
pub mod test_utils;

pub use application::{Application, ApplicationError};
pub use authentication::{AuthError, Authentication, StageId};
pub use config::GatecrashConfig;
pub use flow::{Environment, Flow, FlowError, Output};
pub use functions::{FunctionError, Functions};
pub use fuzz::{CancelToken, Fuzz, FuzzAttempt, FuzzError, FuzzMode, FuzzReport};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, TransportError, UreqClient};
pub use operation::{Effect, Operation, OperationError, Predicate};
pub use plugin::{Capability, Plugin, PluginKind, ValueTarget};
pub use project::{Project, ProjectError};
pub use request::{RequestError, RequestTemplate};
pub use session::{SessionError, User, UserStore};
pub use source::{Extent, IterSource, Literals, Mutations, Placement, ValueSource, Wordlist};
