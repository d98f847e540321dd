use crate::authentication::{AuthError, Authentication};
use crate::config::GatecrashConfig;
use crate::flow::Environment;
use crate::functions::{FunctionError, Functions};
use crate::fuzz::{CancelToken, Fuzz, FuzzError, FuzzMode, FuzzReport};
use crate::http::{HttpClient, TransportError, UreqClient};
use crate::project::{Project, ProjectError};
use crate::session::{SessionError, User, UserStore};
use crate::source::ValueSource;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error("Project error: {0}")]
    Project(#[from] ProjectError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("HTTP client error: {0}")]
    Transport(#[from] TransportError),
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),
    #[error("Function error: {0}")]
    Function(#[from] FunctionError),
    #[error("Fuzzing error: {0}")]
    Fuzz(#[from] FuzzError),
    #[error("'{0}' is neither an authentication stage nor a function")]
    UnknownFlow(String),
}

/// A loaded project, ready to authenticate, run functions and fuzz.
#[derive(Debug)]
pub struct Application {
    name: String,
    config: GatecrashConfig,
    users: UserStore,
    authentication: Authentication,
    functions: Functions,
    env: Environment,
    cancel: CancelToken,
}

impl Application {
    pub fn new(project: Project, config: GatecrashConfig, client: Arc<dyn HttpClient>) -> Result<Self, ApplicationError> {
        project.validate()?;
        let mut users = UserStore::new(project.users)?;
        if let Some(active) = &project.active_user {
            users.set_active(active)?;
        }
        let env = Environment::new(client, project.base_url, config.http.user_agent.clone());
        info!(
            "Project '{}': {} stages, {} functions, {} users",
            project.name,
            project.authentication.len(),
            project.functions.len(),
            users.users().len()
        );

        Ok(Self {
            name: project.name,
            config,
            users,
            authentication: Authentication::new(project.authentication),
            functions: Functions::new(project.functions),
            env,
            cancel: CancelToken::new(),
        })
    }

    /// Loads the project at `path` and talks to it over real HTTP.
    pub fn open(path: &Path, config: GatecrashConfig) -> Result<Self, ApplicationError> {
        let project = Project::load_from_file(path)?;
        let client = UreqClient::new(&config.http)?;
        Self::new(project, config, Arc::new(client))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &GatecrashConfig {
        &self.config
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub fn active_user(&self) -> &User {
        self.users.active()
    }

    pub fn authentication(&self) -> &Authentication {
        &self.authentication
    }

    pub fn functions(&self) -> &Functions {
        &self.functions
    }

    /// Token that stops a running fuzzer between two iterations.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs the whole authentication process for `username`, or for the
    /// active user. The named user becomes the active one.
    ///
    /// # Returns
    /// The names of the stages visited, in order.
    pub fn authenticate(&mut self, username: Option<&str>) -> Result<Vec<String>, ApplicationError> {
        if let Some(username) = username {
            self.users.set_active(username)?;
        }
        self.authentication.reset();
        let visited = self
            .authentication
            .run_all(self.users.active_mut(), &self.env)?;
        Ok(visited)
    }

    /// Runs a function for the active user.
    pub fn run_function(&mut self, name: &str) -> Result<Option<String>, ApplicationError> {
        let next = self.functions.run(name, self.users.active_mut(), &self.env)?;
        Ok(next)
    }

    pub fn fuzz(
        &mut self,
        mode: FuzzMode,
        name: &str,
        fuzzing_point: &str,
        source: Box<dyn ValueSource>,
    ) -> Result<FuzzReport, ApplicationError> {
        match mode {
            FuzzMode::Function => self.fuzz_function(name, fuzzing_point, source),
            FuzzMode::Authentication => self.fuzz_authentication(name, fuzzing_point, source),
        }
    }

    pub fn fuzz_function(
        &mut self,
        name: &str,
        fuzzing_point: &str,
        source: Box<dyn ValueSource>,
    ) -> Result<FuzzReport, ApplicationError> {
        let flow = self
            .functions
            .get(name)
            .ok_or_else(|| FunctionError::NotDefined(name.to_string()))?;
        let mut fuzz = Fuzz::new(flow, fuzzing_point, source)
            .with_settings(&self.config.fuzzer)
            .with_cancel_token(self.cancel.clone());
        let report = fuzz.attack_function(self.users.active_mut(), &self.env)?;
        Ok(report)
    }

    /// Fuzzes an authentication stage, starting the process over from its
    /// first stage.
    pub fn fuzz_authentication(
        &mut self,
        name: &str,
        fuzzing_point: &str,
        source: Box<dyn ValueSource>,
    ) -> Result<FuzzReport, ApplicationError> {
        let index = self
            .authentication
            .stage_index(name)
            .ok_or_else(|| AuthError::StageNotDefined(name.into()))?;
        let flow = &self.authentication.stages()[index];
        let mut fuzz = Fuzz::new(flow, fuzzing_point, source)
            .with_settings(&self.config.fuzzer)
            .with_cancel_token(self.cancel.clone());

        self.authentication.reset();
        let report = fuzz.attack_authentication(&mut self.authentication, self.users.active_mut(), &self.env)?;
        Ok(report)
    }

    /// Looks `name` up among the stages first, then the functions.
    pub fn fuzz_mode_of(&self, name: &str) -> Result<FuzzMode, ApplicationError> {
        if self.authentication.stage_index(name).is_some() {
            Ok(FuzzMode::Authentication)
        } else if self.functions.get(name).is_some() {
            Ok(FuzzMode::Function)
        } else {
            Err(ApplicationError::UnknownFlow(name.to_string()))
        }
    }

    pub fn load_session(&mut self, path: &Path) -> Result<usize, ApplicationError> {
        Ok(self.users.load_sessions(path)?)
    }

    pub fn write_session(&self, path: &Path) -> Result<(), ApplicationError> {
        Ok(self.users.save_sessions(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::source::Literals;
    use crate::test_utils::{BASE_URL, ScriptedClient, path_of};

    fn project() -> Project {
        let toml = format!(
            r#"
            name = "portal"
            base-url = "{BASE_URL}"

            [[users]]
            username = "alice"
            password = "alice-pw"

            [[users]]
            username = "bob"
            password = "bob-pw"

            [[authentication]]
            name = "login"
            outputs = [{{ name = "session", type = "response-cookie" }}]
            operations = [{{ op = "conditional", predicate = {{ status = 200 }}, otherwise = [{{ op = "effect", effect = {{ error = "Login failed" }} }}] }}]

            [authentication.request]
            method = "POST"
            path = "/login"
            data = [
                {{ key = "username", value = {{ name = "username", type = "variable" }} }},
                {{ key = "password", value = {{ name = "password", type = "variable" }} }},
            ]

            [[functions]]
            name = "search"
            outputs = [{{ name = "count", type = "regex", regex = "count=([0-9]+)", group = 0 }}]

            [functions.request]
            method = "GET"
            path = "/search"
            cookies = [{{ name = "session", type = "response-cookie" }}]
            data = [{{ key = "q", value = {{ name = "q", type = "value", value = "shoes" }} }}]
            "#
        );
        toml::from_str(&toml).unwrap()
    }

    fn portal() -> ScriptedClient {
        ScriptedClient::responding(|request| match path_of(request) {
            "/login" => match (request.body.get("username"), request.body.get("password")) {
                (Some(user), Some(password)) if password == &format!("{user}-pw") => {
                    HttpResponse::new(200, "welcome").with_cookie("session", format!("s-{user}"))
                }
                _ => HttpResponse::new(401, "denied"),
            },
            "/search" => {
                let q = request.body.get("q").cloned().unwrap_or_default();
                HttpResponse::new(200, format!("count={}", q.len()))
            }
            _ => HttpResponse::new(404, ""),
        })
    }

    fn application(client: &ScriptedClient) -> Application {
        Application::new(project(), GatecrashConfig::default(), Arc::new(client.clone())).unwrap()
    }

    #[test]
    fn authenticate_then_run_a_function_with_the_session() {
        let client = portal();
        let mut app = application(&client);
        assert_eq!(app.name(), "portal");
        assert_eq!(app.active_user().username, "alice");

        assert_eq!(app.authenticate(Some("bob")).unwrap(), vec!["login"]);
        assert_eq!(app.active_user().username, "bob");
        assert_eq!(app.active_user().cookies["session"], "s-bob");

        assert_eq!(app.run_function("search").unwrap(), None);
        let requests = client.requests();
        assert_eq!(requests[1].cookies["session"], "s-bob");
        assert_eq!(requests[1].body["q"], "shoes");
        assert_eq!(app.active_user().data["count"], "5");
    }

    #[test]
    fn failed_login_aborts_authentication() {
        let client = ScriptedClient::with_responses(vec![HttpResponse::new(401, "denied")]);
        let mut app = application(&client);
        assert!(matches!(
            app.authenticate(None),
            Err(ApplicationError::Auth(AuthError::Flow { .. }))
        ));
        assert!(matches!(
            app.authenticate(Some("mallory")),
            Err(ApplicationError::Session(SessionError::UnknownUser(_)))
        ));
    }

    #[test]
    fn fuzz_dispatches_on_the_kind_of_flow() {
        let client = portal();
        let mut app = application(&client);
        app.authenticate(None).unwrap();

        assert_eq!(app.fuzz_mode_of("search").unwrap(), FuzzMode::Function);
        assert_eq!(app.fuzz_mode_of("login").unwrap(), FuzzMode::Authentication);
        assert!(matches!(app.fuzz_mode_of("logout"), Err(ApplicationError::UnknownFlow(_))));

        let report = app
            .fuzz(FuzzMode::Function, "search", "q", Box::new(Literals::new(["a", "bb", "bb"])))
            .unwrap();
        assert_eq!(report.attempts().len(), 3);
        assert_eq!(report.distinct_responses(), 2);
        let search = app.functions().get("search").unwrap();
        assert!(
            search.request.inputs().iter().all(|p| p.value().is_none()),
            "The project's own function is left untouched"
        );

        let report = app
            .fuzz(FuzzMode::Authentication, "login", "password", Box::new(Literals::new(["alice-pw"])))
            .unwrap();
        assert_eq!(report.attempts()[0].status, 200);
        assert_eq!(report.attempts()[0].next_stage, None);

        // The stage aborts on a wrong password, which ends the run.
        assert!(matches!(
            app.fuzz(FuzzMode::Authentication, "login", "password", Box::new(Literals::new(["x", "y"]))),
            Err(ApplicationError::Fuzz(FuzzError::Flow { .. }))
        ));
    }

    #[test]
    fn fuzzing_unknown_names_is_a_lookup_error() {
        let client = portal();
        let mut app = application(&client);
        assert!(matches!(
            app.fuzz_function("nope", "q", Box::new(Literals::new(["a"]))),
            Err(ApplicationError::Function(FunctionError::NotDefined(_)))
        ));
        assert!(matches!(
            app.fuzz_authentication("nope", "q", Box::new(Literals::new(["a"]))),
            Err(ApplicationError::Auth(AuthError::StageNotDefined(_)))
        ));
        assert!(matches!(
            app.fuzz_function("search", "page", Box::new(Literals::new(["a"]))),
            Err(ApplicationError::Fuzz(FuzzError::FuzzingPointNotFound { .. }))
        ));
        assert!(client.requests().is_empty());
    }

    #[test]
    fn sessions_survive_a_restart() {
        let client = portal();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let mut app = application(&client);
        app.authenticate(None).unwrap();
        app.write_session(&path).unwrap();

        let mut restarted = application(&client);
        assert!(restarted.active_user().cookies.is_empty());
        assert_eq!(restarted.load_session(&path).unwrap(), 2);
        assert_eq!(restarted.active_user().cookies["session"], "s-alice");
    }
}
