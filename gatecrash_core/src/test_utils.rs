use crate::flow::Environment;
use crate::http::{HttpClient, HttpRequest, HttpResponse, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Responder = Box<dyn FnMut(&HttpRequest) -> HttpResponse + Send>;

enum Script {
    Queue(VecDeque<HttpResponse>),
    Responder(Responder),
}

struct State {
    script: Script,
    requests: Vec<HttpRequest>,
}

/// In-memory [`HttpClient`] that answers from a script and records every
/// request it receives. Clones share the same script and log.
#[derive(Clone)]
pub struct ScriptedClient {
    state: Arc<Mutex<State>>,
}

impl ScriptedClient {
    /// Answers with `responses` in order, then fails with a transport error.
    pub fn with_responses(responses: Vec<HttpResponse>) -> Self {
        Self::from_script(Script::Queue(responses.into()))
    }

    /// Answers every request with whatever `responder` returns for it.
    pub fn responding(responder: impl FnMut(&HttpRequest) -> HttpResponse + Send + 'static) -> Self {
        Self::from_script(Script::Responder(Box::new(responder)))
    }

    fn from_script(script: Script) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                script,
                requests: Vec::new(),
            })),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Paths of the recorded requests, base URL stripped.
    pub fn paths(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| r.url.trim_start_matches(BASE_URL).to_string())
            .collect()
    }
}

impl HttpClient for ScriptedClient {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        match &mut state.script {
            Script::Queue(queue) => queue.pop_front().ok_or_else(|| TransportError::Request {
                method: request.method,
                url: request.url.clone(),
                reason: "no scripted response left".to_string(),
            }),
            Script::Responder(responder) => Ok(responder(request)),
        }
    }
}

pub const BASE_URL: &str = "https://app.test";

pub fn environment(client: &ScriptedClient) -> Environment {
    Environment::new(Arc::new(client.clone()), Some(BASE_URL.to_string()), "gatecrash/test")
}

/// Request path without the base URL, for matching in responders.
pub fn path_of(request: &HttpRequest) -> &str {
    request.url.trim_start_matches(BASE_URL)
}

