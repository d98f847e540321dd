use crate::http::HttpResponse;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum OperationError {
    #[error("Aborted: {message}")]
    Aborted { message: String },
    #[error("Failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("Operation needs a response but none is available")]
    MissingResponse,
}

/// Condition checked by [`Operation::Conditional`].
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Predicate {
    /// The response status equals this code.
    Status(u16),
    /// The regular expression matches somewhere in the response body.
    Grep(String),
}

impl Predicate {
    pub fn needs_response(&self) -> bool {
        match self {
            Predicate::Status(_) | Predicate::Grep(_) => true,
        }
    }

    fn evaluate(&self, response: Option<&HttpResponse>) -> Result<bool, OperationError> {
        let response = response.ok_or(OperationError::MissingResponse)?;
        match self {
            Predicate::Status(code) => Ok(response.status == *code),
            Predicate::Grep(pattern) => {
                let regex = Regex::new(pattern).map_err(|e| OperationError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
                Ok(regex.is_match(&response.body))
            }
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum PrintItem {
    Text(String),
    Value { value: String },
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SaveContent {
    /// The value of a stage output, by name.
    Value(String),
    /// The whole response body.
    Body,
}

/// Side effects. None of them can select a stage.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Effect {
    Print(Vec<PrintItem>),
    PrintBody,
    /// Prints response headers, all of them when the list is empty.
    PrintHeaders(Vec<String>),
    /// Prints response cookies, all of them when the list is empty.
    PrintCookies(Vec<String>),
    Save {
        path: PathBuf,
        content: SaveContent,
        #[serde(default)]
        append: bool,
    },
    /// Stops the whole process with a message.
    Error(String),
}

impl Effect {
    pub fn needs_response(&self) -> bool {
        match self {
            Effect::PrintBody | Effect::PrintHeaders(_) | Effect::PrintCookies(_) => true,
            Effect::Save { content, .. } => *content == SaveContent::Body,
            Effect::Print(_) | Effect::Error(_) => false,
        }
    }

    /// Renders the text a print effect would write, `None` for other effects.
    pub fn render(&self, ctx: &OperationContext<'_>) -> Result<Option<String>, OperationError> {
        let lines: Vec<String> = match self {
            Effect::Print(items) => items
                .iter()
                .map(|item| match item {
                    PrintItem::Text(text) => text.clone(),
                    PrintItem::Value { value } => match ctx.values.get(value) {
                        Some(v) => format!("{value} = {v}"),
                        None => format!("{value} = <unset>"),
                    },
                })
                .collect(),
            Effect::PrintBody => vec![ctx.require_response()?.body.clone()],
            Effect::PrintHeaders(filter) => filtered(&ctx.require_response()?.headers, filter),
            Effect::PrintCookies(filter) => filtered(&ctx.require_response()?.cookies, filter),
            Effect::Save { .. } | Effect::Error(_) => return Ok(None),
        };
        Ok(Some(lines.join("\n")))
    }

    fn apply(&self, ctx: &OperationContext<'_>) -> Result<(), OperationError> {
        match self {
            Effect::Save {
                path,
                content,
                append,
            } => {
                let text = match content {
                    SaveContent::Body => ctx.require_response()?.body.clone(),
                    SaveContent::Value(name) => match ctx.values.get(name) {
                        Some(value) => value.clone(),
                        None => {
                            warn!("Nothing to save, '{}' has no value", name);
                            return Ok(());
                        }
                    },
                };
                save(path, &text, *append)
            }
            Effect::Error(message) => {
                error!("{}", message);
                Err(OperationError::Aborted {
                    message: message.clone(),
                })
            }
            _ => {
                if let Some(text) = self.render(ctx)? {
                    println!("{text}");
                }
                Ok(())
            }
        }
    }
}

fn filtered(map: &BTreeMap<String, String>, filter: &[String]) -> Vec<String> {
    map.iter()
        .filter(|(name, _)| filter.is_empty() || filter.iter().any(|f| f.eq_ignore_ascii_case(name)))
        .map(|(name, value)| format!("{name}: {value}"))
        .collect()
}

fn save(path: &Path, text: &str, append: bool) -> Result<(), OperationError> {
    let io_err = |source| OperationError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .map_err(io_err)?;
    writeln!(file, "{text}").map_err(io_err)?;
    info!("Saved {} bytes to {:?}", text.len() + 1, path);
    Ok(())
}

/// What operations are evaluated against: the last response and the values
/// of the stage's outputs, by name.
#[derive(Debug, Clone, Copy)]
pub struct OperationContext<'a> {
    pub response: Option<&'a HttpResponse>,
    pub values: &'a BTreeMap<String, String>,
}

impl<'a> OperationContext<'a> {
    pub fn new(response: Option<&'a HttpResponse>, values: &'a BTreeMap<String, String>) -> Self {
        Self { response, values }
    }

    fn require_response(&self) -> Result<&'a HttpResponse, OperationError> {
        self.response.ok_or(OperationError::MissingResponse)
    }
}

/// A node of a stage's post-response decision tree.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Operation {
    Conditional {
        predicate: Predicate,
        #[serde(default)]
        action: Vec<Operation>,
        #[serde(default)]
        otherwise: Vec<Operation>,
    },
    Effect {
        effect: Effect,
    },
    /// Selects the next stage; `None` ends the process.
    NextStage {
        #[serde(default)]
        stage: Option<String>,
    },
}

impl Operation {
    pub fn next_stage(stage: impl Into<String>) -> Self {
        Operation::NextStage {
            stage: Some(stage.into()),
        }
    }

    pub fn finish() -> Self {
        Operation::NextStage { stage: None }
    }

    pub fn when(predicate: Predicate, action: Vec<Operation>, otherwise: Vec<Operation>) -> Self {
        Operation::Conditional {
            predicate,
            action,
            otherwise,
        }
    }

    pub fn effect(effect: Effect) -> Self {
        Operation::Effect { effect }
    }

    pub fn needs_response(&self) -> bool {
        match self {
            Operation::Conditional { predicate, .. } => predicate.needs_response(),
            Operation::Effect { effect } => effect.needs_response(),
            Operation::NextStage { .. } => false,
        }
    }

    /// Evaluates this node.
    ///
    /// # Returns
    /// `Ok(Some(stage))` when the node selects a stage, `Ok(None)` when it
    /// does not (effects, an empty branch, or a `NextStage` without target).
    /// `Err(OperationError::Aborted)` when an `Error` effect fired.
    pub fn run(&self, ctx: &OperationContext<'_>) -> Result<Option<String>, OperationError> {
        if self.needs_response() && ctx.response.is_none() {
            return Err(OperationError::MissingResponse);
        }
        match self {
            Operation::Conditional {
                predicate,
                action,
                otherwise,
            } => {
                if predicate.evaluate(ctx.response)? {
                    execute_actions(action, ctx)
                } else {
                    execute_actions(otherwise, ctx)
                }
            }
            Operation::Effect { effect } => {
                effect.apply(ctx)?;
                Ok(None)
            }
            Operation::NextStage { stage } => Ok(stage.clone()),
        }
    }
}

/// Runs a forest of operations in order and returns the first stage name
/// any of them selects.
pub fn execute_actions(
    operations: &[Operation],
    ctx: &OperationContext<'_>,
) -> Result<Option<String>, OperationError> {
    for operation in operations {
        if let Some(next) = operation.run(ctx)? {
            return Ok(Some(next));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        values.insert("access_token".to_string(), "abc123".to_string());
        values
    }

    fn save_marker(path: &std::path::Path) -> Operation {
        Operation::effect(Effect::Save {
            path: path.to_path_buf(),
            content: SaveContent::Value("access_token".to_string()),
            append: true,
        })
    }

    #[test]
    fn conditional_on_status_selects_the_branch() {
        let login = Operation::when(
            Predicate::Status(200),
            vec![Operation::next_stage("mfa")],
            vec![Operation::finish()],
        );
        let values = values();

        let ok = HttpResponse::new(200, "");
        let ctx = OperationContext::new(Some(&ok), &values);
        assert_eq!(login.run(&ctx).unwrap().as_deref(), Some("mfa"));

        let denied = HttpResponse::new(403, "");
        let ctx = OperationContext::new(Some(&denied), &values);
        assert_eq!(login.run(&ctx).unwrap(), None);
    }

    #[test]
    fn exactly_one_branch_runs() {
        let dir = tempfile::tempdir().unwrap();
        let taken = dir.path().join("action");
        let skipped = dir.path().join("otherwise");
        let op = Operation::when(
            Predicate::Grep("Welcome, [a-z]+".to_string()),
            vec![save_marker(&taken)],
            vec![save_marker(&skipped)],
        );
        let values = values();
        let response = HttpResponse::new(200, "<h1>Welcome, alice</h1>");

        let next = op.run(&OperationContext::new(Some(&response), &values)).unwrap();
        assert_eq!(next, None, "Effects must not select a stage");
        assert_eq!(std::fs::read_to_string(&taken).unwrap(), "abc123\n");
        assert!(!skipped.exists(), "The otherwise branch must not run");
    }

    #[test]
    fn empty_branch_yields_nothing() {
        let op = Operation::when(Predicate::Status(500), vec![Operation::next_stage("x")], vec![]);
        let values = BTreeMap::new();
        let response = HttpResponse::new(200, "");
        assert_eq!(op.run(&OperationContext::new(Some(&response), &values)).unwrap(), None);
    }

    #[test]
    fn forest_stops_at_first_stage_signal() {
        let dir = tempfile::tempdir().unwrap();
        let after = dir.path().join("after");
        let forest = vec![
            Operation::effect(Effect::Print(vec![PrintItem::Text("checking".to_string())])),
            Operation::when(Predicate::Status(302), vec![Operation::next_stage("redirected")], vec![]),
            Operation::next_stage("fallback"),
            save_marker(&after),
        ];
        let values = values();

        let redirect = HttpResponse::new(302, "");
        let ctx = OperationContext::new(Some(&redirect), &values);
        assert_eq!(execute_actions(&forest, &ctx).unwrap().as_deref(), Some("redirected"));

        let ok = HttpResponse::new(200, "");
        let ctx = OperationContext::new(Some(&ok), &values);
        assert_eq!(execute_actions(&forest, &ctx).unwrap().as_deref(), Some("fallback"));
        assert!(!after.exists(), "Nodes after a stage signal must not run");
    }

    #[test]
    fn error_effect_aborts() {
        let values = BTreeMap::new();
        let response = HttpResponse::new(401, "denied");
        let op = Operation::when(
            Predicate::Status(401),
            vec![Operation::effect(Effect::Error("Login failed".to_string()))],
            vec![],
        );
        match op.run(&OperationContext::new(Some(&response), &values)) {
            Err(OperationError::Aborted { message }) => assert_eq!(message, "Login failed"),
            other => panic!("Expected Aborted, got {other:?}"),
        }
    }

    #[test]
    fn save_overwrites_or_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.txt");
        let values = BTreeMap::new();
        let first = HttpResponse::new(200, "first");
        let second = HttpResponse::new(200, "second");
        let overwrite = Effect::Save {
            path: path.clone(),
            content: SaveContent::Body,
            append: false,
        };
        let append = Effect::Save {
            path: path.clone(),
            content: SaveContent::Body,
            append: true,
        };

        overwrite.apply(&OperationContext::new(Some(&first), &values)).unwrap();
        overwrite.apply(&OperationContext::new(Some(&second), &values)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");

        append.apply(&OperationContext::new(Some(&first), &values)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\nfirst\n");
    }

    #[test]
    fn print_effects_render_filtered_views() {
        let values = values();
        let response = HttpResponse::new(200, "body")
            .with_header("Location", "/home")
            .with_header("Server", "nginx")
            .with_cookie("session", "s1");
        let ctx = OperationContext::new(Some(&response), &values);

        let print = Effect::Print(vec![
            PrintItem::Text("Tokens:".to_string()),
            PrintItem::Value {
                value: "access_token".to_string(),
            },
            PrintItem::Value {
                value: "refresh".to_string(),
            },
        ]);
        assert_eq!(
            print.render(&ctx).unwrap().as_deref(),
            Some("Tokens:\naccess_token = abc123\nrefresh = <unset>")
        );
        assert_eq!(
            Effect::PrintHeaders(vec!["location".to_string()]).render(&ctx).unwrap().as_deref(),
            Some("Location: /home")
        );
        assert_eq!(
            Effect::PrintCookies(vec![]).render(&ctx).unwrap().as_deref(),
            Some("session: s1")
        );

        let no_response = OperationContext::new(None, &values);
        assert!(matches!(
            Effect::PrintBody.render(&no_response),
            Err(OperationError::MissingResponse)
        ));
        assert!(!print.needs_response());
    }

    #[test]
    fn only_response_dependent_nodes_need_a_response() {
        let values = values();
        let ctx = OperationContext::new(None, &values);
        let print = Operation::effect(Effect::Print(vec![PrintItem::Text("no request yet".to_string())]));

        assert_eq!(print.run(&ctx).unwrap(), None);
        assert_eq!(Operation::next_stage("login").run(&ctx).unwrap().as_deref(), Some("login"));
        assert!(matches!(
            Operation::when(Predicate::Status(200), vec![], vec![]).run(&ctx),
            Err(OperationError::MissingResponse)
        ));
        assert!(matches!(
            Operation::effect(Effect::PrintBody).run(&ctx),
            Err(OperationError::MissingResponse)
        ));
    }

    #[test]
    fn invalid_grep_pattern_is_reported() {
        let values = BTreeMap::new();
        let response = HttpResponse::new(200, "");
        let op = Operation::when(Predicate::Grep("(".to_string()), vec![], vec![]);
        assert!(matches!(
            op.run(&OperationContext::new(Some(&response), &values)),
            Err(OperationError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn operations_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Holder {
            operations: Vec<Operation>,
        }
        let holder: Holder = toml::from_str(
            r#"
            [[operations]]
            op = "conditional"
            predicate = { status = 200 }
            action = [{ op = "next-stage", stage = "mfa" }]
            otherwise = [{ op = "effect", effect = { error = "Login failed" } }]

            [[operations]]
            op = "effect"
            effect = { save = { path = "token.txt", content = { value = "access_token" } } }

            [[operations]]
            op = "effect"
            effect = "print-body"

            [[operations]]
            op = "next-stage"
            "#,
        )
        .unwrap();

        assert_eq!(
            holder.operations[0],
            Operation::when(
                Predicate::Status(200),
                vec![Operation::next_stage("mfa")],
                vec![Operation::effect(Effect::Error("Login failed".to_string()))],
            )
        );
        assert_eq!(
            holder.operations[1],
            Operation::effect(Effect::Save {
                path: PathBuf::from("token.txt"),
                content: SaveContent::Value("access_token".to_string()),
                append: false,
            })
        );
        assert_eq!(holder.operations[2], Operation::effect(Effect::PrintBody));
        assert_eq!(holder.operations[3], Operation::finish());
    }
}
