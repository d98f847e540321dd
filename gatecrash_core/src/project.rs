use crate::flow::Flow;
use crate::operation::Operation;
use crate::session::User;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("Failed to read project file at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse project file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Project defines no users")]
    NoUsers,
    #[error("Active user '{0}' is not defined")]
    UnknownActiveUser(String),
    #[error("Stage '{0}' is defined more than once")]
    DuplicateStage(String),
    #[error("Function '{0}' is defined more than once")]
    DuplicateFunction(String),
    #[error("Stage '{stage}' leads to '{target}', which is not an authentication stage")]
    UnknownNextStage { stage: String, target: String },
}

/// A target application: its users, its authentication process and the
/// functions available once authenticated.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Project {
    pub name: String,
    /// Joined with the `path` of requests that do not give a full URL.
    #[serde(default)]
    pub base_url: Option<String>,
    pub users: Vec<User>,
    #[serde(default)]
    pub active_user: Option<String>,
    #[serde(default)]
    pub authentication: Vec<Flow>,
    #[serde(default)]
    pub functions: Vec<Flow>,
}

impl Project {
    pub fn load_from_file(path: &Path) -> Result<Self, ProjectError> {
        let content = std::fs::read_to_string(path).map_err(|source| ProjectError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let project: Project = toml::from_str(&content).map_err(|source| ProjectError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        project.validate()?;
        Ok(project)
    }

    /// Checks what deserialization cannot: names are unique, the active user
    /// exists and every stage selected by an authentication stage exists.
    pub fn validate(&self) -> Result<(), ProjectError> {
        if self.users.is_empty() {
            return Err(ProjectError::NoUsers);
        }
        if let Some(active) = &self.active_user {
            if !self.users.iter().any(|u| &u.username == active) {
                return Err(ProjectError::UnknownActiveUser(active.clone()));
            }
        }

        let mut stages = HashSet::new();
        for stage in &self.authentication {
            if !stages.insert(stage.name.as_str()) {
                return Err(ProjectError::DuplicateStage(stage.name.clone()));
            }
        }
        let mut functions = HashSet::new();
        for function in &self.functions {
            if !functions.insert(function.name.as_str()) {
                return Err(ProjectError::DuplicateFunction(function.name.clone()));
            }
        }

        for stage in &self.authentication {
            let mut targets = Vec::new();
            collect_next_stages(&stage.operations, &mut targets);
            if let Some(target) = targets.into_iter().find(|t| !stages.contains(t)) {
                return Err(ProjectError::UnknownNextStage {
                    stage: stage.name.clone(),
                    target: target.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn collect_next_stages<'a>(operations: &'a [Operation], targets: &mut Vec<&'a str>) {
    for operation in operations {
        match operation {
            Operation::Conditional {
                action, otherwise, ..
            } => {
                collect_next_stages(action, targets);
                collect_next_stages(otherwise, targets);
            }
            Operation::NextStage { stage: Some(stage) } => targets.push(stage),
            Operation::NextStage { stage: None } | Operation::Effect { .. } => {}
        }
    }
}
