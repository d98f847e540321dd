use crate::flow::Output;
use crate::plugin::{SessionMap, ValueTarget};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No users defined")]
    NoUsers,
    #[error("User '{0}' is not defined")]
    UnknownUser(String),
    #[error("Session file {path:?} could not be accessed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Session file {path:?} is malformed: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One user's credentials and everything collected for them so far.
///
/// The three accumulators keep the last value written for each key. Header
/// keys are lower-cased on write.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Persisted part of a [`User`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionRecord {
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl User {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn set_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_lowercase(), value.into());
    }

    pub fn set_data(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.data.insert(name.into(), value.into());
    }

    /// Writes extracted outputs into the accumulator matching their target.
    /// Outputs without a value are skipped.
    pub fn absorb(&mut self, outputs: &[Output]) {
        for output in outputs {
            let Some(value) = &output.value else {
                debug!("Output '{}' has no value, not stored", output.name);
                continue;
            };
            match output.target {
                ValueTarget::Cookie => self.set_cookie(output.name.as_str(), value.as_str()),
                ValueTarget::Header => self.set_header(&output.name, value.as_str()),
                ValueTarget::Data => self.set_data(output.name.as_str(), value.as_str()),
            }
        }
    }

    /// Flattens the user into the mapping input plugins resolve against.
    /// Later sources win: credentials, then cookies, headers and data.
    pub fn to_map(&self) -> SessionMap {
        let mut map = SessionMap::new();
        map.insert("username".to_string(), self.username.clone());
        map.insert("password".to_string(), self.password.clone());
        for source in [&self.cookies, &self.headers, &self.data] {
            map.extend(source.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        map
    }

    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            cookies: self.cookies.clone(),
            headers: self.headers.clone(),
            data: self.data.clone(),
        }
    }

    pub fn restore(&mut self, record: SessionRecord) {
        self.cookies = record.cookies;
        self.headers = record.headers;
        self.data = record.data;
    }
}

/// All users of a project and which one is active.
#[derive(Debug, Clone)]
pub struct UserStore {
    users: Vec<User>,
    active: usize,
}

impl UserStore {
    pub fn new(users: Vec<User>) -> Result<Self, SessionError> {
        if users.is_empty() {
            return Err(SessionError::NoUsers);
        }
        Ok(Self { users, active: 0 })
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn get(&self, username: &str) -> Option<&User> {
        self.users.iter().find(|u| u.username == username)
    }

    pub fn active(&self) -> &User {
        &self.users[self.active]
    }

    pub fn active_mut(&mut self) -> &mut User {
        &mut self.users[self.active]
    }

    pub fn set_active(&mut self, username: &str) -> Result<(), SessionError> {
        let index = self
            .users
            .iter()
            .position(|u| u.username == username)
            .ok_or_else(|| SessionError::UnknownUser(username.to_string()))?;
        self.active = index;
        Ok(())
    }

    /// Writes `username -> {cookies, headers, data}` for every user as JSON.
    pub fn save_sessions(&self, path: &Path) -> Result<(), SessionError> {
        let records: BTreeMap<&str, SessionRecord> = self
            .users
            .iter()
            .map(|u| (u.username.as_str(), u.record()))
            .collect();
        let json = serde_json::to_string_pretty(&records).map_err(|source| SessionError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Saved {} sessions to {:?}", records.len(), path);
        Ok(())
    }

    /// Restores sessions written by [`UserStore::save_sessions`].
    ///
    /// # Returns
    /// The number of users restored. Entries for users the store does not
    /// know are skipped with a warning.
    pub fn load_sessions(&mut self, path: &Path) -> Result<usize, SessionError> {
        let content = std::fs::read_to_string(path).map_err(|source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let records: BTreeMap<String, SessionRecord> =
            serde_json::from_str(&content).map_err(|source| SessionError::Format {
                path: path.to_path_buf(),
                source,
            })?;

        let mut restored = 0;
        for (username, record) in records {
            match self.users.iter_mut().find(|u| u.username == username) {
                Some(user) => {
                    user.restore(record);
                    restored += 1;
                }
                None => warn!("Session for unknown user '{}' ignored", username),
            }
        }
        info!("Loaded {} sessions from {:?}", restored, path);
        Ok(restored)
    }
}
