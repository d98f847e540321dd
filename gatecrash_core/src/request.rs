use crate::http::{HttpMethod, HttpRequest};
use crate::plugin::{Plugin, ResolveContext};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RequestError {
    #[error("Request has no method defined")]
    MissingMethod,
    #[error("Request defines both an absolute URL and a relative path")]
    UrlAndPath,
    #[error("Request defines neither an absolute URL nor a relative path")]
    NeitherUrlNorPath,
    #[error("Request uses a relative path '{path}' but no base URL is configured")]
    MissingBaseUrl { path: String },
    #[error("URL plugin '{name}' has no value")]
    UnresolvedUrl { name: String },
    #[error("Invalid request URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// A request field that is either fixed text or produced by a plugin.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Field {
    Text(String),
    Plugin(Plugin),
}

impl Field {
    pub fn resolve(&mut self, ctx: &ResolveContext<'_>) -> Option<String> {
        match self {
            Field::Text(text) => Some(text.clone()),
            Field::Plugin(plugin) => plugin.resolve(ctx),
        }
    }

    fn describe(&self) -> String {
        match self {
            Field::Text(text) => text.clone(),
            Field::Plugin(plugin) => plugin.name().to_string(),
        }
    }

    fn plugin(&self) -> Option<&Plugin> {
        match self {
            Field::Plugin(plugin) => Some(plugin),
            Field::Text(_) => None,
        }
    }

    fn plugin_mut(&mut self) -> Option<&mut Plugin> {
        match self {
            Field::Plugin(plugin) => Some(plugin),
            Field::Text(_) => None,
        }
    }
}

impl From<&str> for Field {
    fn from(text: &str) -> Self {
        Field::Text(text.to_string())
    }
}

impl From<Plugin> for Field {
    fn from(plugin: Plugin) -> Self {
        Field::Plugin(plugin)
    }
}

/// One body parameter. Either side may be a plugin; the entry is dropped
/// when either side has no value.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DataEntry {
    pub key: Field,
    pub value: Field,
}

impl DataEntry {
    pub fn new(key: impl Into<Field>, value: impl Into<Field>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The request half of a stage: plugins bound to HTTP fields.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RequestTemplate {
    #[serde(default)]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub url: Option<Field>,
    #[serde(default)]
    pub path: Option<Field>,
    #[serde(default)]
    pub cookies: Vec<Plugin>,
    #[serde(default)]
    pub headers: Vec<Plugin>,
    #[serde(default)]
    pub data: Vec<DataEntry>,
}

impl RequestTemplate {
    pub fn get(url: impl Into<Field>) -> Self {
        Self {
            method: Some(HttpMethod::Get),
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn post(url: impl Into<Field>) -> Self {
        Self {
            method: Some(HttpMethod::Post),
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Relative-path variant of [`RequestTemplate::get`].
    pub fn get_path(path: impl Into<Field>) -> Self {
        Self {
            method: Some(HttpMethod::Get),
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn post_path(path: impl Into<Field>) -> Self {
        Self {
            method: Some(HttpMethod::Post),
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_cookie(mut self, plugin: Plugin) -> Self {
        self.cookies.push(plugin);
        self
    }

    pub fn with_header(mut self, plugin: Plugin) -> Self {
        self.headers.push(plugin);
        self
    }

    pub fn with_data(mut self, key: impl Into<Field>, value: impl Into<Field>) -> Self {
        self.data.push(DataEntry::new(key, value));
        self
    }

    pub fn validate(&self) -> Result<HttpMethod, RequestError> {
        let method = self.method.ok_or(RequestError::MissingMethod)?;
        match (&self.url, &self.path) {
            (Some(_), Some(_)) => Err(RequestError::UrlAndPath),
            (None, None) => Err(RequestError::NeitherUrlNorPath),
            _ => Ok(method),
        }
    }

    /// All plugins this template reads from, in field order.
    pub fn inputs(&self) -> Vec<&Plugin> {
        let mut inputs: Vec<&Plugin> = Vec::new();
        inputs.extend(self.url.iter().chain(self.path.iter()).filter_map(Field::plugin));
        inputs.extend(self.cookies.iter());
        inputs.extend(self.headers.iter());
        for entry in &self.data {
            inputs.extend(entry.key.plugin());
            inputs.extend(entry.value.plugin());
        }
        inputs
    }

    pub fn has_inputs(&self) -> bool {
        !self.inputs().is_empty()
    }

    /// Finds an input plugin by name.
    pub fn input_mut(&mut self, name: &str) -> Option<&mut Plugin> {
        let fields = self
            .url
            .iter_mut()
            .chain(self.path.iter_mut())
            .chain(self.data.iter_mut().flat_map(|e| [&mut e.key, &mut e.value]))
            .filter_map(Field::plugin_mut);
        self.cookies
            .iter_mut()
            .chain(self.headers.iter_mut())
            .chain(fields)
            .find(|plugin| plugin.name() == name)
    }

    /// Resolves every plugin and builds the concrete request.
    ///
    /// Cookies and headers whose plugin has no value are omitted, as are body
    /// entries with an unset key or value. `user_agent` is sent unless the
    /// template sets its own `User-Agent` header.
    pub fn resolve(
        &mut self,
        ctx: &ResolveContext<'_>,
        base_url: Option<&str>,
        user_agent: &str,
    ) -> Result<HttpRequest, RequestError> {
        let method = self.validate()?;
        let url = self.resolve_url(ctx, base_url)?;
        let mut request = HttpRequest::new(method, url);

        for cookie in self.cookies.iter_mut() {
            if let Some(value) = cookie.resolve(ctx) {
                request.cookies.insert(cookie.name().to_string(), value);
            }
        }
        for header in self.headers.iter_mut() {
            if let Some(value) = header.resolve(ctx) {
                request.headers.insert(header.name().to_string(), value);
            }
        }
        if !request
            .headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case("user-agent"))
        {
            request
                .headers
                .insert("User-Agent".to_string(), user_agent.to_string());
        }
        for entry in self.data.iter_mut() {
            let key = entry.key.resolve(ctx);
            let value = entry.value.resolve(ctx);
            match (key, value) {
                (Some(key), Some(value)) => {
                    request.body.insert(key, value);
                }
                _ => debug!("Dropping body entry '{}' without a value", entry.key.describe()),
            }
        }

        Ok(request)
    }

    fn resolve_url(
        &mut self,
        ctx: &ResolveContext<'_>,
        base_url: Option<&str>,
    ) -> Result<String, RequestError> {
        match (&mut self.url, &mut self.path) {
            (Some(url), None) => {
                let url = url.resolve(ctx).ok_or_else(|| RequestError::UnresolvedUrl {
                    name: url.describe(),
                })?;
                Url::parse(&url).map_err(|e| invalid_url(&url, e))?;
                Ok(url)
            }
            (None, Some(path)) => {
                let resolved = path.resolve(ctx).ok_or_else(|| RequestError::UnresolvedUrl {
                    name: path.describe(),
                })?;
                let base = base_url.ok_or_else(|| RequestError::MissingBaseUrl {
                    path: resolved.clone(),
                })?;
                join_url(base, &resolved)
            }
            (Some(_), Some(_)) => Err(RequestError::UrlAndPath),
            (None, None) => Err(RequestError::NeitherUrlNorPath),
        }
    }
}

/// Resolves `reference` against `base` the way a browser follows a link: an
/// absolute path replaces the base path, a full URL replaces everything and
/// dot segments are collapsed.
fn join_url(base: &str, reference: &str) -> Result<String, RequestError> {
    let base = Url::parse(base).map_err(|e| invalid_url(base, e))?;
    let joined = base.join(reference).map_err(|e| invalid_url(reference, e))?;
    Ok(joined.to_string())
}

fn invalid_url(url: &str, error: url::ParseError) -> RequestError {
    RequestError::InvalidUrl {
        url: url.to_string(),
        reason: error.to_string(),
    }
}
