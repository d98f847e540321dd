use crate::http::HttpResponse;
use crate::parsers;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::process::Command;
use tracing::{debug, warn};

/// Flat view of a user's session: username, password, cookies, headers and
/// data merged into one mapping. Input plugins resolve against it.
pub type SessionMap = BTreeMap<String, String>;

/// Where a plugin's value belongs: which session accumulator an extracted
/// output is written into.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ValueTarget {
    Cookie,
    Header,
    #[default]
    Data,
}

/// What a plugin needs in order to produce its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Produces its value from its own configuration.
    None,
    /// Reads its own name from the session.
    NeedsSessionData,
    /// Extracts its value from the last HTTP response.
    NeedsResponse,
    /// Derives its value from child plugins, resolved first.
    DependsOnPlugins,
}

/// Everything a plugin may consult while resolving.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub session: &'a SessionMap,
    pub response: Option<&'a HttpResponse>,
}

impl<'a> ResolveContext<'a> {
    /// Context for resolving request inputs: session only.
    pub fn inputs(session: &'a SessionMap) -> Self {
        Self {
            session,
            response: None,
        }
    }

    /// Context for extracting outputs after a request completed.
    pub fn outputs(session: &'a SessionMap, response: &'a HttpResponse) -> Self {
        Self {
            session,
            response: Some(response),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AlterAction {
    Prepend(String),
    Append(String),
    Replace { old: String, new: Replacement },
}

/// Replacement text for [`AlterAction::Replace`]: fixed text or the value of
/// another plugin.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Replacement {
    Text(String),
    Plugin(Box<Plugin>),
}

/// One piece of a [`PluginKind::Combine`] value.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Part {
    Text(String),
    Plugin(Plugin),
}

/// The closed set of plugin behaviours. The capability of a plugin follows
/// from its kind, see [`PluginKind::capability`].
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PluginKind {
    Value {
        #[serde(default)]
        value: Option<String>,
    },
    Variable,
    Prompt,
    Command {
        command: String,
    },
    BasicAuth {
        username: String,
        password: String,
    },
    Regex {
        regex: String,
        #[serde(default)]
        group: usize,
    },
    Html {
        tag: String,
        #[serde(default)]
        attributes: BTreeMap<String, String>,
        extract: String,
    },
    Json {
        path: String,
    },
    ResponseCookie,
    ResponseHeader,
    Alter {
        parent: Box<Plugin>,
        action: AlterAction,
    },
    Combine {
        parts: Vec<Part>,
    },
    UrlParser {
        parent: Box<Plugin>,
        element: String,
    },
    JsonFrom {
        parent: Box<Plugin>,
        path: String,
    },
    BearerAuth {
        token: Box<Plugin>,
    },
    Alias {
        parent: Box<Plugin>,
    },
}

impl PluginKind {
    pub fn capability(&self) -> Capability {
        match self {
            PluginKind::Value { .. }
            | PluginKind::Prompt
            | PluginKind::Command { .. }
            | PluginKind::BasicAuth { .. } => Capability::None,
            PluginKind::Variable => Capability::NeedsSessionData,
            PluginKind::Regex { .. }
            | PluginKind::Html { .. }
            | PluginKind::Json { .. }
            | PluginKind::ResponseCookie
            | PluginKind::ResponseHeader => Capability::NeedsResponse,
            PluginKind::Alter { .. }
            | PluginKind::Combine { .. }
            | PluginKind::UrlParser { .. }
            | PluginKind::JsonFrom { .. }
            | PluginKind::BearerAuth { .. }
            | PluginKind::Alias { .. } => Capability::DependsOnPlugins,
        }
    }

    fn default_target(&self) -> ValueTarget {
        match self {
            PluginKind::ResponseCookie => ValueTarget::Cookie,
            PluginKind::ResponseHeader | PluginKind::BasicAuth { .. } | PluginKind::BearerAuth { .. } => {
                ValueTarget::Header
            }
            _ => ValueTarget::Data,
        }
    }
}

/// A named value producer.
///
/// Plugins are plain data: the same plugin definition can appear in several
/// request templates, and values flow between them through the session under
/// the plugin's name. The cached value only lives for one resolution pass.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Plugin {
    name: String,
    #[serde(default)]
    target: Option<ValueTarget>,
    #[serde(flatten)]
    kind: PluginKind,
    #[serde(skip)]
    value: Option<String>,
}

impl Plugin {
    pub fn new(name: impl Into<String>, kind: PluginKind) -> Self {
        Self {
            name: name.into(),
            target: None,
            kind,
            value: None,
        }
    }

    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(
            name,
            PluginKind::Value {
                value: Some(value.into()),
            },
        )
    }

    /// A plugin whose value is unset until it is assigned.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, PluginKind::Value { value: None })
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Self::new(name, PluginKind::Variable)
    }

    pub fn prompt(name: impl Into<String>) -> Self {
        Self::new(name, PluginKind::Prompt)
    }

    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(
            name,
            PluginKind::Command {
                command: command.into(),
            },
        )
    }

    pub fn regex(name: impl Into<String>, regex: impl Into<String>) -> Self {
        Self::regex_group(name, regex, 0)
    }

    pub fn regex_group(name: impl Into<String>, regex: impl Into<String>, group: usize) -> Self {
        Self::new(
            name,
            PluginKind::Regex {
                regex: regex.into(),
                group,
            },
        )
    }

    pub fn html(
        name: impl Into<String>,
        tag: impl Into<String>,
        attributes: BTreeMap<String, String>,
        extract: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            PluginKind::Html {
                tag: tag.into(),
                attributes,
                extract: extract.into(),
            },
        )
    }

    pub fn json(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(name, PluginKind::Json { path: path.into() })
    }

    pub fn cookie(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::literal(name, value).with_target(ValueTarget::Cookie)
    }

    pub fn cookie_from_response(name: impl Into<String>) -> Self {
        Self::new(name, PluginKind::ResponseCookie)
    }

    pub fn cookie_from_plugin(name: impl Into<String>, parent: Plugin) -> Self {
        Self::new(
            name,
            PluginKind::Alias {
                parent: Box::new(parent),
            },
        )
        .with_target(ValueTarget::Cookie)
    }

    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::literal(name, value).with_target(ValueTarget::Header)
    }

    pub fn header_from_response(name: impl Into<String>) -> Self {
        Self::new(name, PluginKind::ResponseHeader)
    }

    pub fn header_from_plugin(name: impl Into<String>, parent: Plugin) -> Self {
        Self::new(
            name,
            PluginKind::Alias {
                parent: Box::new(parent),
            },
        )
        .with_target(ValueTarget::Header)
    }

    /// `Authorization: Basic base64(username:password)`.
    pub fn basic_auth(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(
            "Authorization",
            PluginKind::BasicAuth {
                username: username.into(),
                password: password.into(),
            },
        )
    }

    /// `Authorization: Bearer <token>`, the token taken from another plugin.
    pub fn bearer_auth(token: Plugin) -> Self {
        Self::new(
            "Authorization",
            PluginKind::BearerAuth {
                token: Box::new(token),
            },
        )
    }

    pub fn alter(name: impl Into<String>, parent: Plugin, action: AlterAction) -> Self {
        Self::new(
            name,
            PluginKind::Alter {
                parent: Box::new(parent),
                action,
            },
        )
    }

    pub fn combine(name: impl Into<String>, parts: Vec<Part>) -> Self {
        Self::new(name, PluginKind::Combine { parts })
    }

    pub fn url_parser(name: impl Into<String>, parent: Plugin, element: impl Into<String>) -> Self {
        Self::new(
            name,
            PluginKind::UrlParser {
                parent: Box::new(parent),
                element: element.into(),
            },
        )
    }

    pub fn json_from_plugin(name: impl Into<String>, parent: Plugin, path: impl Into<String>) -> Self {
        Self::new(
            name,
            PluginKind::JsonFrom {
                parent: Box::new(parent),
                path: path.into(),
            },
        )
    }

    pub fn with_target(mut self, target: ValueTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &PluginKind {
        &self.kind
    }

    /// The value produced by the last resolution pass.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn capability(&self) -> Capability {
        self.kind.capability()
    }

    /// Explicit target, or the one implied by the kind (response cookies are
    /// cookies, authorization plugins are headers, everything else is data).
    pub fn target(&self) -> ValueTarget {
        self.target.unwrap_or_else(|| self.kind.default_target())
    }

    /// Key this plugin reads from and writes to in the session. Header keys
    /// are stored lower-cased.
    pub fn session_key(&self) -> String {
        match self.target() {
            ValueTarget::Header => self.name.to_lowercase(),
            _ => self.name.clone(),
        }
    }

    /// Turns the plugin into a plain value holding its current value, so it
    /// no longer resolves anything by itself.
    pub fn pin(&mut self) {
        self.kind = PluginKind::Value {
            value: self.value.clone(),
        };
    }

    /// Pins the plugin to `value`.
    pub fn assign(&mut self, value: impl Into<String>) {
        let value = value.into();
        self.kind = PluginKind::Value {
            value: Some(value.clone()),
        };
        self.value = Some(value);
    }

    /// Resolves the plugin, caching and returning its value.
    ///
    /// Children of a `DependsOnPlugins` plugin are resolved in declaration
    /// order before the plugin's own function runs, each exactly once. A
    /// `NeedsResponse` plugin resolved without a response reads its own name
    /// from the session, which is how extracted values reach later requests.
    pub fn resolve(&mut self, ctx: &ResolveContext<'_>) -> Option<String> {
        let value = match self.capability() {
            Capability::None => self.produce(),
            Capability::NeedsSessionData => self.lookup(ctx.session),
            Capability::NeedsResponse => match ctx.response {
                Some(response) => self.extract(response),
                None => self.lookup(ctx.session),
            },
            Capability::DependsOnPlugins => self.derive(ctx),
        };
        if value.is_none() {
            debug!("Plugin '{}' resolved to no value", self.name);
        }
        self.value = value.clone();
        value
    }

    fn lookup(&self, session: &SessionMap) -> Option<String> {
        session.get(&self.session_key()).cloned()
    }

    fn produce(&self) -> Option<String> {
        match &self.kind {
            PluginKind::Value { value } => value.clone(),
            PluginKind::Prompt => prompt_for(&self.name),
            PluginKind::Command { command } => run_command(command),
            PluginKind::BasicAuth { username, password } => Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{username}:{password}"))
            )),
            _ => None,
        }
    }

    fn extract(&self, response: &HttpResponse) -> Option<String> {
        let value = match &self.kind {
            PluginKind::Regex { regex, group } => parsers::regex_search(&response.body, regex, *group),
            PluginKind::Html {
                tag,
                attributes,
                extract,
            } => parsers::html_search(&response.body, tag, attributes, extract),
            PluginKind::Json { path } => parsers::json_lookup(&response.body, path),
            PluginKind::ResponseCookie => response.cookies.get(&self.name).cloned(),
            PluginKind::ResponseHeader => response.header(&self.name).map(str::to_string),
            _ => None,
        };
        if value.is_none() {
            warn!("Couldn't extract '{}' from the response", self.name);
        }
        value
    }

    fn derive(&mut self, ctx: &ResolveContext<'_>) -> Option<String> {
        match &mut self.kind {
            PluginKind::Alter { parent, action } => {
                let base = parent.resolve(ctx);
                let replacement = match action {
                    AlterAction::Replace {
                        new: Replacement::Plugin(plugin),
                        ..
                    } => plugin.resolve(ctx),
                    AlterAction::Replace {
                        new: Replacement::Text(text),
                        ..
                    } => Some(text.clone()),
                    _ => None,
                };
                let base = base?;
                match action {
                    AlterAction::Prepend(text) => Some(format!("{text}{base}")),
                    AlterAction::Append(text) => Some(format!("{base}{text}")),
                    AlterAction::Replace { old, .. } => Some(base.replace(old.as_str(), &replacement?)),
                }
            }
            PluginKind::Combine { parts } => {
                let mut combined = String::new();
                let mut complete = true;
                for part in parts.iter_mut() {
                    match part {
                        Part::Text(text) => combined.push_str(text),
                        Part::Plugin(plugin) => match plugin.resolve(ctx) {
                            Some(value) => combined.push_str(&value),
                            None => complete = false,
                        },
                    }
                }
                complete.then_some(combined)
            }
            PluginKind::UrlParser { parent, element } => {
                let url = parent.resolve(ctx)?;
                parsers::url_component(&url, element)
            }
            PluginKind::JsonFrom { parent, path } => {
                let document = parent.resolve(ctx)?;
                parsers::json_lookup(&document, path)
            }
            PluginKind::BearerAuth { token } => token.resolve(ctx).map(|t| format!("Bearer {t}")),
            PluginKind::Alias { parent } => parent.resolve(ctx),
            _ => None,
        }
    }
}

fn prompt_for(name: &str) -> Option<String> {
    let mut stderr = std::io::stderr();
    if write!(stderr, "Please provide the input value for '{name}': ").is_err() {
        return None;
    }
    let _ = stderr.flush();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        Err(e) => {
            warn!("Failed to read value for '{}': {}", name, e);
            None
        }
    }
}

fn run_command(command: &str) -> Option<String> {
    debug!("Running command: {}", command);
    match Command::new("sh").arg("-c").arg(command).output() {
        Ok(output) => {
            if !output.status.success() {
                warn!("Command '{}' exited with {}", command, output.status);
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            Some(stdout.trim_end_matches(['\r', '\n']).to_string())
        }
        Err(e) => {
            warn!("Failed to run command '{}': {}", command, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(pairs: &[(&str, &str)]) -> SessionMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn capability_follows_the_kind() {
        assert_eq!(Plugin::literal("a", "b").capability(), Capability::None);
        assert_eq!(Plugin::variable("username").capability(), Capability::NeedsSessionData);
        assert_eq!(Plugin::json("t", "a.b").capability(), Capability::NeedsResponse);
        assert_eq!(
            Plugin::bearer_auth(Plugin::json("t", "a")).capability(),
            Capability::DependsOnPlugins
        );
    }

    #[test]
    fn variable_reads_its_own_name() {
        let store = session(&[("username", "alice")]);
        let mut plugin = Plugin::variable("username");
        assert_eq!(plugin.resolve(&ResolveContext::inputs(&store)).as_deref(), Some("alice"));
        assert_eq!(plugin.value(), Some("alice"));

        let mut missing = Plugin::variable("password");
        assert_eq!(missing.resolve(&ResolveContext::inputs(&store)), None);
    }

    #[test]
    fn resolution_is_idempotent() {
        let store = SessionMap::new();
        let response = HttpResponse::new(200, r#"{"token":{"access":"abc123"}}"#);
        let ctx = ResolveContext::outputs(&store, &response);
        let mut plugin = Plugin::alter(
            "auth",
            Plugin::json("access", "token.access"),
            AlterAction::Prepend("tok-".to_string()),
        );
        let first = plugin.resolve(&ctx);
        let second = plugin.resolve(&ctx);
        assert_eq!(first.as_deref(), Some("tok-abc123"));
        assert_eq!(first, second);
    }

    #[test]
    fn extracted_value_is_reused_from_the_session_without_a_response() {
        let store = session(&[("access_token", "from-earlier-stage")]);
        let mut plugin = Plugin::json("access_token", "token.access");
        assert_eq!(
            plugin.resolve(&ResolveContext::inputs(&store)).as_deref(),
            Some("from-earlier-stage")
        );

        let header_store = session(&[("x-csrf", "abc")]);
        let mut header = Plugin::header_from_response("X-CSRF");
        assert_eq!(header.target(), ValueTarget::Header);
        assert_eq!(
            header.resolve(&ResolveContext::inputs(&header_store)).as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn response_cookies_and_headers_are_extracted_by_name() {
        let store = SessionMap::new();
        let response = HttpResponse::new(302, "")
            .with_cookie("session", "s3cr3t")
            .with_header("Location", "https://app.test/cb?code=xyz");
        let ctx = ResolveContext::outputs(&store, &response);

        let mut cookie = Plugin::cookie_from_response("session");
        assert_eq!(cookie.resolve(&ctx).as_deref(), Some("s3cr3t"));
        assert_eq!(cookie.target(), ValueTarget::Cookie);

        let mut code = Plugin::url_parser("code", Plugin::header_from_response("location"), "query.code");
        assert_eq!(code.resolve(&ctx).as_deref(), Some("xyz"));
        assert_eq!(code.target(), ValueTarget::Data);

        let relative = HttpResponse::new(302, "").with_header("Location", "/dashboard?code=rel-1");
        let mut code = Plugin::url_parser("code", Plugin::header_from_response("location"), "query.code");
        assert_eq!(
            code.resolve(&ResolveContext::outputs(&store, &relative)).as_deref(),
            Some("rel-1")
        );
    }

    #[test]
    fn missing_extraction_leaves_value_unset() {
        let store = SessionMap::new();
        let response = HttpResponse::new(200, r#"{"token":{}}"#);
        let mut plugin = Plugin::json("access", "token.access");
        plugin.value = Some("stale".to_string());
        assert_eq!(plugin.resolve(&ResolveContext::outputs(&store, &response)), None);
        assert_eq!(plugin.value(), None, "A new pass must overwrite the cached value");
    }

    #[test]
    fn alter_and_combine_build_on_children() {
        let store = session(&[("username", "bob"), ("nonce", "n-1")]);
        let ctx = ResolveContext::inputs(&store);

        let mut appended = Plugin::alter(
            "user_suffix",
            Plugin::variable("username"),
            AlterAction::Append("@corp".to_string()),
        );
        assert_eq!(appended.resolve(&ctx).as_deref(), Some("bob@corp"));

        let mut replaced = Plugin::alter(
            "path",
            Plugin::literal("template", "/users/ID/profile"),
            AlterAction::Replace {
                old: "ID".to_string(),
                new: Replacement::Plugin(Box::new(Plugin::variable("username"))),
            },
        );
        assert_eq!(replaced.resolve(&ctx).as_deref(), Some("/users/bob/profile"));

        let mut combined = Plugin::combine(
            "combo",
            vec![
                Part::Plugin(Plugin::variable("username")),
                Part::Text(":".to_string()),
                Part::Plugin(Plugin::variable("nonce")),
            ],
        );
        assert_eq!(combined.resolve(&ctx).as_deref(), Some("bob:n-1"));

        let mut incomplete = Plugin::combine(
            "combo",
            vec![Part::Plugin(Plugin::variable("missing")), Part::Text("x".to_string())],
        );
        assert_eq!(incomplete.resolve(&ctx), None);
    }

    #[test]
    fn authorization_headers() {
        let store = session(&[("access_token", "abc")]);
        let ctx = ResolveContext::inputs(&store);

        let mut basic = Plugin::basic_auth("admin", "hunter2");
        assert_eq!(basic.resolve(&ctx).as_deref(), Some("Basic YWRtaW46aHVudGVyMg=="));
        assert_eq!(basic.name(), "Authorization");
        assert_eq!(basic.session_key(), "authorization");

        let mut bearer = Plugin::bearer_auth(Plugin::json("access_token", "access_token"));
        assert_eq!(bearer.resolve(&ctx).as_deref(), Some("Bearer abc"));
    }

    #[test]
    fn each_child_is_resolved_exactly_once_per_pass() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls");
        let child = Plugin::command(
            "nonce",
            format!("echo call >> {}; echo n0nce", log.display()),
        );
        let mut parent = Plugin::combine(
            "signed",
            vec![Part::Plugin(child), Part::Text("-sig".to_string())],
        );

        let store = SessionMap::new();
        assert_eq!(
            parent.resolve(&ResolveContext::inputs(&store)).as_deref(),
            Some("n0nce-sig")
        );
        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.lines().count(), 1, "Child ran {} times", calls.lines().count());
    }

    #[test]
    fn pin_and_assign_make_a_plugin_plain() {
        let store = session(&[("q", "from-session")]);
        let ctx = ResolveContext::inputs(&store);
        let mut plugin = Plugin::variable("q");
        plugin.resolve(&ctx);
        plugin.pin();
        assert_eq!(plugin.capability(), Capability::None);
        assert_eq!(plugin.resolve(&ctx).as_deref(), Some("from-session"));

        plugin.assign("fuzzed");
        assert_eq!(plugin.resolve(&ctx).as_deref(), Some("fuzzed"));
    }

    #[test]
    fn plugins_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Holder {
            plugins: Vec<Plugin>,
        }
        let holder: Holder = toml::from_str(
            r#"
            [[plugins]]
            name = "csrf"
            type = "html"
            tag = "input"
            extract = "value"
            attributes = { name = "csrf_token" }

            [[plugins]]
            name = "session"
            type = "response-cookie"

            [[plugins]]
            name = "Authorization"
            type = "bearer-auth"
            token = { name = "access_token", type = "json", path = "token.access" }

            [[plugins]]
            name = "redirect"
            type = "alter"
            action = { replace = { old = "http:", new = "https:" } }
            parent = { name = "location", type = "response-header" }

            [[plugins]]
            name = "mfa"
            type = "value"
            target = "cookie"
            value = "1"
            "#,
        )
        .unwrap();

        let kinds: Vec<Capability> = holder.plugins.iter().map(Plugin::capability).collect();
        assert_eq!(
            kinds,
            vec![
                Capability::NeedsResponse,
                Capability::NeedsResponse,
                Capability::DependsOnPlugins,
                Capability::DependsOnPlugins,
                Capability::None,
            ]
        );
        assert_eq!(holder.plugins[1].target(), ValueTarget::Cookie);
        assert_eq!(holder.plugins[2].target(), ValueTarget::Header);
        assert_eq!(holder.plugins[4].target(), ValueTarget::Cookie);
        assert_eq!(
            holder.plugins[3].kind(),
            &PluginKind::Alter {
                parent: Box::new(Plugin::header_from_response("location")),
                action: AlterAction::Replace {
                    old: "http:".to_string(),
                    new: Replacement::Text("https:".to_string()),
                },
            }
        );
    }
}
