//! Plugin resolution: parse the job's plugin specification, check each
//! plugin out into an agent-scoped directory, validate configuration,
//! and project configuration into the environment its hooks see.
//!
//! Checkouts land in `<pluginsRoot>/<agentName>/<id>` where `id` is a
//! stable digest of location and version, so concurrent workers with
//! distinct agent names never contend. Cloning happens in a temp
//! sibling directory followed by an atomic rename, so a half-populated
//! plugin directory is never observable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rigger_env::Environment;
use rigger_retry::{Attempt, Retrier, RetryConfig};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::JobConfig;
use crate::git;
use crate::logger::JobLogger;
use crate::shell::Shell;

/// One reference from the job's plugin specification.
#[derive(Debug, Clone, PartialEq)]
pub struct Plugin {
    /// Source location as written in the pipeline, e.g.
    /// `github.com/acme/cache-plugin` or `./.ci/plugins/local-one`.
    pub location: String,
    /// Version spec after `#`, empty for the default branch.
    pub version: String,
    pub configuration: serde_json::Map<String, Value>,
}

impl Plugin {
    /// Parse the JSON plugin specification: an array whose elements are
    /// either a location string or a single-key object mapping location
    /// to a configuration map.
    pub fn parse_spec(spec: &str) -> Result<Vec<Plugin>> {
        if spec.trim().is_empty() {
            return Ok(Vec::new());
        }
        let doc: Value = serde_json::from_str(spec).context("plugin spec is not valid JSON")?;
        let Value::Array(entries) = doc else {
            bail!("plugin spec must be a JSON array");
        };

        let mut plugins = Vec::new();
        for entry in entries {
            match entry {
                Value::String(reference) => plugins.push(Self::from_reference(&reference, None)?),
                Value::Object(map) => {
                    if map.len() != 1 {
                        bail!("plugin entries must have exactly one location key, got {}", map.len());
                    }
                    let (reference, config) = map.into_iter().next().expect("len checked");
                    let configuration = match config {
                        Value::Object(m) => Some(m),
                        Value::Null => None,
                        other => bail!("plugin configuration for {reference} must be a map, got {other}"),
                    };
                    plugins.push(Self::from_reference(&reference, configuration)?);
                }
                other => bail!("unexpected plugin entry: {other}"),
            }
        }
        Ok(plugins)
    }

    fn from_reference(reference: &str, configuration: Option<serde_json::Map<String, Value>>) -> Result<Plugin> {
        let reference = reference.trim();
        if reference.is_empty() {
            bail!("plugin location is empty");
        }
        let (location, version) = match reference.rsplit_once('#') {
            Some((loc, ver)) => (loc.to_string(), ver.to_string()),
            None => (reference.to_string(), String::new()),
        };
        Ok(Plugin {
            location,
            version,
            configuration: configuration.unwrap_or_default(),
        })
    }

    /// Vendored plugins live inside the job's own checkout.
    pub fn vendored(&self) -> bool {
        self.location.starts_with("./") || self.location.starts_with(".\\")
    }

    /// URL to clone the plugin from.
    pub fn repository(&self) -> String {
        if self.location.contains("://") || self.location.starts_with("git@") {
            self.location.clone()
        } else {
            format!("https://{}", self.location)
        }
    }

    /// Short name: the last path segment, without `.git` or the
    /// conventional `-buildkite-plugin` suffix.
    pub fn name(&self) -> String {
        let last = self
            .location
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.location);
        let last = last.strip_suffix(".git").unwrap_or(last);
        last.strip_suffix("-buildkite-plugin").unwrap_or(last).to_string()
    }

    /// Stable checkout id: digest of location and version.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.location.as_bytes());
        hasher.update(b"#");
        hasher.update(self.version.as_bytes());
        hex::encode(hasher.finalize())[..12].to_string()
    }

    /// Human-readable reference for logs.
    pub fn label(&self) -> String {
        if self.version.is_empty() {
            self.location.clone()
        } else {
            format!("{}#{}", self.location, self.version)
        }
    }

    /// Project the configuration map into the environment this plugin's
    /// hooks run with. Both the current and the legacy slug scheme are
    /// emitted during the deprecation window; the returned flag reports
    /// whether they differed (the caller logs a warning).
    pub fn configuration_env(&self) -> (Environment, bool) {
        let mut env = Environment::new();
        let name = self.name();
        let new_prefix = format!("BUILDKITE_PLUGIN_{}", slug(&name));
        let legacy_prefix = format!("BUILDKITE_PLUGIN_{}", legacy_slug(&name));
        let schemes_differ = new_prefix != legacy_prefix;

        env.set("BUILDKITE_PLUGIN_NAME", slug(&name));
        if !self.configuration.is_empty() {
            env.set(
                "BUILDKITE_PLUGIN_CONFIGURATION",
                Value::Object(self.configuration.clone()).to_string(),
            );
        }

        for (key, value) in &self.configuration {
            project(&mut env, &format!("{new_prefix}_{}", slug(key)), value);
            if schemes_differ {
                project(&mut env, &format!("{legacy_prefix}_{}", legacy_slug(key)), value);
            }
        }
        (env, schemes_differ)
    }
}

/// Current slug scheme: uppercase, every run of non-alphanumerics
/// collapses to one underscore.
fn slug(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_sep = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_uppercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out
}

/// Legacy slug scheme: every non-alphanumeric character becomes its own
/// underscore.
fn legacy_slug(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn project(env: &mut Environment, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                project(env, &format!("{prefix}_{}", slug(k)), v);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                project(env, &format!("{prefix}_{i}"), v);
            }
        }
        Value::String(s) => env.set(prefix, s.clone()),
        Value::Bool(b) => env.set(prefix, b.to_string()),
        Value::Number(n) => env.set(prefix, n.to_string()),
        Value::Null => {}
    }
}

/// A plugin resolved to a directory on disk.
#[derive(Debug)]
pub struct PluginCheckout {
    pub plugin: Plugin,
    pub checkout_dir: PathBuf,
}

impl PluginCheckout {
    /// The directory searched for this plugin's hooks.
    pub fn hooks_dir(&self) -> PathBuf {
        self.checkout_dir.join("hooks")
    }
}

/// Definition file (`plugin.yml`) shipped inside a plugin checkout.
#[derive(Debug, Default, serde::Deserialize)]
pub struct PluginDefinition {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub configuration: Option<Value>,
}

impl PluginDefinition {
    pub fn load(checkout_dir: &Path) -> Result<Option<PluginDefinition>> {
        for candidate in ["plugin.yml", "plugin.yaml", "plugin.json"] {
            let path = checkout_dir.join(candidate);
            if !path.is_file() {
                continue;
            }
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let parsed = if candidate.ends_with(".json") {
                serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))?
            } else {
                serde_yaml::from_str(&raw).with_context(|| format!("invalid YAML in {}", path.display()))?
            };
            return Ok(Some(parsed));
        }
        Ok(None)
    }

    /// Validate a configuration map against this definition's
    /// `configuration` schema: required keys must be present, and when
    /// properties are declared, unknown keys are rejected.
    pub fn validate(&self, configuration: &serde_json::Map<String, Value>) -> Result<()> {
        let Some(schema) = &self.configuration else {
            return Ok(());
        };

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !configuration.contains_key(key) {
                    bail!("missing required configuration key: {key}");
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for key in configuration.keys() {
                if !properties.contains_key(key) {
                    bail!("unknown configuration key: {key}");
                }
            }
        }
        Ok(())
    }
}

/// Checks plugins out and resolves their directories.
pub struct PluginLoader<'a> {
    pub config: &'a JobConfig,
}

impl PluginLoader<'_> {
    /// Resolve every non-vendored plugin in the job's specification.
    pub fn load(&self, shell: &mut Shell, logger: &mut dyn JobLogger) -> Result<Vec<PluginCheckout>> {
        let mut checkouts = Vec::new();
        for plugin in Plugin::parse_spec(&self.config.plugins)? {
            if plugin.vendored() {
                continue;
            }
            logger.info(&format!("Plugin {}", plugin.label()));
            let dir = self.checkout_plugin(shell, logger, &plugin)?;
            self.validate(logger, &plugin, &dir)?;
            checkouts.push(PluginCheckout {
                plugin,
                checkout_dir: dir,
            });
        }
        Ok(checkouts)
    }

    /// Resolve vendored plugins against the job's checkout root. Runs
    /// after the checkout phase, once their content exists.
    pub fn resolve_vendored(
        &self,
        logger: &mut dyn JobLogger,
        checkout_root: &Path,
    ) -> Result<Vec<PluginCheckout>> {
        let mut checkouts = Vec::new();
        for plugin in Plugin::parse_spec(&self.config.plugins)? {
            if !plugin.vendored() {
                continue;
            }
            let dir = checkout_root.join(&plugin.location);
            if !dir.is_dir() {
                bail!(
                    "vendored plugin {} not found at {}",
                    plugin.label(),
                    dir.display()
                );
            }
            let dir = dir
                .canonicalize()
                .with_context(|| format!("failed to resolve {}", dir.display()))?;
            let canonical_root = checkout_root.canonicalize().unwrap_or_else(|_| checkout_root.to_path_buf());
            if !dir.starts_with(&canonical_root) {
                bail!(
                    "vendored plugin {} escapes the checkout: {}",
                    plugin.label(),
                    dir.display()
                );
            }
            self.validate(logger, &plugin, &dir)?;
            checkouts.push(PluginCheckout {
                plugin,
                checkout_dir: dir,
            });
        }
        Ok(checkouts)
    }

    fn plugin_dir(&self, plugin: &Plugin) -> PathBuf {
        let mut dir = self.config.plugins_path.clone();
        if !self.config.agent_name.is_empty() {
            dir = dir.join(&self.config.agent_name);
        }
        dir.join(plugin.id())
    }

    fn checkout_plugin(
        &self,
        shell: &mut Shell,
        logger: &mut dyn JobLogger,
        plugin: &Plugin,
    ) -> Result<PathBuf> {
        let dir = self.plugin_dir(plugin);

        // Without an agent-name namespace, concurrent workers share the
        // plugin directory and must serialise on a lock.
        let _lock = if self.config.agent_name.is_empty() {
            let mut lock_path = dir.as_os_str().to_os_string();
            lock_path.push(".lock");
            Some(
                shell
                    .lock_file(PathBuf::from(lock_path), self.config.plugin_lock_timeout)
                    .context("failed to lock plugin directory")?,
            )
        } else {
            None
        };

        if self.config.plugins_always_clone_fresh && dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove {}", dir.display()))?;
        }

        if dir.join(".git").exists() {
            match shell.run_and_capture("git", &["-C", &dir.display().to_string(), "rev-parse", "--short", "HEAD"]) {
                Ok(commit) => logger.info(&format!("Plugin already checked out at {commit}")),
                Err(e) => logger.warn(&format!("Could not read plugin commit: {e}")),
            }
            return Ok(dir);
        }

        if self.config.ssh_keyscan
            && let Some(home) = shell.env.get("HOME").map(PathBuf::from)
            && let Err(e) =
                git::add_host_to_known_hosts(shell, &plugin.repository(), home.join(".ssh/known_hosts"))
        {
            logger.warn(&format!("Could not scan plugin host key: {e:#}"));
        }

        let parent = dir.parent().context("plugin dir has no parent")?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        // Clone into a temp sibling, then rename into place, so a
        // concurrent cleanup can never observe a half-populated plugin.
        let staging = tempfile::Builder::new()
            .prefix("plugin-checkout")
            .tempdir_in(parent)
            .context("failed to create plugin staging dir")?;
        let staging_repo = staging.path().join("repo");
        let repository = plugin.repository();

        let retrier = Retrier::new(RetryConfig::constant(3, Duration::from_secs(2)));
        retrier
            .run(|attempt| {
                if attempt > 1 {
                    debug!(attempt, plugin = %plugin.label(), "retrying plugin clone");
                    let _ = std::fs::remove_dir_all(&staging_repo);
                }
                let staging_str = staging_repo.display().to_string();
                match shell.run("git", &["clone", "-v", "--", &repository, &staging_str]) {
                    Ok(()) => Attempt::Done(()),
                    Err(e) => Attempt::Retry(e),
                }
            })
            .with_context(|| format!("failed to clone plugin {}", plugin.label()))?;

        if !plugin.version.is_empty() {
            let staging_str = staging_repo.display().to_string();
            shell
                .run("git", &["-C", &staging_str, "checkout", "-f", &plugin.version])
                .with_context(|| {
                    format!("failed to check out {} of plugin {}", plugin.version, plugin.location)
                })?;
        }

        match std::fs::rename(&staging_repo, &dir) {
            Ok(()) => {}
            // Lost the race to another worker; its checkout is as good.
            Err(_) if dir.join(".git").exists() => {}
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to move plugin into {}", dir.display())));
            }
        }
        Ok(dir)
    }

    fn validate(&self, logger: &mut dyn JobLogger, plugin: &Plugin, dir: &Path) -> Result<()> {
        if !self.config.plugin_validation {
            return Ok(());
        }
        match PluginDefinition::load(dir)? {
            None => {
                logger.warn(&format!(
                    "Plugin {} has no definition file, skipping validation",
                    plugin.label()
                ));
                Ok(())
            }
            Some(definition) => definition
                .validate(&plugin.configuration)
                .with_context(|| format!("invalid configuration for plugin {}", plugin.label())),
        }
    }
}
