//! Project layout configuration
//!
//! Describes where the pin lives, which files track upstream and how the host
//! build system is driven. Loaded from an optional TOML file; every field has
//! a default describing an Envoy dependency pinned in a Bazel project.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name looked up in the project root when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = ".pinroll.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub pin: PinConfig,
    pub files: FilesConfig,
    pub commands: CommandsConfig,
    pub remotes: RemotesConfig,
    pub signing: SigningPolicy,
}

/// The upstream project being vendored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Display name used in commit messages and branch names.
    pub name: String,
    pub repository: String,
    /// Source archive URL; `{commit}` is substituted.
    pub archive_url: String,
    /// Web URL of a commit; `{commit}` is substituted.
    pub commit_url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            name: "Envoy".to_string(),
            repository: "https://github.com/envoyproxy/envoy.git".to_string(),
            archive_url: "https://github.com/envoyproxy/envoy/archive/{commit}.tar.gz".to_string(),
            commit_url: "https://github.com/envoyproxy/envoy/commit/{commit}".to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn archive_url_for(&self, commit: &str) -> String {
        self.archive_url.replace("{commit}", commit)
    }

    pub fn commit_url_for(&self, commit: &str) -> String {
        self.commit_url.replace("{commit}", commit)
    }

    /// Lowercase name with non-alphanumerics collapsed to `-`.
    pub fn slug(&self) -> String {
        let mut slug = String::new();
        for c in self.name.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.ends_with('-') {
                slug.push('-');
            }
        }
        slug.trim_matches('-').to_string()
    }
}

/// Location of the pinned commit and checksum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PinConfig {
    /// Pin file relative to the project root.
    pub file: PathBuf,
    pub commit_key: String,
    pub checksum_key: String,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("bazel/repositories.bzl"),
            commit_key: "ENVOY_COMMIT".to_string(),
            checksum_key: "ENVOY_SHA".to_string(),
        }
    }
}

/// Files the project keeps in step with upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilesConfig {
    /// Kept byte-for-byte identical; copied over.
    pub copied: Vec<String>,
    /// Kept almost identical; upstream changes are patched in.
    pub shared: Vec<String>,
    /// Inline marker on lines where a shared file intentionally diverges.
    pub divergence_marker: String,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            copied: vec![
                ".bazelversion".to_string(),
                ".github/config.yml".to_string(),
                "ci/envoy_build_sha.sh".to_string(),
                "ci/run_envoy_docker.sh".to_string(),
            ],
            shared: vec![
                ".bazelrc".to_string(),
                "ci/docker-compose.yml".to_string(),
                "tools/code_format/config.yaml".to_string(),
                "tools/gen_compilation_database.py".to_string(),
            ],
            divergence_marker: "# unique".to_string(),
        }
    }
}

/// Host build system commands, each an argv run in the project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandsConfig {
    pub refresh_requirements: Vec<String>,
    pub build: Vec<String>,
    pub test: Vec<String>,
    pub docs: Vec<String>,
    pub format: Vec<String>,
    /// Run once before the search; skipped when absent.
    pub clean_cache: Option<Vec<String>>,
}

fn do_ci(target: &str) -> Vec<String> {
    vec!["./ci/do_ci.sh".to_string(), target.to_string()]
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            refresh_requirements: do_ci("fix_requirements"),
            build: do_ci("build"),
            test: do_ci("test"),
            docs: do_ci("fix_docs"),
            format: do_ci("fix_format"),
            clean_cache: Some(vec![
                "bazel".to_string(),
                "clean".to_string(),
                "--expunge".to_string(),
            ]),
        }
    }
}

/// Git remotes of the project checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemotesConfig {
    /// Remote tracking the canonical project repository.
    pub upstream: String,
    pub upstream_url: String,
    /// Personal remote the update branch is pushed to.
    pub push: String,
    pub default_branch: String,
}

impl Default for RemotesConfig {
    fn default() -> Self {
        Self {
            upstream: "upstream".to_string(),
            upstream_url: "https://github.com/envoyproxy/nighthawk".to_string(),
            push: "origin".to_string(),
            default_branch: "main".to_string(),
        }
    }
}

/// How commits made by the updater must be signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum SigningPolicy {
    /// No signing requirement.
    None,
    /// A tracked hook template must be installed as `.git/hooks/prepare-commit-msg`.
    PrepareCommitHook { template: PathBuf },
    /// `git config commit.gpgsign` must be `true`.
    Gpg,
}

impl Default for SigningPolicy {
    fn default() -> Self {
        SigningPolicy::PrepareCommitHook {
            template: PathBuf::from("support/hooks/prepare-commit-msg"),
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file that must exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content, path)
    }

    /// Load `<project_dir>/.pinroll.toml`, or defaults when it doesn't exist.
    pub fn load_for_project(project_dir: &Path) -> Result<Self, ConfigError> {
        let path = project_dir.join(DEFAULT_CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pin.commit_key.is_empty() || self.pin.checksum_key.is_empty() {
            return Err(ConfigError::Invalid(
                "pin.commit_key and pin.checksum_key must not be empty".to_string(),
            ));
        }
        if !self.upstream.archive_url.contains("{commit}") {
            return Err(ConfigError::Invalid(
                "upstream.archive_url must contain a {commit} placeholder".to_string(),
            ));
        }
        let commands = [
            ("refresh_requirements", &self.commands.refresh_requirements),
            ("build", &self.commands.build),
            ("test", &self.commands.test),
            ("docs", &self.commands.docs),
            ("format", &self.commands.format),
        ];
        for (name, argv) in commands {
            if argv.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "commands.{name} must not be empty"
                )));
            }
        }
        if matches!(&self.commands.clean_cache, Some(argv) if argv.is_empty()) {
            return Err(ConfigError::Invalid(
                "commands.clean_cache must be omitted rather than empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
