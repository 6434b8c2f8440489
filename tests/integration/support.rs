//! A scripted stand-in for git, the upstream clone and the project's build.
//!
//! The build "passes" when the commit currently written into the pin file is
//! one of the first `clean_count` upstream commits, so verdicts follow from
//! what the pipeline actually wrote.

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};

use pinroll::config::{Config, SigningPolicy};
use pinroll::integration::pin_file::read_value;
use pinroll::integration::StaticArchiveSource;
use pinroll::logging::init_test_logging;
use pinroll::process::{CommandFailure, CommandRunner, CommandSpec, FailureReason};
use tempfile::TempDir;

pub const PIN: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const COMMIT_TIME: &str = "1700000000";
pub const PUSH_URL: &str = "git@github.com:dev/nighthawk.git";

/// The `i`th upstream commit after the pin.
pub fn commit_id(i: usize) -> String {
    format!("{:040x}", i + 1)
}

pub fn commits(n: usize) -> Vec<String> {
    (0..n).map(commit_id).collect()
}

/// Default layout with signing disabled.
pub fn test_layout() -> Config {
    Config {
        signing: SigningPolicy::None,
        ..Config::default()
    }
}

/// Archives for every commit, so checksums can always be computed.
pub fn archives_for(layout: &Config, commits: &[String]) -> StaticArchiveSource {
    commits.iter().fold(StaticArchiveSource::new(), |source, commit| {
        source.with_archive(layout.upstream.archive_url_for(commit), format!("archive of {commit}"))
    })
}

/// Write the files the pipeline copies from upstream as they read at `rev`.
pub fn populate_upstream(dir: &Path, layout: &Config, rev: &str) {
    for file in &layout.files.copied {
        let path = dir.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, upstream_content(file, rev)).unwrap();
    }
}

pub fn upstream_content(file: &str, rev: &str) -> String {
    format!("upstream {file} at {rev}\n")
}

/// A project checkout inside its own temporary parent directory.
pub struct Project {
    pub root: TempDir,
    pub dir: PathBuf,
}

impl Project {
    pub fn new(layout: &Config) -> Self {
        init_test_logging();
        let root = TempDir::new().unwrap();
        let dir = root.path().join("nighthawk");
        fs::create_dir_all(dir.join("bazel")).unwrap();
        fs::write(
            dir.join(&layout.pin.file),
            format!("ENVOY_COMMIT = \"{PIN}\"  # 2023-11-01\nENVOY_SHA = \"0000\"\n"),
        )
        .unwrap();
        Self { root, dir }
    }

    pub fn pinned_commit(&self, layout: &Config) -> String {
        let content = fs::read_to_string(self.dir.join(&layout.pin.file)).unwrap();
        read_value(&content, &layout.pin.commit_key).unwrap()
    }
}

pub struct ScriptedRunner {
    pub calls: RefCell<Vec<CommandSpec>>,
    /// Pinned commit at each build, in order.
    pub builds: RefCell<Vec<String>>,
    pin_file: PathBuf,
    /// Pin file content as committed, restored by `git reset --hard`.
    committed_pin_file: String,
    commit_key: String,
    pin: String,
    commits: Vec<String>,
    pub clean_count: Cell<usize>,
    pub dirty_tree: bool,
    pub upstream_url: String,
    pub branch_exists: bool,
    /// Body `git diff --output=..` writes for the shared files.
    pub shared_patch: String,
    pub apply_fails: bool,
    pub show_fails: bool,
    /// Times the test command fails before it passes.
    pub test_failures: Cell<u32>,
    /// Whether a recovery agent run makes the tests pass.
    pub agent_fixes: bool,
}

impl ScriptedRunner {
    pub fn new(project: &Project, layout: &Config, commits: &[String], clean_count: usize) -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            builds: RefCell::new(Vec::new()),
            pin_file: project.dir.join(&layout.pin.file),
            committed_pin_file: fs::read_to_string(project.dir.join(&layout.pin.file)).unwrap(),
            commit_key: layout.pin.commit_key.clone(),
            pin: PIN.to_string(),
            commits: commits.to_vec(),
            clean_count: Cell::new(clean_count),
            dirty_tree: false,
            upstream_url: layout.remotes.upstream_url.clone(),
            branch_exists: false,
            shared_patch: String::new(),
            apply_fails: false,
            show_fails: false,
            test_failures: Cell::new(0),
            agent_fixes: false,
        }
    }

    pub fn argvs(&self) -> Vec<Vec<String>> {
        self.calls
            .borrow()
            .iter()
            .map(|spec| {
                std::iter::once(spec.program.clone())
                    .chain(spec.args.iter().cloned())
                    .collect()
            })
            .collect()
    }

    pub fn find(&self, prefix: &[&str]) -> Vec<CommandSpec> {
        self.calls
            .borrow()
            .iter()
            .filter(|spec| spec.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn count(&self, prefix: &[&str]) -> usize {
        self.find(prefix).len()
    }

    fn current_pin(&self) -> String {
        let content = fs::read_to_string(&self.pin_file).unwrap();
        read_value(&content, &self.commit_key).unwrap()
    }

    fn build(&self, spec: &CommandSpec) -> Result<String, CommandFailure> {
        let pinned = self.current_pin();
        self.builds.borrow_mut().push(pinned.clone());
        match self.commits.iter().position(|c| *c == pinned) {
            Some(index) if index < self.clean_count.get() => {
                Ok("Build completed successfully".to_string())
            }
            _ => Err(fail(spec, "error: use of undeclared identifier 'Http1Settings'")),
        }
    }
}

fn fail(spec: &CommandSpec, stderr: &str) -> CommandFailure {
    CommandFailure::new(spec, FailureReason::Exit(Some(1))).with_output("", stderr)
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<String, CommandFailure> {
        self.calls.borrow_mut().push(spec.clone());
        let argv: Vec<&str> = std::iter::once(spec.program.as_str())
            .chain(spec.args.iter().map(String::as_str))
            .collect();

        match argv.as_slice() {
            ["git", "rev-parse", "--is-inside-work-tree"] => Ok("true".to_string()),
            ["git", "status", "--porcelain"] => Ok(if self.dirty_tree {
                " M source/client/main.cc".to_string()
            } else {
                String::new()
            }),
            ["git", "remote", "get-url", "upstream"] => Ok(self.upstream_url.clone()),
            ["git", "remote", "get-url", "origin"] => Ok(PUSH_URL.to_string()),
            ["git", "remote", "get-url", _] => Err(fail(spec, "error: No such remote")),
            ["git", "checkout", "-b", ..] if self.branch_exists => {
                Err(fail(spec, "fatal: a branch named 'update' already exists"))
            }
            ["git", "clone", _, _, dir] => {
                populate_upstream(Path::new(dir), &Config::default(), "HEAD");
                Ok(String::new())
            }
            ["git", "checkout", "--force", "--detach", rev] => {
                let dir = spec.cwd.as_deref().unwrap();
                populate_upstream(dir, &Config::default(), rev);
                Ok(String::new())
            }
            ["git", "reset", "--hard", _] => {
                fs::write(&self.pin_file, &self.committed_pin_file).unwrap();
                Ok(String::new())
            }
            ["git", "log", "--reverse", "--pretty=%H", range] => {
                if *range == format!("{}..HEAD", self.pin) {
                    Ok(self.commits.join("\n"))
                } else {
                    Err(fail(spec, "fatal: bad revision"))
                }
            }
            ["git", "diff", output, ..] if output.starts_with("--output=") => {
                let path = output.trim_start_matches("--output=");
                fs::write(path, &self.shared_patch).unwrap();
                Ok(String::new())
            }
            ["git", "apply", "--reject", ..] if self.apply_fails => {
                let dir = spec.cwd.as_deref().unwrap();
                fs::write(dir.join(".bazelrc.rej"), "@@ -12 +12 @@\n").unwrap();
                Err(fail(spec, "error: patch failed: .bazelrc:12"))
            }
            ["git", "apply", ..] if self.apply_fails => {
                Err(fail(spec, "error: patch failed: .bazelrc:12"))
            }
            ["git", "show", ..] if self.show_fails => Err(fail(spec, "fatal: bad object")),
            ["git", "show", "-s", "--pretty=format:%ct", _] => Ok(COMMIT_TIME.to_string()),
            ["./ci/do_ci.sh", "build"] => self.build(spec),
            ["./ci/do_ci.sh", "test"] if self.test_failures.get() > 0 => {
                self.test_failures.set(self.test_failures.get() - 1);
                Err(fail(spec, "[  FAILED  ] ClientTest.Basic"))
            }
            ["sh", "-c", _] => {
                if self.agent_fixes {
                    self.test_failures.set(0);
                }
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }
}
