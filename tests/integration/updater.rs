//! Full update runs against a scripted project and upstream.

use std::fs;
use std::path::{Path, PathBuf};

use pinroll::config::Config;
use pinroll::integration::{IntegrationStep, StaticArchiveSource, Verdict};
use pinroll::models::StepStatus;
use pinroll::orchestrator::{
    RemediationKind, RemediationReport, RunStatus, UpdateError, UpdateOptions, UpdateOutcome,
    UpdateStep, Updater,
};
use pinroll::steps::RecoveryConfig;

use crate::support::{archives_for, commits, commit_id, test_layout, Project, ScriptedRunner, PIN};

const BRANCH: &str = "update-envoy-20260301";

struct World {
    layout: Config,
    project: Project,
    commits: Vec<String>,
    archives: StaticArchiveSource,
}

impl World {
    fn new(n: usize) -> Self {
        let layout = test_layout();
        let project = Project::new(&layout);
        let commits = commits(n);
        let archives = archives_for(&layout, &commits);
        Self {
            layout,
            project,
            commits,
            archives,
        }
    }

    fn options(&self) -> UpdateOptions {
        let mut options = UpdateOptions::new(&self.project.dir, &self.layout.upstream);
        options.branch_name = BRANCH.to_string();
        options
    }

    fn runner(&self, clean_count: usize) -> ScriptedRunner {
        ScriptedRunner::new(&self.project, &self.layout, &self.commits, clean_count)
    }

    fn pinned(&self) -> String {
        self.project.pinned_commit(&self.layout)
    }
}

fn tried_indices(updater: &Updater<'_>) -> Vec<usize> {
    updater.state().probes.iter().map(|p| p.index).collect()
}

fn expect_remediation(result: Result<UpdateOutcome, UpdateError>) -> Box<RemediationReport> {
    match result {
        Err(UpdateError::Remediation(report)) => report,
        other => panic!("expected a remediation report, got {other:?}"),
    }
}

#[test]
fn test_all_commits_clean_pushes_newest() {
    let world = World::new(3);
    let runner = world.runner(3);
    let options = world.options();
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);

    let outcome = updater.run().unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Pushed {
            branch: BRANCH.to_string(),
            commit: world.commits[2].clone(),
        }
    );
    assert_eq!(tried_indices(&updater), vec![2]);
    assert_eq!(world.pinned(), world.commits[2]);

    let commit = runner.find(&["git", "commit", "-m"]);
    assert_eq!(commit.len(), 1);
    assert!(commit[0].interactive);
    let message = &commit[0].args[2];
    assert!(
        message.starts_with("Updating Envoy version to 0000000 (2023-11-14T22:13:20Z)"),
        "{message}"
    );
    assert!(message.ends_with(&format!("{}.", world.layout.upstream.commit_url_for(&world.commits[2]))));

    let push = runner.find(&["git", "push", "--force", "--set-upstream", "origin", BRANCH]);
    assert_eq!(push.len(), 1);
    assert!(push[0].interactive);
    assert_eq!(runner.count(&["bazel", "clean", "--expunge"]), 1);
}

#[test]
fn test_partial_integration_stops_at_first_bad_commit() {
    let world = World::new(5);
    let runner = world.runner(3);
    let options = world.options();
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);

    let report = expect_remediation(updater.run());
    assert_eq!(tried_indices(&updater), vec![4, 1, 2, 3]);
    assert_eq!(report.kind, RemediationKind::Partial);
    assert_eq!(report.commit, world.commits[3]);
    assert_eq!(report.best_commit.as_deref(), Some(world.commits[2].as_str()));
    assert_eq!(report.remaining, 1);

    // the workspace holds the first bad commit's integration
    assert_eq!(world.pinned(), world.commits[3]);
    assert_eq!(runner.count(&["git", "commit"]), 0);
    assert_eq!(runner.count(&["git", "push", "--force"]), 0);

    let message = report.to_string();
    assert!(
        message.starts_with(&format!("Ran partial integration of Envoy commit {}.", world.commits[3])),
        "{message}"
    );
    assert!(message.contains("Then run the update again"), "{message}");
    assert!(message.contains("git -C"), "{message}");
    assert_eq!(updater.report().status, RunStatus::Remediation);
}

#[test]
fn test_nothing_clean_leaves_oldest_commit() {
    let world = World::new(3);
    let runner = world.runner(0);
    let options = world.options();
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);

    let report = expect_remediation(updater.run());
    assert_eq!(tried_indices(&updater), vec![2, 0]);
    assert_eq!(report.kind, RemediationKind::NothingClean);
    assert_eq!(report.commit, world.commits[0]);
    assert!(report.best_commit.is_none());
    assert_eq!(report.remaining, 2);
    assert_eq!(world.pinned(), world.commits[0]);
}

#[test]
fn test_head_failing_after_clean_predecessor_retries_head() {
    let world = World::new(5);
    let runner = world.runner(4);
    let options = world.options();
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);

    let report = expect_remediation(updater.run());
    assert_eq!(report.kind, RemediationKind::PartialAtHead);
    assert_eq!(report.commit, world.commits[4]);
    assert_eq!(report.best_commit.as_deref(), Some(world.commits[3].as_str()));
    assert_eq!(report.remaining, 0);
    assert_eq!(tried_indices(&updater), vec![4, 1, 2, 3, 4]);
    assert_eq!(world.pinned(), world.commits[4]);
    assert!(!report.to_string().contains("Then run the update again"));
}

#[test]
fn test_no_new_commits_is_up_to_date() {
    let world = World::new(0);
    let runner = world.runner(0);
    let options = world.options();
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);

    let outcome = updater.run().unwrap();
    assert_eq!(outcome, UpdateOutcome::UpToDate { pin: PIN.to_string() });
    assert!(updater.state().probes.is_empty());
    assert!(runner.builds.borrow().is_empty());
    assert_eq!(runner.count(&["bazel", "clean"]), 0);
    assert_eq!(runner.count(&["git", "commit"]), 0);
    assert_eq!(updater.report().status, RunStatus::UpToDate);
}

#[test]
fn test_dirty_tree_fails_before_cloning() {
    let world = World::new(3);
    let mut runner = world.runner(3);
    runner.dirty_tree = true;
    let options = world.options();
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);

    match updater.run() {
        Err(UpdateError::Precondition { step, .. }) => assert_eq!(step, UpdateStep::CheckCleanTree),
        other => panic!("expected a precondition failure, got {other:?}"),
    }
    assert_eq!(runner.count(&["git", "clone"]), 0);
    assert_eq!(updater.report().status, RunStatus::Failed);

    let status = |step: UpdateStep| {
        updater
            .step_results()
            .into_iter()
            .find(|(id, _)| *id == step)
            .map(|(_, result)| result.status)
            .unwrap()
    };
    assert_eq!(status(UpdateStep::CheckProjectDir), StepStatus::Success);
    assert_eq!(status(UpdateStep::CheckCleanTree), StepStatus::Failed);
    assert_eq!(status(UpdateStep::CloneUpstream), StepStatus::Cancelled);
}

#[test]
fn test_wrong_upstream_remote_is_precondition_failure() {
    let world = World::new(3);
    let mut runner = world.runner(3);
    runner.upstream_url = "https://github.com/someone/fork".to_string();
    let options = world.options();
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);

    let err = updater.run().unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Precondition {
            step: UpdateStep::CheckUpstreamRemote,
            ..
        }
    ));
    assert!(err.to_string().contains("someone/fork"));
}

#[test]
fn test_sync_fetches_interactively_unless_disabled() {
    let world = World::new(1);
    let runner = world.runner(1);
    let options = world.options();
    Updater::new(&options, &world.layout, &runner, &world.archives)
        .run()
        .unwrap();
    let fetch = runner.find(&["git", "fetch", "--all"]);
    assert_eq!(fetch.len(), 1);
    assert!(fetch[0].interactive);
    assert_eq!(runner.count(&["git", "merge", "upstream/main"]), 1);

    // the first run moved the pin, so start over
    let world = World::new(1);
    let runner = world.runner(1);
    let mut options = world.options();
    options.sync_default_branch = false;
    Updater::new(&options, &world.layout, &runner, &world.archives)
        .run()
        .unwrap();
    assert_eq!(runner.count(&["git", "fetch"]), 0);
    assert_eq!(runner.count(&["git", "merge"]), 0);
}

#[test]
fn test_existing_branch_is_rebased() {
    let world = World::new(1);
    let mut runner = world.runner(1);
    runner.branch_exists = true;
    let options = world.options();
    Updater::new(&options, &world.layout, &runner, &world.archives)
        .run()
        .unwrap();

    assert_eq!(runner.count(&["git", "checkout", BRANCH]), 1);
    assert_eq!(runner.count(&["git", "rebase", "origin/main"]), 1);
}

#[test]
fn test_skip_bisection_tries_only_newest() {
    let world = World::new(5);
    let runner = world.runner(3);
    let mut options = world.options();
    options.skip_bisection = true;
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);

    let report = expect_remediation(updater.run());
    assert_eq!(updater.state().probes.len(), 1);
    assert_eq!(report.commit, world.commits[4]);
    assert_eq!(report.kind, RemediationKind::NothingClean);
}

#[test]
fn test_pin_outside_clone_suggests_deeper_clone() {
    let world = World::new(3);
    let pin_file = world.project.dir.join(&world.layout.pin.file);
    fs::write(&pin_file, format!("ENVOY_COMMIT = \"{}\"\nENVOY_SHA = \"0\"\n", commit_id(99))).unwrap();
    let runner = world.runner(3);
    let options = world.options();
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);

    match updater.run() {
        Err(UpdateError::Step { step, summary }) => {
            assert_eq!(step, UpdateStep::DiscoverCommitRange);
            assert!(summary.contains("--clone-depth"), "{summary}");
        }
        other => panic!("expected a step failure, got {other:?}"),
    }
}

#[test]
fn test_agent_recovery_applies_within_integration() {
    let world = World::new(2);
    let mut runner = world.runner(2);
    runner.test_failures.set(1);
    runner.agent_fixes = true;
    let mut options = world.options();
    options.recovery = Some(RecoveryConfig::new("fix-agent"));
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);

    assert!(matches!(updater.run().unwrap(), UpdateOutcome::Pushed { .. }));
    let probes = &updater.state().probes;
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].agent_attempts, 1);
    assert_eq!(probes[0].verdict, Verdict::Clean);
}

#[test]
fn test_run_report_serializes_search() {
    let world = World::new(5);
    let runner = world.runner(3);
    let options = world.options();
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);
    let _ = updater.run();

    let json = serde_json::to_value(updater.report()).unwrap();
    assert_eq!(json["status"], "remediation");
    assert_eq!(json["current_pin"], PIN);
    assert_eq!(json["best_commit"], world.commits[2]);
    assert_eq!(json["first_bad_commit"], world.commits[3]);
    assert_eq!(json["probes"].as_array().unwrap().len(), 4);
    assert_eq!(json["probes"][0]["verdict"], "dirty");
    assert_eq!(json["probes"][0]["failed_step"], "build");
    assert!(json["probes"][1].get("failed_step").is_none());
    assert!(json["message"].as_str().unwrap().contains(&world.commits[3]));

    let failed: Vec<_> = updater
        .state()
        .probes
        .iter()
        .filter_map(|p| p.failed_step)
        .collect();
    assert_eq!(failed, vec![IntegrationStep::Build, IntegrationStep::Build]);
}

#[test]
fn test_shared_file_conflict_reaches_remediation_message() {
    let world = World::new(3);
    let mut runner = world.runner(3);
    runner.shared_patch = "diff --git a/.bazelrc b/.bazelrc\n".to_string();
    runner.apply_fails = true;
    let options = world.options();
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);

    let report = expect_remediation(updater.run());
    assert_eq!(report.kind, RemediationKind::NothingClean);
    assert_eq!(report.commit, world.commits[0]);
    let conflict = report.patch_conflict.as_ref().unwrap();
    assert_eq!(conflict.rejects, vec![PathBuf::from(".bazelrc.rej")]);

    let message = report.to_string();
    assert!(message.contains(".bazelrc"), "{message}");
    assert!(message.contains("# unique"), "{message}");
    assert!(message.contains(".bazelrc.rej"), "{message}");
    assert_eq!(runner.count(&["./ci/do_ci.sh", "build"]), 0);
}

#[test]
fn test_remediation_survives_missing_commit_time() {
    let world = World::new(5);
    let mut runner = world.runner(3);
    runner.show_fails = true;
    let options = world.options();
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);

    let report = expect_remediation(updater.run());
    assert_eq!(report.kind, RemediationKind::Partial);
    assert_eq!(report.commit, world.commits[3]);
    let url = world.layout.upstream.commit_url_for(&world.commits[3]);
    assert_eq!(
        report.commit_message,
        format!("Updating Envoy version to 0000000\n\nSee {url}.")
    );
    assert_eq!(updater.report().status, RunStatus::Remediation);
}

#[test]
fn test_relative_project_dir_is_rejected() {
    let world = World::new(1);
    let runner = world.runner(1);
    let mut options = world.options();
    options.project_dir = PathBuf::from("nighthawk");
    let mut updater = Updater::new(&options, &world.layout, &runner, &world.archives);

    match updater.run() {
        Err(UpdateError::Precondition { step, message }) => {
            assert_eq!(step, UpdateStep::CheckProjectDir);
            assert!(message.contains("absolute"), "{message}");
        }
        other => panic!("expected a precondition failure, got {other:?}"),
    }
    assert!(runner.calls.borrow().is_empty());
}

#[test]
fn test_upstream_clone_sits_next_to_the_project() {
    let world = World::new(1);
    let runner = world.runner(1);
    let options = world.options();
    Updater::new(&options, &world.layout, &runner, &world.archives)
        .run()
        .unwrap();

    let clone = runner.find(&["git", "clone"]);
    let clone_dir = PathBuf::from(clone[0].args.last().unwrap());
    assert!(clone_dir.is_absolute());
    assert!(!clone_dir.starts_with(&world.project.dir));
    assert_eq!(clone_dir.parent(), Some(world.project.root.path()));

    let diff = runner.find(&["git", "diff"]);
    let patch = diff[0].args[1].trim_start_matches("--output=");
    assert!(Path::new(patch).starts_with(&clone_dir), "{patch}");
}
