//! The build pipeline state machine.
//!
//! One controller owns the working root, the mount tracker, and the
//! process evictor, and drives a run through verification, the idempotent
//! reset, the staged build, artifact assembly, and publication. Every
//! exit path, including cancellation, funnels through the same mount
//! unwind so no run can end with privileged mounts outstanding.

pub mod plan;
pub mod report;

use anyhow::{bail, Context, Result};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::artifact::{manifest, Assembler, BuildArtifact, HostAssembler};
use crate::config::BuildConfig;
use crate::error::BuildError;
use crate::evict::{Evictor, ProcEvictor};
use crate::mounts::{chroot_mounts, HostMounter, MountTracker, UnwindReport};
use crate::preflight;
use crate::provision::AptProvisioner;
use crate::stage::{HostStageRunner, Stage, StageRunner};
use crate::workspace::{self, Workspace, WorkingRoot};

use self::report::RunReport;

/// Set by the signal handler, polled between pipeline steps.
static CANCELLED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_cancel_signal(_signal: libc::c_int) {
    CANCELLED.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM into the cancellation flag. A cancelled run
/// fails between steps and takes the normal cleanup path instead of
/// dying with mounts outstanding.
pub fn install_cancel_handler() {
    let handler = handle_cancel_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn cancel_requested() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Verified,
    Reset,
    /// `Staged(n)` means the first `n` stages completed.
    Staged(usize),
    Assembled,
    Done,
    Failed,
}

/// The controller. Exactly one instance operates on a workspace at a
/// time; acquisition of the [`Workspace`] lock enforces that.
pub struct Pipeline {
    config: BuildConfig,
    workspace: Workspace,
    root: WorkingRoot,
    tracker: MountTracker,
    evictor: Box<dyn Evictor>,
    runner: Box<dyn StageRunner>,
    assembler: Box<dyn Assembler>,
    stages: Vec<Stage>,
    verifier: fn(&BuildConfig) -> Result<()>,
    cancelled: fn() -> bool,
    state: PipelineState,
}

impl Pipeline {
    /// Acquire the workspace and wire up the host-backed collaborators.
    pub fn new(config: BuildConfig) -> Result<Pipeline> {
        let workspace = Workspace::acquire(&config.workspace_dir)?;
        let tracker = MountTracker::new(workspace.root_dir(), Box::new(HostMounter));
        let runner = HostStageRunner::new(Box::new(AptProvisioner), workspace.scratch_dir());
        let stages = plan::build_plan(&config);
        Ok(Pipeline::with_parts(
            config,
            workspace,
            tracker,
            Box::new(ProcEvictor),
            Box::new(runner),
            Box::new(HostAssembler),
            stages,
            preflight::verify,
            cancel_requested,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn with_parts(
        config: BuildConfig,
        workspace: Workspace,
        tracker: MountTracker,
        evictor: Box<dyn Evictor>,
        runner: Box<dyn StageRunner>,
        assembler: Box<dyn Assembler>,
        stages: Vec<Stage>,
        verifier: fn(&BuildConfig) -> Result<()>,
        cancelled: fn() -> bool,
    ) -> Pipeline {
        let root = WorkingRoot::new(workspace.root_dir());
        Pipeline {
            config,
            workspace,
            root,
            tracker,
            evictor,
            runner,
            assembler,
            stages,
            verifier,
            cancelled,
            state: PipelineState::Uninitialized,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Drive the full pipeline. On any failure the mount state is cleaned
    /// up best-effort before returning, and a run report lands in the
    /// workspace either way.
    pub fn run(&mut self) -> Result<BuildArtifact> {
        let mut run_report = RunReport::begin(&self.config.image_name);
        let outcome = self.drive(&mut run_report);

        match &outcome {
            Ok(artifact) => run_report.finish_success(&artifact.iso),
            Err(err) => {
                self.state = PipelineState::Failed;
                let precondition = err
                    .downcast_ref::<BuildError>()
                    .map(|kind| matches!(kind, BuildError::Precondition(_)))
                    .unwrap_or(false);
                // A precondition failure touched nothing, so there is
                // nothing to clean up.
                if !precondition {
                    self.cleanup_after_failure();
                }
                run_report.finish_failure(err);
            }
        }

        if let Err(err) = run_report.write(&self.workspace.report_path()) {
            eprintln!("  [WARN] could not write run report: {:#}", err);
        }
        outcome
    }

    fn drive(&mut self, run_report: &mut RunReport) -> Result<BuildArtifact> {
        println!("=== Verifying environment ===");
        if let Err(err) = (self.verifier)(&self.config) {
            return Err(BuildError::precondition(format!("{:#}", err)).into());
        }
        self.state = PipelineState::Verified;

        self.check_cancelled()?;
        println!("=== Resetting workspace ===");
        self.reset()?;
        self.state = PipelineState::Reset;

        let stages = self.stages.clone();
        for (index, stage) in stages.iter().enumerate() {
            self.check_cancelled()?;
            if stage.needs_chroot() {
                self.ensure_chroot_mounts()?;
            }
            println!("=== Stage {}/{}: {} ===", index + 1, stages.len(), stage.name);
            match self.runner.run(stage, &self.root) {
                Ok(()) => {
                    run_report.record_stage(&stage.name, true);
                    self.state = PipelineState::Staged(index + 1);
                }
                Err(err) => {
                    run_report.record_stage(&stage.name, false);
                    return Err(BuildError::stage(&stage.name, format!("{:#}", err)).into());
                }
            }
        }

        self.check_cancelled()?;
        println!("=== Unmounting before assembly ===");
        self.settle_mounts()?;

        println!("=== Assembling artifact ===");
        let artifact =
            self.assembler
                .assemble(&self.root, &self.workspace.scratch_dir(), &self.config)?;
        self.state = PipelineState::Assembled;

        self.check_cancelled()?;
        println!("=== Publishing artifact ===");
        let artifact = self.publish(artifact)?;
        self.state = PipelineState::Done;
        Ok(artifact)
    }

    /// Idempotent reset: evict holders, unwind leftover mounts from any
    /// prior run, then recreate the working tree and scratch area and
    /// drop a stale destination artifact. Running this twice in a row is
    /// safe and produces the same clean slate.
    fn reset(&mut self) -> Result<()> {
        self.evictor.evict(self.root.path())?;
        let unwind = self.tracker.unwind_all()?;
        self.ensure_no_residual(&unwind)?;

        if self.root.path().exists() {
            fs::remove_dir_all(self.root.path()).with_context(|| {
                format!("deleting working root '{}'", self.root.path().display())
            })?;
        }
        fs::create_dir_all(self.root.path()).with_context(|| {
            format!("creating working root '{}'", self.root.path().display())
        })?;

        let scratch = self.workspace.scratch_dir();
        if scratch.exists() {
            fs::remove_dir_all(&scratch).with_context(|| {
                format!("deleting scratch directory '{}'", scratch.display())
            })?;
        }
        fs::create_dir_all(&scratch).with_context(|| {
            format!("creating scratch directory '{}'", scratch.display())
        })?;

        let destination = &self.config.destination;
        if destination.exists() {
            if !destination.is_file() {
                bail!(
                    "destination '{}' exists and is not a file",
                    destination.display()
                );
            }
            println!("  Removing stale artifact {}", destination.display());
            fs::remove_file(destination).with_context(|| {
                format!("removing stale artifact '{}'", destination.display())
            })?;
        }
        Ok(())
    }

    /// Evict holders, unwind leftover mounts, and delete the working
    /// tree and scratch area. Refuses to delete anything while a mount
    /// survives under the root.
    pub fn clean(&mut self) -> Result<()> {
        self.evictor.evict(self.root.path())?;
        let unwind = self.tracker.unwind_all()?;
        self.ensure_no_residual(&unwind)?;

        for dir in [self.root.path().to_path_buf(), self.workspace.scratch_dir()] {
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("deleting '{}'", dir.display()))?;
            }
        }
        println!("Workspace '{}' cleaned", self.workspace.dir().display());
        Ok(())
    }

    /// Establish the chroot mount set once; later chroot stages reuse it.
    fn ensure_chroot_mounts(&mut self) -> Result<()> {
        if self.tracker.tracked() > 0 {
            return Ok(());
        }
        println!("=== Establishing chroot mounts ===");
        for mount in chroot_mounts(&self.root) {
            self.tracker.register(mount)?;
        }
        Ok(())
    }

    /// Full unwind before anything destructive or packaging-related runs.
    /// Holders are evicted first so busy unmounts have a chance to go
    /// down without the forced fallback.
    fn settle_mounts(&mut self) -> Result<()> {
        self.evictor.evict(self.root.path())?;
        let unwind = self.tracker.unwind_all()?;
        self.ensure_no_residual(&unwind)
    }

    fn ensure_no_residual(&self, unwind: &UnwindReport) -> Result<()> {
        if unwind.is_clean() {
            return Ok(());
        }
        Err(BuildError::ResidualMounts {
            root: self.root.path().to_path_buf(),
            count: unwind.residual.len(),
        }
        .into())
    }

    /// Move the finished ISO to the configured destination and write its
    /// checksum sidecar. The destination is replaced wholesale, never
    /// appended to or merged with.
    fn publish(&self, artifact: BuildArtifact) -> Result<BuildArtifact> {
        let destination = &self.config.destination;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("creating destination directory '{}'", parent.display())
            })?;
        }
        if destination.exists() {
            fs::remove_file(destination).with_context(|| {
                format!("removing previous artifact '{}'", destination.display())
            })?;
        }

        workspace::atomic_move(&artifact.iso, destination)?;
        let sidecar = manifest::write_checksum_sidecar(destination)?;
        println!("  Artifact:  {}", destination.display());
        println!("  Checksum:  {}", sidecar.display());
        Ok(BuildArtifact {
            iso: destination.clone(),
            ..artifact
        })
    }

    /// Best-effort cleanup on the failure path. The first error is
    /// already recorded; anything that goes wrong here is warned about,
    /// never escalated.
    fn cleanup_after_failure(&mut self) {
        if let Err(err) = self.evictor.evict(self.root.path()) {
            eprintln!("  [WARN] eviction during cleanup failed: {:#}", err);
        }
        match self.tracker.unwind_all() {
            Ok(unwind) if !unwind.is_clean() => {
                eprintln!(
                    "  [WARN] {} mount(s) still active under {}",
                    unwind.residual.len(),
                    self.root.path().display()
                );
            }
            Ok(_) => {}
            Err(err) => {
                eprintln!("  [WARN] mount unwind during cleanup failed: {:#}", err);
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if (self.cancelled)() {
            bail!("build cancelled by signal");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseSource;
    use crate::mounts::{MountPoint, Mounter};
    use std::collections::BTreeSet;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Shared event log so ordering across collaborators can be asserted.
    type Log = Arc<Mutex<Vec<String>>>;

    fn new_log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn position(entries: &[String], needle: &str) -> usize {
        entries
            .iter()
            .position(|entry| entry.starts_with(needle))
            .unwrap_or_else(|| panic!("no '{}' event in {:?}", needle, entries))
    }

    struct RecordingMounter {
        log: Log,
        live: Mutex<BTreeSet<PathBuf>>,
        stuck: Option<PathBuf>,
    }

    impl Mounter for RecordingMounter {
        fn mount(&self, mount: &MountPoint) -> Result<()> {
            self.live.lock().unwrap().insert(mount.target.clone());
            self.log
                .lock()
                .unwrap()
                .push(format!("mount {}", mount.target.display()));
            Ok(())
        }

        fn unmount(&self, target: &Path, _force: bool) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("umount {}", target.display()));
            if self.stuck.as_deref() == Some(target) {
                bail!("target is busy");
            }
            self.live.lock().unwrap().remove(target);
            Ok(())
        }

        fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>> {
            self.log.lock().unwrap().push("scan".to_string());
            Ok(self
                .live
                .lock()
                .unwrap()
                .iter()
                .filter(|path| path.starts_with(root) && path.as_path() != root)
                .cloned()
                .collect())
        }
    }

    struct FakeEvictor {
        log: Log,
    }

    impl Evictor for FakeEvictor {
        fn evict(&self, path: &Path) -> Result<usize> {
            self.log
                .lock()
                .unwrap()
                .push(format!("evict {}", path.display()));
            Ok(0)
        }
    }

    struct ScriptedRunner {
        log: Log,
        fail_stage: Option<String>,
    }

    impl StageRunner for ScriptedRunner {
        fn run(&self, stage: &Stage, _root: &WorkingRoot) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("stage {}", stage.name));
            if self.fail_stage.as_deref() == Some(stage.name.as_str()) {
                bail!("injected failure");
            }
            Ok(())
        }
    }

    struct RecordingAssembler {
        log: Log,
    }

    impl Assembler for RecordingAssembler {
        fn assemble(
            &self,
            _root: &WorkingRoot,
            scratch_dir: &Path,
            config: &BuildConfig,
        ) -> Result<BuildArtifact> {
            self.log.lock().unwrap().push("assemble".to_string());
            let iso = scratch_dir.join(format!("{}.iso", config.image_name));
            fs::write(&iso, "iso-bytes")?;
            Ok(BuildArtifact {
                squashfs: scratch_dir.join("iso/live/filesystem.squashfs"),
                kernel: scratch_dir.join("iso/boot/vmlinuz"),
                initrd: scratch_dir.join("iso/boot/initrd.img"),
                iso,
            })
        }
    }

    /// Stands in for an assembly that produced an undersized squashfs.
    struct UndersizedAssembler {
        log: Log,
    }

    impl Assembler for UndersizedAssembler {
        fn assemble(
            &self,
            _root: &WorkingRoot,
            _scratch_dir: &Path,
            _config: &BuildConfig,
        ) -> Result<BuildArtifact> {
            self.log.lock().unwrap().push("assemble".to_string());
            Err(BuildError::ArtifactSize {
                actual: 12,
                floor: 1024 * 1024,
            }
            .into())
        }
    }

    fn verify_ok(_config: &BuildConfig) -> Result<()> {
        Ok(())
    }

    fn never_cancelled() -> bool {
        false
    }

    struct FakeOptions {
        fail_stage: Option<String>,
        stuck: Option<String>,
        undersized_artifact: bool,
        verifier: fn(&BuildConfig) -> Result<()>,
        cancelled: fn() -> bool,
    }

    impl Default for FakeOptions {
        fn default() -> Self {
            FakeOptions {
                fail_stage: None,
                stuck: None,
                undersized_artifact: false,
                verifier: verify_ok,
                cancelled: never_cancelled,
            }
        }
    }

    fn test_config(workspace_dir: &Path, destination: PathBuf) -> BuildConfig {
        BuildConfig {
            image_name: "test-live".to_string(),
            volume_label: "TEST_LIVE".to_string(),
            destination,
            workspace_dir: workspace_dir.to_path_buf(),
            base: BaseSource::Tarball {
                path: workspace_dir.join("base.tar"),
            },
            packages: vec![],
            no_install_recommends: true,
            update_index_first: false,
            squashfs_compression: "zstd".to_string(),
            squashfs_block_size: "1M".to_string(),
            min_squashfs_mb: 1,
            persistence_size_mb: 8,
            persistence_label: "persistence".to_string(),
        }
    }

    fn fake_pipeline(temp: &TempDir, log: &Log, options: FakeOptions) -> Pipeline {
        let workspace_dir = temp.path().join("work");
        let destination = temp.path().join("out/test-live.iso");
        let config = test_config(&workspace_dir, destination);
        let workspace = Workspace::acquire(&workspace_dir).unwrap();

        let stuck = options
            .stuck
            .as_deref()
            .map(|suffix| workspace.root_dir().join(suffix));
        let mounter = RecordingMounter {
            log: log.clone(),
            live: Mutex::new(BTreeSet::new()),
            stuck,
        };
        let tracker = MountTracker::new(workspace.root_dir(), Box::new(mounter));
        let stages = plan::build_plan(&config);

        let assembler: Box<dyn Assembler> = if options.undersized_artifact {
            Box::new(UndersizedAssembler { log: log.clone() })
        } else {
            Box::new(RecordingAssembler { log: log.clone() })
        };

        Pipeline::with_parts(
            config,
            workspace,
            tracker,
            Box::new(FakeEvictor { log: log.clone() }),
            Box::new(ScriptedRunner {
                log: log.clone(),
                fail_stage: options.fail_stage,
            }),
            assembler,
            stages,
            options.verifier,
            options.cancelled,
        )
    }

    #[test]
    fn test_successful_run_publishes_artifact() {
        let temp = TempDir::new().unwrap();
        let log = new_log();
        let destination = temp.path().join("out/test-live.iso");

        // A leftover artifact from an earlier run must be replaced.
        fs::create_dir_all(destination.parent().unwrap()).unwrap();
        fs::write(&destination, "stale").unwrap();

        let mut pipeline = fake_pipeline(&temp, &log, FakeOptions::default());
        let artifact = pipeline.run().unwrap();

        assert_eq!(pipeline.state(), PipelineState::Done);
        assert_eq!(artifact.iso, destination);
        assert_eq!(fs::read_to_string(&destination).unwrap(), "iso-bytes");
        assert!(temp.path().join("out/test-live.iso.sha256").exists());

        let run_report: RunReport = serde_json::from_slice(
            &fs::read(temp.path().join("work/report.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(run_report.status, "success");
        assert_eq!(run_report.stages.len(), 4);
        assert!(run_report
            .stages
            .iter()
            .all(|stage| stage.status == "success"));
    }

    #[test]
    fn test_mounts_up_for_chroot_stages_and_down_before_assembly() {
        let temp = TempDir::new().unwrap();
        let log = new_log();
        let mut pipeline = fake_pipeline(&temp, &log, FakeOptions::default());
        pipeline.run().unwrap();

        let events = entries(&log);
        let base = position(&events, "stage base");
        let first_mount = position(&events, "mount ");
        let provision = position(&events, "stage provision");
        let assemble = position(&events, "assemble");

        // Mounts come up after base staging, before the first chroot stage.
        assert!(base < first_mount);
        assert!(first_mount < provision);

        // And all of them are down before assembly starts.
        let last_umount = events
            .iter()
            .rposition(|event| event.starts_with("umount "))
            .unwrap();
        assert!(last_umount < assemble);
        let umounts = events
            .iter()
            .filter(|event| event.starts_with("umount "))
            .count();
        assert_eq!(umounts, 4);

        // Eviction runs at reset and again before the pre-assembly unwind.
        let evictions = events
            .iter()
            .filter(|event| event.starts_with("evict "))
            .count();
        assert!(evictions >= 2);
    }

    #[test]
    fn test_stage_failure_fails_pipeline_without_assembly() {
        for stage_name in ["base", "provision", "configure", "persistence"] {
            let temp = TempDir::new().unwrap();
            let log = new_log();
            let mut pipeline = fake_pipeline(
                &temp,
                &log,
                FakeOptions {
                    fail_stage: Some(stage_name.to_string()),
                    ..FakeOptions::default()
                },
            );

            let err = pipeline.run().unwrap_err();
            match err.downcast_ref::<BuildError>() {
                Some(BuildError::Stage { stage, .. }) => assert_eq!(stage, stage_name),
                other => panic!("expected stage error for {}, got {:?}", stage_name, other),
            }
            assert_eq!(pipeline.state(), PipelineState::Failed);

            let events = entries(&log);
            assert!(!events.iter().any(|event| event == "assemble"));
            assert!(!temp.path().join("out/test-live.iso").exists());

            // Cleanup ran a full unwind pass after the failure.
            let failed_at = position(&events, &format!("stage {}", stage_name));
            assert!(
                events[failed_at..].iter().any(|event| event == "scan"),
                "no cleanup unwind after failure in '{}'",
                stage_name
            );
            if stage_name == "provision" {
                let unmounts = events[failed_at..]
                    .iter()
                    .filter(|event| event.starts_with("umount "))
                    .count();
                assert_eq!(unmounts, 4);
            }
        }
    }

    #[test]
    fn test_reset_is_idempotent_and_clears_stale_state() {
        let temp = TempDir::new().unwrap();
        let log = new_log();
        let mut pipeline = fake_pipeline(&temp, &log, FakeOptions::default());

        let root_dir = temp.path().join("work/root");
        fs::create_dir_all(root_dir.join("old")).unwrap();
        fs::write(root_dir.join("old/leftover"), "junk").unwrap();
        let destination = temp.path().join("out/test-live.iso");
        fs::create_dir_all(destination.parent().unwrap()).unwrap();
        fs::write(&destination, "stale").unwrap();

        pipeline.reset().unwrap();
        assert!(root_dir.is_dir());
        assert!(!root_dir.join("old").exists());
        assert!(!destination.exists());

        // Second reset with nothing left behind must also succeed.
        pipeline.reset().unwrap();
        assert!(root_dir.is_dir());
        assert!(temp.path().join("work/scratch").is_dir());
    }

    #[test]
    fn test_clean_removes_working_tree_and_scratch() {
        let temp = TempDir::new().unwrap();
        let log = new_log();
        let mut pipeline = fake_pipeline(&temp, &log, FakeOptions::default());

        let root_dir = temp.path().join("work/root");
        let scratch_dir = temp.path().join("work/scratch");
        fs::create_dir_all(root_dir.join("etc")).unwrap();
        fs::create_dir_all(&scratch_dir).unwrap();
        fs::write(scratch_dir.join("leftover.iso"), "x").unwrap();

        pipeline.clean().unwrap();
        assert!(!root_dir.exists());
        assert!(!scratch_dir.exists());
        // The workspace directory itself (with lock and report) survives.
        assert!(temp.path().join("work").is_dir());
    }

    #[test]
    fn test_residual_mounts_block_assembly() {
        let temp = TempDir::new().unwrap();
        let log = new_log();
        let mut pipeline = fake_pipeline(
            &temp,
            &log,
            FakeOptions {
                stuck: Some("dev/pts".to_string()),
                ..FakeOptions::default()
            },
        );

        let err = pipeline.run().unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::ResidualMounts { count, .. }) => assert_eq!(*count, 1),
            other => panic!("expected residual mount error, got {:?}", other),
        }
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert!(!entries(&log).iter().any(|event| event == "assemble"));
    }

    #[test]
    fn test_undersized_artifact_fails_run_without_publication() {
        let temp = TempDir::new().unwrap();
        let log = new_log();
        let mut pipeline = fake_pipeline(
            &temp,
            &log,
            FakeOptions {
                undersized_artifact: true,
                ..FakeOptions::default()
            },
        );

        let err = pipeline.run().unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::ArtifactSize { actual, floor }) => {
                assert_eq!(*actual, 12);
                assert_eq!(*floor, 1024 * 1024);
            }
            other => panic!("expected artifact size error, got {:?}", other),
        }
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert!(!temp.path().join("out/test-live.iso").exists());

        // All stages ran; only assembly refused the result.
        let run_report: RunReport = serde_json::from_slice(
            &fs::read(temp.path().join("work/report.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(run_report.status, "failed");
        assert_eq!(run_report.stages.len(), 4);
        assert!(run_report.error.unwrap().contains("artifact too small"));
    }

    #[test]
    fn test_precondition_failure_skips_cleanup() {
        fn verify_fail(_config: &BuildConfig) -> Result<()> {
            bail!("missing tool xyz")
        }

        let temp = TempDir::new().unwrap();
        let log = new_log();
        let mut pipeline = fake_pipeline(
            &temp,
            &log,
            FakeOptions {
                verifier: verify_fail,
                ..FakeOptions::default()
            },
        );

        let err = pipeline.run().unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::Precondition(detail)) => {
                assert!(detail.contains("missing tool xyz"))
            }
            other => panic!("expected precondition error, got {:?}", other),
        }
        assert_eq!(pipeline.state(), PipelineState::Failed);
        // Nothing was touched and nothing was cleaned.
        assert!(entries(&log).is_empty());
    }

    #[test]
    fn test_cancellation_routes_through_cleanup() {
        use std::sync::atomic::AtomicBool;

        static TEST_CANCEL: AtomicBool = AtomicBool::new(false);
        fn test_cancelled() -> bool {
            TEST_CANCEL.load(Ordering::SeqCst)
        }

        TEST_CANCEL.store(true, Ordering::SeqCst);
        let temp = TempDir::new().unwrap();
        let log = new_log();
        let mut pipeline = fake_pipeline(
            &temp,
            &log,
            FakeOptions {
                cancelled: test_cancelled,
                ..FakeOptions::default()
            },
        );

        let err = pipeline.run().unwrap_err();
        assert!(format!("{:#}", err).contains("cancelled"));
        assert_eq!(pipeline.state(), PipelineState::Failed);

        let events = entries(&log);
        assert!(!events.iter().any(|event| event == "assemble"));
        // The cleanup pass still swept for mounts.
        assert!(events.iter().any(|event| event == "scan"));
        TEST_CANCEL.store(false, Ordering::SeqCst);
    }
}
