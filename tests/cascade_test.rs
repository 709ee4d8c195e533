//! Integration tests for the two-phase job entry.

mod common;

use cascade_rs::balance::{AccountBalancer, Balancer, CommandBalancer, NoopBalancer};
use cascade_rs::engine::{AdmissionConfig, AdmissionController, JobEntry};
use cascade_rs::error::{Error, Result};
use cascade_rs::queue::QueueStore;
use common::{FakeBatch, job_names, scratch_queue};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Records each call along with how many entries were still queued then.
struct RecordingBalancer {
    store: QueueStore,
    fail: bool,
    calls: Mutex<Vec<(String, PathBuf, usize)>>,
}

impl RecordingBalancer {
    fn new(store: QueueStore) -> Self {
        Self {
            store,
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl AccountBalancer for RecordingBalancer {
    async fn balance(&self, identity: &str, results_dir: &Path) -> Result<()> {
        let pending = self.store.len()?;
        self.calls
            .lock()
            .unwrap()
            .push((identity.to_string(), results_dir.to_path_buf(), pending));
        if self.fail {
            Err(Error::Other("balancer exploded".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Collects formatted log lines, standing in for a job's `.out` file.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

#[tokio::test]
async fn scheduling_turn_runs_before_the_balancer_exactly_once() {
    let scratch = scratch_queue(&["A", "B", "C"]);
    let ctl = AdmissionController::new(
        FakeBatch::with_active(0),
        scratch.store.clone(),
        AdmissionConfig::new(2),
    );
    let balancer = RecordingBalancer::new(scratch.store.clone());
    let results = scratch.dir.path().to_path_buf();

    let entry = JobEntry::new(&ctl, &balancer, "5151", "alice", &results);
    let phase = entry.schedule().await;

    assert_eq!(phase.turn.unwrap().submitted().len(), 2);
    assert!(phase.balance.is_ok());
    let calls = balancer.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    // The balancer works for the account user, not for this job.
    assert_eq!(calls[0].0, "alice");
    assert_eq!(calls[0].1, results);
    // The turn had already drained A and B when the balancer ran.
    assert_eq!(calls[0].2, 1);
}

#[tokio::test]
async fn payload_runs_after_scheduling_and_its_code_is_returned() {
    let scratch = scratch_queue(&["A"]);
    let ctl = AdmissionController::new(
        FakeBatch::with_active(0),
        scratch.store.clone(),
        AdmissionConfig::new(950),
    );
    let marker = scratch.dir.path().join("payload-ran");
    let payload = sh(&format!(
        "test ! -e {q}/A.sh && touch {m}; exit 3",
        q = scratch.queue_dir().display(),
        m = marker.display()
    ));

    let entry = JobEntry::new(&ctl, &NoopBalancer, "5151", "alice", scratch.dir.path());
    let (phase, code) = entry.run(&payload).await.unwrap();

    assert!(phase.turn.is_ok());
    assert_eq!(code, 3);
    // The payload saw the queue already drained.
    assert!(marker.exists());
}

#[tokio::test]
async fn fatal_scheduling_does_not_cost_the_payload() {
    let names = job_names(12);
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let scratch = scratch_queue(&names);
    let ctl = AdmissionController::new(
        FakeBatch::rejecting_all(),
        scratch.store.clone(),
        AdmissionConfig::new(950),
    );
    let balancer = RecordingBalancer::new(scratch.store.clone());
    let marker = scratch.dir.path().join("payload-ran");

    let entry = JobEntry::new(&ctl, &balancer, "5151", "alice", scratch.dir.path());
    let (phase, code) = entry
        .run(&sh(&format!("touch {}", marker.display())))
        .await
        .unwrap();

    assert!(phase.is_fatal());
    assert_eq!(balancer.calls.lock().unwrap().len(), 1);
    assert_eq!(code, 0);
    assert!(marker.exists());
    assert_eq!(scratch.store.len().unwrap(), 12);
}

#[tokio::test]
async fn fatal_scheduling_is_logged_as_an_error_before_the_payload() {
    let names = job_names(10);
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let scratch = scratch_queue(&names);
    let ctl = AdmissionController::new(
        FakeBatch::rejecting_all(),
        scratch.store.clone(),
        AdmissionConfig::new(950),
    );
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .with_writer(move || writer.clone())
        .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let entry = JobEntry::new(&ctl, &NoopBalancer, "5151", "alice", scratch.dir.path());
    let (phase, code) = entry.run(&sh("exit 0")).await.unwrap();

    assert!(phase.is_fatal());
    assert_eq!(code, 0);
    let out = logs.contents();
    let line = out
        .lines()
        .find(|l| l.contains("batch service unavailable during scheduling"))
        .expect("fatal scheduling is logged");
    assert!(line.contains("ERROR"));
    assert!(line.contains("5151"));
}

#[tokio::test]
async fn balancer_failure_is_reported_not_fatal() {
    let scratch = scratch_queue(&["A"]);
    let ctl = AdmissionController::new(
        FakeBatch::with_active(0),
        scratch.store.clone(),
        AdmissionConfig::new(950),
    );
    let mut balancer = RecordingBalancer::new(scratch.store.clone());
    balancer.fail = true;

    let phase = JobEntry::new(&ctl, &balancer, "5151", "alice", scratch.dir.path())
        .schedule()
        .await;

    assert!(phase.turn.is_ok());
    assert!(phase.balance.is_err());
    assert!(!phase.is_fatal());
}

#[tokio::test]
async fn denied_turn_still_balances() {
    let scratch = scratch_queue(&["A"]);
    std::fs::write(
        scratch.queue_dir().join(cascade_rs::lock::LOCK_FILE),
        "scheduler id = 1\n",
    )
    .unwrap();
    let ctl = AdmissionController::new(
        FakeBatch::with_active(0),
        scratch.store.clone(),
        AdmissionConfig::new(950),
    );
    let balancer = RecordingBalancer::new(scratch.store.clone());

    let phase = JobEntry::new(&ctl, &balancer, "5151", "alice", scratch.dir.path())
        .schedule()
        .await;

    assert!(phase.turn.unwrap().submitted().is_empty());
    assert_eq!(balancer.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn command_balancer_passes_identity_and_results_dir() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("args.txt");
    let script = dir.path().join("balance.sh");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho \"$1 $2\" > {}\n", out.display()),
    )
    .unwrap();
    make_executable(&script);

    let balancer = Balancer::from_program(Some(script.clone()));
    balancer.balance("alice", Path::new("/results")).await.unwrap();

    let written = std::fs::read_to_string(&out).unwrap();
    assert_eq!(written.trim(), "alice /results");
}

#[tokio::test]
async fn command_balancer_failure_surfaces_status() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("balance.sh");
    std::fs::write(&script, "#!/bin/sh\necho nope >&2\nexit 4\n").unwrap();
    make_executable(&script);

    let err = CommandBalancer::new(&script)
        .balance("alice", Path::new("/results"))
        .await
        .unwrap_err();

    match err {
        Error::Command { code, stderr, .. } => {
            assert_eq!(code, 4);
            assert_eq!(stderr, "nope");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn empty_payload_is_an_error() {
    assert!(cascade_rs::engine::cascade::run_payload(&[]).await.is_err());
}

fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}
