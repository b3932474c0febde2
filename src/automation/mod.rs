//! External office automation: field recalculation and fixed-layout export.
//!
//! There is one automation session per process. [`AutomationGate`] owns the client and runs
//! every connect → invoke → close sequence under its mutex, on a worker thread it stops
//! waiting for once the timeout expires.

pub mod soffice;

use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{AssemblyError, Result};

pub use soffice::SofficeClient;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AutomationOp {
    /// Refresh fields (table of contents included) and save in place.
    RecalculateFields,
    /// Write a PDF rendition of the document into `out_dir`.
    ExportPdf { out_dir: PathBuf },
}

impl fmt::Display for AutomationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecalculateFields => f.write_str("recalculate fields"),
            Self::ExportPdf { .. } => f.write_str("export pdf"),
        }
    }
}

pub trait OfficeAutomation: Send {
    fn connect(&mut self) -> Result<()>;

    /// Run `op` on `document` (absolute path) and return the produced artifact.
    fn invoke(&mut self, op: &AutomationOp, document: &Path, timeout: Duration) -> Result<PathBuf>;

    fn close(&mut self) -> Result<()>;

    /// Whether this client is set up to perform `op` at all.
    fn supports(&self, _op: &AutomationOp) -> bool {
        true
    }
}

/// Checks made before a document is handed to the automation session.
pub fn preflight(path: &Path) -> Result<PathBuf> {
    let denied = |reason: &str| AssemblyError::DocumentNotAccessible {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if !path.is_file() {
        return Err(denied("does not exist"));
    }
    let abs = fs::canonicalize(path).map_err(|_| denied("cannot resolve path"))?;
    let meta = fs::metadata(&abs).map_err(|_| denied("not readable"))?;
    fs::File::open(&abs).map_err(|_| denied("not readable"))?;
    if meta.permissions().readonly() {
        return Err(denied("not writable"));
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(&abs)
        .map_err(|_| denied("locked by another process"))?;
    if let (Some(dir), Some(name)) = (abs.parent(), abs.file_name().and_then(|n| n.to_str())) {
        for lock in [format!(".~lock.{name}#"), format!("~${name}")] {
            if dir.join(&lock).exists() {
                return Err(denied("locked by another process"));
            }
        }
    }
    Ok(abs)
}

type Session = Box<dyn OfficeAutomation>;
type SessionFactory = Box<dyn Fn() -> Session + Send + Sync>;

pub struct AutomationGate {
    session: Mutex<Option<Session>>,
    factory: Option<SessionFactory>,
    timeout: Duration,
}

impl AutomationGate {
    /// Gate over a single session. A session abandoned after a timeout is not replaced.
    pub fn new(client: Session, timeout: Duration) -> Self {
        Self {
            session: Mutex::new(Some(client)),
            factory: None,
            timeout,
        }
    }

    /// Gate that opens sessions from `factory` on demand and after a timeout.
    pub fn with_factory<F>(factory: F, timeout: Duration) -> Self
    where
        F: Fn() -> Session + Send + Sync + 'static,
    {
        Self {
            session: Mutex::new(None),
            factory: Some(Box::new(factory)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn supports(&self, op: &AutomationOp) -> bool {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        match self.checkout(&mut slot) {
            Ok(client) => {
                let supported = client.supports(op);
                *slot = Some(client);
                supported
            }
            Err(_) => false,
        }
    }

    fn checkout(&self, slot: &mut Option<Session>) -> Result<Session> {
        if let Some(client) = slot.take() {
            return Ok(client);
        }
        match self.factory.as_ref() {
            Some(make) => {
                debug!("opening office automation session");
                Ok(make())
            }
            None => Err(AssemblyError::ExternalServiceUnavailable(
                "office automation session was abandoned after a timeout".to_string(),
            )),
        }
    }

    /// Preflight `document`, then run `op` while holding the session.
    ///
    /// The session runs on a worker thread. When it does not answer within the timeout the
    /// caller gets `ExternalServiceUnavailable` and the session is abandoned; the next call
    /// opens a new one.
    pub fn run(&self, op: &AutomationOp, document: &Path) -> Result<PathBuf> {
        let path = preflight(document)?;
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let mut client = self.checkout(&mut slot)?;
        info!(%op, path = %path.display(), "office automation");

        let (tx, rx) = mpsc::channel();
        let timeout = self.timeout;
        let job = (op.clone(), path);
        let started = Instant::now();
        thread::Builder::new()
            .name("office-automation".to_string())
            .spawn(move || {
                let (op, path) = job;
                let result = client.connect().and_then(|()| {
                    let result = client.invoke(&op, &path, timeout);
                    if let Err(e) = client.close() {
                        warn!(error = %e, "closing office automation session failed");
                    }
                    result
                });
                // The receiver is gone once the caller has given up.
                let _ = tx.send((client, result));
            })
            .map_err(|e| AssemblyError::io("spawn office automation worker", e))?;

        match rx.recv_timeout(timeout) {
            Ok((client, result)) => {
                *slot = Some(client);
                debug!(%op, elapsed = ?started.elapsed(), "office automation finished");
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(%op, ?timeout, "office automation did not answer; session abandoned");
                Err(AssemblyError::ExternalServiceUnavailable(format!(
                    "{op} exceeded {timeout:?}"
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(AssemblyError::ExternalOperationFailed(
                format!("{op}: automation worker stopped without a result"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    struct Counters {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        closes: AtomicUsize,
    }

    struct MockSession {
        counters: Arc<Counters>,
        delay: Duration,
        fail: bool,
    }

    impl OfficeAutomation for MockSession {
        fn connect(&mut self) -> Result<()> {
            let now = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.peak.fetch_max(now, Ordering::SeqCst);
            Ok(())
        }

        fn invoke(
            &mut self,
            _op: &AutomationOp,
            document: &Path,
            _timeout: Duration,
        ) -> Result<PathBuf> {
            self.counters.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if self.fail {
                return Err(AssemblyError::ExternalOperationFailed("boom".into()));
            }
            Ok(document.to_path_buf())
        }

        fn close(&mut self) -> Result<()> {
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn gate(delay: Duration, timeout: Duration, fail: bool) -> (AutomationGate, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let session = MockSession {
            counters: counters.clone(),
            delay,
            fail,
        };
        (AutomationGate::new(Box::new(session), timeout), counters)
    }

    #[test]
    fn sessions_never_overlap() {
        let tmp = tempfile::tempdir().unwrap();
        let docs: Vec<PathBuf> = (0..4)
            .map(|i| {
                let p = tmp.path().join(format!("doc{i}.docx"));
                std::fs::write(&p, b"x").unwrap();
                p
            })
            .collect();
        let (gate, counters) = gate(Duration::from_millis(20), Duration::from_secs(5), false);
        thread::scope(|s| {
            for doc in &docs {
                let gate = &gate;
                s.spawn(move || gate.run(&AutomationOp::RecalculateFields, doc).unwrap());
            }
        });
        assert_eq!(counters.calls.load(Ordering::SeqCst), 4);
        assert_eq!(counters.peak.load(Ordering::SeqCst), 1);
    }

    fn wait_for(counter: &AtomicUsize, want: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if counter.load(Ordering::SeqCst) == want {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn hanging_client_is_abandoned_at_the_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = tmp.path().join("slow.docx");
        std::fs::write(&doc, b"x").unwrap();
        let (gate, counters) = gate(Duration::from_secs(3), Duration::from_millis(100), false);

        let started = Instant::now();
        let err = gate.run(&AutomationOp::RecalculateFields, &doc).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, AssemblyError::ExternalServiceUnavailable(_)));

        let err = gate.run(&AutomationOp::RecalculateFields, &doc).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::ExternalServiceUnavailable(ref m) if m.contains("abandoned")
        ));
        assert_eq!(counters.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn factory_replaces_an_abandoned_session() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = tmp.path().join("report.docx");
        std::fs::write(&doc, b"x").unwrap();
        let counters = Arc::new(Counters::default());
        let opened = Arc::new(AtomicUsize::new(0));

        let (c, o) = (counters.clone(), opened.clone());
        let gate = AutomationGate::with_factory(
            move || {
                let first = o.fetch_add(1, Ordering::SeqCst) == 0;
                Box::new(MockSession {
                    counters: c.clone(),
                    delay: if first { Duration::from_secs(2) } else { Duration::ZERO },
                    fail: false,
                }) as Session
            },
            Duration::from_millis(100),
        );

        let err = gate.run(&AutomationOp::RecalculateFields, &doc).unwrap_err();
        assert!(matches!(err, AssemblyError::ExternalServiceUnavailable(_)));
        let out = gate.run(&AutomationOp::RecalculateFields, &doc).unwrap();
        assert_eq!(out, doc.canonicalize().unwrap());
        assert_eq!(opened.load(Ordering::SeqCst), 2);

        // The abandoned session still closes once its call returns.
        assert!(wait_for(&counters.closes, 2));
    }

    #[test]
    fn client_failure_propagates_after_close() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = tmp.path().join("bad.docx");
        std::fs::write(&doc, b"x").unwrap();
        let (gate, counters) = gate(Duration::ZERO, Duration::from_secs(1), true);
        let err = gate.run(&AutomationOp::RecalculateFields, &doc).unwrap_err();
        assert!(matches!(err, AssemblyError::ExternalOperationFailed(_)));
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn preflight_rejects_missing_and_locked_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("none.docx");
        let err = preflight(&missing).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::DocumentNotAccessible { ref reason, .. } if reason == "does not exist"
        ));

        let doc = tmp.path().join("report.docx");
        std::fs::write(&doc, b"x").unwrap();
        assert!(preflight(&doc).unwrap().is_absolute());

        std::fs::write(tmp.path().join(".~lock.report.docx#"), b"").unwrap();
        let err = preflight(&doc).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::DocumentNotAccessible { ref reason, .. } if reason.contains("locked")
        ));
    }

    #[test]
    fn preflight_failure_never_reaches_the_client() {
        let tmp = tempfile::tempdir().unwrap();
        let (gate, counters) = gate(Duration::ZERO, Duration::from_secs(1), false);
        let missing = tmp.path().join("x.docx");
        assert!(gate.run(&AutomationOp::RecalculateFields, &missing).is_err());
        assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
    }
}
