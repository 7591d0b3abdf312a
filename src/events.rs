//! Backend lifecycle events and the add/update/remove state machine
//!
//! Each event is handled to completion: the fragment change is made durable
//! first, then nginx is reloaded. A failed write never reaches the reload
//! step. When nginx rejects the new configuration the fragment is rolled
//! back, so a bad route cannot poison later reloads. Every failure is reported to the [`OperatorSink`] before it is
//! returned, so nothing is swallowed when the caller ignores the result.

use crate::error::{Error, Result};
use crate::fragment::{validate_id, BackendKind, FragmentRepository, RouteFragment};
use crate::reload::ReloadCoordinator;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Fields whose change alters the route of an existing backend
pub const ROUTE_FIELDS: &[&str] = &["hostname", "render_url"];

/// Severity of an operator-visible message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Where operator-visible messages go
pub trait OperatorSink {
    fn report(&self, severity: Severity, message: &str);
}

impl<T: OperatorSink + ?Sized> OperatorSink for Arc<T> {
    fn report(&self, severity: Severity, message: &str) {
        (**self).report(severity, message)
    }
}

/// Sends operator messages to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl OperatorSink for TracingSink {
    fn report(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(target: "webscale::operator", "{}", message),
            Severity::Warning => warn!(target: "webscale::operator", "{}", message),
            Severity::Error => error!(target: "webscale::operator", "{}", message),
        }
    }
}

/// A change to a remote collector or hub, as delivered by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BackendEvent {
    BackendInstalled {
        kind: BackendKind,
        id: String,
        hostname: String,
    },
    BackendUpdated {
        kind: BackendKind,
        id: String,
        hostname: String,
        #[serde(default)]
        changed_fields: Vec<String>,
    },
    BackendRemoved {
        kind: BackendKind,
        id: String,
    },
}

impl BackendEvent {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendEvent::BackendInstalled { kind, .. }
            | BackendEvent::BackendUpdated { kind, .. }
            | BackendEvent::BackendRemoved { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            BackendEvent::BackendInstalled { id, .. }
            | BackendEvent::BackendUpdated { id, .. }
            | BackendEvent::BackendRemoved { id, .. } => id,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            BackendEvent::BackendInstalled { .. } => "adding",
            BackendEvent::BackendUpdated { .. } => "updating",
            BackendEvent::BackendRemoved { .. } => "removing",
        }
    }
}

/// What handling an event changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Fragment written and nginx reloaded
    Routed(RouteFragment),
    /// Update touched no routing field
    Unchanged,
    /// Fragment deleted (`existed` is false when there was nothing to delete)
    Removed { existed: bool },
}

/// Result of reconciling the fragment directory against a full backend list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Backends that had no fragment
    pub added: Vec<String>,
    /// Fragments whose host changed
    pub updated: Vec<String>,
    /// Fragments for backends no longer present
    pub removed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Applies backend events to the fragment repository and reloads nginx
pub struct EventHandler<R> {
    repository: R,
    reloader: ReloadCoordinator,
    sink: Box<dyn OperatorSink>,
    reload_on_remove: bool,
}

impl<R: FragmentRepository> EventHandler<R> {
    pub fn new(repository: R, reloader: ReloadCoordinator, sink: Box<dyn OperatorSink>) -> Self {
        Self {
            repository,
            reloader,
            sink,
            reload_on_remove: true,
        }
    }

    /// Whether a removal is followed by a best-effort reload (default: true)
    pub fn with_reload_on_remove(mut self, enabled: bool) -> Self {
        self.reload_on_remove = enabled;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub async fn handle(&self, event: &BackendEvent) -> Result<EventOutcome> {
        info!(event = event.verb(), kind = %event.kind(), id = event.id(), "Handling backend event");

        let result = match event {
            BackendEvent::BackendInstalled { kind, id, hostname } => {
                self.route(*kind, id, hostname).await
            }
            BackendEvent::BackendUpdated {
                kind,
                id,
                hostname,
                changed_fields,
            } => {
                if changed_fields.iter().any(|f| ROUTE_FIELDS.contains(&f.as_str())) {
                    self.route(*kind, id, hostname).await
                } else {
                    debug!(kind = %kind, id = %id, ?changed_fields, "Update does not affect routing");
                    Ok(EventOutcome::Unchanged)
                }
            }
            BackendEvent::BackendRemoved { kind, id } => self.unroute(*kind, id).await,
        };

        if let Err(e) = &result {
            self.sink.report(Severity::Error, &failure_message(event, e));
        }
        result
    }

    /// Make the fragment directory match `desired` exactly, then reload once
    ///
    /// Used for administrative regeneration: fragments for unknown backends
    /// are deleted, missing or stale ones are written. Nothing is reloaded
    /// when nothing changed.
    pub async fn reconcile(&self, desired: &[RouteFragment]) -> Result<ReconcileReport> {
        let result = self.reconcile_inner(desired).await;
        if let Err(e) = &result {
            self.sink
                .report(Severity::Error, &format!("Proxy route reconciliation failed: {}", e));
        }
        result
    }

    async fn reconcile_inner(&self, desired: &[RouteFragment]) -> Result<ReconcileReport> {
        let current: BTreeMap<(BackendKind, String), RouteFragment> = self
            .repository
            .list()?
            .into_iter()
            .map(|f| ((f.kind, f.id.clone()), f))
            .collect();
        let mut report = ReconcileReport::default();

        for fragment in desired {
            match current.get(&(fragment.kind, fragment.id.clone())) {
                Some(existing) if existing == fragment => {}
                Some(_) => {
                    self.repository.put(fragment)?;
                    report.updated.push(fragment.id.clone());
                }
                None => {
                    self.repository.put(fragment)?;
                    report.added.push(fragment.id.clone());
                }
            }
        }

        // Unparsable fragments are still included by nginx, so go by file name
        for (kind, id) in self.repository.registered()? {
            if !desired.iter().any(|f| f.kind == kind && f.id == id) {
                self.repository.delete(kind, &id)?;
                report.removed.push(id);
            }
        }

        if !report.is_empty() {
            self.reloader.reload().await?;
        }

        info!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            "Proxy routes reconciled"
        );
        Ok(report)
    }

    async fn route(&self, kind: BackendKind, id: &str, hostname: &str) -> Result<EventOutcome> {
        let fragment = RouteFragment::new(kind, id, hostname)?;
        let previous = self.repository.get(kind, id)?;
        self.repository.put(&fragment)?;
        if let Err(e) = self.reloader.reload().await {
            if matches!(e, Error::ConfigValidation { .. }) {
                self.roll_back(&fragment, previous.as_ref());
            }
            return Err(e);
        }
        info!(kind = %kind, id, url = %fragment.render_url_prefix(), "Backend routed through proxy");
        Ok(EventOutcome::Routed(fragment))
    }

    /// Put back what was there before `fragment` was written
    ///
    /// nginx keeps serving its old configuration after a rejected reload, so
    /// only the files need restoring.
    fn roll_back(&self, fragment: &RouteFragment, previous: Option<&RouteFragment>) {
        let result = match previous {
            Some(previous) => self.repository.put(previous),
            None => self.repository.delete(fragment.kind, &fragment.id).map(|_| ()),
        };
        match result {
            Ok(()) => warn!(
                kind = %fragment.kind,
                id = %fragment.id,
                restored = previous.is_some(),
                "nginx rejected the new route; fragment rolled back"
            ),
            Err(e) => error!(
                kind = %fragment.kind,
                id = %fragment.id,
                error = %e,
                "Could not roll back rejected fragment"
            ),
        }
    }

    async fn unroute(&self, kind: BackendKind, id: &str) -> Result<EventOutcome> {
        validate_id(id)?;
        let existed = self.repository.delete(kind, id)?;

        // nginx 404s a path whose fragment is gone only after a reload
        if existed && self.reload_on_remove {
            if let Err(e) = self.reloader.reload().await {
                warn!(kind = %kind, id, error = %e, "Reload after removal failed");
                self.sink.report(
                    Severity::Warning,
                    &format!("Removed proxy route for {} '{}' but nginx reload failed: {}", kind, id, e),
                );
            }
        }
        Ok(EventOutcome::Removed { existed })
    }
}

fn failure_message(event: &BackendEvent, err: &Error) -> String {
    if err.is_reload_failure() {
        format!(
            "nginx reload failed after {} {} '{}': {}",
            event.verb(),
            event.kind(),
            event.id(),
            err
        )
    } else {
        format!(
            "Unable to update proxy route while {} {} '{}': {}",
            event.verb(),
            event.kind(),
            event.id(),
            err
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FsFragmentStore;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<(Severity, String)>>,
    }

    impl RecordingSink {
        fn messages(&self) -> Vec<(Severity, String)> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl OperatorSink for RecordingSink {
        fn report(&self, severity: Severity, message: &str) {
            self.messages.lock().unwrap().push((severity, message.to_string()));
        }
    }

    /// Repository whose writes always fail
    struct ReadOnlyRepository;

    impl FragmentRepository for ReadOnlyRepository {
        fn list(&self) -> Result<Vec<RouteFragment>> {
            Ok(Vec::new())
        }

        fn get(&self, _kind: BackendKind, _id: &str) -> Result<Option<RouteFragment>> {
            Ok(None)
        }

        fn put(&self, fragment: &RouteFragment) -> Result<()> {
            Err(Error::ConfigWrite {
                target: format!("{} '{}'", fragment.kind, fragment.id),
                path: fragment.file_name().into(),
                message: "read-only filesystem".to_string(),
            })
        }

        fn delete(&self, _kind: BackendKind, _id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn sh(script: &str) -> ReloadCoordinator {
        ReloadCoordinator::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        )
    }

    fn installed(id: &str, host: &str) -> BackendEvent {
        BackendEvent::BackendInstalled {
            kind: BackendKind::Collector,
            id: id.to_string(),
            hostname: host.to_string(),
        }
    }

    #[test]
    fn test_event_json() {
        let event: BackendEvent = serde_json::from_str(
            r#"{"event":"backend_updated","kind":"hub","id":"h1","hostname":"10.0.0.9","changed_fields":["hostname"]}"#,
        )
        .unwrap();
        assert_eq!(event.kind(), BackendKind::Hub);
        assert_eq!(event.id(), "h1");

        let removed: BackendEvent =
            serde_json::from_str(r#"{"event":"backend_removed","kind":"collector","id":"dc1"}"#).unwrap();
        assert_eq!(
            removed,
            BackendEvent::BackendRemoved {
                kind: BackendKind::Collector,
                id: "dc1".to_string()
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_writes_and_reloads() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("reloads");
        let sink = Arc::new(RecordingSink::default());
        let handler = EventHandler::new(
            FsFragmentStore::new(tmp.path().join("etc")),
            sh(&format!("echo reload >> '{}'", marker.display())),
            Box::new(sink.clone()),
        );

        let outcome = handler.handle(&installed("dc1", "10.1.1.1")).await.unwrap();
        match outcome {
            EventOutcome::Routed(fragment) => assert_eq!(fragment.port, 8091),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(tmp.path().join("etc/proxy-collector-dc1.conf").exists());
        assert_eq!(std::fs::read_to_string(&marker).unwrap().lines().count(), 1);
        assert!(sink.messages().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_failure_skips_reload() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("reloaded");
        let sink = Arc::new(RecordingSink::default());
        let handler = EventHandler::new(
            ReadOnlyRepository,
            sh(&format!("touch '{}'", marker.display())),
            Box::new(sink.clone()),
        );

        let err = handler.handle(&installed("dc1", "10.1.1.1")).await.unwrap_err();
        assert!(matches!(err, Error::ConfigWrite { .. }));
        assert!(!marker.exists());

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, Severity::Error);
        assert!(messages[0].1.contains("dc1"));
        assert!(messages[0].1.contains("read-only filesystem"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reload_failure_is_reported_with_diagnostic() {
        let tmp = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let handler = EventHandler::new(
            FsFragmentStore::new(tmp.path()),
            sh("echo 'nginx: [emerg] host not found in upstream' >&2; exit 1"),
            Box::new(sink.clone()),
        );

        let err = handler.handle(&installed("dc1", "10.1.1.1")).await.unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { .. }));

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.starts_with("nginx reload failed after adding collector 'dc1'"));
        assert!(messages[0].1.contains("host not found in upstream"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejected_install_removes_new_fragment() {
        let tmp = TempDir::new().unwrap();
        let handler = EventHandler::new(
            FsFragmentStore::new(tmp.path()),
            sh("echo 'nginx: [emerg] invalid port' >&2; exit 1"),
            Box::new(TracingSink),
        );

        let err = handler.handle(&installed("dc1", "10.1.1.1")).await.unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { .. }));
        assert!(!tmp.path().join("proxy-collector-dc1.conf").exists());
        assert!(handler.repository().list().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejected_update_restores_previous_fragment() {
        let tmp = TempDir::new().unwrap();
        let store = FsFragmentStore::new(tmp.path());
        store
            .put(&RouteFragment::new(BackendKind::Collector, "dc1", "10.1.1.1").unwrap())
            .unwrap();
        let handler = EventHandler::new(store, sh("exit 1"), Box::new(TracingSink));

        let moved = BackendEvent::BackendUpdated {
            kind: BackendKind::Collector,
            id: "dc1".to_string(),
            hostname: "10.2.2.2".to_string(),
            changed_fields: vec!["hostname".to_string()],
        };
        assert!(handler.handle(&moved).await.is_err());

        let current = handler.repository().get(BackendKind::Collector, "dc1").unwrap().unwrap();
        assert_eq!(current.host, "10.1.1.1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_reload_keeps_fragment() {
        let tmp = TempDir::new().unwrap();
        let handler = EventHandler::new(
            FsFragmentStore::new(tmp.path()),
            ReloadCoordinator::new(
                vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
                Duration::from_millis(100),
            ),
            Box::new(TracingSink),
        );

        let err = handler.handle(&installed("dc1", "10.1.1.1")).await.unwrap_err();
        assert!(matches!(err, Error::ReloadTimeout { .. }));
        assert!(tmp.path().join("proxy-collector-dc1.conf").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_update_only_on_route_fields() {
        let tmp = TempDir::new().unwrap();
        let handler = EventHandler::new(
            FsFragmentStore::new(tmp.path()),
            sh("true"),
            Box::new(TracingSink),
        );
        handler.handle(&installed("dc1", "10.1.1.1")).await.unwrap();

        let cosmetic = BackendEvent::BackendUpdated {
            kind: BackendKind::Collector,
            id: "dc1".to_string(),
            hostname: "10.2.2.2".to_string(),
            changed_fields: vec!["title".to_string()],
        };
        assert_eq!(handler.handle(&cosmetic).await.unwrap(), EventOutcome::Unchanged);
        let current = handler.repository().get(BackendKind::Collector, "dc1").unwrap().unwrap();
        assert_eq!(current.host, "10.1.1.1");

        let moved = BackendEvent::BackendUpdated {
            kind: BackendKind::Collector,
            id: "dc1".to_string(),
            hostname: "10.2.2.2".to_string(),
            changed_fields: vec!["hostname".to_string()],
        };
        handler.handle(&moved).await.unwrap();
        let current = handler.repository().get(BackendKind::Collector, "dc1").unwrap().unwrap();
        assert_eq!(current.host, "10.2.2.2");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remove_with_failing_reload_only_warns() {
        let tmp = TempDir::new().unwrap();
        let store = FsFragmentStore::new(tmp.path());
        store
            .put(&RouteFragment::new(BackendKind::Hub, "h1", "10.0.0.3").unwrap())
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let handler = EventHandler::new(store, sh("exit 1"), Box::new(sink.clone()));

        let removed = BackendEvent::BackendRemoved {
            kind: BackendKind::Hub,
            id: "h1".to_string(),
        };
        assert_eq!(
            handler.handle(&removed).await.unwrap(),
            EventOutcome::Removed { existed: true }
        );
        assert_eq!(handler.handle(&removed).await.unwrap(), EventOutcome::Removed { existed: false });

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, Severity::Warning);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remove_without_reload() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("reloaded");
        let store = FsFragmentStore::new(tmp.path().join("etc"));
        store
            .put(&RouteFragment::new(BackendKind::Hub, "h1", "10.0.0.3").unwrap())
            .unwrap();
        let handler = EventHandler::new(
            store,
            sh(&format!("touch '{}'", marker.display())),
            Box::new(TracingSink),
        )
        .with_reload_on_remove(false);

        let removed = BackendEvent::BackendRemoved {
            kind: BackendKind::Hub,
            id: "h1".to_string(),
        };
        handler.handle(&removed).await.unwrap();
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_invalid_id_is_reported() {
        let sink = Arc::new(RecordingSink::default());
        let handler = EventHandler::new(
            ReadOnlyRepository,
            ReloadCoordinator::new(vec!["true".to_string()], Duration::from_secs(1)),
            Box::new(sink.clone()),
        );

        let err = handler.handle(&installed("../etc", "10.1.1.1")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidBackendId(_)));
        assert_eq!(sink.messages().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reconcile() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("reloads");
        let store = FsFragmentStore::new(tmp.path().join("etc"));
        store
            .put(&RouteFragment::new(BackendKind::Collector, "dc1", "10.0.0.1").unwrap())
            .unwrap();
        store
            .put(&RouteFragment::new(BackendKind::Collector, "old", "10.0.0.5").unwrap())
            .unwrap();
        store
            .put(&RouteFragment::new(BackendKind::Hub, "h1", "10.0.0.3").unwrap())
            .unwrap();
        let handler = EventHandler::new(
            store,
            sh(&format!("echo reload >> '{}'", marker.display())),
            Box::new(TracingSink),
        );

        let desired = vec![
            RouteFragment::new(BackendKind::Collector, "dc1", "10.0.0.1").unwrap(),
            RouteFragment::new(BackendKind::Collector, "dc2", "10.0.0.2").unwrap(),
            RouteFragment::new(BackendKind::Hub, "h1", "10.0.0.4").unwrap(),
        ];
        let report = handler.reconcile(&desired).await.unwrap();
        assert_eq!(report.added, vec!["dc2"]);
        assert_eq!(report.updated, vec!["h1"]);
        assert_eq!(report.removed, vec!["old"]);
        assert_eq!(handler.repository().list().unwrap(), desired);

        // Second pass is a no-op and does not reload
        let report = handler.reconcile(&desired).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(std::fs::read_to_string(&marker).unwrap().lines().count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reconcile_removes_unparsable_fragments() {
        let tmp = TempDir::new().unwrap();
        let broken = tmp.path().join("proxy-collector-broken.conf");
        std::fs::write(&broken, "location ^~ /remote-collector/broken/ {\n    proxy_pass http://;\n}\n")
            .unwrap();
        let handler = EventHandler::new(FsFragmentStore::new(tmp.path()), sh("true"), Box::new(TracingSink));

        let report = handler.reconcile(&[]).await.unwrap();
        assert_eq!(report.removed, vec!["broken"]);
        assert!(!broken.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reconcile_rewrites_unparsable_desired_fragment() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("proxy-hub-h1.conf"), "garbage").unwrap();
        let handler = EventHandler::new(FsFragmentStore::new(tmp.path()), sh("true"), Box::new(TracingSink));

        let desired = vec![RouteFragment::new(BackendKind::Hub, "h1", "10.0.0.3").unwrap()];
        let report = handler.reconcile(&desired).await.unwrap();
        assert_eq!(report.added, vec!["h1"]);
        assert!(report.removed.is_empty());
        assert_eq!(handler.repository().list().unwrap(), desired);
    }
}
