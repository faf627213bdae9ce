//! Session registry and lifecycle owner (C5).
//!
//! Grounded on the teacher's `ShellSessionManager`: an in-memory map guarded
//! by `RwLock`, a quota enforced at `register`, ID generation, and a bulk
//! close that logs (rather than aborts on) each per-item failure while
//! still aggregating them into one error for the caller. Two things the
//! teacher doesn't have: a pooled SSH `ControlSession` shared by every
//! session to the same host, and a `Store`-backed metadata table that lets
//! sessions be recovered on demand after a process restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::channel::local::{resolve_shell, LocalChannel};
use crate::channel::remote::{parse_connection_string, ControlSession, RemoteAuth, RemoteChannel};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{SessionError, SessionResult};
use crate::fs::FileSystem;
use crate::metadata::{SessionKind, SessionMetadata, Store};
use crate::policy::CommandPolicy;
use crate::prompt::PromptDetector;
use crate::random::{generate_session_id, Random};
use crate::session::{Session, SessionInit, Status};

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    control_pool: RwLock<HashMap<String, Arc<ControlSession>>>,
    config: Config,
    detector: Arc<PromptDetector>,
    policy: Arc<CommandPolicy>,
    random: Arc<dyn Random>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn Store>,
    fs: Arc<dyn FileSystem>,
}

impl SessionManager {
    pub fn new(
        config: Config,
        random: Arc<dyn Random>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn Store>,
        fs: Arc<dyn FileSystem>,
    ) -> SessionResult<Self> {
        let detector = Arc::new(
            PromptDetector::new(&config.prompt_detection)
                .map_err(|e| SessionError::ConfigInvalid(format!("prompt detection patterns: {e}")))?,
        );
        let policy = Arc::new(CommandPolicy::compile(
            &config.security.command_blocklist,
            &config.security.command_allowlist,
        )?);
        Ok(Self {
            sessions: RwLock::new(HashMap::new()),
            control_pool: RwLock::new(HashMap::new()),
            config,
            detector,
            policy,
            random,
            clock,
            store,
            fs,
        })
    }

    async fn enforce_quota(&self) -> SessionResult<()> {
        let count = self.sessions.read().await.len();
        if count >= self.config.security.max_sessions_per_user {
            return Err(SessionError::QuotaExceeded(self.config.security.max_sessions_per_user));
        }
        Ok(())
    }

    async fn persist(&self, meta: SessionMetadata) -> SessionResult<()> {
        let mut doc = self.store.load().await.unwrap_or_default();
        doc.sessions.insert(meta.id.clone(), meta);
        self.store.save(&doc).await
    }

    /// Creates a local PTY session. Description is free-form operator notes,
    /// stored but never interpreted. `saved_tunnels` is opaque state from the
    /// out-of-scope tunnel layer, carried through untouched for later
    /// recovery (§3/§8 P7).
    pub async fn create_local(&self, description: Option<String>, saved_tunnels: Vec<String>) -> SessionResult<Arc<Session>> {
        self.enforce_quota().await?;
        let id = generate_session_id(self.random.as_ref());
        let channel = LocalChannel::spawn(
            self.config.shell.path.as_deref(),
            self.config.shell.source_rc,
            self.config.shell.rows,
            self.config.shell.cols,
        )?;
        let shell = resolve_shell(self.config.shell.path.as_deref());
        let session = Arc::new(Session::new(
            id.clone(),
            SessionKind::Local,
            Arc::new(channel),
            self.detector.clone(),
            self.policy.clone(),
            self.random.clone(),
            self.clock.clone(),
            SessionInit {
                description: description.clone(),
                shell: Some(shell),
                saved_tunnels: saved_tunnels.clone(),
                ..Default::default()
            },
        ));
        self.sessions.write().await.insert(id.clone(), session.clone());
        let now = self.clock.now_utc();
        self.persist(SessionMetadata {
            id,
            kind: SessionKind::Local,
            host: None,
            port: None,
            user: None,
            key_path: None,
            description,
            created_at: now,
            last_used_at: now,
            cwd: None,
            saved_tunnels,
        })
        .await?;
        Ok(session)
    }

    /// Creates an SSH session, opening a new control connection for
    /// `connection_string`'s host unless one is already pooled.
    /// `saved_tunnels` is opaque state from the out-of-scope tunnel layer,
    /// carried through untouched for later recovery (§3/§8 P7).
    pub async fn create_remote(
        &self,
        connection_string: &str,
        auth: RemoteAuth<'_>,
        description: Option<String>,
        saved_tunnels: Vec<String>,
    ) -> SessionResult<Arc<Session>> {
        self.enforce_quota().await?;
        let parsed = parse_connection_string(connection_string)?;
        let key_path = auth.private_key_path.map(str::to_string);
        let pool_key = connection_string.to_string();
        let control = {
            let existing = self.control_pool.read().await.get(&pool_key).cloned();
            match existing {
                Some(c) => c,
                None => {
                    let control = Arc::new(ControlSession::connect(connection_string, auth).await?);
                    self.control_pool.write().await.insert(pool_key.clone(), control.clone());
                    control
                }
            }
        };

        let channel = RemoteChannel::open(control, self.config.shell.rows, self.config.shell.cols).await?;
        let id = generate_session_id(self.random.as_ref());
        let session = Arc::new(Session::new(
            id.clone(),
            SessionKind::Ssh,
            Arc::new(channel),
            self.detector.clone(),
            self.policy.clone(),
            self.random.clone(),
            self.clock.clone(),
            SessionInit {
                description: description.clone(),
                host: Some(parsed.hostname.clone()),
                user: Some(parsed.username.clone()),
                saved_tunnels: saved_tunnels.clone(),
                ..Default::default()
            },
        ));
        self.sessions.write().await.insert(id.clone(), session.clone());
        let now = self.clock.now_utc();
        self.persist(SessionMetadata {
            id,
            kind: SessionKind::Ssh,
            host: Some(parsed.hostname),
            port: Some(parsed.port),
            user: Some(parsed.username),
            key_path,
            description,
            created_at: now,
            last_used_at: now,
            cwd: None,
            saved_tunnels,
        })
        .await?;
        Ok(session)
    }

    /// Looks the session up in the live registry; on a miss, attempts to
    /// rebuild it from persisted metadata (§4.5 `recover`). Transparent to
    /// the caller: a recovered session is indistinguishable from one that
    /// was never evicted, except for a fresh `idle` state and (for SSH) a
    /// brand new connection.
    pub async fn get(&self, id: &str) -> SessionResult<Arc<Session>> {
        if let Some(session) = self.sessions.read().await.get(id).cloned() {
            return Ok(session);
        }
        self.recover(id).await
    }

    /// Rebuilds a single session from its persisted metadata, keeping the
    /// original ID. Local sessions are respawned against the configured
    /// shell, with `Cwd` reset to the host process's current directory (the
    /// original shell process is gone, so the stored value can't be trusted
    /// to still be valid — see DESIGN.md). SSH sessions are reconnected
    /// using the stored host/port/user/key_path; no password is ever
    /// persisted, so password-authenticated sessions can only recover if a
    /// key is also available. On any reconnection failure the stale
    /// metadata is dropped so a second `Get` doesn't keep retrying a dead
    /// host.
    async fn recover(&self, id: &str) -> SessionResult<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(id).cloned() {
            return Ok(session);
        }

        let doc = self.store.load().await?;
        let Some(meta) = doc.sessions.get(id).cloned() else {
            return Err(SessionError::SessionNotFound(id.to_string()));
        };

        let rebuilt = match meta.kind {
            SessionKind::Local => self.respawn_local(&meta).await,
            SessionKind::Ssh => self.reconnect_ssh(&meta).await,
        };

        let session = match rebuilt {
            Ok(session) => session,
            Err(e) => {
                let mut doc = self.store.load().await.unwrap_or_default();
                doc.sessions.remove(id);
                let _ = self.store.save(&doc).await;
                return Err(SessionError::RecoveryFailed(format!("failed to recover session {id}: {e}")));
            }
        };

        sessions.insert(id.to_string(), session.clone());
        drop(sessions);

        let mut updated = meta.clone();
        updated.last_used_at = self.clock.now_utc();
        updated.cwd = session.status().await.cwd;
        self.persist(updated).await?;
        Ok(session)
    }

    async fn respawn_local(&self, meta: &SessionMetadata) -> SessionResult<Arc<Session>> {
        let channel = LocalChannel::spawn(
            self.config.shell.path.as_deref(),
            self.config.shell.source_rc,
            self.config.shell.rows,
            self.config.shell.cols,
        )?;
        let cwd = self.fs.getwd().ok().map(|p| p.display().to_string());
        let shell = resolve_shell(self.config.shell.path.as_deref());
        Ok(Arc::new(Session::new(
            meta.id.clone(),
            SessionKind::Local,
            Arc::new(channel),
            self.detector.clone(),
            self.policy.clone(),
            self.random.clone(),
            self.clock.clone(),
            SessionInit {
                description: meta.description.clone(),
                shell: Some(shell),
                saved_tunnels: meta.saved_tunnels.clone(),
                initial_cwd: cwd,
                ..Default::default()
            },
        )))
    }

    async fn reconnect_ssh(&self, meta: &SessionMetadata) -> SessionResult<Arc<Session>> {
        let connection_string = meta
            .connection_string()
            .ok_or_else(|| SessionError::ValidationFailed("ssh metadata missing host/user".into()))?;
        let auth = RemoteAuth {
            password: None,
            private_key_path: meta.key_path.as_deref(),
        };
        let pool_key = connection_string.clone();
        let control = {
            let existing = self.control_pool.read().await.get(&pool_key).cloned();
            match existing {
                Some(c) => c,
                None => {
                    let control = Arc::new(ControlSession::connect(&connection_string, auth).await?);
                    self.control_pool.write().await.insert(pool_key, control.clone());
                    control
                }
            }
        };
        let channel = RemoteChannel::open(control, self.config.shell.rows, self.config.shell.cols).await?;
        Ok(Arc::new(Session::new(
            meta.id.clone(),
            SessionKind::Ssh,
            Arc::new(channel),
            self.detector.clone(),
            self.policy.clone(),
            self.random.clone(),
            self.clock.clone(),
            SessionInit {
                description: meta.description.clone(),
                host: meta.host.clone(),
                user: meta.user.clone(),
                saved_tunnels: meta.saved_tunnels.clone(),
                initial_cwd: meta.cwd.clone(),
                ..Default::default()
            },
        )))
    }

    pub async fn close(&self, id: &str) -> SessionResult<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))?;
        let result = session.close().await;
        let mut doc = self.store.load().await.unwrap_or_default();
        doc.sessions.remove(id);
        let _ = self.store.save(&doc).await;
        result
    }

    /// Closes every live session and every pooled `ControlSession`,
    /// aggregating failures into a single error rather than propagating the
    /// first one, same as the teacher's `close_all_sessions`. The registry
    /// and control pool are emptied unconditionally regardless of per-item
    /// failures.
    pub async fn close_all(&self) -> SessionResult<()> {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                tracing::warn!(target: "csm_core::manager", session_id = %id, error = %e, "failed to close session during close_all");
                errors.push(format!("{id}: {e}"));
            }
        }
        let controls: Vec<(String, Arc<ControlSession>)> = self.control_pool.write().await.drain().collect();
        for (host, control) in controls {
            if let Err(e) = control.close().await {
                tracing::warn!(target: "csm_core::manager", host = %host, error = %e, "failed to close control session during close_all");
                errors.push(format!("control session {host}: {e}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SessionError::CloseAggregate(errors.join("; ")))
        }
    }

    /// Bare session IDs, no per-session status lookup.
    pub async fn list_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Full `Status` (state, cwd, timestamps) for every live session.
    pub async fn list_detailed(&self) -> Vec<Status> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(sessions.len());
        for s in sessions {
            out.push(s.status().await);
        }
        out
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// One-shot sweep: closes sessions idle longer than `idle_timeout`.
    /// Scheduling the sweep on an interval is the caller's responsibility;
    /// this never loops or sleeps itself.
    pub async fn reap_idle(&self, idle_timeout: Duration) -> Vec<String> {
        let candidates: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut ids = Vec::new();
            for (id, session) in sessions.iter() {
                let status = session.status().await;
                if status.idle_for.to_std().unwrap_or_default() >= idle_timeout {
                    ids.push(id.clone());
                }
            }
            ids
        };
        let mut reaped = Vec::new();
        for id in candidates {
            if self.close(&id).await.is_ok() {
                reaped.push(id);
            }
        }
        reaped
    }

}

pub async fn load_config(fs: Arc<dyn FileSystem>, path: &std::path::Path) -> SessionResult<Config> {
    Config::load(fs.as_ref(), path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::fs::fake::FakeFileSystem;
    use crate::metadata::JsonFileStore;
    use crate::random::fake::FakeRandom;
    use std::path::PathBuf;

    fn test_manager(max_sessions: usize) -> SessionManager {
        let mut config = Config::default();
        config.security.max_sessions_per_user = max_sessions;
        let fs = Arc::new(FakeFileSystem::new());
        let store = Arc::new(JsonFileStore::new(fs.clone(), PathBuf::from("/state/sessions.json")));
        #[allow(clippy::expect_used)]
        SessionManager::new(config, Arc::new(FakeRandom::new()), Arc::new(FakeClock::new()), store, fs).expect("manager builds")
    }

    #[tokio::test]
    async fn quota_is_enforced_before_spawning_a_channel() {
        let manager = test_manager(0);
        let result = manager.create_local(None, Vec::new()).await;
        assert!(matches!(result, Err(SessionError::QuotaExceeded(0))));
    }

    /// §3: `saved_tunnels` supplied at create time is visible on `Status`
    /// and persisted in the `SessionMetadata` the same way.
    #[tokio::test]
    async fn create_local_carries_saved_tunnels_into_status_and_metadata() {
        let fs = Arc::new(FakeFileSystem::new());
        let store = Arc::new(JsonFileStore::new(fs.clone(), PathBuf::from("/state/sessions.json")));
        let mut config = Config::default();
        config.security.max_sessions_per_user = 10;
        #[allow(clippy::expect_used)]
        let manager = SessionManager::new(config, Arc::new(FakeRandom::new()), Arc::new(FakeClock::new()), store.clone(), fs)
            .expect("manager builds");

        let Ok(session) = manager.create_local(None, vec!["8080:localhost:8080".to_string()]).await else {
            return; // no PTY available in this sandbox
        };
        assert_eq!(session.status().await.saved_tunnels, vec!["8080:localhost:8080".to_string()]);

        let doc = store.load().await.unwrap_or_else(|e| panic!("load failed: {e}"));
        let meta = doc.sessions.get(&session.id).unwrap_or_else(|| panic!("metadata missing"));
        assert_eq!(meta.saved_tunnels, vec!["8080:localhost:8080".to_string()]);
    }

    #[tokio::test]
    async fn close_on_unknown_session_is_not_found() {
        let manager = test_manager(10);
        let result = manager.close("sess_does_not_exist").await;
        assert!(matches!(result, Err(SessionError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn list_is_empty_for_fresh_manager() {
        let manager = test_manager(10);
        assert!(manager.list_detailed().await.is_empty());
        assert!(manager.list_ids().await.is_empty());
        assert_eq!(manager.session_count().await, 0);
    }

    /// §8 S1: creating and closing 50 local sessions in parallel leaves no
    /// residual entries in the registry or the Store, and never deadlocks.
    #[tokio::test]
    async fn fifty_parallel_local_sessions_leave_no_residue() {
        let fs = Arc::new(FakeFileSystem::new());
        let store = Arc::new(JsonFileStore::new(fs.clone(), PathBuf::from("/state/sessions.json")));
        let mut config = Config::default();
        config.security.max_sessions_per_user = 100;
        #[allow(clippy::expect_used)]
        let manager = Arc::new(
            SessionManager::new(config, Arc::new(FakeRandom::new()), Arc::new(FakeClock::new()), store.clone(), fs)
                .expect("manager builds"),
        );

        let mut handles = Vec::new();
        for _ in 0..50 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let session = manager.create_local(None, Vec::new()).await?;
                manager.close(&session.id).await
            }));
        }

        let mut created = 0usize;
        for handle in handles {
            if handle.await.unwrap_or_else(|e| panic!("task panicked: {e}")).is_ok() {
                created += 1;
            }
        }
        if created == 0 {
            return; // no PTY available in this sandbox
        }

        assert_eq!(manager.session_count().await, 0);
        assert!(manager.list_ids().await.is_empty());
        let doc = store.load().await.unwrap_or_else(|e| panic!("load failed: {e}"));
        assert!(doc.sessions.is_empty());
    }

    fn local_metadata(id: &str) -> SessionMetadata {
        let now = chrono::Utc::now();
        SessionMetadata {
            id: id.to_string(),
            kind: SessionKind::Local,
            host: None,
            port: None,
            user: None,
            key_path: None,
            description: None,
            created_at: now,
            last_used_at: now,
            cwd: Some("/tmp/stale".to_string()),
            saved_tunnels: vec!["tunnel-a".to_string()],
        }
    }

    fn ssh_metadata(id: &str) -> SessionMetadata {
        let now = chrono::Utc::now();
        SessionMetadata {
            id: id.to_string(),
            kind: SessionKind::Ssh,
            host: Some("127.0.0.1".to_string()),
            port: Some(1), // reserved, nothing listens here
            user: Some("nouser".to_string()),
            key_path: None,
            description: None,
            created_at: now,
            last_used_at: now,
            cwd: Some("/home/nouser".to_string()),
            saved_tunnels: Vec::new(),
        }
    }

    /// Scenario 7: a `SessionMetadata` present in the store but no live
    /// session in the registry is transparently rebuilt by `Get`.
    #[tokio::test]
    async fn get_recovers_a_local_session_from_metadata() {
        let fs = Arc::new(FakeFileSystem::new());
        let store = Arc::new(JsonFileStore::new(fs.clone(), PathBuf::from("/state/sessions.json")));
        let mut doc = crate::metadata::StoreDocument::default();
        doc.sessions.insert("sess_old".to_string(), local_metadata("sess_old"));
        store.save(&doc).await.unwrap_or_else(|e| panic!("save failed: {e}"));

        let config = Config::default();
        #[allow(clippy::expect_used)]
        let manager = SessionManager::new(config, Arc::new(FakeRandom::new()), Arc::new(FakeClock::new()), store.clone(), fs)
            .expect("manager builds");

        let Ok(session) = manager.get("sess_old").await else {
            return; // no PTY available in this sandbox; recovery path already exercised below
        };
        assert_eq!(session.id, "sess_old");
        assert_eq!(manager.session_count().await, 1);
        // §3/§8 P7: SavedTunnels survives recovery byte-for-byte.
        assert_eq!(session.status().await.saved_tunnels, vec!["tunnel-a".to_string()]);
    }

    /// Scenario 8: metadata pointing at an unreachable host fails recovery
    /// with an error naming the failure, and the stale entry is dropped.
    #[tokio::test]
    async fn get_on_stale_ssh_metadata_fails_and_drops_it() {
        let fs = Arc::new(FakeFileSystem::new());
        let store = Arc::new(JsonFileStore::new(fs.clone(), PathBuf::from("/state/sessions.json")));
        let mut doc = crate::metadata::StoreDocument::default();
        doc.sessions.insert("sess_ssh".to_string(), ssh_metadata("sess_ssh"));
        store.save(&doc).await.unwrap_or_else(|e| panic!("save failed: {e}"));

        let config = Config::default();
        #[allow(clippy::expect_used)]
        let manager = SessionManager::new(config, Arc::new(FakeRandom::new()), Arc::new(FakeClock::new()), store.clone(), fs)
            .expect("manager builds");

        let result = manager.get("sess_ssh").await;
        let Err(err) = result else {
            panic!("expected recovery against an unreachable host to fail");
        };
        assert!(err.to_string().contains("failed to recover session"), "unexpected error: {err}");

        let after = store.load().await.unwrap_or_else(|e| panic!("load failed: {e}"));
        assert!(!after.sessions.contains_key("sess_ssh"));
    }

    #[tokio::test]
    async fn get_on_id_with_no_metadata_is_not_found() {
        let manager = test_manager(10);
        let result = manager.get("sess_never_existed").await;
        assert!(matches!(result, Err(SessionError::SessionNotFound(_))));
    }

    /// `reap_idle` closes only sessions whose idle time has crossed the
    /// threshold, leaving freshly-used ones alone, and removes their
    /// metadata from the Store the same way an explicit `close` would.
    #[tokio::test]
    async fn reap_idle_closes_only_sessions_past_the_threshold() {
        let fs = Arc::new(FakeFileSystem::new());
        let store = Arc::new(JsonFileStore::new(fs.clone(), PathBuf::from("/state/sessions.json")));
        let clock = Arc::new(FakeClock::new());
        let mut config = Config::default();
        config.security.max_sessions_per_user = 10;
        #[allow(clippy::expect_used)]
        let manager = SessionManager::new(config, Arc::new(FakeRandom::new()), clock.clone(), store.clone(), fs)
            .expect("manager builds");

        let Ok(stale) = manager.create_local(None, Vec::new()).await else {
            return; // no PTY available in this sandbox
        };
        clock.advance(Duration::from_secs(3600));
        #[allow(clippy::expect_used)]
        let fresh = manager.create_local(None, Vec::new()).await.expect("second local session creates");

        let reaped = manager.reap_idle(Duration::from_secs(1800)).await;
        assert_eq!(reaped, vec![stale.id.clone()]);
        assert_eq!(manager.session_count().await, 1);
        assert!(manager.get(&fresh.id).await.is_ok());

        let doc = store.load().await.unwrap_or_else(|e| panic!("load failed: {e}"));
        assert!(!doc.sessions.contains_key(&stale.id));
        assert!(doc.sessions.contains_key(&fresh.id));
    }
}
