// =============================================================================
// Session Supervisor (C7)
// =============================================================================
//
// Owns the per-session background worker: one `tokio::spawn`ed task per live
// session, cancellable via a `tokio_util::sync::CancellationToken`, tracked in
// a process-wide map guarded by a single `parking_lot::Mutex`. `status` reads
// through to the durable store; `list_running` reports what is actually alive
// in this process right now — the two can disagree after a crash, which is
// exactly what a restart-recovery sweep (`reconcile_after_restart`) fixes.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::exchange::ExchangeAdapter;
use crate::llm::LlmGateway;
use crate::pipeline::PipelineRunner;
use crate::session::store::SessionStore;
use crate::types::{BgStatus, Session, SessionStatus, StartSessionRequest};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct Supervisor<A: ExchangeAdapter + 'static, L: LlmGateway + 'static> {
    store: Arc<SessionStore>,
    adapter: Arc<A>,
    gateway: Arc<L>,
    workers: Mutex<HashMap<i64, WorkerHandle>>,
}

impl<A: ExchangeAdapter + 'static, L: LlmGateway + 'static> Supervisor<A, L> {
    pub fn new(store: Arc<SessionStore>, adapter: Arc<A>, gateway: Arc<L>) -> Self {
        Self { store, adapter, gateway, workers: Mutex::new(HashMap::new()) }
    }

    /// Recovery routine for process restart (S6): any session whose durable
    /// `bg_status` is `running` has, by definition, no live worker in this
    /// fresh process, so it is transitioned to `crashed` with a note.
    pub async fn reconcile_after_restart(&self) -> anyhow::Result<()> {
        let running = self.store.list_by_status(SessionStatus::Running).await?;
        for session in running {
            warn!(session_id = session.id, "found running session with no live worker at startup");
            self.store.mark_crashed(session.id, "process restart").await?;
        }
        Ok(())
    }

    /// Create a session and, unless `auto_start_agent` is false, start its
    /// worker immediately. Rejects (without touching persistence) if the
    /// account's available balance cannot cover the requested initial
    /// capital.
    #[instrument(skip(self, req))]
    pub async fn create(&self, req: StartSessionRequest) -> anyhow::Result<Session> {
        self.check_balance_covers(req.initial_capital).await?;

        let auto_start = req.auto_start_agent;
        let session = self.store.create_session(&req).await?;
        if auto_start {
            self.start(session.id).await?;
        }
        Ok(session)
    }

    async fn check_balance_covers(&self, initial_capital: f64) -> anyhow::Result<()> {
        let account = self.adapter.get_account().await.context("balance pre-check failed")?;
        if account.available_balance < initial_capital {
            anyhow::bail!(
                "available_balance {} cannot cover requested initial_capital {initial_capital}",
                account.available_balance
            );
        }
        Ok(())
    }

    /// Rejects if the durable `bg_status` is already `starting` or `running`,
    /// or if the account's available balance cannot cover the session's
    /// configured initial capital (checked before any store write).
    #[instrument(skip(self))]
    pub async fn start(&self, session_id: i64) -> anyhow::Result<BgStatus> {
        let session = self
            .store
            .get_by_id(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session {session_id} not found"))?;

        if matches!(session.bg_status, BgStatus::Starting | BgStatus::Running) {
            anyhow::bail!("session {session_id} is already {}", session.bg_status);
        }

        self.check_balance_covers(session.initial_capital).await?;

        {
            let workers = self.workers.lock();
            if workers.contains_key(&session_id) {
                anyhow::bail!("session {session_id} already has a live worker");
            }
        }

        self.store.mark_bg_status(session_id, BgStatus::Starting).await?;

        if !self.store.try_mark_running(session_id).await? {
            self.store.mark_bg_status(session_id, BgStatus::Idle).await?;
            anyhow::bail!("another session is already running");
        }

        let started_at = chrono::Utc::now();
        let cancel = CancellationToken::new();
        let handle = self.spawn_worker(session_id, session, started_at, cancel.clone());
        self.workers.lock().insert(session_id, WorkerHandle { cancel, join: handle });

        Ok(BgStatus::Running)
    }

    fn spawn_worker(
        &self,
        session_id: i64,
        session: Session,
        started_at: chrono::DateTime<chrono::Utc>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let runner = Arc::new(PipelineRunner::new(
            self.adapter.clone(),
            self.gateway.clone(),
            session.risk_params.clone(),
            session.initial_capital,
            started_at,
        ));
        let instruments = session.instruments.clone();
        let interval = Duration::from_secs(session.decision_interval_secs.max(1));

        tokio::spawn(async move {
            if let Err(e) = store.mark_bg_status(session_id, BgStatus::Running).await {
                error!(session_id, error = %e, "supervisor machinery failure while marking worker running");
                let _ = store.mark_crashed(session_id, &format!("supervisor machinery failure: {e}")).await;
                return;
            }

            let mut cycle_number: u64 = 0;
            loop {
                cycle_number += 1;
                let record = runner.run_cycle(session_id, cycle_number, &instruments).await;
                if let Err(e) = store.record_cycle(&record).await {
                    error!(session_id, error = %e, "supervisor machinery failure while recording cycle");
                    let _ = store.mark_crashed(session_id, &format!("supervisor machinery failure: {e}")).await;
                    return;
                }

                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(session_id, "worker observed cancellation, exiting");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            if let Err(e) = store.mark_stopped(session_id).await {
                error!(session_id, error = %e, "failed to persist stopped status on worker exit");
            }
        })
    }

    /// Transitions `running -> stopping`, signals cancellation, awaits the
    /// worker up to the stop-timeout, then forces the final state to
    /// `stopped` regardless (P3). Calling `stop` on a session that isn't
    /// `running`/`stopping` is a no-op that returns success without writing
    /// to the store (P8).
    #[instrument(skip(self))]
    pub async fn stop(&self, session_id: i64) -> anyhow::Result<BgStatus> {
        let session = self
            .store
            .get_by_id(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session {session_id} not found"))?;

        if !matches!(session.bg_status, BgStatus::Running | BgStatus::Stopping) {
            return Ok(session.bg_status);
        }

        self.store.mark_bg_status(session_id, BgStatus::Stopping).await?;

        let handle = self.workers.lock().remove(&session_id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if tokio::time::timeout(STOP_TIMEOUT, handle.join).await.is_err() {
                warn!(session_id, "worker did not exit within stop-timeout, forcing stopped state");
            }
        }

        self.store.mark_stopped(session_id).await?;
        Ok(BgStatus::Stopped)
    }

    /// Pure read from the store; `None` iff the session never started.
    pub async fn status(&self, session_id: i64) -> anyhow::Result<Option<Session>> {
        let session = self.store.get_by_id(session_id).await?;
        Ok(session.filter(|s| s.bg_status != BgStatus::Idle))
    }

    /// The in-memory set of live workers — authoritative for "is a task
    /// running right now", distinct from `status`'s "last known state".
    pub fn list_running(&self) -> Vec<i64> {
        self.workers.lock().keys().copied().collect()
    }

    /// Invoked on process shutdown: stop every live worker with the same
    /// per-worker bound, then sweep any session left `running` in the store.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let ids: Vec<i64> = self.workers.lock().keys().copied().collect();
        for id in ids {
            if let Err(e) = self.stop(id).await {
                warn!(session_id = id, error = %e, "error stopping worker during shutdown");
            }
        }

        let running = self.store.list_by_status(SessionStatus::Running).await?;
        for session in running {
            self.store.mark_crashed(session.id, "shutdown").await.ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::fake::FakeExchangeAdapter;
    use crate::llm::LlmGateway;
    use crate::types::{MarginMode, RiskParams};
    use async_trait::async_trait;

    struct StubGateway;

    #[async_trait]
    impl LlmGateway for StubGateway {
        async fn chat(&self, _s: &str, _u: &str, _t: f64) -> anyhow::Result<String> {
            Ok("```json\n[]\n```".to_string())
        }
    }

    fn req() -> StartSessionRequest {
        StartSessionRequest {
            instruments: vec!["BTC/USDT:USDT".to_string()],
            initial_capital: 10_000.0,
            risk_params: RiskParams {
                max_notional_per_trade: 1000.0,
                max_leverage: 5,
                max_drawdown_pct: 10.0,
                max_total_exposure: 5000.0,
                max_positions: 3,
                margin_mode: MarginMode::Crossed,
            },
            decision_interval_secs: 60,
            auto_start_agent: false,
        }
    }

    async fn supervisor() -> Supervisor<FakeExchangeAdapter, StubGateway> {
        let store = Arc::new(SessionStore::new("sqlite::memory:").await.unwrap());
        let adapter = Arc::new(FakeExchangeAdapter::new(10_000.0));
        let gateway = Arc::new(StubGateway);
        Supervisor::new(store, adapter, gateway)
    }

    #[tokio::test]
    async fn start_then_status_reports_running() {
        let sup = supervisor().await;
        let session = sup.create(req()).await.unwrap();
        sup.start(session.id).await.unwrap();

        // let the worker run at least one cycle before asserting.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = sup.status(session.id).await.unwrap().unwrap();
        assert_eq!(status.bg_status, BgStatus::Running);
        assert!(sup.list_running().contains(&session.id));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let sup = supervisor().await;
        let session = sup.create(req()).await.unwrap();
        sup.start(session.id).await.unwrap();
        assert!(sup.start(session.id).await.is_err());
    }

    #[tokio::test]
    async fn stop_transitions_to_stopped_within_timeout() {
        let sup = supervisor().await;
        let session = sup.create(req()).await.unwrap();
        sup.start(session.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = sup.stop(session.id).await.unwrap();
        assert_eq!(status, BgStatus::Stopped);
        assert!(!sup.list_running().contains(&session.id));

        let stored = sup.status(session.id).await.unwrap().unwrap();
        assert_eq!(stored.bg_status, BgStatus::Stopped);
    }

    #[tokio::test]
    async fn create_rejects_when_balance_cannot_cover_initial_capital_and_writes_nothing() {
        let store = Arc::new(SessionStore::new("sqlite::memory:").await.unwrap());
        let adapter = Arc::new(FakeExchangeAdapter::new(500.0)); // available_balance == 500
        let gateway = Arc::new(StubGateway);
        let sup = Supervisor::new(store, adapter, gateway);

        let mut request = req();
        request.initial_capital = 10_000.0;

        assert!(sup.create(request).await.is_err());
        assert!(sup.store.list_recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_on_idle_session_is_a_no_op() {
        let sup = supervisor().await;
        let session = sup.create(req()).await.unwrap();

        let status = sup.stop(session.id).await.unwrap();
        assert_eq!(status, BgStatus::Idle);

        let stored = sup.store.get_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(stored.bg_status, BgStatus::Idle);
        assert!(stored.stopped_at.is_none());
    }

    #[tokio::test]
    async fn status_is_none_before_first_start() {
        let sup = supervisor().await;
        let session = sup.create(req()).await.unwrap();
        assert!(sup.status(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reconcile_marks_stale_running_sessions_crashed() {
        let sup = supervisor().await;
        let session = sup.create(req()).await.unwrap();
        // simulate a crash: durable state says running, but no worker exists
        // in this process (as if the process had just restarted).
        sup.store.try_mark_running(session.id).await.unwrap();

        sup.reconcile_after_restart().await.unwrap();

        let status = sup.store.get_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(status.session_status, SessionStatus::Crashed);
        assert_eq!(status.last_error.as_deref(), Some("process restart"));
    }
}
