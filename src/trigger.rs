//! 동기화 트리거 루프
//!
//! 호스트 준비 후 첫 동기화를 강제로 실행하고, 이후 내비게이션 이벤트와
//! 주기적인 타이머 틱으로 동기화를 트리거합니다.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::host::PathSource;
use crate::orchestrator::{RunOutcome, SyncOrchestrator};

/// 호스트 내비게이션 이벤트
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NavigationEvent {
    pub path: String,
}

impl NavigationEvent {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// 실행 중인 트리거 루프 핸들. Drop 시 루프를 취소합니다.
pub struct TriggerHandle {
    cancellation_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TriggerHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// 타이머를 해제하고 루프 종료를 기다립니다.
    pub async fn shutdown(mut self) {
        self.cancellation_token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TriggerHandle {
    fn drop(&mut self) {
        // Don't wait in Drop, just cancel
        self.cancellation_token.cancel();
    }
}

fn log_outcome(source: &str, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed(report) => debug!(source, owners = report.owners.len(), "triggered run completed"),
        RunOutcome::Skipped(reason) => debug!(source, ?reason, "trigger ignored"),
        RunOutcome::Failed(e) => debug!(source, error = %e, "triggered run failed"),
    }
}

/// 트리거 루프를 시작합니다. 프로세스 수명 동안 한 번만 호출합니다.
pub fn start(
    orchestrator: Arc<SyncOrchestrator>,
    mut navigation: mpsc::Receiver<NavigationEvent>,
    paths: Arc<dyn PathSource>,
) -> TriggerHandle {
    let cancellation_token = CancellationToken::new();
    let token = cancellation_token.clone();

    let task = tokio::spawn(async move {
        let mut navigation_open = true;

        tokio::select! {
            _ = token.cancelled() => return,
            outcome = orchestrator.activate() => log_outcome("activation", &outcome),
        }

        let mut ticker = tokio::time::interval(orchestrator.config().tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // 첫 틱은 즉시 완료되므로 소비
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = navigation.recv(), if navigation_open => match event {
                    Some(event) => log_outcome("navigation", &orchestrator.on_navigation(&event.path).await),
                    // 채널 닫힘: 타이머만 계속 사용
                    None => navigation_open = false,
                },
                _ = ticker.tick() => {
                    let path = paths.current_path();
                    log_outcome("tick", &orchestrator.on_tick(path.as_deref()).await);
                }
            }
        }
        debug!("trigger loop stopped");
    });

    TriggerHandle {
        cancellation_token,
        task: Some(task),
    }
}
