//! Single-flight event loop. Exactly one escalation chain runs at a
//! time; the interval timer and the ad-hoc trigger channel race in a
//! `select`, same shape as the teacher's cron trigger loop, generalized
//! to also listen for out-of-band requests and a shutdown signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::escalation::{CycleRequest, EscalationDriver};
use crate::notify::{NotificationKind, Notifier};
use crate::store::Trigger;

const TRIGGER_CHANNEL_CAPACITY: usize = 1;

pub struct AdHocRequest {
    pub prompt: String,
    pub start_tier: u32,
    pub trigger: Trigger,
}

#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<AdHocRequest>,
    busy: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new() -> (Self, mpsc::Receiver<AdHocRequest>) {
        let (tx, rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        (Self { tx, busy: Arc::new(AtomicBool::new(false)) }, rx)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Non-blocking. Returns `Busy` if a chain is already queued or
    /// running; this does not guarantee ordering against the interval
    /// tick, whichever reaches the `select` first wins, which is
    /// harmless since both just start a cycle.
    pub fn trigger_ad_hoc(&self, prompt: String, start_tier: u32, trigger: Trigger) -> Result<(), SchedulerError> {
        if prompt.trim().is_empty() {
            return Err(SchedulerError::EmptyPrompt);
        }
        self.tx
            .try_send(AdHocRequest { prompt, start_tier, trigger })
            .map_err(|_| SchedulerError::Busy)
    }

    /// Runs the event loop until `cancel` fires. Only one escalation
    /// chain runs at a time; the loop does not poll the next tick while
    /// one is in flight because the whole iteration, including the
    /// `run_cycle` call, happens before the next `select`.
    pub async fn run(
        &self,
        mut trigger_rx: mpsc::Receiver<AdHocRequest>,
        interval: Duration,
        driver: Arc<EscalationDriver>,
        notifier: Arc<Notifier>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately; consume it before the loop proper

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("scheduler received shutdown signal, exiting event loop");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_one(CycleRequest::scheduled(), &driver, &notifier, &cancel).await;
                }
                Some(req) = trigger_rx.recv() => {
                    let request = CycleRequest {
                        trigger: req.trigger,
                        start_tier: req.start_tier,
                        custom_prompt: Some(req.prompt),
                    };
                    self.run_one(request, &driver, &notifier, &cancel).await;
                }
            }
        }
    }

    async fn run_one(
        &self,
        request: CycleRequest,
        driver: &Arc<EscalationDriver>,
        notifier: &Arc<Notifier>,
        cancel: &CancellationToken,
    ) {
        self.busy.store(true, Ordering::SeqCst);
        if let Err(e) = driver.run_cycle(request, cancel.child_token()).await {
            tracing::error!(error = %e, "escalation cycle failed");
            notifier
                .notify(NotificationKind::CycleFailure, &format!("escalation cycle failed: {e}"))
                .await;
        }
        self.busy.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prompt_is_rejected_before_sending() {
        let (scheduler, _rx) = Scheduler::new();
        let err = scheduler.trigger_ad_hoc("   ".into(), 1, Trigger::Manual);
        assert!(matches!(err, Err(SchedulerError::EmptyPrompt)));
    }

    #[test]
    fn second_trigger_while_channel_full_is_busy() {
        let (scheduler, _rx) = Scheduler::new();
        scheduler.trigger_ad_hoc("first".into(), 1, Trigger::Manual).unwrap();
        let err = scheduler.trigger_ad_hoc("second".into(), 1, Trigger::Manual);
        assert!(matches!(err, Err(SchedulerError::Busy)));
    }

    #[test]
    fn not_busy_before_any_cycle_runs() {
        let (scheduler, _rx) = Scheduler::new();
        assert!(!scheduler.is_busy());
    }
}
