use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use inferprobe_transport::Connector;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::correlation::PendingResponse;
use crate::error::{ClientError, Result};
use crate::handshake::{FrameKind, ImageFormatNegotiation};
use crate::image::TestImage;
use crate::messages::{ImageryFrame, Request, RequestPayload, UasMetadata, VideoFrame};
use crate::session::StreamSession;

/// Convert a frame rate (frames per second, may be fractional) into a tick period.
pub fn period_from_rate(fps: f64) -> Result<Duration> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(ClientError::InvalidRate(fps));
    }
    match Duration::try_from_secs_f64(1.0 / fps) {
        Ok(period) if !period.is_zero() => Ok(period),
        _ => Err(ClientError::InvalidRate(fps)),
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between data frames. Default: 5 s (0.2 fps).
    pub period: Duration,
    /// Stop after this many data frames; `None` runs until stopped.
    pub max_frames: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            max_frames: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    NotStarted,
    Running,
    Stopped,
}

/// Builds the payload for each data frame from the negotiated format.
#[derive(Debug, Clone)]
pub struct FrameFactory {
    negotiation: ImageFormatNegotiation,
    image: TestImage,
}

impl FrameFactory {
    pub fn new(negotiation: ImageFormatNegotiation, image: TestImage) -> Self {
        Self { negotiation, image }
    }

    pub fn negotiation(&self) -> &ImageFormatNegotiation {
        &self.negotiation
    }

    pub fn payload(&self) -> RequestPayload {
        match self.negotiation.frame_kind {
            FrameKind::Video => RequestPayload::Video(VideoFrame {
                image: self.image.image_ref(),
                width: self.image.width,
                height: self.image.height,
                uas: UasMetadata::sample(),
                timestamp_millis: now_millis(),
            }),
            FrameKind::Imagery => RequestPayload::Imagery(ImageryFrame {
                image: self.image.image_ref(),
                width: self.image.width,
                height: self.image.height,
            }),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Totals for one scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Request ids assigned, startup included.
    pub issued: u64,
    /// Data frames submitted after startup.
    pub frames: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Drives a session: one startup exchange, then a data frame every period.
///
/// Ticks never wait for earlier responses. Each response is observed on its
/// own task, so a slow or failed request does not shift the cadence.
pub struct FrameScheduler<C: Connector> {
    session: Arc<StreamSession<C>>,
    factory: FrameFactory,
    config: SchedulerConfig,
    next_id: AtomicU64,
    state: Mutex<SchedulerState>,
    stop: CancellationToken,
    counters: Arc<Counters>,
}

impl<C: Connector> FrameScheduler<C> {
    pub fn new(
        session: Arc<StreamSession<C>>,
        factory: FrameFactory,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            session,
            factory,
            config,
            next_id: AtomicU64::new(0),
            state: Mutex::new(SchedulerState::NotStarted),
            stop: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.lock_state()
    }

    /// Number of request ids assigned so far.
    pub fn issued(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Cancel the periodic timer and close the session.
    ///
    /// A running scheduler closes the session itself on its way out of
    /// [`run`](Self::run). Before that, the close happens here: on a spawned
    /// task inside a runtime, synchronously without a completion notice
    /// otherwise.
    pub fn stop(&self) {
        self.stop.cancel();
        if self.state() != SchedulerState::NotStarted {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let session = Arc::clone(&self.session);
                handle.spawn(async move { session.close().await });
            }
            Err(_) => self.session.close_now(),
        }
    }

    /// Token that stops the scheduler when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run until stopped, `max_frames` is reached, or the session faults.
    ///
    /// The session is closed before this returns. Outstanding responses are
    /// awaited when the frame budget runs out; on stop they are failed.
    pub async fn run(&self) -> Result<RunSummary> {
        {
            let mut state = self.lock_state();
            if *state != SchedulerState::NotStarted {
                return Err(ClientError::AlreadyStarted);
            }
            *state = SchedulerState::Running;
        }

        let mut observers = JoinSet::new();
        let outcome = self.drive(&mut observers).await;

        self.session.close().await;
        while observers.join_next().await.is_some() {}
        *self.lock_state() = SchedulerState::Stopped;

        let summary = self.summary();
        info!(
            issued = summary.issued,
            frames = summary.frames,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "scheduler stopped"
        );
        outcome.map(|()| summary)
    }

    async fn drive(&self, observers: &mut JoinSet<()>) -> Result<()> {
        if self.stop.is_cancelled() {
            debug!("stopped before start");
            return Ok(());
        }

        if self.issued() == 0 {
            let startup = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                submitted = self.session.submit(Request::startup(self.assign_id())) => submitted?,
            };
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                value = startup => {
                    let value = value.map_err(|err| self.attribute(err))?;
                    info!(response = %value, "startup complete");
                }
            }
        }

        let mut interval = tokio::time::interval(self.config.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let mut frames = 0u64;

        loop {
            if self.config.max_frames.is_some_and(|max| frames >= max) {
                debug!(frames, "frame budget reached");
                return self.drain(observers).await;
            }

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                reason = self.session.closed() => {
                    return if reason.is_fault() {
                        Err(ClientError::SessionFault(reason))
                    } else {
                        Ok(())
                    };
                }
                _ = interval.tick() => {}
            }

            while observers.try_join_next().is_some() {}

            let request = Request::new(self.assign_id(), self.factory.payload());
            let request_id = request.request_id;
            frames += 1;
            let submitted = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                submitted = self.session.submit(request) => submitted,
            };
            match submitted {
                Ok(pending) => self.observe(observers, pending),
                Err(err) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(request_id, error = %err, "submit failed");
                }
            }
        }
    }

    /// Wait for outstanding responses, unless stopped or the session ends.
    async fn drain(&self, observers: &mut JoinSet<()>) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                next = observers.join_next() => {
                    if next.is_none() {
                        return Ok(());
                    }
                }
                reason = self.session.closed() => {
                    return if reason.is_fault() {
                        Err(ClientError::SessionFault(reason))
                    } else {
                        Ok(())
                    };
                }
            }
        }
    }

    fn observe(&self, observers: &mut JoinSet<()>, pending: PendingResponse) {
        let counters = Arc::clone(&self.counters);
        let request_id = pending.request_id();
        observers.spawn(async move {
            match pending.await {
                Ok(value) => {
                    counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    info!(request_id, response = %value, "response received");
                }
                Err(err) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(request_id, error = %err, "request failed");
                }
            }
        });
    }

    /// Report a session fault in place of the per-request error it caused.
    fn attribute(&self, err: ClientError) -> ClientError {
        match self.session.close_reason() {
            Some(reason) if reason.is_fault() => ClientError::SessionFault(reason),
            _ => err,
        }
    }

    fn assign_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn summary(&self) -> RunSummary {
        let issued = self.issued();
        RunSummary {
            issued,
            frames: issued.saturating_sub(1),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
