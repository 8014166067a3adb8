mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{pipe, pipe_with_capacity, spawn_processor, video_factory, Reply};
use futures_util::{SinkExt, StreamExt};
use inferprobe_client::{
    ClientError, CloseReason, FrameScheduler, Request, Response, SchedulerConfig, SchedulerState,
    SessionState, StreamSession,
};
use inferprobe_frame::{Frame, FrameCodec, PROCESS};
use serde_json::json;
use tokio_util::codec::Framed;

fn config(max_frames: Option<u64>) -> SchedulerConfig {
    SchedulerConfig {
        period: Duration::from_secs(1),
        max_frames,
    }
}

#[tokio::test(start_paused = true)]
async fn startup_resolves_before_first_tick_and_ids_increase() {
    let (connector, server) = pipe();
    let processor = spawn_processor(server, |request| {
        let response = Response::ok(request.request_id, json!({ "detections": [] }));
        if request.request_id == 0 {
            Reply::After(Duration::from_secs(3), response)
        } else {
            Reply::Now(response)
        }
    });

    let session = Arc::new(StreamSession::new(connector));
    let scheduler = FrameScheduler::new(Arc::clone(&session), video_factory(), config(Some(4)));
    assert_eq!(scheduler.state(), SchedulerState::NotStarted);

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.issued, 5);
    assert_eq!(summary.frames, 4);
    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.failed, 0);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.close_reason(), Some(CloseReason::Local));

    let transcript = processor.await.unwrap();
    let ids: Vec<u64> = transcript.received.iter().map(|r| r.request_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    assert_eq!(transcript.received[0].kind, "startup");
    assert!(transcript.received[1..].iter().all(|r| r.kind == "video"));

    let startup_answered = transcript.replied[0].1;
    assert!(transcript.received[1].at >= startup_answered);
    for pair in transcript.received[1..].windows(2) {
        let gap = pair[1].at - pair[0].at;
        assert!(gap >= Duration::from_millis(999) && gap <= Duration::from_millis(1001));
    }
    assert!(transcript.completed);
}

#[tokio::test(start_paused = true)]
async fn rejected_frames_do_not_stop_the_cadence() {
    let (connector, server) = pipe();
    let processor = spawn_processor(server, |request| {
        if request.request_id % 2 == 1 {
            Reply::Now(Response::error(request.request_id, "cannot read image"))
        } else {
            Reply::Now(Response::ok(request.request_id, json!(null)))
        }
    });

    let session = Arc::new(StreamSession::new(connector));
    let scheduler = FrameScheduler::new(session, video_factory(), config(Some(4)));

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.frames, 4);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(processor.await.unwrap().received.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn unmatched_response_faults_the_run() {
    let (connector, server) = pipe();
    let _processor = spawn_processor(server, |request| match request.request_id {
        0 => Reply::Now(Response::ok(0, json!(null))),
        _ => Reply::Now(Response::ok(1000, json!(null))),
    });

    let session = Arc::new(StreamSession::new(connector));
    let scheduler = FrameScheduler::new(Arc::clone(&session), video_factory(), config(None));

    let err = scheduler.run().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::SessionFault(CloseReason::UnmatchedResponse(1000))
    ));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stop_ends_the_run_and_fails_outstanding_requests() {
    let (connector, server) = pipe();
    let processor = spawn_processor(server, |request| match request.request_id {
        0 => Reply::Now(Response::ok(0, json!(null))),
        _ => Reply::Never,
    });

    let session = Arc::new(StreamSession::new(connector));
    let scheduler = FrameScheduler::new(Arc::clone(&session), video_factory(), config(None));
    let stop = scheduler.stop_handle();

    let (summary, ()) = tokio::join!(scheduler.run(), async {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        stop.cancel();
    });

    let summary = summary.unwrap();
    assert_eq!(summary.frames, 3);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 3);
    assert_eq!(session.pending(), 0);
    assert_eq!(session.close_reason(), Some(CloseReason::Local));
    assert!(processor.await.unwrap().completed);
}

#[tokio::test(start_paused = true)]
async fn rejected_startup_aborts_before_any_frame() {
    let (connector, server) = pipe();
    let processor = spawn_processor(server, |request| {
        Reply::Now(Response::error(request.request_id, "model not loaded"))
    });

    let session = Arc::new(StreamSession::new(connector));
    let scheduler = FrameScheduler::new(session, video_factory(), config(None));

    let err = scheduler.run().await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected { request_id: 0, .. }));
    assert_eq!(scheduler.issued(), 1);
    assert_eq!(processor.await.unwrap().received.len(), 1);

    assert!(matches!(
        scheduler.run().await,
        Err(ClientError::AlreadyStarted)
    ));
}

#[tokio::test(start_paused = true)]
async fn stop_before_run_closes_the_session_without_sending() {
    let (connector, server) = pipe();
    let processor = spawn_processor(server, |request| {
        Reply::Now(Response::ok(request.request_id, json!(null)))
    });

    let session = Arc::new(StreamSession::new(connector));
    let scheduler = FrameScheduler::new(Arc::clone(&session), video_factory(), config(None));

    scheduler.stop();
    let reason = tokio::time::timeout(Duration::from_secs(1), session.closed())
        .await
        .expect("stop should close the session");
    assert_eq!(reason, CloseReason::Local);

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.issued, 0);
    assert_eq!(summary.frames, 0);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    drop(scheduler);
    drop(session);
    assert!(processor.await.unwrap().received.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_is_honoured_while_a_write_is_stalled() {
    let (connector, server) = pipe_with_capacity(1024);
    // Answers startup, then never reads again.
    let stalled = tokio::spawn(async move {
        let mut framed = Framed::new(server, FrameCodec::default());
        let frame = framed.next().await.unwrap().unwrap();
        let request: Request = serde_json::from_slice(&frame.payload).unwrap();
        let payload = serde_json::to_vec(&Response::ok(request.request_id, json!(null))).unwrap();
        framed.send(Frame::new(PROCESS, payload)).await.unwrap();
        std::future::pending::<()>().await;
    });

    let session = Arc::new(StreamSession::new(connector));
    let scheduler = FrameScheduler::new(
        Arc::clone(&session),
        video_factory(),
        SchedulerConfig {
            period: Duration::from_millis(10),
            max_frames: None,
        },
    );
    let stop = scheduler.stop_handle();

    let (summary, ()) = tokio::join!(
        async {
            tokio::time::timeout(Duration::from_secs(30), scheduler.run())
                .await
                .expect("run did not return after stop")
        },
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stop.cancel();
        }
    );

    let summary = summary.unwrap();
    assert!(summary.frames > 0);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, summary.frames);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.close_reason(), Some(CloseReason::Local));
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    stalled.abort();
}
