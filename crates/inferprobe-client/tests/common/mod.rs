#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use inferprobe_client::{
    FrameFactory, FrameKind, ImageFormat, ImageFormatNegotiation, Request, Response, TestImage,
};
use inferprobe_frame::{Frame, FrameCodec, CONTROL, PROCESS};
use inferprobe_transport::{Connector, TransportError};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Framed;

/// Hands out one end of an in-memory pipe on the first connect.
pub struct DuplexConnector {
    stream: Mutex<Option<DuplexStream>>,
}

impl Connector for DuplexConnector {
    type Stream = DuplexStream;

    fn connect(&self) -> impl Future<Output = inferprobe_transport::Result<DuplexStream>> + Send {
        let stream = self.stream.lock().unwrap().take();
        async move {
            stream.ok_or_else(|| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "pipe already taken",
                ))
            })
        }
    }
}

pub fn pipe() -> (DuplexConnector, DuplexStream) {
    pipe_with_capacity(256 * 1024)
}

pub fn pipe_with_capacity(capacity: usize) -> (DuplexConnector, DuplexStream) {
    let (client, server) = tokio::io::duplex(capacity);
    (
        DuplexConnector {
            stream: Mutex::new(Some(client)),
        },
        server,
    )
}

/// What the fake processor does with one request.
pub enum Reply {
    Now(Response),
    After(Duration, Response),
    Never,
}

#[derive(Debug, Clone)]
pub struct Received {
    pub request_id: u64,
    pub kind: &'static str,
    pub at: Instant,
}

#[derive(Debug, Default)]
pub struct Transcript {
    pub received: Vec<Received>,
    /// When each response left the processor, by request id.
    pub replied: Vec<(u64, Instant)>,
    pub completed: bool,
}

/// Serve requests sequentially until the client completes or hangs up.
pub fn spawn_processor<F>(stream: DuplexStream, mut policy: F) -> JoinHandle<Transcript>
where
    F: FnMut(&Request) -> Reply + Send + 'static,
{
    tokio::spawn(async move {
        let mut framed = Framed::new(stream, FrameCodec::default());
        let mut transcript = Transcript::default();

        while let Some(Ok(frame)) = framed.next().await {
            if frame.channel == CONTROL {
                transcript.completed = true;
                break;
            }
            let request: Request = serde_json::from_slice(&frame.payload).unwrap();
            transcript.received.push(Received {
                request_id: request.request_id,
                kind: request.payload.kind(),
                at: Instant::now(),
            });

            let response = match policy(&request) {
                Reply::Now(response) => response,
                Reply::After(delay, response) => {
                    tokio::time::sleep(delay).await;
                    response
                }
                Reply::Never => continue,
            };
            transcript.replied.push((response.request_id, Instant::now()));
            let payload = serde_json::to_vec(&response).unwrap();
            if framed.send(Frame::new(PROCESS, payload)).await.is_err() {
                break;
            }
        }
        transcript
    })
}

pub fn video_factory() -> FrameFactory {
    FrameFactory::new(
        ImageFormatNegotiation {
            format: ImageFormat::RawBgr,
            supports_raw: false,
            frame_kind: FrameKind::Video,
        },
        TestImage {
            path: PathBuf::from("/tmp/inferprobe-test.bgr888"),
            format: ImageFormat::RawBgr,
            width: 2048,
            height: 2048,
        },
    )
}
