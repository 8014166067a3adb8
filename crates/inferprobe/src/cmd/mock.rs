use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use inferprobe_client::messages::{
    Capability, ImageryCapability, RawCapability, TiledCapability, V2Configuration,
    V3Configuration, VersionEnvelope, VideoCapability, CONTROL_CONFIGURE,
};
use inferprobe_client::{
    ConfigurationResponse, ControlMessage, ImageFormat, Request, RequestPayload, Response,
};
use inferprobe_frame::{channel_name, Frame, FrameCodec, CONTROL, PROCESS};
use inferprobe_transport::{AsyncIpcStream, IpcListener};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::cmd::{parse_duration, MockArgs};
use crate::exit::{io_error, transport_error, CliResult, SUCCESS};

/// Answers configuration requests with a fixed capability set and
/// acknowledges every process request.
#[derive(Debug, Clone)]
struct MockProcessor {
    configuration: ConfigurationResponse,
    latency: Option<Duration>,
}

impl MockProcessor {
    fn from_args(args: &MockArgs) -> CliResult<Self> {
        let latency = args.latency.as_deref().map(parse_duration).transpose()?;
        Ok(Self {
            configuration: advertised_configuration(args.format_name, args.imagery, args.raw),
            latency,
        })
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: AsyncIpcStream,
    ) -> inferprobe_client::Result<()> {
        let (mut sink, mut frames) = Framed::new(stream, FrameCodec::default()).split();
        let (tx, mut rx) = mpsc::channel::<Frame>(64);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = sink.send(frame).await {
                    debug!(error = %err, "mock write failed");
                    break;
                }
            }
            if let Err(err) = sink.close().await {
                debug!(error = %err, "mock writer shutdown failed");
            }
        });

        while let Some(frame) = frames.next().await {
            let frame = frame?;
            match frame.channel {
                CONTROL => {
                    let message: ControlMessage = serde_json::from_slice(&frame.payload)?;
                    if message.is_complete() {
                        debug!("client completed the stream");
                        break;
                    }
                    if message.msg_type == CONTROL_CONFIGURE {
                        info!(client = ?message.payload, "configuration requested");
                        let payload = serde_json::to_vec(&self.configuration)?;
                        if tx.send(Frame::new(CONTROL, payload)).await.is_err() {
                            break;
                        }
                    } else {
                        warn!(msg_type = %message.msg_type, "ignoring control message");
                    }
                }
                PROCESS => {
                    let request: Request = serde_json::from_slice(&frame.payload)?;
                    let processor = Arc::clone(&self);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Some(latency) = processor.latency {
                            tokio::time::sleep(latency).await;
                        }
                        let response = respond(&request);
                        match serde_json::to_vec(&response) {
                            Ok(payload) => {
                                if tx.send(Frame::new(PROCESS, payload)).await.is_err() {
                                    debug!(
                                        request_id = request.request_id,
                                        "connection gone before reply"
                                    );
                                }
                            }
                            Err(err) => warn!(error = %err, "failed to encode response"),
                        }
                    });
                }
                other => warn!(
                    channel = other,
                    channel_name = channel_name(other),
                    "ignoring frame on unexpected channel"
                ),
            }
        }

        drop(tx);
        if let Err(err) = writer.await {
            warn!(error = %err, "mock writer task ended abnormally");
        }
        Ok(())
    }
}

pub fn run(args: MockArgs) -> CliResult<i32> {
    let processor = Arc::new(MockProcessor::from_args(&args)?);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("runtime startup failed", err))?;
    runtime.block_on(serve(args, processor))
}

async fn serve(args: MockArgs, processor: Arc<MockProcessor>) -> CliResult<i32> {
    let listener = IpcListener::bind(&args.endpoint)
        .await
        .map_err(|err| transport_error("bind failed", err))?;
    let endpoint = listener
        .local_endpoint()
        .map_err(|err| transport_error("bind failed", err))?;
    info!(
        %endpoint,
        format = %args.format_name,
        imagery = args.imagery,
        raw = args.raw,
        "mock processor ready"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupt received, shutting down");
                return Ok(SUCCESS);
            }
            accepted = listener.accept() => {
                let stream = accepted.map_err(|err| transport_error("accept failed", err))?;
                let processor = Arc::clone(&processor);
                tokio::spawn(async move {
                    if let Err(err) = processor.serve_connection(stream).await {
                        warn!(error = %err, "connection ended with error");
                    }
                });
            }
        }
    }
}

fn advertised_configuration(
    format: ImageFormat,
    imagery: bool,
    raw: bool,
) -> ConfigurationResponse {
    let image_format = format.wire_name().to_string();
    let capability = if imagery {
        Capability {
            video: None,
            imagery: Some(ImageryCapability {
                tiled: Some(TiledCapability {
                    image_format: image_format.clone(),
                }),
                raw: raw.then_some(RawCapability {}),
            }),
        }
    } else {
        Capability {
            video: Some(VideoCapability {
                image_format: image_format.clone(),
            }),
            imagery: None,
        }
    };

    ConfigurationResponse {
        version: VersionEnvelope {
            v2: Some(V2Configuration { image_format }),
            processor_v3: Some(V3Configuration {
                capabilities: vec![capability],
            }),
        },
    }
}

fn respond(request: &Request) -> Response {
    let value = match &request.payload {
        RequestPayload::Startup {} => json!({ "status": "ready" }),
        RequestPayload::Video(frame) => json!({
            "kind": "video",
            "image": frame.image.path,
            "detections": [],
        }),
        RequestPayload::Imagery(frame) => json!({
            "kind": "imagery",
            "image": frame.image.path,
            "detections": [],
        }),
    };
    Response::ok(request.request_id, value)
}
