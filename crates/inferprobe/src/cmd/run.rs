use std::fs;
use std::sync::Arc;

use inferprobe_client::{
    configure_endpoint, period_from_rate, FrameFactory, FrameScheduler, ImageProvisioner,
    RunSummary, SchedulerConfig, StreamSession, SyntheticImage,
};
use inferprobe_transport::Endpoint;
use tracing::{debug, info};

use crate::cmd::RunArgs;
use crate::exit::{client_error, io_error, CliResult, SUCCESS};
use crate::output::{print_summary, OutputFormat};

pub fn run(args: RunArgs, format: OutputFormat) -> CliResult<i32> {
    let period = period_from_rate(args.rate).map_err(|err| client_error("invalid rate", err))?;
    let handshake = args.connect.handshake_config()?;
    let endpoint = args.connect.uri;

    let negotiation = configure_endpoint(&endpoint, &handshake)
        .map_err(|err| client_error("configuration failed", err))?;

    let mut provisioner = SyntheticImage::new().with_size(args.width, args.height);
    if let Some(source) = &args.test_image {
        provisioner = provisioner.with_encoded_source(source);
    }
    let image = provisioner
        .provision(negotiation.format, &args.shared_images_dir)
        .map_err(|err| client_error("test image provisioning failed", err))?;
    let image_path = image.path.clone();

    let config = SchedulerConfig {
        period,
        max_frames: args.count,
    };
    info!(
        %endpoint,
        period_ms = period.as_millis() as u64,
        max_frames = ?config.max_frames,
        "streaming frames"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("runtime startup failed", err))?;
    let result = runtime.block_on(stream(
        endpoint.clone(),
        FrameFactory::new(negotiation, image),
        config,
    ));

    if let Err(err) = fs::remove_file(&image_path) {
        debug!(path = %image_path.display(), error = %err, "test image cleanup failed");
    }

    let summary = result.map_err(|err| client_error("streaming failed", err))?;
    print_summary(&endpoint.to_string(), &negotiation, summary, format);
    Ok(SUCCESS)
}

async fn stream(
    endpoint: Endpoint,
    factory: FrameFactory,
    config: SchedulerConfig,
) -> inferprobe_client::Result<RunSummary> {
    let session = Arc::new(StreamSession::new(endpoint));
    let scheduler = FrameScheduler::new(session, factory, config);

    let stop = scheduler.stop_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            stop.cancel();
        }
    });

    let result = scheduler.run().await;
    interrupt.abort();
    result
}
