use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use inferprobe_client::image::{DEFAULT_HEIGHT, DEFAULT_WIDTH};
use inferprobe_client::{HandshakeConfig, ImageFormat, ProtocolVersion};
use inferprobe_transport::Endpoint;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod configure;
pub mod mock;
pub mod run;
pub mod version;

pub const DEFAULT_URI: &str = "tcp://127.0.0.1:50051";

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Negotiate, then stream synthetic frames until interrupted.
    Run(RunArgs),
    /// Run the configuration handshake only and print the negotiation.
    Configure(ConfigureArgs),
    /// Serve a mock inference processor.
    Mock(MockArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Run(args) => run::run(args, format),
        Command::Configure(args) => configure::run(args, format),
        Command::Mock(args) => mock::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum ProtocolArg {
    V2,
    V3,
}

impl From<ProtocolArg> for ProtocolVersion {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::V2 => ProtocolVersion::V2,
            ProtocolArg::V3 => ProtocolVersion::V3,
        }
    }
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Processor address (tcp://host:port or unix:///path).
    #[arg(long, env = "INFERPROBE_URI", default_value = DEFAULT_URI)]
    pub uri: Endpoint,
    /// Configuration block to read from the processor.
    #[arg(long, value_enum, default_value = "v3")]
    pub protocol: ProtocolArg,
    /// Handshake timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

impl ConnectArgs {
    pub fn handshake_config(&self) -> CliResult<HandshakeConfig> {
        Ok(HandshakeConfig {
            timeout: parse_duration(&self.timeout)?,
            protocol: self.protocol.into(),
            ..HandshakeConfig::default()
        })
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Frames per second; fractional values are allowed (0.2 = one frame every 5s).
    #[arg(long, env = "INFERPROBE_RATE", default_value_t = 0.2)]
    pub rate: f64,
    /// Directory shared with the processor where the test image is written.
    #[arg(long, value_name = "DIR", default_value = "/tmp")]
    pub shared_images_dir: PathBuf,
    /// Stop after N frames instead of running until interrupted.
    #[arg(long)]
    pub count: Option<u64>,
    /// Pre-encoded PNG/TIFF file used when the processor asks for an encoded format.
    /// Its pixel size must match --width/--height.
    #[arg(long, value_name = "FILE")]
    pub test_image: Option<PathBuf>,
    /// Test image width in pixels.
    #[arg(long, default_value_t = DEFAULT_WIDTH, value_parser = clap::value_parser!(u32).range(1..))]
    pub width: u32,
    /// Test image height in pixels.
    #[arg(long, default_value_t = DEFAULT_HEIGHT, value_parser = clap::value_parser!(u32).range(1..))]
    pub height: u32,
}

#[derive(Args, Debug)]
pub struct ConfigureArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct MockArgs {
    /// Address to listen on (tcp://host:port or unix:///path).
    pub endpoint: Endpoint,
    /// Image format to advertise.
    #[arg(long, default_value = "BGR888")]
    pub format_name: ImageFormat,
    /// Advertise a tiled imagery capability instead of video.
    #[arg(long)]
    pub imagery: bool,
    /// With --imagery, also advertise raw imagery support.
    #[arg(long, requires = "imagery")]
    pub raw: bool,
    /// Delay before answering each process request (e.g. 200ms).
    #[arg(long)]
    pub latency: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build information.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    let (number, millis) = match input.strip_suffix("ms") {
        Some(number) => (number, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration: '{input}'")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn rejects_zero_and_garbage() {
        for bad in ["0s", "", "fast", "1.5s"] {
            assert_eq!(parse_duration(bad).unwrap_err().code, USAGE, "{bad}");
        }
    }
}
