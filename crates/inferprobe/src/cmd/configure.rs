use inferprobe_client::configure_endpoint;

use crate::cmd::ConfigureArgs;
use crate::exit::{client_error, CliResult, SUCCESS};
use crate::output::{print_negotiation, OutputFormat};

pub fn run(args: ConfigureArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.connect.handshake_config()?;
    let negotiation = configure_endpoint(&args.connect.uri, &config)
        .map_err(|err| client_error("configuration failed", err))?;

    print_negotiation(
        &args.connect.uri.to_string(),
        config.protocol.as_str(),
        &negotiation,
        format,
    );
    Ok(SUCCESS)
}
