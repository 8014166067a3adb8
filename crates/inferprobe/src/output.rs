use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use inferprobe_client::{ImageFormatNegotiation, RunSummary};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct NegotiationOutput<'a> {
    endpoint: &'a str,
    protocol: &'a str,
    image_format: &'a str,
    supports_raw: bool,
    frame_kind: String,
}

pub fn print_negotiation(
    endpoint: &str,
    protocol: &str,
    negotiation: &ImageFormatNegotiation,
    format: OutputFormat,
) {
    let out = NegotiationOutput {
        endpoint,
        protocol,
        image_format: negotiation.format.wire_name(),
        supports_raw: negotiation.supports_raw,
        frame_kind: negotiation.frame_kind.to_string(),
    };

    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => print_table(
            &["ENDPOINT", "PROTOCOL", "FORMAT", "RAW", "FRAMES"],
            vec![
                out.endpoint.to_string(),
                out.protocol.to_string(),
                out.image_format.to_string(),
                out.supports_raw.to_string(),
                out.frame_kind,
            ],
        ),
        OutputFormat::Pretty => println!(
            "{} ({}): format={} supports_raw={} frames={}",
            out.endpoint, out.protocol, out.image_format, out.supports_raw, out.frame_kind
        ),
    }
}

#[derive(Serialize)]
struct SummaryOutput<'a> {
    endpoint: &'a str,
    image_format: &'a str,
    #[serde(flatten)]
    summary: RunSummary,
}

pub fn print_summary(
    endpoint: &str,
    negotiation: &ImageFormatNegotiation,
    summary: RunSummary,
    format: OutputFormat,
) {
    let out = SummaryOutput {
        endpoint,
        image_format: negotiation.format.wire_name(),
        summary,
    };

    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => print_table(
            &["ENDPOINT", "FORMAT", "FRAMES", "OK", "FAILED"],
            vec![
                out.endpoint.to_string(),
                out.image_format.to_string(),
                summary.frames.to_string(),
                summary.succeeded.to_string(),
                summary.failed.to_string(),
            ],
        ),
        OutputFormat::Pretty => println!(
            "{}: sent {} frames ({}), {} ok, {} failed",
            out.endpoint, summary.frames, out.image_format, summary.succeeded, summary.failed
        ),
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn print_table(header: &[&str], row: Vec<String>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec())
        .add_row(row);
    println!("{table}");
}
