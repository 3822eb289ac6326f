use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use scte35_stitcher::{
    RewriteOptions, parse_pid,
    rewrite::{DEFAULT_OUTPUT, DEFAULT_SIDECAR, rewrite},
};

/// Inject SCTE-35 cues from a sidecar file into an MPEG-TS.
#[derive(Debug, Parser)]
#[command(author, version, about = "SCTE-35 packet injection for MPEG-TS", long_about = None)]
struct Cli {
    /// Input source: file path, "-" for stdin, or udp://[@]addr:port
    #[arg(long, short = 'i')]
    input: String,

    /// PID for SCTE-35 packets (decimal or 0x hex)
    #[arg(long = "scte35-pid", short = 'p', value_parser = parse_pid)]
    scte35_pid: u16,

    /// Output MPEG-TS file path ("-" for stdout)
    #[arg(long, short = 'o', default_value = DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Sidecar file of "pts,cue" lines, re-read on every video keyframe
    #[arg(long, short = 's', default_value = DEFAULT_SIDECAR)]
    sidecar: PathBuf,

    /// Also insert a time_signal cue on every video keyframe
    #[arg(long = "time-signals", short = 't')]
    time_signals: bool,
}

fn init_tracing() {
    // Logs go to stderr so "-o -" leaves stdout to the stream.
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            std::env::var("RUST_LOG")
                .ok()
                .unwrap_or_else(|| "info,scte35_stitcher=debug".to_string()),
        )
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let options = RewriteOptions {
        cue_pid: cli.scte35_pid,
        sidecar: cli.sidecar,
        time_signals: cli.time_signals,
    };

    rewrite(&cli.input, &cli.output, options)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_and_hex_pid() {
        let cli = Cli::try_parse_from(["scte35-stitcher", "-i", "in.ts", "-p", "0x86"]).unwrap();
        assert_eq!(cli.scte35_pid, 0x86);
        assert_eq!(cli.output, PathBuf::from("output.ts"));
        assert_eq!(cli.sidecar, PathBuf::from("sidecar.txt"));
        assert!(!cli.time_signals);
    }

    #[test]
    fn input_and_pid_are_required() {
        assert!(Cli::try_parse_from(["scte35-stitcher", "-i", "in.ts"]).is_err());
        assert!(Cli::try_parse_from(["scte35-stitcher", "-p", "134"]).is_err());
        assert!(Cli::try_parse_from(["scte35-stitcher", "-i", "in.ts", "-p", "0x2000"]).is_err());
    }
}
