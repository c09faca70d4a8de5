use anyhow::Result;
use clap::{Parser, Subcommand};
use vision::{StreamCliArgs, StreamConfig};

use crate::compose;

#[derive(Parser, Debug)]
#[command(
    name = "stream-server",
    version,
    about = "Capture camera frames, run detection, and stream them to browsers"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline and the HTTP server until Ctrl+C
    Serve(StreamCliArgs),
    /// Open the source, grab one frame, run the detector once, and exit
    Probe(StreamCliArgs),
}

pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve(args) => compose::serve(StreamConfig::try_from(args)?),
        Command::Probe(args) => compose::probe(StreamConfig::try_from(args)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_clip() {
        let cli = Cli::try_parse_from([
            "stream-server",
            "serve",
            "--clip",
            "frames/",
            "--port",
            "0",
            "--max-restarts",
            "2",
        ])
        .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = StreamConfig::try_from(args).unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.max_restarts, 2);
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["stream-server"]).is_err());
    }
}
