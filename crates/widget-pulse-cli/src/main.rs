use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = widget_pulse_cli::Cli::parse();
    widget_pulse_cli::run_cli(cli)
}
