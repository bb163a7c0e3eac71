use std::{
    fs::File,
    io::{self, BufWriter, Write},
    process::ExitCode,
    sync::atomic::Ordering,
};

use args::Args;
use clap::Parser;
use hop_power::{
    device::{Device, FileDevice},
    sweep::Sweeper,
    writer::Writer,
};
use tracing::{error, info, warn};

mod args;

fn run(cli: &Args) -> hop_power::Result<()> {
    let device = FileDevice::open(&cli.input, cli.rate)?;
    info!("Using device: {}", device.hardware());
    let config = cli.sweep_config(device.sample_rate())?;

    // Records go to stdout unless a file was asked for, logs always go to stderr
    let sink: Box<dyn Write + Send> = match &cli.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout()),
    };
    let writer = Writer::new(sink, cli.format, cli.max_queue_size)?;
    let mut sweeper = Sweeper::new(device, writer);

    let stop = sweeper.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        if !stop.swap(true, Ordering::SeqCst) {
            warn!("Interrupted, stopping after the current run");
        }
    }) {
        warn!("Could not install the Ctrl-C handler: {}", e);
    }

    sweeper.sweep(&config)?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args::convert_filter(cli.verbose.log_level_filter()))
        .with_writer(io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
