use std::fmt::Display;

use clap::{Parser, Subcommand, ValueEnum};
use pmu_dispatch::HwEvent;

#[derive(Parser)]
#[command(author, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Only show info about the CPU and its PMU dispatch node, then exit.
    Info,

    /// Poll some hardware counters continuously
    Poll {
        /// How to access the counters.
        #[arg(value_enum)]
        probe: ProbeType,

        /// The hardware events to record.
        #[arg(short, long, value_delimiter = ',', required = true)]
        events: Vec<HwEvent>,

        /// The CPUs to monitor; defaults to all online CPUs.
        #[arg(short, long, value_delimiter = ',')]
        cpus: Option<Vec<u32>>,

        /// Measurement frequency, in Hertz.
        #[arg(short, long)]
        frequency: f64,

        /// Print counter measurements on each iteration.
        #[arg(short, long, value_enum)]
        output: OutputType,

        /// Sets the output file, if output is set to file.
        #[arg(long)]
        output_file: Option<String>,
    },

    /// Capture and print the last-branch-record stack of one CPU.
    Lbr {
        /// The CPU whose branches to record.
        #[arg(short, long, default_value_t = 0)]
        cpu: u32,
    },
}

#[derive(Clone, Copy, ValueEnum, Debug, PartialEq, Eq)]
pub enum OutputType {
    None,
    Stdout,
    File,
}

impl Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (self as &dyn std::fmt::Debug).fmt(f)
    }
}

#[derive(Clone, Copy, ValueEnum, Debug, PartialEq, Eq)]
pub enum ProbeType {
    /// Program and read the counters directly through /dev/cpu/<id>/msr.
    Msr,
    /// Let the kernel program the counters through perf_event_open.
    PerfEvent,
}

impl Display for ProbeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            ProbeType::Msr => "msr",
            ProbeType::PerfEvent => "perf-event",
        };
        f.write_str(str)
    }
}
