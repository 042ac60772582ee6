use anyhow::{anyhow, Context};
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use cli::{Cli, Commands, OutputType, ProbeType};
use log::{info, warn};
use pmu_dispatch::{
    dispatch_for, microarch_for_identity,
    msr::{MsrCounterProbe, MsrHandle},
    perf_event::PerfCounterProbe,
    CounterProbe, HwEvent,
};

mod cli;
mod polling;

const MEASUREMENTS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const WRITER_BUFFER_CAPACITY: usize = 8192 * 10;

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<(), anyhow::Error> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();

    // identify the processor and resolve its dispatch node
    let identity = pmu_dispatch::detect_identity()?;
    let arch = microarch_for_identity(&identity).ok_or_else(|| {
        anyhow!(
            "unsupported processor: vendor {:?}, family {:#x}, model {:#x}",
            identity.vendor,
            identity.family,
            identity.model
        )
    })?;
    let dispatch = dispatch_for(arch);
    let all_cpus = pmu_dispatch::online_cpus()?;
    info!(
        "family {:#x} model {:#x} -> dispatch node '{}', {} online CPUs",
        identity.family,
        identity.model,
        dispatch.name(),
        all_cpus.len()
    );

    // run the command
    match cli.command {
        Commands::Info => {
            warn_if_msr_module_missing();
            let layout = dispatch.layout();

            println!(
                "\nDetected CPU: vendor {:?}, family {:#x}, model {:#x}, stepping {}",
                identity.vendor, identity.family, identity.model, identity.stepping
            );
            println!("Dispatch node: {}", dispatch.name());
            println!(
                "- {} general-purpose counters of {} bits",
                layout.gp_counters, layout.gp_counter_bits
            );
            println!(
                "- {} fixed-function counters of {} bits",
                layout.fixed_counters, layout.fixed_counter_bits
            );
            println!(
                "- LBR stack of {} entries, address mask {:#x}",
                layout.lbr_depth,
                pmu_dispatch::lbr::LBR_ADDRESS_MASK
            );
            println!("- {} hardware threads per core", layout.threads_per_core);

            println!("\nEvent encodings:");
            for event in HwEvent::ALL {
                match dispatch.event_code(event) {
                    Some(code) => println!(
                        "- {event:?}: select {:#04x}, umask {:#04x}",
                        code.select, code.umask
                    ),
                    None => println!("- {event:?}: not countable on this family"),
                }
            }
        }
        Commands::Poll {
            probe,
            events,
            cpus,
            frequency,
            output,
            output_file,
        } => {
            // compute the polling period, or stop if zero
            let polling_period = Duration::from_secs_f64({
                if frequency == 0.0 {
                    info!("Frequency set to zero, stopping here.");
                    return Ok(());
                } else if frequency < 0.0 {
                    info!("Negative frequency, which means continuous polling.");
                    0.0 // continuous polling
                } else {
                    1.0 / frequency
                }
            });

            // restrict the monitored CPUs according to the command-line arguments
            let cpus = match cpus {
                Some(list) => {
                    if let Some(bad) = list.iter().find(|c| !all_cpus.contains(c)) {
                        return Err(anyhow!("cpu {bad} is not online"));
                    }
                    list
                }
                None => all_cpus,
            };

            // create the counter probe
            let probe: Box<dyn CounterProbe> = match probe {
                ProbeType::Msr => {
                    warn_if_msr_module_missing();
                    let p = MsrCounterProbe::new(&cpus, dispatch, &events)?;
                    Box::new(p)
                }
                ProbeType::PerfEvent => {
                    let p = PerfCounterProbe::new(&cpus, dispatch, &events)?;
                    Box::new(p)
                }
            };

            // prepare the output, if any
            let writer: Box<dyn Write + Send> = match output {
                OutputType::None => Box::new(std::io::sink()),
                OutputType::Stdout => Box::new(BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, std::io::stdout())),
                OutputType::File => {
                    let filename = if let Some(f) = output_file {
                        f
                    } else {
                        // create the csv file
                        let now = OffsetDateTime::now_utc().format(&Rfc3339)?;
                        format!("poll-{now}.csv")
                    };
                    let file = File::create(filename)?;
                    let writer = BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, file);
                    // return the writer
                    Box::new(writer)
                }
            };

            polling::run(writer, probe, cpus, polling_period, MEASUREMENTS_FLUSH_INTERVAL).await?;
        }
        Commands::Lbr { cpu } => {
            if !all_cpus.contains(&cpu) {
                return Err(anyhow!("cpu {cpu} is not online"));
            }
            warn_if_msr_module_missing();

            let msr = MsrHandle::open(cpu)?;
            dispatch.init(&msr).context("failed to init the PMU")?;

            // let some branches accumulate before taking the snapshot
            std::thread::sleep(Duration::from_millis(10));
            let entries = dispatch.read_lbr(&msr)?;
            dispatch.disable(&msr)?;

            println!("Captured {} branch records on cpu {cpu}:", entries.len());
            for e in &entries {
                let flag = if e.mispredicted { " (mispredicted)" } else { "" };
                println!("- {:#014x} -> {:#014x}{flag}", e.from, e.to);
            }
        }
    }

    Ok(())
}

/// Reading /dev/cpu/<id>/msr needs the msr kernel module (unless it is built
/// into the kernel); warn early instead of failing on the first open.
fn warn_if_msr_module_missing() {
    match procfs::modules() {
        Ok(modules) => {
            if !modules.contains_key("msr") {
                warn!("the 'msr' kernel module does not appear to be loaded; if /dev/cpu/*/msr is missing, run `modprobe msr`");
            }
        }
        Err(e) => warn!("could not list the kernel modules: {e}"),
    }
}
