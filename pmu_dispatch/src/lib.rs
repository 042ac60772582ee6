use std::{
    fs,
    num::ParseIntError,
    process::{Command, Stdio},
};

use anyhow::{anyhow, Context};
use clap::ValueEnum;
use enum_map::{self, Enum, EnumMap};
use regex::Regex;

pub mod knights;
pub mod lbr;
pub mod msr;
pub mod perf_event;
pub mod silvermont;

use lbr::LbrEntry;
use msr::MsrHandle;

/// A supported microarchitecture family.
///
/// Each family is bound to exactly one [`PmuDispatch`] node, resolved with
/// [`dispatch_for`]. Supporting a new family means adding a variant here and
/// a module implementing its node.
#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Microarch {
    /// Silvermont and Airmont Atom cores
    Silvermont,
    /// Knights Landing and Knights Mill (Xeon Phi)
    Knights,
}

impl Microarch {
    pub const ALL: [Microarch; 2] = [Microarch::Silvermont, Microarch::Knights];
}

/// Portable hardware event kinds.
///
/// The dispatch nodes map them to family-specific encodings, see
/// [`PmuDispatch::event_code`].
#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum HwEvent {
    /// unhalted core cycles
    Cycles,
    /// instructions retired
    Instructions,
    /// unhalted reference cycles
    RefCycles,
    /// last-level cache references
    LlcReferences,
    /// last-level cache misses
    LlcMisses,
    /// branch instructions retired
    Branches,
    /// mispredicted branches retired
    BranchMisses,
}

impl HwEvent {
    pub const ALL: [HwEvent; 7] = [
        HwEvent::Cycles,
        HwEvent::Instructions,
        HwEvent::RefCycles,
        HwEvent::LlcReferences,
        HwEvent::LlcMisses,
        HwEvent::Branches,
        HwEvent::BranchMisses,
    ];
}

/// Event select + unit mask pair, as written into an IA32_PERFEVTSELx
/// register (or used as the raw config of a perf event).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCode {
    pub select: u8,
    pub umask: u8,
}

/// Index of one hardware counter on one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmcIndex {
    /// Fixed-function counter (IA32_FIXED_CTRx)
    Fixed(u8),
    /// General-purpose counter (IA32_PMCx)
    Gp(u8),
}

/// Counter geometry of one microarchitecture family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmuLayout {
    pub gp_counters: u8,
    pub gp_counter_bits: u8,
    pub fixed_counters: u8,
    pub fixed_counter_bits: u8,
    pub lbr_depth: u8,
    pub threads_per_core: u8,
}

impl PmuLayout {
    /// Maximum raw value of a general-purpose counter.
    pub const fn gp_max(&self) -> u64 {
        (1u64 << self.gp_counter_bits) - 1
    }

    /// Maximum raw value of a fixed-function counter.
    pub const fn fixed_max(&self) -> u64 {
        (1u64 << self.fixed_counter_bits) - 1
    }

    pub const fn counter_max(&self, index: PmcIndex) -> u64 {
        match index {
            PmcIndex::Fixed(_) => self.fixed_max(),
            PmcIndex::Gp(_) => self.gp_max(),
        }
    }
}

/// The architecture-specific PMU operations of one microarchitecture family.
///
/// Exactly one node implements this trait per [`Microarch`]. The nodes are
/// frozen statics: they are fully built at compile time, never mutated, and
/// can be shared between threads without locking. Generic code (the probes,
/// the CLI) only goes through this trait.
pub trait PmuDispatch: Sync {
    /// Stable name of the family, e.g. `"silvermont"`.
    fn name(&self) -> &'static str;

    /// Counter geometry of this family.
    fn layout(&self) -> PmuLayout;

    /// Family encoding of a portable event, or `None` if the family cannot
    /// count it.
    fn event_code(&self, event: HwEvent) -> Option<EventCode>;

    /// Quiesces the PMU of one CPU: stops all counters, acknowledges pending
    /// overflows, zeroes the counter registers and turns branch recording on.
    fn init(&self, msr: &MsrHandle) -> anyhow::Result<()>;

    /// Writes an event selection into general-purpose slot `slot`.
    fn program(&self, msr: &MsrHandle, slot: u8, code: EventCode) -> anyhow::Result<()>;

    /// Globally enables the given counters.
    fn enable(&self, msr: &MsrHandle, counters: &[PmcIndex]) -> anyhow::Result<()>;

    /// Globally disables all counters and branch recording.
    fn disable(&self, msr: &MsrHandle) -> anyhow::Result<()>;

    fn read_counter(&self, msr: &MsrHandle, index: PmcIndex) -> anyhow::Result<u64>;

    fn write_counter(&self, msr: &MsrHandle, index: PmcIndex, value: u64) -> anyhow::Result<()>;

    /// Captures the last-branch-record stack, most recent branch first.
    fn read_lbr(&self, msr: &MsrHandle) -> anyhow::Result<Vec<LbrEntry>>;
}

/// Returns the dispatch node of a microarchitecture family.
///
/// The nodes are statics: repeated lookups return references to the same
/// underlying object.
pub fn dispatch_for(arch: Microarch) -> &'static dyn PmuDispatch {
    match arch {
        Microarch::Silvermont => &silvermont::DISPATCH,
        Microarch::Knights => &knights::DISPATCH,
    }
}

/// Looks up a dispatch node by its stable name.
pub fn dispatch_by_name(name: &str) -> Option<&'static dyn PmuDispatch> {
    Microarch::ALL.into_iter().map(dispatch_for).find(|d| d.name() == name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
}

/// CPUID-level identity of the processor, as reported by `lscpu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuIdentity {
    pub vendor: CpuVendor,
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
}

/// Detects the identity of the processor by running `LC_ALL=C lscpu`.
pub fn detect_identity() -> anyhow::Result<CpuIdentity> {
    let child = Command::new("lscpu")
        .env("LC_ALL", "C")
        .stdout(Stdio::piped())
        .spawn()
        .context("lscpu should be executable")?;
    let finished = child.wait_with_output()?;
    let stdout = std::str::from_utf8(&finished.stdout)?;
    parse_lscpu(stdout)
}

fn parse_lscpu(stdout: &str) -> anyhow::Result<CpuIdentity> {
    fn field(stdout: &str, name: &str) -> anyhow::Result<String> {
        let re = Regex::new(&format!(r"{name}:\s+(\w+)"))?;
        let group = re
            .captures(stdout)
            .with_context(|| format!("{name} not found in lscpu output"))?
            .get(1)
            .unwrap();
        Ok(group.as_str().trim().to_owned())
    }

    let vendor = match field(stdout, "Vendor ID")?.as_str() {
        "GenuineIntel" => CpuVendor::Intel,
        "AuthenticAMD" => CpuVendor::Amd,
        other => return Err(anyhow!("Unsupported CPU vendor {other}")),
    };
    let family: u32 = field(stdout, "CPU family")?.parse()?;
    let model: u32 = field(stdout, "Model")?.parse()?;
    let stepping: u32 = field(stdout, "Stepping")?.parse()?;

    Ok(CpuIdentity {
        vendor,
        family,
        model,
        stepping,
    })
}

/// Maps a detected CPU identity to its microarchitecture family.
///
/// Returns `None` when no dispatch node covers the model; the caller decides
/// whether that is an error.
pub fn microarch_for_identity(id: &CpuIdentity) -> Option<Microarch> {
    if id.vendor != CpuVendor::Intel || id.family != 6 {
        return None;
    }
    if silvermont::MODELS.contains(&id.model) {
        Some(Microarch::Silvermont)
    } else if knights::MODELS.contains(&id.model) {
        Some(Microarch::Knights)
    } else {
        None
    }
}

/// Uniform polling interface over the counter access backends.
///
/// ## Overflows
///
/// The hardware counters wrap after some time, which depends on the event
/// rate and on the counter width of the family. No more than one wrap must
/// occur between two polls, otherwise the reported deltas are too small:
/// the polling frequency must be high enough. Two consecutive polls with
/// `overflowed == true` mean the frequency is too low, or barely right.
pub trait CounterProbe: Send {
    /// Reads the current counter values and updates the measurements.
    fn poll(&mut self) -> anyhow::Result<()>;

    fn measurements(&self) -> &CounterMeasurements;

    fn reset(&mut self);
}

/// Per-CPU counter bookkeeping.
#[derive(Debug, Clone)]
pub struct CounterMeasurements {
    pub per_cpu: Vec<EnumMap<HwEvent, CounterState>>,
}

#[derive(Debug, Default, Clone)]
pub struct CounterState {
    /// The previous raw value of the hardware counter.
    previous_value: Option<u64>,

    /// `true` if the counter wrapped between the last two polls.
    pub overflowed: bool,

    /// Number of events counted between the last two polls.
    pub count: Option<u64>,
}

impl CounterMeasurements {
    pub fn new(cpu_count: usize) -> CounterMeasurements {
        let v = vec![EnumMap::default(); cpu_count];
        CounterMeasurements { per_cpu: v }
    }

    pub fn events_of_cpu(&self, cpu_index: usize) -> impl Iterator<Item = (HwEvent, &CounterState)> {
        self.per_cpu[cpu_index].iter()
    }

    /// Stores a new raw counter value and computes the difference with the
    /// previous one. `max_value` is the highest raw value the counter can
    /// hold, used to correct a wraparound.
    pub fn push(&mut self, cpu_index: usize, event: HwEvent, counter_value: u64, max_value: u64) {
        let current = counter_value;
        let state = &mut self.per_cpu[cpu_index][event];
        if let Some(prev) = state.previous_value {
            if current < prev {
                // one or more wraps have occured, we cannot know how many,
                // so we correct only one.
                let corrected = max_value - prev + current;
                state.overflowed = true;
                state.count = Some(corrected);
            } else {
                state.overflowed = false;
                state.count = Some(current - prev);
            }
        }
        state.previous_value = Some(current);
    }

    pub fn clear(&mut self) {
        for map in &mut self.per_cpu {
            for (_, state) in map.iter_mut() {
                *state = CounterState::default();
            }
        }
    }
}

/// Lists the online CPUs.
pub fn online_cpus() -> anyhow::Result<Vec<u32>> {
    let list = fs::read_to_string("/sys/devices/system/cpu/online")?;
    parse_cpu_list(&list)
}

fn parse_cpu_list(cpulist: &str) -> anyhow::Result<Vec<u32>> {
    // handles "n" or "start-end"
    fn parse_cpulist_item(item: &str) -> anyhow::Result<Vec<u32>> {
        let bounds: Vec<u32> = item
            .split('-')
            .map(str::parse)
            .collect::<Result<Vec<u32>, ParseIntError>>()?;

        match bounds.as_slice() {
            &[start, end] => Ok((start..=end).collect()),
            &[n] => Ok(vec![n]),
            _ => Err(anyhow::anyhow!("invalid cpulist: {}", item)),
        }
    }

    // this can be "0,64" or "0-1" or maybe "0-1,64-66"
    let cpus: Vec<u32> = cpulist
        .trim_end()
        .split(',')
        .map(parse_cpulist_item)
        .collect::<anyhow::Result<Vec<Vec<u32>>>>()?
        .into_iter()
        .flatten()
        .collect();

    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSCPU_SILVERMONT: &str = "Architecture:        x86_64
CPU op-mode(s):      32-bit, 64-bit
Byte Order:          Little Endian
CPU(s):              4
Vendor ID:           GenuineIntel
CPU family:          6
Model:               55
Model name:          Intel(R) Celeron(R) CPU J1900 @ 1.99GHz
Stepping:            3
";

    const LSCPU_KNIGHTS: &str = "Architecture:        x86_64
Vendor ID:           GenuineIntel
CPU family:          6
Model:               87
Model name:          Intel(R) Xeon Phi(TM) CPU 7210 @ 1.30GHz
Stepping:            1
";

    #[test]
    fn test_parse_cpulist() -> anyhow::Result<()> {
        assert_eq!(parse_cpu_list("0")?, vec![0]);
        assert_eq!(parse_cpu_list("0,64")?, vec![0, 64]);
        assert_eq!(parse_cpu_list("0-1")?, vec![0, 1]);
        assert_eq!(parse_cpu_list("1-3,5-6")?, vec![1, 2, 3, 5, 6]);
        assert!(parse_cpu_list("1-2-3").is_err());
        Ok(())
    }

    #[test]
    fn test_parse_lscpu() -> anyhow::Result<()> {
        let id = parse_lscpu(LSCPU_SILVERMONT)?;
        assert_eq!(
            id,
            CpuIdentity {
                vendor: CpuVendor::Intel,
                family: 6,
                model: 0x37,
                stepping: 3,
            }
        );

        let id = parse_lscpu(LSCPU_KNIGHTS)?;
        assert_eq!(id.model, 0x57);
        assert!(parse_lscpu("Vendor ID:  WeirdCpuCorp\n").is_err());
        Ok(())
    }

    #[test]
    fn test_model_mapping() -> anyhow::Result<()> {
        let silvermont = parse_lscpu(LSCPU_SILVERMONT)?;
        assert_eq!(microarch_for_identity(&silvermont), Some(Microarch::Silvermont));

        let knights = parse_lscpu(LSCPU_KNIGHTS)?;
        assert_eq!(microarch_for_identity(&knights), Some(Microarch::Knights));

        // Skylake is family 6 too, but no node covers it
        let skylake = CpuIdentity {
            vendor: CpuVendor::Intel,
            family: 6,
            model: 0x5E,
            stepping: 3,
        };
        assert_eq!(microarch_for_identity(&skylake), None);

        let amd = CpuIdentity {
            vendor: CpuVendor::Amd,
            family: 0x17,
            model: 0x31,
            stepping: 0,
        };
        assert_eq!(microarch_for_identity(&amd), None);
        Ok(())
    }

    #[test]
    fn test_registry_lookups_are_idempotent() {
        for arch in Microarch::ALL {
            let a = dispatch_for(arch) as *const dyn PmuDispatch as *const ();
            let b = dispatch_for(arch) as *const dyn PmuDispatch as *const ();
            assert_eq!(a, b, "{arch:?} must always resolve to the same node");
        }
    }

    #[test]
    fn test_registry_nodes_are_distinct() {
        let silvermont = dispatch_for(Microarch::Silvermont) as *const dyn PmuDispatch as *const ();
        let knights = dispatch_for(Microarch::Knights) as *const dyn PmuDispatch as *const ();
        assert_ne!(silvermont, knights);
    }

    #[test]
    fn test_registry_nodes_are_fully_populated() {
        for arch in Microarch::ALL {
            let dispatch = dispatch_for(arch);
            assert!(!dispatch.name().is_empty());

            let layout = dispatch.layout();
            assert!(layout.gp_counters > 0);
            assert!(layout.fixed_counters > 0);
            assert!(layout.lbr_depth > 0);
            assert!(layout.gp_counter_bits > 0 && layout.gp_counter_bits <= 64);

            // the architectural events must all be countable
            for event in HwEvent::ALL {
                assert!(
                    dispatch.event_code(event).is_some(),
                    "{arch:?} has no encoding for {event:?}"
                );
            }
        }
    }

    #[test]
    fn test_lookup_by_name() {
        let silvermont = dispatch_by_name("silvermont").expect("silvermont node should exist");
        let knights = dispatch_by_name("knights").expect("knights node should exist");
        assert_eq!(silvermont.name(), "silvermont");
        assert_eq!(knights.name(), "knights");
        assert!(dispatch_by_name("tremont").is_none());
    }

    #[test]
    fn test_overflow_correction() {
        let mut m = CounterMeasurements::new(1);
        let max = (1u64 << 40) - 1;

        m.push(0, HwEvent::Cycles, 100, max);
        let state = &m.per_cpu[0][HwEvent::Cycles];
        assert_eq!(state.count, None);

        m.push(0, HwEvent::Cycles, 250, max);
        let state = &m.per_cpu[0][HwEvent::Cycles];
        assert_eq!(state.count, Some(150));
        assert!(!state.overflowed);

        // the counter wrapped at 2^40 - 1
        m.push(0, HwEvent::Cycles, 50, max);
        let state = &m.per_cpu[0][HwEvent::Cycles];
        assert_eq!(state.count, Some(max - 250 + 50));
        assert!(state.overflowed);

        m.clear();
        let state = &m.per_cpu[0][HwEvent::Cycles];
        assert_eq!(state.count, None);
        assert!(!state.overflowed);
    }
}
