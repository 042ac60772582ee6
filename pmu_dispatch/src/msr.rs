// The counters are programmed through model-specific registers, described in
// the Intel 64 and IA-32 architectures software developer's manual, volume 3B
// (performance monitoring) and volume 4 (MSR listings).

use std::{fs::File, io, os::unix::prelude::FileExt};

use anyhow::{anyhow, Context};
use log::warn;

use crate::{
    CounterMeasurements, CounterProbe, EventCode, HwEvent, PmcIndex, PmuDispatch, PmuLayout,
};

pub type Addr = u64;

/// Architectural performance-monitoring MSRs, common to all families.
pub mod arch {
    use super::Addr;

    pub const IA32_PMC0: Addr = 0x0C1;
    pub const IA32_PERFEVTSEL0: Addr = 0x186;
    pub const IA32_DEBUGCTL: Addr = 0x1D9;
    pub const IA32_FIXED_CTR0: Addr = 0x309;
    pub const IA32_FIXED_CTR_CTRL: Addr = 0x38D;
    pub const IA32_PERF_GLOBAL_STATUS: Addr = 0x38E;
    pub const IA32_PERF_GLOBAL_CTRL: Addr = 0x38F;
    pub const IA32_PERF_GLOBAL_OVF_CTRL: Addr = 0x390;
}

/// IA32_PERFEVTSELx flag bits.
mod evtsel {
    pub const USR: u64 = 1 << 16;
    pub const OS: u64 = 1 << 17;
    pub const ENABLE: u64 = 1 << 22;
}

/// IA32_DEBUGCTL.LBR enables last-branch recording.
pub(crate) const DEBUGCTL_LBR: u64 = 1 << 0;

/// Handle to the MSRs of one CPU (via /dev/cpu/<cpu_id>/msr).
pub struct MsrHandle {
    /// File descriptor to the MSR device of one cpu
    fd: File,
    cpu: u32,
}

impl MsrHandle {
    pub fn open(cpu: u32) -> anyhow::Result<MsrHandle> {
        let path = format!("/dev/cpu/{cpu}/msr");
        let fd = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {path}"))?;
        Ok(MsrHandle { fd, cpu })
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn read(&self, at: Addr) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.fd.read_exact_at(&mut buf, at)?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write(&self, at: Addr, value: u64) -> io::Result<()> {
        self.fd.write_all_at(&value.to_ne_bytes(), at)
    }
}

/// Value written into IA32_PERFEVTSELx to count an event in rings 0 and 3.
pub fn evtsel_value(code: EventCode) -> u64 {
    code.select as u64 | (code.umask as u64) << 8 | evtsel::USR | evtsel::OS | evtsel::ENABLE
}

/// MSR address of a counter register.
pub(crate) fn counter_addr(index: PmcIndex) -> Addr {
    match index {
        PmcIndex::Gp(i) => arch::IA32_PMC0 + i as Addr,
        PmcIndex::Fixed(i) => arch::IA32_FIXED_CTR0 + i as Addr,
    }
}

/// IA32_PERF_GLOBAL_CTRL mask enabling exactly the given counters.
pub(crate) fn global_ctrl_mask(counters: &[PmcIndex]) -> u64 {
    let mut mask = 0u64;
    for &counter in counters {
        match counter {
            PmcIndex::Gp(i) => mask |= 1 << i,
            PmcIndex::Fixed(i) => mask |= 1 << (32 + i),
        }
    }
    mask
}

/// IA32_FIXED_CTR_CTRL value enabling the given fixed counters in rings 0
/// and 3 (one 4-bit field per counter).
pub(crate) fn fixed_ctrl_value(counters: &[PmcIndex]) -> u64 {
    let mut value = 0u64;
    for &counter in counters {
        if let PmcIndex::Fixed(i) = counter {
            value |= 0b011 << (4 * i);
        }
    }
    value
}

/// Stops all counters of one CPU, acknowledges pending overflows and zeroes
/// the counter registers. The family quirks on top of this sequence live in
/// the dispatch nodes.
pub(crate) fn quiesce(msr: &MsrHandle, layout: &PmuLayout) -> anyhow::Result<()> {
    msr.write(arch::IA32_PERF_GLOBAL_CTRL, 0)?;
    msr.write(arch::IA32_FIXED_CTR_CTRL, 0)?;

    // acknowledge any overflow left behind by a previous user
    let status = msr.read(arch::IA32_PERF_GLOBAL_STATUS)?;
    if status != 0 {
        msr.write(arch::IA32_PERF_GLOBAL_OVF_CTRL, status)?;
    }

    for i in 0..layout.gp_counters {
        msr.write(arch::IA32_PERFEVTSEL0 + i as Addr, 0)?;
        msr.write(arch::IA32_PMC0 + i as Addr, 0)?;
    }
    for i in 0..layout.fixed_counters {
        msr.write(arch::IA32_FIXED_CTR0 + i as Addr, 0)?;
    }
    Ok(())
}

/// Sets the LBR bit of IA32_DEBUGCTL, keeping the other bits.
pub(crate) fn enable_branch_recording(msr: &MsrHandle) -> anyhow::Result<()> {
    let debugctl = msr.read(arch::IA32_DEBUGCTL)?;
    msr.write(arch::IA32_DEBUGCTL, debugctl | DEBUGCTL_LBR)?;
    Ok(())
}

/// Clears the LBR bit of IA32_DEBUGCTL, keeping the other bits.
pub(crate) fn disable_branch_recording(msr: &MsrHandle) -> anyhow::Result<()> {
    let debugctl = msr.read(arch::IA32_DEBUGCTL)?;
    msr.write(arch::IA32_DEBUGCTL, debugctl & !DEBUGCTL_LBR)?;
    Ok(())
}

/// A portable event bound to one hardware counter.
#[derive(Debug, Clone, Copy)]
pub struct EventSlot {
    pub event: HwEvent,
    pub index: PmcIndex,
    code: Option<EventCode>,
}

/// Assigns events to counters: the architectural fixed-function counters
/// count their dedicated events, everything else takes a general-purpose
/// slot.
pub fn assign_counters(
    dispatch: &'static dyn PmuDispatch,
    events: &[HwEvent],
) -> anyhow::Result<Vec<EventSlot>> {
    let layout = dispatch.layout();
    let mut slots = Vec::with_capacity(events.len());
    let mut next_gp = 0u8;

    for &event in events {
        let index = match fixed_counter_for(event) {
            Some(i) if i < layout.fixed_counters => PmcIndex::Fixed(i),
            _ => {
                if next_gp >= layout.gp_counters {
                    return Err(anyhow!(
                        "{} only has {} general-purpose counters, too many events requested",
                        dispatch.name(),
                        layout.gp_counters
                    ));
                }
                let i = next_gp;
                next_gp += 1;
                PmcIndex::Gp(i)
            }
        };
        let code = match index {
            PmcIndex::Fixed(_) => None,
            PmcIndex::Gp(_) => Some(
                dispatch
                    .event_code(event)
                    .with_context(|| format!("{} cannot count {event:?}", dispatch.name()))?,
            ),
        };
        slots.push(EventSlot { event, index, code });
    }
    Ok(slots)
}

/// The architectural fixed-function counter dedicated to an event, if any.
fn fixed_counter_for(event: HwEvent) -> Option<u8> {
    match event {
        HwEvent::Instructions => Some(0),
        HwEvent::Cycles => Some(1),
        HwEvent::RefCycles => Some(2),
        _ => None,
    }
}

/// Reads the counters directly from the MSRs of each monitored CPU,
/// programming them through the dispatch node of the detected family.
pub struct MsrCounterProbe {
    /// Stores the counter measurements
    measurements: CounterMeasurements,

    /// MSR handles for each monitored cpu
    msr_per_cpu: Vec<MsrHandle>,

    /// The dispatch node of the family, resolved once
    dispatch: &'static dyn PmuDispatch,

    /// The events to read and the counters they are bound to
    slots: Vec<EventSlot>,
}

impl MsrCounterProbe {
    pub fn new(
        cpus: &[u32],
        dispatch: &'static dyn PmuDispatch,
        events: &[HwEvent],
    ) -> anyhow::Result<MsrCounterProbe> {
        let slots = assign_counters(dispatch, events)?;
        let counters: Vec<PmcIndex> = slots.iter().map(|s| s.index).collect();

        let msr_per_cpu = cpus
            .iter()
            .map(|&cpu| MsrHandle::open(cpu))
            .collect::<anyhow::Result<Vec<MsrHandle>>>()?;

        for msr in &msr_per_cpu {
            dispatch
                .init(msr)
                .with_context(|| format!("failed to init the PMU of cpu {}", msr.cpu()))?;
            for slot in &slots {
                if let (PmcIndex::Gp(i), Some(code)) = (slot.index, slot.code) {
                    dispatch.program(msr, i, code)?;
                }
            }
            dispatch.enable(msr, &counters)?;
        }

        Ok(MsrCounterProbe {
            measurements: CounterMeasurements::new(cpus.len()),
            msr_per_cpu,
            dispatch,
            slots,
        })
    }
}

impl CounterProbe for MsrCounterProbe {
    fn poll(&mut self) -> anyhow::Result<()> {
        let layout = self.dispatch.layout();
        for (cpu_index, msr) in self.msr_per_cpu.iter().enumerate() {
            for slot in &self.slots {
                let value = self
                    .dispatch
                    .read_counter(msr, slot.index)
                    .with_context(|| {
                        format!("failed to read counter {:?} of cpu {}", slot.index, msr.cpu())
                    })?;

                self.measurements
                    .push(cpu_index, slot.event, value, layout.counter_max(slot.index));
            }
        }
        Ok(())
    }

    fn measurements(&self) -> &CounterMeasurements {
        &self.measurements
    }

    fn reset(&mut self) {
        self.measurements.clear()
    }
}

impl Drop for MsrCounterProbe {
    fn drop(&mut self) {
        for msr in &self.msr_per_cpu {
            if let Err(e) = self.dispatch.disable(msr) {
                warn!("failed to disable the counters of cpu {}: {e}", msr.cpu());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dispatch_for, Microarch};

    #[test]
    fn test_evtsel_encoding() {
        let value = evtsel_value(EventCode {
            select: 0x3C,
            umask: 0x01,
        });
        assert_eq!(value & 0xFF, 0x3C);
        assert_eq!((value >> 8) & 0xFF, 0x01);
        assert_ne!(value & (1 << 16), 0, "USR must be set");
        assert_ne!(value & (1 << 17), 0, "OS must be set");
        assert_ne!(value & (1 << 22), 0, "ENABLE must be set");
        assert_eq!(value >> 23, 0, "no stray high bits");
    }

    #[test]
    fn test_counter_addresses() {
        assert_eq!(counter_addr(PmcIndex::Gp(0)), 0x0C1);
        assert_eq!(counter_addr(PmcIndex::Gp(1)), 0x0C2);
        assert_eq!(counter_addr(PmcIndex::Fixed(0)), 0x309);
        assert_eq!(counter_addr(PmcIndex::Fixed(2)), 0x30B);
    }

    #[test]
    fn test_global_ctrl_mask() {
        let counters = [PmcIndex::Gp(0), PmcIndex::Gp(1), PmcIndex::Fixed(0), PmcIndex::Fixed(2)];
        let mask = global_ctrl_mask(&counters);
        assert_eq!(mask, 0b11 | (1 << 32) | (1 << 34));
    }

    #[test]
    fn test_fixed_ctrl_value() {
        let counters = [PmcIndex::Fixed(0), PmcIndex::Fixed(2), PmcIndex::Gp(0)];
        let value = fixed_ctrl_value(&counters);
        assert_eq!(value, 0b011 | (0b011 << 8));
    }

    #[test]
    fn test_assign_counters() -> anyhow::Result<()> {
        let dispatch = dispatch_for(Microarch::Silvermont);
        let events = [
            HwEvent::Cycles,
            HwEvent::Instructions,
            HwEvent::Branches,
            HwEvent::LlcMisses,
        ];
        let slots = assign_counters(dispatch, &events)?;

        assert_eq!(slots[0].index, PmcIndex::Fixed(1));
        assert_eq!(slots[1].index, PmcIndex::Fixed(0));
        assert_eq!(slots[2].index, PmcIndex::Gp(0));
        assert_eq!(slots[3].index, PmcIndex::Gp(1));
        assert!(slots[2].code.is_some());

        // a third general-purpose event does not fit on silvermont
        let too_many = [
            HwEvent::Branches,
            HwEvent::BranchMisses,
            HwEvent::LlcReferences,
        ];
        assert!(assign_counters(dispatch, &too_many).is_err());
        Ok(())
    }
}
