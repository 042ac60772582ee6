// Silvermont/Airmont core PMU: 2 general-purpose counters and 3
// fixed-function counters, all 40 bits wide, and an 8-deep LBR stack with a
// filtering MSR. Addresses from the Intel SDM volume 4, Silvermont chapters.

use anyhow::anyhow;

use crate::lbr::{self, LbrEntry};
use crate::msr::{self, arch, Addr, MsrHandle};
use crate::{EventCode, HwEvent, PmcIndex, PmuDispatch, PmuLayout};

mod msrs {
    use crate::msr::Addr;

    pub const MSR_LBR_SELECT: Addr = 0x1C8;
    pub const MSR_LASTBRANCH_TOS: Addr = 0x1C9;
    pub const MSR_LASTBRANCH_0_FROM_IP: Addr = 0x680;
    pub const MSR_LASTBRANCH_0_TO_IP: Addr = 0x6C0;
}

/// DisplayModel values (family 6) handled by this node.
pub const MODELS: &[u32] = &[
    0x37, // Bay Trail
    0x4A, // Merrifield
    0x4C, // Airmont: Cherry Trail, Braswell
    0x4D, // Avoton, Rangeley
    0x5A, // Moorefield
    0x5D, // SoFIA
];

const LAYOUT: PmuLayout = PmuLayout {
    gp_counters: 2,
    gp_counter_bits: 40,
    fixed_counters: 3,
    fixed_counter_bits: 40,
    lbr_depth: 8,
    threads_per_core: 1,
};

pub struct SilvermontDispatch {
    layout: PmuLayout,
}

pub static DISPATCH: SilvermontDispatch = SilvermontDispatch { layout: LAYOUT };

impl PmuDispatch for SilvermontDispatch {
    fn name(&self) -> &'static str {
        "silvermont"
    }

    fn layout(&self) -> PmuLayout {
        self.layout
    }

    fn event_code(&self, event: HwEvent) -> Option<EventCode> {
        // the architectural events, all implemented since Silvermont
        let (select, umask) = match event {
            HwEvent::Cycles => (0x3C, 0x00),
            HwEvent::RefCycles => (0x3C, 0x01),
            HwEvent::Instructions => (0xC0, 0x00),
            HwEvent::LlcReferences => (0x2E, 0x4F),
            HwEvent::LlcMisses => (0x2E, 0x41),
            HwEvent::Branches => (0xC4, 0x00),
            HwEvent::BranchMisses => (0xC5, 0x00),
        };
        Some(EventCode { select, umask })
    }

    fn init(&self, msr: &MsrHandle) -> anyhow::Result<()> {
        msr::quiesce(msr, &self.layout)?;

        // record every branch kind, then turn recording on
        msr.write(msrs::MSR_LBR_SELECT, 0)?;
        msr::enable_branch_recording(msr)?;
        Ok(())
    }

    fn program(&self, msr: &MsrHandle, slot: u8, code: EventCode) -> anyhow::Result<()> {
        if slot >= self.layout.gp_counters {
            return Err(anyhow!("silvermont has no general-purpose slot {slot}"));
        }
        msr.write(arch::IA32_PERFEVTSEL0 + slot as Addr, msr::evtsel_value(code))?;
        Ok(())
    }

    fn enable(&self, msr: &MsrHandle, counters: &[PmcIndex]) -> anyhow::Result<()> {
        msr.write(arch::IA32_FIXED_CTR_CTRL, msr::fixed_ctrl_value(counters))?;
        msr.write(arch::IA32_PERF_GLOBAL_CTRL, msr::global_ctrl_mask(counters))?;
        Ok(())
    }

    fn disable(&self, msr: &MsrHandle) -> anyhow::Result<()> {
        msr.write(arch::IA32_PERF_GLOBAL_CTRL, 0)?;
        msr.write(arch::IA32_FIXED_CTR_CTRL, 0)?;
        msr::disable_branch_recording(msr)?;
        Ok(())
    }

    fn read_counter(&self, msr: &MsrHandle, index: PmcIndex) -> anyhow::Result<u64> {
        self.check_index(index)?;
        Ok(msr.read(msr::counter_addr(index))?)
    }

    fn write_counter(&self, msr: &MsrHandle, index: PmcIndex, value: u64) -> anyhow::Result<()> {
        self.check_index(index)?;
        if value > self.layout.counter_max(index) {
            return Err(anyhow!("value {value:#x} does not fit in a 40-bit counter"));
        }
        msr.write(msr::counter_addr(index), value)?;
        Ok(())
    }

    fn read_lbr(&self, msr: &MsrHandle) -> anyhow::Result<Vec<LbrEntry>> {
        lbr::read_stack(
            msr,
            msrs::MSR_LASTBRANCH_TOS,
            msrs::MSR_LASTBRANCH_0_FROM_IP,
            msrs::MSR_LASTBRANCH_0_TO_IP,
            self.layout.lbr_depth,
        )
    }
}

impl SilvermontDispatch {
    fn check_index(&self, index: PmcIndex) -> anyhow::Result<()> {
        let valid = match index {
            PmcIndex::Gp(i) => i < self.layout.gp_counters,
            PmcIndex::Fixed(i) => i < self.layout.fixed_counters,
        };
        if valid {
            Ok(())
        } else {
            Err(anyhow!("silvermont has no counter {index:?}"))
        }
    }
}
