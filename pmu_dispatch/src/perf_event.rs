use anyhow::Context;
use log::debug;
use perf_event_open_sys as sys;
use std::{
    fs::File,
    io::{self, Read},
    os::fd::FromRawFd,
};

use crate::{CounterMeasurements, CounterProbe, EventCode, HwEvent, PmuDispatch};

// The kernel accumulates each event in a 64-bit value, whatever the width of
// the hardware counter behind it, so a wrap is practically impossible here.
pub(crate) const PERF_MAX_COUNT: u64 = u64::MAX;

/// Raw config value for a `PERF_TYPE_RAW` perf event: on x86 the kernel
/// expects the low IA32_PERFEVTSELx bits (select + umask).
pub fn raw_config(code: EventCode) -> u64 {
    code.select as u64 | (code.umask as u64) << 8
}

/// Make a system call to [perf_event_open](https://www.man7.org/linux/man-pages/man2/perf_event_open.2.html)
/// with `attr.config = raw_config(code)` and `attr.type = PERF_TYPE_RAW`.
///
/// # Arguments
/// * `code` - The family encoding of the event, given by [`PmuDispatch::event_code`].
/// * `cpu_id` - Defines which CPU (core) to monitor.
///
pub fn perf_event_open_raw(code: EventCode, cpu_id: u32) -> io::Result<i32> {
    // For core PMU events we use (-1, cpu), which means "all processes, one cpu".
    let pid = -1; // all processes
    let cpu = cpu_id as i32;

    let mut attr = sys::bindings::perf_event_attr::default();
    attr.config = raw_config(code);
    attr.type_ = sys::bindings::PERF_TYPE_RAW as u32;
    attr.size = core::mem::size_of_val(&attr) as u32;
    debug!("{attr:?}");

    let result = unsafe { sys::perf_event_open(&mut attr, pid, cpu, -1, 0) };
    if result == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// Counter probe based on raw perf events.
///
/// The events still carry the family encodings of the dispatch node, but the
/// kernel programs the counters, so this works without `/dev/cpu` access and
/// cross-checks the direct MSR path.
pub struct PerfCounterProbe {
    /// Stores the counter measurements
    measurements: CounterMeasurements,

    /// Ready-to-read perf events with additional metadata
    events: Vec<OpenedCounter>,
}

struct OpenedCounter {
    fd: File,
    cpu_index: usize,
    event: HwEvent,
}

impl PerfCounterProbe {
    pub fn new(
        cpus: &[u32],
        dispatch: &'static dyn PmuDispatch,
        events: &[HwEvent],
    ) -> anyhow::Result<PerfCounterProbe> {
        let mut opened = Vec::with_capacity(cpus.len() * events.len());
        for (cpu_index, &cpu) in cpus.iter().enumerate() {
            for &event in events {
                let code = dispatch
                    .event_code(event)
                    .with_context(|| format!("{} cannot count {event:?}", dispatch.name()))?;
                let raw_fd = perf_event_open_raw(code, cpu)
                    .with_context(|| format!("perf_event_open failed for {event:?} on cpu {cpu}"))?;
                let fd = unsafe { File::from_raw_fd(raw_fd) };
                opened.push(OpenedCounter {
                    fd,
                    cpu_index,
                    event,
                });
            }
        }
        Ok(PerfCounterProbe {
            measurements: CounterMeasurements::new(cpus.len()),
            events: opened,
        })
    }
}

impl CounterProbe for PerfCounterProbe {
    fn poll(&mut self) -> anyhow::Result<()> {
        for evt in &mut self.events {
            let value = read_perf_event(&mut evt.fd)
                .with_context(|| format!("failed to read perf event {:?} for {:?}", evt.fd, evt.event))?;

            self.measurements
                .push(evt.cpu_index, evt.event, value, PERF_MAX_COUNT);
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

fn read_perf_event(fd: &mut File) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    // rewind() is INVALID for perf events, we must read "at the cursor" every time
    fd.read(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_config() {
        let config = raw_config(EventCode {
            select: 0x2E,
            umask: 0x41,
        });
        assert_eq!(config, 0x412E);
    }
}
