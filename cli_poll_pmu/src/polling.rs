use pmu_dispatch::{CounterMeasurements, CounterProbe};

use anyhow::Context;
use futures::stream::StreamExt;
use std::io::Write;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{self, Sender};
use tokio_timerfd::Interval;

pub async fn run(
    mut writer: Box<dyn Write + Send>,
    mut probe: Box<dyn CounterProbe>,
    cpus: Vec<u32>,
    polling_period: Duration,
    measurement_flush_interval: Duration,
) -> anyhow::Result<()> {
    // open a Channel to write to the output in another thread
    let (tx, mut rx) = mpsc::channel::<MeasurementsMessage>(4096);

    // Start the writer task, which will receive the data from the channel and write
    // it to the selected output.
    let handle = tokio::spawn(async move {
        let mut previous_timestamp: SystemTime = SystemTime::now();

        // write the csv header
        writer.write_all("timestamp_ms;cpu;event;overflow;count\n".as_bytes())?;
        while let Some(msg) = rx.recv().await {
            print_measurements(&mut writer, &cpus, &msg)?;

            let time_since_last_flush = msg
                .timestamp
                .duration_since(previous_timestamp)
                .unwrap_or(Duration::ZERO);

            if time_since_last_flush >= measurement_flush_interval {
                previous_timestamp = msg.timestamp;
                writer.flush()?;
            }
        }

        anyhow::Ok(())
    });

    // Start the polling task, which will poll the counters at regular intervals
    // and send the data to the writer task, through the channel.
    poll_counter_probe(probe.as_mut(), polling_period, tx)
        .await
        .expect("probe error");

    handle.await?.expect("writer task error");

    Ok(())
}

#[derive(Debug)]
pub(crate) struct MeasurementsMessage {
    pub timestamp: SystemTime,
    pub measurements: CounterMeasurements,
}

async fn poll_counter_probe(
    probe: &mut dyn CounterProbe,
    period: Duration,
    tx: Sender<MeasurementsMessage>,
) -> anyhow::Result<()> {
    // Underneath, this uses a periodic timer from timerfd, which has a higher
    // resolution than std::time::sleep and tokio::time::sleep.
    let mut interval = Interval::new_interval(period)?;

    loop {
        // wait for the next tick of the periodic timer
        interval.next().await;

        // poll the new values from the probe
        probe.poll().context("refreshing measurements")?;

        // send the values to the writer task through the channel
        let timestamp = SystemTime::now();
        let measurements = probe.measurements().clone();

        tx.send(MeasurementsMessage {
            timestamp,
            measurements,
        })
        .await
        .expect("failed to send measurement through channel");
    }
}

pub(crate) fn print_measurements(
    writer: &mut dyn Write,
    cpus: &[u32],
    msg: &MeasurementsMessage,
) -> anyhow::Result<()> {
    let timestamp_ms = msg.timestamp.duration_since(SystemTime::UNIX_EPOCH)?.as_millis();

    for (cpu, events_of_cpu) in cpus.iter().zip(msg.measurements.per_cpu.iter()) {
        for (event, state) in events_of_cpu {
            if let Some(count) = state.count {
                let overflow = state.overflowed;
                writeln!(writer, "{timestamp_ms};{cpu};{event:?};{overflow};{count}")?;
            }
        }
    }
    Ok(())
}
