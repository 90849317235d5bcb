use anyhow::Context;
use cpustat_probes::{sampler::Sampler, source::RegisterSource};

use crate::report::{ReportMessage, Reporter};
use futures::stream::{Stream, StreamExt};
use log::info;
use std::io::Write;
use std::pin::pin;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{self, Sender};
use tokio_timerfd::Interval;

/// Samples the cpus every `polling_period` until `count` intervals have been reported, or until Ctrl-C.
pub async fn run<S: RegisterSource>(
    writer: Box<dyn Write + Send>,
    reporter: Reporter,
    sampler: &mut Sampler<S>,
    polling_period: Duration,
    count: Option<usize>,
    flush_interval: Duration,
) -> anyhow::Result<()> {
    // Underneath, this uses a periodic timer from timerfd, which has a higher resolution than std::time::sleep and tokio::time::sleep
    let ticks = Interval::new_interval(polling_period)?;
    run_with_ticks(writer, reporter, sampler, ticks, count, flush_interval).await
}

/// Same as [`run`], with one sampling pass per item of `ticks`.
async fn run_with_ticks<S: RegisterSource>(
    mut writer: Box<dyn Write + Send>,
    mut reporter: Reporter,
    sampler: &mut Sampler<S>,
    ticks: impl Stream<Item = std::io::Result<()>>,
    count: Option<usize>,
    flush_interval: Duration,
) -> anyhow::Result<()> {
    // open a Channel to write to the output in another thread
    let (tx, mut rx) = mpsc::channel::<ReportMessage>(64);

    // Start the writer task, which will receive the reports from the channel and write
    // them to the selected output.
    let handle = tokio::spawn(async move {
        let mut previous_flush: SystemTime = SystemTime::UNIX_EPOCH;

        reporter.write_preamble(&mut writer)?;
        while let Some(msg) = rx.recv().await {
            reporter.write_report(&mut writer, &msg)?;

            let time_since_last_flush = msg
                .timestamp
                .duration_since(previous_flush)
                .unwrap_or(Duration::ZERO);

            if time_since_last_flush >= flush_interval {
                previous_flush = msg.timestamp;
                writer.flush()?;
            }
        }
        writer.flush()?;
        anyhow::Ok(())
    });

    // Poll in this task. Stopping drops the sender, which ends the writer task
    // once it has written everything that was sent.
    let polled = tokio::select! {
        res = poll_sampler(sampler, ticks, count, tx) => res,
        res = tokio::signal::ctrl_c() => {
            res.map(|_| info!("Interrupted, exiting.")).map_err(anyhow::Error::from)
        }
    };

    // A failing writer closes the channel, in which case the poller only sees the consequence.
    let written = handle.await.context("the writer task panicked")?;
    written.context("failed to write the reports")?;
    polled
}

async fn poll_sampler<S: RegisterSource>(
    sampler: &mut Sampler<S>,
    ticks: impl Stream<Item = std::io::Result<()>>,
    count: Option<usize>,
    tx: Sender<ReportMessage>,
) -> anyhow::Result<()> {
    let mut ticks = pin!(ticks);

    // the first pass only primes the sampler
    info!("Taking initial measurement...");
    sampler.sample();

    let mut reported = 0;
    while count.map_or(true, |n| reported < n) {
        // wait for the next tick of the periodic timer
        match ticks.next().await {
            Some(tick) => tick.context("the polling timer failed")?,
            None => break,
        }

        let Some(report) = sampler.sample() else {
            continue;
        };
        let timestamp = SystemTime::now();
        tx.send(ReportMessage { timestamp, report }).await?;
        reported += 1;
    }
    Ok(())
}
