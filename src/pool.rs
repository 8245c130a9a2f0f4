use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::BTreeMap;

/// Map `inputs` through `work` on `workers` threads and feed the results to
/// `sink` strictly in input order.
///
/// At most `depth` items sit between the feeder and the sink: a slow item
/// stalls the feeder instead of growing the reorder buffer. The first error
/// stops the pipeline and is returned. With one worker everything runs
/// inline.
pub fn ordered_map<I, T, R, W, S>(
    inputs: I,
    workers: usize,
    depth: usize,
    work: W,
    mut sink: S,
) -> Result<u64>
where
    I: Iterator<Item = Result<T>> + Send,
    T: Send,
    R: Send,
    W: Fn(u64, T) -> Result<R> + Sync,
    S: FnMut(u64, R) -> Result<()>,
{
    if workers <= 1 {
        let mut seq = 0u64;
        for item in inputs {
            let out = work(seq, item?)?;
            sink(seq, out)?;
            seq += 1;
        }
        return Ok(seq);
    }

    let depth = depth.max(workers);
    let work = &work;

    std::thread::scope(|scope| {
        let (slot_tx, slot_rx) = bounded::<()>(depth);
        let (job_tx, job_rx) = bounded::<(u64, T)>(workers);
        let (res_tx, res_rx) = bounded::<(u64, Result<R>)>(depth);

        let feeder = scope.spawn(move || -> Result<u64> {
            let mut seq = 0u64;
            for item in inputs {
                let item = item?;
                if slot_tx.send(()).is_err() || job_tx.send((seq, item)).is_err() {
                    // Sink stopped early; its error is the one reported.
                    break;
                }
                seq += 1;
            }
            Ok(seq)
        });

        for _ in 0..workers {
            let job_rx: Receiver<(u64, T)> = job_rx.clone();
            let res_tx: Sender<(u64, Result<R>)> = res_tx.clone();
            scope.spawn(move || {
                for (seq, item) in job_rx.iter() {
                    if res_tx.send((seq, work(seq, item))).is_err() {
                        break;
                    }
                }
            });
        }
        drop(job_rx);
        drop(res_tx);

        let drained = drain_in_order(res_rx, slot_rx, &mut sink);

        let fed = feeder
            .join()
            .map_err(|_| anyhow!("pool feeder thread panicked"))?;
        let consumed = drained?;
        let fed = fed?;
        if consumed != fed {
            bail!("pool consumed {} of {} items", consumed, fed);
        }
        Ok(consumed)
    })
}

fn drain_in_order<R, S>(
    res_rx: Receiver<(u64, Result<R>)>,
    slot_rx: Receiver<()>,
    sink: &mut S,
) -> Result<u64>
where
    S: FnMut(u64, R) -> Result<()>,
{
    let mut pending: BTreeMap<u64, R> = BTreeMap::new();
    let mut next = 0u64;

    for (seq, res) in res_rx.iter() {
        pending.insert(seq, res?);
        while let Some(out) = pending.remove(&next) {
            sink(next, out)?;
            let _ = slot_rx.recv();
            next += 1;
        }
    }
    Ok(next)
}
