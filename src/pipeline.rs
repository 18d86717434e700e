//! Overlapped sweeps over document buffers.
//!
//! Step `i` samples buffer `i` while buffer `i - 1` is copied back to the host
//! and buffer `i + 1` is uploaded, so transfers hide behind compute.

use std::time::{Duration, Instant};

use log::debug;

use crate::buffer::Buffer;
use crate::engine::Engine;
use crate::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, Default)]
pub struct SweepOptions {
    /// Upload each buffer's host arrays before sampling it.
    pub upload: bool,
    /// Copy each buffer's topics back to the host after sampling it.
    pub copy_back: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SweepStats {
    pub buffers: usize,
    pub tokens: u64,
    pub uploads: usize,
    pub copy_backs: usize,
    pub elapsed: Duration,
}

/// Run one `sample_z` pass over every buffer. Stops at the first error.
#[fastrace::trace(name = "sweep")]
pub fn sweep(engine: &Engine, buffers: &mut [Buffer], options: SweepOptions) -> Result<SweepStats> {
    let start = Instant::now();
    let mut stats = SweepStats {
        buffers: buffers.len(),
        ..Default::default()
    };

    if options.upload {
        if let Some(first) = buffers.first() {
            engine.to_device(first)?;
            stats.uploads += 1;
        }
    }

    for i in 0..=buffers.len() {
        let (head, tail) = buffers.split_at_mut(i);
        let prev = if options.copy_back { head.last_mut() } else { None };
        let (current, next) = match tail.split_first() {
            Some((current, rest)) => (Some(current), rest.first().filter(|_| options.upload)),
            None => (None, None),
        };

        let mut sampled: Result<u64> = Ok(0);
        let mut copied: Result<bool> = Ok(false);
        let mut uploaded: Result<bool> = Ok(false);
        {
            let (sampled, copied, uploaded) = (&mut sampled, &mut copied, &mut uploaded);
            rayon::scope(move |s| {
                if let Some(buffer) = current {
                    s.spawn(move |_| *sampled = engine.sample_z(buffer));
                }
                if let Some(buffer) = prev {
                    s.spawn(move |_| *copied = engine.to_host(buffer).map(|_| true));
                }
                if let Some(buffer) = next {
                    s.spawn(move |_| *uploaded = engine.to_device(buffer).map(|_| true));
                }
            });
        }

        stats.tokens += sampled.map_err(|e| step_error(i, e))?;
        stats.copy_backs += copied? as usize;
        stats.uploads += uploaded? as usize;
    }

    stats.elapsed = start.elapsed();
    debug!(
        "Sweep done: buffers={}, tokens={}, uploads={}, copy_backs={}, elapsed_ms={}",
        stats.buffers,
        stats.tokens,
        stats.uploads,
        stats.copy_backs,
        stats.elapsed.as_millis()
    );
    Ok(stats)
}

fn step_error(step: usize, err: EngineError) -> EngineError {
    debug!("Sweep stopped at buffer {step}: {err}");
    err
}
