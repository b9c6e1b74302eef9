use anyhow::{bail, Context, Result};
use itertools::Itertools;
use log::{error, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{ScopeFifo, ThreadPoolBuilder};
use std::{
    io,
    sync::{
        mpsc::{
            channel, sync_channel, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError,
        },
        Arc, Mutex,
    },
    thread::{sleep, spawn, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    chain::{draw_start_point, Chain, ChainState, DramChain, Progress, SampleRecord},
    diagnostics::{expanded_columns, refine, split_rhat, ChainStatus, ChainSummary},
    dram::DramError,
    model::LogDensity,
    settings::{RunConfiguration, StartPoint},
    storage::{
        ChainFiles, ChainStart, ChainStorage, MemoryConfig, StorageConfig, TextConfig,
    },
};

/// How often the controller looks for messages from the chains.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Base delay between attempts to flush a chain file.
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Random start points are redrawn at most this often.
const MAX_INIT_TRIES: usize = 500;

/// Run a single chain in the current thread.
///
/// Returns an iterator over the states after each step.
pub fn sample_sequentially<'model, D: LogDensity>(
    density: &'model D,
    settings: &'model RunConfiguration,
    start: &[f64],
    steps: u64,
    chain: u64,
) -> Result<impl Iterator<Item = Result<(Box<[f64]>, Progress)>> + 'model> {
    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
    rng.set_stream(chain);
    let mut sampler = DramChain::new(density, settings, rng, chain)?;
    sampler.set_position(start)?;
    Ok((0..steps).map(move |_| {
        let info = sampler.step()?;
        Ok((sampler.state().point.clone(), info))
    }))
}

/// The random stream of a chain that continues from `steps` stored steps.
fn resumed_rng(seed: u64, chain: u64, steps: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ steps.wrapping_mul(0x9e37_79b9_7f4a_7c15));
    rng.set_stream(chain);
    rng
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct ChainProgress {
    pub chain: u64,
    pub steps: u64,
    pub unique_points: u64,
    pub target_points: u64,
    pub acceptance_rate: f64,
    pub evaluation_failures: u64,
    pub adaptive_updates: u64,
    pub started: bool,
    pub finished: bool,
    pub runtime: Duration,
}

impl ChainProgress {
    fn new(chain: u64, total: u64) -> Self {
        Self {
            chain,
            steps: 0,
            unique_points: 0,
            target_points: total,
            acceptance_rate: 0.,
            evaluation_failures: 0,
            adaptive_updates: 0,
            started: false,
            finished: false,
            runtime: Duration::ZERO,
        }
    }

    fn update(&mut self, info: &Progress, counters: &ChainCounters, rows: u64, step_duration: Duration) {
        self.steps = info.step;
        self.unique_points = rows;
        self.acceptance_rate = info.acceptance_rate;
        self.evaluation_failures = counters.failures;
        self.adaptive_updates = counters.updates;
        self.runtime += step_duration;
    }
}

/// Counters of a chain that do not show up in its rows.
#[derive(Debug, Clone, Copy, Default)]
struct ChainCounters {
    failures: u64,
    out_of_domain: u64,
    updates: u64,
    fallbacks: u64,
}

impl ChainCounters {
    fn of<D: LogDensity, R: rand::Rng>(chain: &DramChain<'_, D, R>) -> Self {
        Self {
            failures: chain.failures(),
            out_of_domain: chain.out_of_domain(),
            updates: chain.adaptation().updates(),
            fallbacks: chain.adaptation().fallbacks(),
        }
    }
}

/// A finished or intermediate chain.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub chain_id: u64,
    /// Compact rows of the chain.
    pub records: Vec<SampleRecord>,
    /// Indices into `records` that make up the refined sample.
    pub refined: Vec<usize>,
    pub summary: ChainSummary,
    pub files: Option<ChainFiles>,
}

impl ChainOutput {
    /// The verbose chain of every variable after burn-in.
    pub fn post_burnin_columns(&self) -> Vec<Vec<f64>> {
        expanded_columns(&self.records, self.summary.burnin)
    }
}

enum ChainCommand {
    Resume,
    Pause,
}

enum ChainEvent {
    Report(ChainProgress),
    Finished { chain: u64, result: Result<()> },
}

/// Run-length encodes the states of a chain and hands finished rows to
/// the storage.
struct ChainTrace<S: ChainStorage> {
    storage: Option<S>,
    records: Vec<SampleRecord>,
    /// The row of the current point. Its weight grows until the chain moves.
    pending: Option<SampleRecord>,
    status: ChainStatus,
    counters: ChainCounters,
    files: Option<ChainFiles>,
    chain_id: u64,
    dim: usize,
    unflushed: u64,
    flush_period: u64,
    io_retries: u32,
}

impl<S: ChainStorage> ChainTrace<S> {
    fn new(chain_id: u64, settings: &RunConfiguration, storage: Option<S>) -> Self {
        let (flush_period, io_retries) = settings
            .output
            .as_ref()
            .map(|output| (output.flush_period, output.io_retries))
            .unwrap_or((100, 3));
        Self {
            storage,
            records: Vec::new(),
            pending: None,
            status: ChainStatus::Running,
            counters: ChainCounters::default(),
            files: None,
            chain_id,
            dim: settings.dimension,
            unflushed: 0,
            flush_period,
            io_retries,
        }
    }

    /// Number of rows, the open one included.
    fn rows(&self) -> u64 {
        self.records.len() as u64 + self.pending.is_some() as u64
    }

    fn push(&mut self, info: &Progress, state: &ChainState) -> Result<()> {
        if info.accepted || self.pending.is_none() {
            self.close_pending()?;
            self.pending = Some(SampleRecord {
                weight: 1,
                logp: state.logp,
                stage: info.stage.unwrap_or(0),
                mean_acceptance_rate: info.acceptance_rate,
                adaptation_measure: info.adaptation_measure,
                point: state.point.clone(),
            });
        } else if let Some(pending) = self.pending.as_mut() {
            pending.weight += 1;
        }
        Ok(())
    }

    fn close_pending(&mut self) -> Result<()> {
        let Some(record) = self.pending.take() else {
            return Ok(());
        };
        if let Some(storage) = self.storage.as_mut() {
            storage
                .record_sample(&record)
                .context("Could not store sample")?;
            self.unflushed += 1;
        }
        self.records.push(record);
        Ok(())
    }

    /// Whether `flush_period` rows were stored since the last flush.
    fn flush_due(&self) -> bool {
        self.storage.is_some() && self.unflushed >= self.flush_period
    }

    /// A single attempt to flush the storage.
    fn try_flush(&mut self) -> io::Result<()> {
        if let Some(storage) = self.storage.as_mut() {
            storage.flush()?;
        }
        self.unflushed = 0;
        Ok(())
    }

    /// Flush the storage, retrying a few times before giving up.
    fn flush(&mut self) -> Result<()> {
        let (chain, retries) = (self.chain_id, self.io_retries);
        retry_flush(chain, retries, || self.try_flush())
    }

    fn summary(&self, records: &[SampleRecord]) -> ChainSummary {
        let mut summary =
            ChainSummary::from_records(self.chain_id, self.status.clone(), records, self.dim);
        summary.evaluation_failures = self.counters.failures;
        summary.out_of_domain = self.counters.out_of_domain;
        summary.adaptive_updates = self.counters.updates;
        summary.numerical_fallbacks = self.counters.fallbacks;
        summary
    }

    fn inspect(&self) -> Result<ChainOutput> {
        let records = self
            .records
            .iter()
            .chain(self.pending.iter())
            .cloned()
            .collect_vec();
        let summary = self.summary(&records);
        Ok(ChainOutput {
            chain_id: self.chain_id,
            records,
            refined: Vec::new(),
            summary,
            files: None,
        })
    }

    fn finalize(mut self) -> Result<ChainOutput> {
        if self.status == ChainStatus::Running {
            self.status = ChainStatus::Incomplete;
        }
        self.close_pending()?;
        self.flush()?;

        let records = std::mem::take(&mut self.records);
        let mut summary = self.summary(&records);
        let refined = refine(&records, summary.burnin);
        summary.refined_size = refined.len();

        let files = match self.storage.take() {
            Some(storage) => storage
                .finalize(&summary, &records, &refined)
                .context("Could not finalize chain output")?,
            None => self.files.take(),
        };
        info!(
            "chain {}: {} after {} steps with {} unique points, acceptance rate {:.3}, ess {:.0}",
            self.chain_id,
            summary.status,
            summary.steps,
            summary.unique_points,
            summary.acceptance_rate,
            summary.effective_sample_size
        );
        Ok(ChainOutput {
            chain_id: self.chain_id,
            records,
            refined,
            summary,
            files,
        })
    }
}

/// Call `attempt` until it succeeds, sleeping a little longer after every
/// failure. Gives up with `DramError::FatalIo` after `retries` retries.
fn retry_flush(
    chain: u64,
    retries: u32,
    mut attempt: impl FnMut() -> io::Result<()>,
) -> Result<()> {
    let mut failures = 0;
    loop {
        match attempt() {
            Ok(()) => return Ok(()),
            Err(source) if failures >= retries => {
                return Err(DramError::FatalIo { chain, source }.into());
            }
            Err(err) => {
                failures += 1;
                warn!(
                    "chain {}: writing output failed (attempt {} of {}): {}",
                    chain,
                    failures,
                    retries + 1,
                    err
                );
                sleep(RETRY_DELAY * failures);
            }
        }
    }
}

struct ChainProcess<S: ChainStorage> {
    stop_marker: Sender<ChainCommand>,
    trace: Arc<Mutex<Option<ChainTrace<S>>>>,
    progress: Arc<Mutex<ChainProgress>>,
}

impl<'scope, S: ChainStorage + 'scope> ChainProcess<S> {
    fn finalize_many(chains: Vec<Self>) -> Vec<Result<Option<ChainOutput>>> {
        chains
            .into_iter()
            .map(|chain| chain.finalize())
            .collect_vec()
    }

    fn progress(&self) -> ChainProgress {
        self.progress.lock().expect("Poisoned lock").clone()
    }

    fn current_trace(&self) -> Result<Option<ChainOutput>> {
        self.trace
            .lock()
            .expect("Poisoned lock")
            .as_ref()
            .map(|trace| trace.inspect())
            .transpose()
    }

    fn resume(&self) -> Result<()> {
        self.stop_marker.send(ChainCommand::Resume)?;
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.stop_marker.send(ChainCommand::Pause)?;
        Ok(())
    }

    fn finalize(self) -> Result<Option<ChainOutput>> {
        drop(self.stop_marker);
        let trace = self.trace.lock().expect("Poisoned lock").take();
        trace.map(|trace| trace.finalize()).transpose()
    }

    fn start<'model, D, C>(
        model: &'model D,
        chain_id: u64,
        settings: &'model RunConfiguration,
        storage: &'model C,
        scope: &ScopeFifo<'scope>,
        events: Sender<ChainEvent>,
    ) -> Result<Self>
    where
        'model: 'scope,
        D: LogDensity,
        C: StorageConfig<ChainStorage = S>,
    {
        let (stop_marker_tx, stop_marker_rx) = channel();

        let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
        rng.set_stream(chain_id);

        // Replaced once the storage is known.
        let trace = Arc::new(Mutex::new(Some(ChainTrace::<S>::new(
            chain_id, settings, None,
        ))));
        let progress = Arc::new(Mutex::new(ChainProgress::new(
            chain_id,
            settings.chain_size,
        )));

        let trace_inner = trace.clone();
        let progress_inner = progress.clone();

        scope.spawn_fifo(move |_| {
            let trace = trace_inner;
            let progress = progress_inner;
            let report_events = events.clone();

            let fail = |err: &anyhow::Error| {
                if let Some(trace) = trace.lock().expect("Poisoned mutex").as_mut() {
                    trace.status = ChainStatus::Failed(format!("{:#}", err));
                }
            };

            // Returns false if the controller already took the trace.
            let install = |new_trace: ChainTrace<S>| {
                let mut guard = trace.lock().expect("Poisoned mutex");
                if guard.is_none() {
                    return false;
                }
                *guard = Some(new_trace);
                true
            };

            let sample = || -> Result<()> {
                let start = storage
                    .new_chain(settings, chain_id)
                    .context("Failed to create chain storage")?;
                let mut sampler = DramChain::new(model, settings, rng, chain_id)?;

                match start {
                    ChainStart::Complete { records, files } => {
                        info!("chain {}: stored output is complete", chain_id);
                        let mut new_trace = ChainTrace::<S>::new(chain_id, settings, None);
                        new_trace.records = records;
                        new_trace.files = files;
                        new_trace.status = ChainStatus::Complete;
                        install(new_trace);
                        return Ok(());
                    }
                    ChainStart::Resume { storage, mut records } => {
                        let steps = records.iter().map(|r| r.weight).sum::<u64>() - 1;
                        sampler
                            .restore(&records, resumed_rng(settings.seed, chain_id, steps))
                            .context("Failed to restore stored chain")?;
                        let mut new_trace = ChainTrace::new(chain_id, settings, Some(storage));
                        new_trace.pending = records.pop();
                        new_trace.records = records;
                        if !install(new_trace) {
                            return Ok(());
                        }
                    }
                    ChainStart::Fresh(storage) => {
                        if !install(ChainTrace::new(chain_id, settings, Some(storage))) {
                            return Ok(());
                        }

                        let tries = match settings.start_point {
                            StartPoint::Random { .. } => MAX_INIT_TRIES,
                            _ => 1,
                        };
                        let mut initval = vec![0f64; settings.dimension];
                        let mut error = None;
                        for _ in 0..tries {
                            draw_start_point(&settings.start_point, sampler.rng_mut(), &mut initval);
                            if let Err(err) = sampler.set_position(&initval) {
                                error = Some(err);
                                continue;
                            }
                            error = None;
                            break;
                        }
                        if let Some(error) = error {
                            return Err(error).context("All initialization points failed");
                        }

                        let mut guard = trace.lock().expect("Poisoned mutex");
                        let Some(current) = guard.as_mut() else {
                            return Ok(());
                        };
                        current.pending = Some(sampler.start_record());
                    }
                }
                progress.lock().expect("Poisoned mutex").started = true;

                let mut msg = stop_marker_rx.try_recv();
                loop {
                    match msg {
                        // The remote end is dead
                        Err(TryRecvError::Disconnected) => {
                            break;
                        }
                        Err(TryRecvError::Empty) => {}
                        Ok(ChainCommand::Pause) => {
                            msg = stop_marker_rx.recv().map_err(|e| e.into());
                            continue;
                        }
                        Ok(ChainCommand::Resume) => {}
                    }

                    {
                        let mut guard = trace.lock().expect("Poisoned mutex");
                        let Some(current) = guard.as_mut() else {
                            break;
                        };
                        if current.rows() >= settings.chain_size {
                            current.status = ChainStatus::Complete;
                            break;
                        }
                        if sampler.state().steps >= settings.max_steps {
                            warn!(
                                "chain {}: stopping at the step limit with {} of {} unique points",
                                chain_id,
                                current.rows(),
                                settings.chain_size
                            );
                            current.status = ChainStatus::Capped;
                            break;
                        }
                    }

                    let now = Instant::now();
                    let step = sampler.step();
                    let counters = ChainCounters::of(&sampler);
                    let info = match step {
                        Ok(info) => info,
                        Err(err) => {
                            if let Some(current) = trace.lock().expect("Poisoned mutex").as_mut() {
                                current.counters = counters;
                            }
                            return Err(err.into());
                        }
                    };

                    let mut guard = trace
                        .lock()
                        .expect("Could not unlock trace lock. Poisoned mutex");
                    let Some(current) = guard.as_mut() else {
                        // The trace was removed by controller thread. We can stop sampling
                        break;
                    };
                    current.counters = counters;
                    current.push(&info, sampler.state())?;
                    let rows = current.rows();
                    let flush_due = current.flush_due();
                    let io_retries = current.io_retries;
                    drop(guard);

                    // The trace lock is not held while a retry sleeps.
                    if flush_due {
                        retry_flush(chain_id, io_retries, || {
                            match trace.lock().expect("Poisoned mutex").as_mut() {
                                Some(current) => current.try_flush(),
                                None => Ok(()),
                            }
                        })?;
                    }

                    let mut current = progress.lock().expect("Poisoned mutex");
                    current.update(&info, &counters, rows, now.elapsed());
                    if info.step % settings.progress_report_period == 0 {
                        let _ = report_events.send(ChainEvent::Report(current.clone()));
                    }
                    drop(current);

                    msg = stop_marker_rx.try_recv();
                }
                Ok(())
            };

            let result = sample();
            if let Err(err) = &result {
                error!("chain {}: {:#}", chain_id, err);
                fail(err);
            }
            progress.lock().expect("Poisoned mutex").finished = true;

            let _ = events.send(ChainEvent::Finished {
                chain: chain_id,
                result,
            });
        });

        Ok(Self {
            trace,
            stop_marker: stop_marker_tx,
            progress,
        })
    }
}

/// Logs one consolidated line once every running chain has passed another
/// report period. Chains never wait for each other.
struct ProgressLog {
    period: u64,
    latest: Vec<Option<ChainProgress>>,
    logged: u64,
}

impl ProgressLog {
    fn new(num_chains: usize, period: u64) -> Self {
        Self {
            period,
            latest: vec![None; num_chains],
            logged: 0,
        }
    }

    fn record(&mut self, progress: ChainProgress) {
        let chain = progress.chain as usize;
        self.latest[chain] = Some(progress);
        let reached = self
            .latest
            .iter()
            .filter(|p| !p.as_ref().is_some_and(|p| p.finished))
            .map(|p| p.as_ref().map(|p| p.steps / self.period).unwrap_or(0))
            .min()
            .unwrap_or(0);
        if reached <= self.logged {
            return;
        }
        self.logged = reached;
        let reports = self.latest.iter().flatten().collect_vec();
        let unique: u64 = reports.iter().map(|p| p.unique_points).sum();
        let target: u64 = reports.iter().map(|p| p.target_points).sum();
        let acceptance =
            reports.iter().map(|p| p.acceptance_rate).sum::<f64>() / reports.len().max(1) as f64;
        info!(
            "{} steps per chain: {} of {} unique points, mean acceptance rate {:.3}",
            reached * self.period,
            unique,
            target,
            acceptance
        );
    }

    fn finish(&mut self, chain: u64) {
        if let Some(Some(progress)) = self.latest.get_mut(chain as usize) {
            progress.finished = true;
        }
    }
}

#[derive(Debug)]
enum SamplerCommand {
    Pause,
    Continue,
    InspectTrace,
    Progress,
}

enum SamplerResponse {
    Ok(),
    IntermediateTrace(Trace),
    Progress(Box<[ChainProgress]>),
}

pub enum SamplerWaitResult {
    Trace(Trace),
    Timeout(Sampler),
    Err(anyhow::Error, Option<Trace>),
}

struct ControllerOutput {
    chains: Vec<Result<Option<ChainOutput>>>,
    fatal: Option<anyhow::Error>,
}

pub struct Sampler {
    main_thread: JoinHandle<Result<ControllerOutput>>,
    commands: SyncSender<SamplerCommand>,
    responses: Receiver<SamplerResponse>,
    results: Receiver<Result<()>>,
}

pub struct Trace {
    pub chains: Vec<ChainOutput>,
}

impl<I: Iterator<Item = ChainOutput>> From<I> for Trace {
    fn from(value: I) -> Self {
        let mut chains = value.into_iter().collect_vec();
        chains.sort_unstable_by_key(|x| x.chain_id);
        Trace { chains }
    }
}

pub struct ProgressCallback {
    pub callback: Box<dyn FnMut(Duration, Box<[ChainProgress]>) + Send>,
    pub rate: Duration,
}

fn is_fatal_io(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<DramError>(), Some(DramError::FatalIo { .. }))
}

impl Sampler {
    pub fn new<D: LogDensity, C: StorageConfig>(
        model: D,
        settings: RunConfiguration,
        storage: C,
        num_cores: usize,
        callback: Option<ProgressCallback>,
    ) -> Result<Self> {
        settings.validate()?;
        if let Some(dim) = model.dim() {
            if dim != settings.dimension {
                return Err(DramError::Configuration(format!(
                    "log-density has dimension {}, configuration has {}",
                    dim, settings.dimension
                ))
                .into());
            }
        }
        storage
            .prepare(&settings)
            .context("Existing output can not be used")?;

        let (commands_tx, commands_rx) = sync_channel(0);
        let (responses_tx, responses_rx) = sync_channel(0);
        let (results_tx, results_rx) = channel();

        let main_thread = spawn(move || {
            let pool = ThreadPoolBuilder::new()
                .num_threads(num_cores.max(1) + 1) // One more thread because the controller also uses one
                .thread_name(|i| format!("dram-worker-{}", i))
                .build()
                .context("Could not start thread pool")?;

            let settings_ref = &settings;
            let model_ref = &model;
            let storage_ref = &storage;
            let mut callback = callback;

            pool.scope_fifo(move |scope| {
                let results = results_tx;
                let num_chains = settings_ref.chain_count();
                let (events_tx, events_rx) = channel();
                let mut chains = Vec::with_capacity(num_chains);

                info!(
                    "sampling {} chains of {} unique points in {} dimensions",
                    num_chains, settings_ref.chain_size, settings_ref.dimension
                );
                for chain_id in 0..num_chains {
                    let chain = ChainProcess::start(
                        model_ref,
                        chain_id as u64,
                        settings_ref,
                        storage_ref,
                        scope,
                        events_tx.clone(),
                    );
                    chains.push(chain);
                }
                drop(events_tx);

                let (chains, errors): (Vec<_>, Vec<_>) = chains.into_iter().partition_result();
                if let Some(error) = errors.into_iter().next() {
                    let _ = ChainProcess::finalize_many(chains);
                    return Err(error).context("Could not start chains");
                }

                let mut fatal = None;
                let mut main_loop = || {
                    let start_time = Instant::now();
                    let mut pause_start = Instant::now();
                    let mut pause_time = Duration::ZERO;
                    let mut progress_log =
                        ProgressLog::new(num_chains, settings_ref.progress_report_period);
                    let mut finished = 0;

                    let mut progress_rate = Duration::MAX;
                    if let Some(ProgressCallback { callback, rate }) = &mut callback {
                        let progress = chains.iter().map(|chain| chain.progress()).collect_vec();
                        callback(start_time.elapsed(), progress.into());
                        progress_rate = *rate;
                    }
                    let mut last_progress = Instant::now();
                    let mut is_paused = false;

                    let report = |callback: &mut Option<ProgressCallback>,
                                      is_paused: bool,
                                      pause_start: Instant,
                                      pause_time: Duration| {
                        if let Some(ProgressCallback { callback, .. }) = callback {
                            let progress =
                                chains.iter().map(|chain| chain.progress()).collect_vec();
                            let mut elapsed = start_time.elapsed().saturating_sub(pause_time);
                            if is_paused {
                                elapsed = elapsed.saturating_sub(pause_start.elapsed());
                            }
                            callback(elapsed, progress.into());
                        }
                    };

                    loop {
                        loop {
                            match events_rx.try_recv() {
                                Ok(ChainEvent::Report(progress)) => progress_log.record(progress),
                                Ok(ChainEvent::Finished { chain, result }) => {
                                    finished += 1;
                                    progress_log.finish(chain);
                                    match result {
                                        Err(err) if is_fatal_io(&err) => {
                                            error!("aborting all chains: {:#}", err);
                                            let forwarded = anyhow::anyhow!("{:#}", err);
                                            let _ = results.send(Err(forwarded));
                                            fatal = Some(err);
                                        }
                                        // Failed chains are reported in their summary
                                        _ => {
                                            let _ = results.send(Ok(()));
                                        }
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                        if fatal.is_some() || finished == num_chains {
                            report(&mut callback, is_paused, pause_start, pause_time);
                            return Ok(());
                        }

                        let timeout = progress_rate.checked_sub(last_progress.elapsed());
                        let timeout = timeout.unwrap_or_else(|| {
                            report(&mut callback, is_paused, pause_start, pause_time);
                            last_progress = Instant::now();
                            progress_rate
                        });

                        match commands_rx.recv_timeout(timeout.min(POLL_INTERVAL)) {
                            Ok(SamplerCommand::Pause) => {
                                for chain in chains.iter() {
                                    // This failes if the thread is done.
                                    // We just want to ignore those threads.
                                    let _ = chain.pause();
                                }
                                if !is_paused {
                                    pause_start = Instant::now();
                                }
                                is_paused = true;
                                responses_tx.send(SamplerResponse::Ok())?;
                            }
                            Ok(SamplerCommand::Continue) => {
                                for chain in chains.iter() {
                                    let _ = chain.resume();
                                }
                                if is_paused {
                                    pause_time += pause_start.elapsed();
                                }
                                is_paused = false;
                                responses_tx.send(SamplerResponse::Ok())?;
                            }
                            Ok(SamplerCommand::InspectTrace) => {
                                let traces: Result<Vec<_>> =
                                    chains.iter().map(|chain| chain.current_trace()).collect();
                                responses_tx.send(SamplerResponse::IntermediateTrace(
                                    traces?.into_iter().flatten().into(),
                                ))?;
                            }
                            Ok(SamplerCommand::Progress) => {
                                let progress =
                                    chains.iter().map(|chain| chain.progress()).collect_vec();
                                responses_tx.send(SamplerResponse::Progress(progress.into()))?;
                            }
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => {
                                info!("sampling aborted");
                                report(&mut callback, is_paused, pause_start, pause_time);
                                return Ok(());
                            }
                        };
                    }
                };
                let result: Result<()> = main_loop();
                // Run finalization even if something failed
                let output = ControllerOutput {
                    chains: ChainProcess::finalize_many(chains),
                    fatal,
                };

                result?;
                Ok(output)
            })
        });

        Ok(Self {
            main_thread,
            commands: commands_tx,
            responses: responses_rx,
            results: results_rx,
        })
    }

    pub fn pause(&mut self) -> Result<()> {
        self.commands
            .send(SamplerCommand::Pause)
            .context("Could not send pause command to controller thread")?;
        let response = self
            .responses
            .recv()
            .context("Could not recieve pause response from controller thread")?;
        let SamplerResponse::Ok() = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.commands.send(SamplerCommand::Continue)?;
        let response = self.responses.recv()?;
        let SamplerResponse::Ok() = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(())
    }

    /// Stop all chains after their current step and collect what they
    /// have sampled so far.
    pub fn abort(self) -> (Result<()>, Option<Trace>) {
        drop(self.commands);
        let result = self.main_thread.join();
        match result {
            Err(payload) => std::panic::resume_unwind(payload),
            Ok(Ok(output)) => {
                let (traces, errors): (Vec<_>, Vec<_>) =
                    output.chains.into_iter().partition_result();
                let trace: Trace = traces.into_iter().flatten().into();
                match output.fatal.into_iter().chain(errors).next() {
                    Some(err) => (Err(err), Some(trace)),
                    None => (Ok(()), Some(trace)),
                }
            }
            Ok(Err(err)) => (Err(err), None),
        }
    }

    pub fn inspect_trace(&mut self) -> Result<Trace> {
        self.commands.send(SamplerCommand::InspectTrace)?;
        let response = self.responses.recv()?;
        let SamplerResponse::IntermediateTrace(trace) = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(trace)
    }

    pub fn wait_timeout(self, timeout: Duration) -> SamplerWaitResult {
        let start = Instant::now();
        let mut remaining = Some(timeout);
        while let Some(left) = remaining {
            match self.results.recv_timeout(left) {
                Ok(Ok(_)) => remaining = timeout.checked_sub(start.elapsed()),
                Ok(Err(_)) => {
                    let (res, trace) = self.abort();
                    let err = res
                        .err()
                        .unwrap_or_else(|| anyhow::anyhow!("A chain could not write its output"));
                    return SamplerWaitResult::Err(err, trace);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let (res, trace) = self.abort();
                    if let Err(err) = res {
                        return SamplerWaitResult::Err(err, trace);
                    }
                    return match trace {
                        Some(trace) => SamplerWaitResult::Trace(trace),
                        None => SamplerWaitResult::Err(anyhow::anyhow!("No chains available"), None),
                    };
                }
                Err(RecvTimeoutError::Timeout) => break,
            }
        }
        SamplerWaitResult::Timeout(self)
    }

    /// Block until all chains are done.
    pub fn wait(self) -> Result<Trace> {
        let mut sampler = self;
        loop {
            match sampler.wait_timeout(Duration::from_secs(1)) {
                SamplerWaitResult::Trace(trace) => return Ok(trace),
                SamplerWaitResult::Timeout(next) => sampler = next,
                SamplerWaitResult::Err(err, _) => return Err(err),
            }
        }
    }

    pub fn progress(&mut self) -> Result<Box<[ChainProgress]>> {
        self.commands.send(SamplerCommand::Progress)?;
        let response = self.responses.recv()?;
        let SamplerResponse::Progress(progress) = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(progress)
    }
}

/// The outcome of [`run`].
#[derive(Debug, Clone)]
pub struct RunResult {
    pub chains: Vec<ChainOutput>,
    /// Split R-hat per variable, if every chain has enough post burn-in
    /// draws.
    pub rhat: Option<Vec<f64>>,
}

impl RunResult {
    pub fn new(trace: Trace, settings: &RunConfiguration) -> Self {
        let columns = trace
            .chains
            .iter()
            .map(|chain| chain.post_burnin_columns())
            .collect_vec();
        let enough = !columns.is_empty()
            && columns.iter().all(|c| {
                c.first()
                    .is_some_and(|c| c.len() >= settings.diagnostics_min_samples.max(4))
            });
        let rhat = enough.then(|| {
            (0..settings.dimension)
                .map(|var| {
                    let per_chain = columns.iter().map(|c| c[var].as_slice()).collect_vec();
                    split_rhat(&per_chain)
                })
                .collect_vec()
        });
        if let Some(rhat) = &rhat {
            let worst = rhat.iter().cloned().fold(f64::NAN, f64::max);
            info!("largest split R-hat across chains: {:.4}", worst);
        }
        Self {
            chains: trace.chains,
            rhat,
        }
    }

    pub fn summaries(&self) -> impl Iterator<Item = &ChainSummary> {
        self.chains.iter().map(|chain| &chain.summary)
    }

    pub fn files(&self) -> impl Iterator<Item = &ChainFiles> {
        self.chains.iter().filter_map(|chain| chain.files.as_ref())
    }
}

/// Sample from `density` with the given configuration and block until all
/// chains are done.
///
/// Chains are written to plain-text files if `settings.output` is set and
/// kept in memory otherwise.
pub fn run<D: LogDensity>(
    dimension: usize,
    density: D,
    settings: RunConfiguration,
) -> Result<RunResult> {
    if settings.dimension != dimension {
        return Err(DramError::Configuration(format!(
            "dimension {} does not match the configured dimension {}",
            dimension, settings.dimension
        ))
        .into());
    }
    settings.validate()?;
    let num_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(settings.chain_count());

    let trace = match settings.output.clone() {
        Some(output) => {
            Sampler::new(density, settings.clone(), TextConfig::new(output), num_cores, None)?
                .wait()?
        }
        None => Sampler::new(density, settings.clone(), MemoryConfig::default(), num_cores, None)?
            .wait()?,
    };
    Ok(RunResult::new(trace, &settings))
}


#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    use anyhow::Result;
    use itertools::Itertools;
    use pretty_assertions::assert_eq;

    use super::{
        test_logps::{FailingLogp, NormalLogp},
        *,
    };
    use crate::settings::ParallelizationModel;

    fn settings(dim: usize, chain_size: u64) -> RunConfiguration {
        let mut settings = RunConfiguration::new(dim);
        settings.chain_size = chain_size;
        settings.seed = 10;
        settings.progress_report_period = 100;
        settings
    }

    #[test]
    fn sample_chain() -> Result<()> {
        let logp = NormalLogp { dim: 10, mu: 0.1 };
        let settings = settings(10, 100);
        let start = vec![0.2; 10];

        let draws = sample_sequentially(&logp, &settings, &start, 200, 1)?.collect_vec();
        assert_eq!(draws.len(), 200);
        let (point, info) = draws.into_iter().nth(100).unwrap()?;
        assert_eq!(point.len(), 10);
        assert_eq!(info.chain, 1);
        assert_eq!(info.step, 101);
        Ok(())
    }

    #[test]
    fn sample_parallel() -> Result<()> {
        let logp = NormalLogp { dim: 5, mu: 0.1 };
        let settings = settings(5, 2_000);

        let mut sampler = Sampler::new(logp.clone(), settings.clone(), MemoryConfig::default(), 4, None)?;
        sampler.pause()?;
        sampler.pause()?;
        let _trace = sampler.inspect_trace()?;
        sampler.resume()?;
        let (ok, trace) = sampler.abort();
        ok?;
        let trace = trace.expect("No trace");
        assert!(trace.chains.len() <= settings.num_chains);
        for chain in trace.chains.iter() {
            assert!(!matches!(chain.summary.status, ChainStatus::Failed(_)));
        }

        let mut sampler = Sampler::new(logp.clone(), settings.clone(), MemoryConfig::default(), 4, None)?;
        sampler.pause()?;
        sampler.abort().0?;

        let sampler = Sampler::new(logp.clone(), settings.clone(), MemoryConfig::default(), 4, None)?;
        let mut sampler = match sampler.wait_timeout(Duration::from_nanos(100)) {
            SamplerWaitResult::Trace(_) => panic!("finished"),
            SamplerWaitResult::Timeout(sampler) => sampler,
            SamplerWaitResult::Err(err, _) => panic!("error: {:?}", err),
        };

        for _ in 0..30 {
            sampler.progress()?;
        }

        let trace = sampler.wait()?;
        assert_eq!(trace.chains.len(), settings.num_chains);
        for chain in trace.chains.iter() {
            assert_eq!(chain.records.len() as u64, settings.chain_size);
            assert_eq!(chain.summary.status, ChainStatus::Complete);
            assert!(chain.summary.acceptance_rate > 0.);
        }
        Ok(())
    }

    #[test]
    fn progress_callback_sees_all_chains() -> Result<()> {
        let logp = NormalLogp { dim: 3, mu: 0. };
        let settings = settings(3, 500);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let callback = ProgressCallback {
            callback: Box::new(move |_elapsed, progress| {
                assert_eq!(progress.len(), 4);
                seen.fetch_add(1, Ordering::Relaxed);
            }),
            rate: Duration::from_millis(1),
        };
        let sampler = Sampler::new(logp, settings, MemoryConfig::default(), 2, Some(callback))?;
        sampler.wait()?;
        assert!(calls.load(Ordering::Relaxed) >= 2);
        Ok(())
    }

    #[test]
    fn failed_chains_are_reported() -> Result<()> {
        let logp = FailingLogp {
            threshold: -0.5,
            calls: AtomicUsize::new(0),
        };
        let mut settings = settings(2, 300);
        settings.max_evaluation_failures = 3;
        let trace = Sampler::new(logp, settings.clone(), MemoryConfig::default(), 4, None)?.wait()?;
        assert_eq!(trace.chains.len(), 4);
        for chain in trace.chains.iter() {
            let ChainStatus::Failed(reason) = &chain.summary.status else {
                panic!("chain {} did not fail", chain.chain_id);
            };
            assert!(reason.contains("failed logp evaluations"), "{}", reason);
            assert!(chain.summary.evaluation_failures > 3);
            assert!(!chain.records.is_empty());
        }
        Ok(())
    }

    #[test]
    fn step_limit_caps_chains() -> Result<()> {
        let logp = NormalLogp { dim: 2, mu: 0. };
        let mut settings = settings(2, 1_000);
        settings.max_steps = 1_000;
        settings.parallelization = ParallelizationModel::SingleChain;
        settings.num_chains = 1;
        let trace = Sampler::new(logp, settings, MemoryConfig::default(), 1, None)?.wait()?;
        let chain = &trace.chains[0];
        assert_eq!(chain.summary.status, ChainStatus::Capped);
        assert_eq!(chain.summary.steps, 1_000);
        assert!(chain.records.len() < 1_000);
        Ok(())
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let logp = NormalLogp { dim: 3, mu: 0. };
        let result = Sampler::new(logp, settings(2, 10), MemoryConfig::default(), 1, None);
        let Err(err) = result else {
            panic!("expected an error");
        };
        assert!(matches!(
            err.downcast_ref::<DramError>(),
            Some(DramError::Configuration(_))
        ));
        assert!(run(3, NormalLogp { dim: 3, mu: 0. }, settings(2, 10)).is_err());
    }

    /// Storage whose flushes fail while `broken` is set.
    struct FlakyStorage {
        broken: Arc<AtomicBool>,
        flushes: Arc<AtomicUsize>,
    }

    struct FlakyConfig {
        broken: Arc<AtomicBool>,
        flushes: Arc<AtomicUsize>,
        broken_chain: u64,
    }

    impl ChainStorage for FlakyStorage {
        fn record_sample(&mut self, _record: &SampleRecord) -> Result<()> {
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes.fetch_add(1, Ordering::Relaxed);
            if self.broken.load(Ordering::Relaxed) {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            Ok(())
        }

        fn finalize(
            self,
            _summary: &ChainSummary,
            _records: &[SampleRecord],
            _refined: &[usize],
        ) -> Result<Option<ChainFiles>> {
            Ok(None)
        }
    }

    impl StorageConfig for FlakyConfig {
        type ChainStorage = FlakyStorage;

        fn prepare(&self, _settings: &RunConfiguration) -> Result<()> {
            Ok(())
        }

        fn new_chain(
            &self,
            _settings: &RunConfiguration,
            chain: u64,
        ) -> Result<ChainStart<FlakyStorage>> {
            let broken = if chain == self.broken_chain {
                self.broken.clone()
            } else {
                Arc::new(AtomicBool::new(false))
            };
            Ok(ChainStart::Fresh(FlakyStorage {
                broken,
                flushes: self.flushes.clone(),
            }))
        }
    }

    #[test]
    fn write_failures_abort_the_run() {
        let logp = NormalLogp { dim: 2, mu: 0. };
        let mut settings = settings(2, 1_000_000);
        settings.max_steps = 100_000_000;
        settings.output = Some(crate::settings::OutputSettings {
            flush_period: 10,
            io_retries: 2,
            ..crate::settings::OutputSettings::new("unused")
        });
        let storage = FlakyConfig {
            broken: Arc::new(AtomicBool::new(true)),
            flushes: Arc::new(AtomicUsize::new(0)),
            broken_chain: 2,
        };
        let start = Instant::now();
        let sampler = Sampler::new(logp, settings, storage, 4, None).unwrap();
        match sampler.wait_timeout(Duration::from_secs(60)) {
            SamplerWaitResult::Err(err, trace) => {
                assert!(err.to_string().contains("could not write"), "{:#}", err);
                let trace = trace.expect("other chains are finalized");
                assert!(trace
                    .chains
                    .iter()
                    .all(|chain| chain.summary.status == ChainStatus::Incomplete));
            }
            SamplerWaitResult::Trace(_) => panic!("the run should fail"),
            SamplerWaitResult::Timeout(_) => panic!("the run did not abort"),
        }
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn transient_write_failures_are_retried() -> Result<()> {
        let logp = NormalLogp { dim: 2, mu: 0. };
        let mut settings = settings(2, 200);
        settings.num_chains = 1;
        settings.output = Some(crate::settings::OutputSettings {
            flush_period: 10,
            io_retries: 50,
            ..crate::settings::OutputSettings::new("unused")
        });
        let broken = Arc::new(AtomicBool::new(true));
        let storage = FlakyConfig {
            broken: broken.clone(),
            flushes: Arc::new(AtomicUsize::new(0)),
            broken_chain: 0,
        };
        let flushes = storage.flushes.clone();
        let healer = std::thread::spawn(move || {
            while flushes.load(Ordering::Relaxed) < 3 {
                std::thread::sleep(Duration::from_millis(1));
            }
            broken.store(false, Ordering::Relaxed);
        });
        let trace = Sampler::new(logp, settings, storage, 1, None)?.wait()?;
        healer.join().unwrap();
        assert_eq!(trace.chains[0].summary.status, ChainStatus::Complete);
        assert_eq!(trace.chains[0].records.len(), 200);
        Ok(())
    }

    #[test]
    fn trace_stays_inspectable_while_flush_retries() -> Result<()> {
        let logp = NormalLogp { dim: 2, mu: 0. };
        let mut settings = settings(2, 200);
        settings.num_chains = 1;
        settings.output = Some(crate::settings::OutputSettings {
            flush_period: 10,
            io_retries: 1_000,
            ..crate::settings::OutputSettings::new("unused")
        });
        let broken = Arc::new(AtomicBool::new(true));
        let storage = FlakyConfig {
            broken: broken.clone(),
            flushes: Arc::new(AtomicUsize::new(0)),
            broken_chain: 0,
        };
        let flushes = storage.flushes.clone();
        let mut sampler = Sampler::new(logp, settings, storage, 1, None)?;
        while flushes.load(Ordering::Relaxed) < 3 {
            std::thread::sleep(Duration::from_millis(1));
        }

        // The chain is now sleeping between flush attempts.
        let start = Instant::now();
        let trace = sampler.inspect_trace()?;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(trace.chains.len(), 1);
        assert!(trace.chains[0].records.len() >= 10);

        broken.store(false, Ordering::Relaxed);
        let trace = sampler.wait()?;
        assert_eq!(trace.chains[0].summary.status, ChainStatus::Complete);
        assert_eq!(trace.chains[0].records.len(), 200);
        Ok(())
    }

    /// Memory storage that cannot open one of the chains.
    struct RefusingConfig {
        refused_chain: u64,
    }

    impl StorageConfig for RefusingConfig {
        type ChainStorage = crate::storage::MemoryChainStorage;

        fn prepare(&self, _settings: &RunConfiguration) -> Result<()> {
            Ok(())
        }

        fn new_chain(
            &self,
            settings: &RunConfiguration,
            chain: u64,
        ) -> Result<ChainStart<Self::ChainStorage>> {
            if chain == self.refused_chain {
                bail!("read-only file system");
            }
            MemoryConfig::default().new_chain(settings, chain)
        }
    }

    #[test]
    fn storage_setup_failures_are_reported() -> Result<()> {
        let logp = NormalLogp { dim: 2, mu: 0. };
        let settings = settings(2, 100);
        let storage = RefusingConfig { refused_chain: 1 };
        let trace = Sampler::new(logp, settings, storage, 2, None)?.wait()?;
        assert_eq!(trace.chains.len(), 4);
        for chain in trace.chains.iter() {
            if chain.chain_id == 1 {
                let ChainStatus::Failed(reason) = &chain.summary.status else {
                    panic!("chain 1 did not fail: {:?}", chain.summary.status);
                };
                assert!(reason.contains("read-only file system"), "{}", reason);
                assert!(chain.records.is_empty());
            } else {
                assert_eq!(chain.summary.status, ChainStatus::Complete);
                assert_eq!(chain.records.len(), 100);
            }
        }
        Ok(())
    }

    #[test]
    fn run_reports_rhat() -> Result<()> {
        let logp = NormalLogp { dim: 2, mu: 1. };
        let mut settings = settings(2, 3_000);
        settings.diagnostics_min_samples = 500;
        let result = run(2, logp, settings)?;
        assert_eq!(result.chains.len(), 4);
        assert_eq!(result.files().count(), 0);
        let rhat = result.rhat.as_ref().expect("enough draws for R-hat");
        assert_eq!(rhat.len(), 2);
        assert!(rhat.iter().all(|r| *r < 1.1), "{:?}", rhat);
        for summary in result.summaries() {
            assert_eq!(summary.unique_points, 3_000);
            assert!((summary.mean[0] - 1.).abs() < 0.3);
        }
        Ok(())
    }
}
