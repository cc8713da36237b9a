use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{Span, debug, info, info_span, warn};

use crate::assembler::assemble;
use crate::cache::CacheStore;
use crate::catalog::DatasetCatalog;
use crate::codec::{CubeReader, NetcdfFormat, writer_for};
use crate::config::PreloadRequest;
use crate::error::IcosdpError;
use crate::icos::CatalogClient;
use crate::progress::{FanOut, PreloadState, ProgressReporter, ProgressSink, StateBoard};
use crate::resolver::resolve_years;
use crate::selector::select_object;
use crate::stager::{ScratchArea, remove_scratch, stage};
use crate::writer::{self, CacheArtifact};

/// Share of the total progress taken by the downloads.
const DOWNLOAD_WEIGHT: f64 = 0.6;
const WRITE_CHECKPOINT: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreloadPhase {
    Initializing,
    ResolvingMetadata,
    Downloading,
    Assembling,
    Writing,
    Finished,
    Failed,
}

impl fmt::Display for PreloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PreloadPhase::Initializing => "INITIALIZING",
            PreloadPhase::ResolvingMetadata => "RESOLVING_METADATA",
            PreloadPhase::Downloading => "DOWNLOADING",
            PreloadPhase::Assembling => "ASSEMBLING",
            PreloadPhase::Writing => "WRITING",
            PreloadPhase::Finished => "FINISHED",
            PreloadPhase::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Result of one preload run. `failed_in` names the phase that was active
/// when a failed run aborted.
#[derive(Debug)]
pub struct PreloadOutcome {
    pub data_id: String,
    pub phase: PreloadPhase,
    pub failed_in: Option<PreloadPhase>,
    pub result: Result<CacheArtifact, IcosdpError>,
}

impl PreloadOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

fn lock_scratch(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs the preload pipeline for one request at a time.
#[derive(Clone)]
pub struct Preloader {
    client: Arc<dyn CatalogClient>,
    catalog: Arc<DatasetCatalog>,
    cache: CacheStore,
    scratch_root: Utf8PathBuf,
    reader: Arc<dyn CubeReader>,
    span: Span,
    scratch_lock: Arc<Mutex<()>>,
}

impl Preloader {
    pub fn new(
        client: Arc<dyn CatalogClient>,
        catalog: Arc<DatasetCatalog>,
        cache: CacheStore,
        scratch_root: Utf8PathBuf,
    ) -> Self {
        Self {
            client,
            catalog,
            cache,
            scratch_root,
            reader: Arc::new(NetcdfFormat),
            span: info_span!("icosdp"),
            scratch_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Reader used for the staged yearly objects.
    pub fn with_reader(mut self, reader: Arc<dyn CubeReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Parent span for every run's events.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_scratch_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.scratch_lock = lock;
        self
    }

    /// Fails when this build can neither read the staged objects nor write
    /// the artifact format `request` asks for.
    pub fn check_formats(&self, request: &PreloadRequest) -> Result<(), IcosdpError> {
        self.reader.ensure_readable()?;
        writer_for(request.target_format).ensure_writable()
    }

    pub fn scratch_root(&self) -> &Utf8Path {
        &self.scratch_root
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Executes one request to completion. Progress goes to `sink`; the
    /// scratch area is gone when this returns, whatever the outcome.
    pub fn run(
        &self,
        request: &PreloadRequest,
        sink: &dyn ProgressSink,
        cancel: &AtomicBool,
    ) -> PreloadOutcome {
        let data_id = request.data_id.to_string();
        let span = info_span!(parent: &self.span, "preload", data_id = %data_id);
        let _entered = span.enter();
        let _scratch = lock_scratch(&self.scratch_lock);

        let mut reporter = ProgressReporter::new(&data_id, sink);
        let mut phase = PreloadPhase::Initializing;
        match self.execute(request, &mut reporter, &mut phase, cancel) {
            Ok(artifact) => {
                reporter.finished("Preload finished");
                info!(output_id = %artifact.output_id, "preload finished");
                PreloadOutcome {
                    data_id,
                    phase: PreloadPhase::Finished,
                    failed_in: None,
                    result: Ok(artifact),
                }
            }
            Err(err) => {
                warn!(%phase, %err, "preload failed");
                reporter.failed(&err.to_string());
                PreloadOutcome {
                    data_id,
                    phase: PreloadPhase::Failed,
                    failed_in: Some(phase),
                    result: Err(err),
                }
            }
        }
    }

    fn execute(
        &self,
        request: &PreloadRequest,
        reporter: &mut ProgressReporter<'_>,
        phase: &mut PreloadPhase,
        cancel: &AtomicBool,
    ) -> Result<CacheArtifact, IcosdpError> {
        *phase = PreloadPhase::Initializing;
        let mut scratch = ScratchArea::acquire(&self.scratch_root)?;
        let result = self.steps(request, reporter, phase, cancel, &scratch);
        if let Err(err) = scratch.release() {
            warn!(%err, "scratch area cleanup failed");
        }
        result
    }

    fn steps(
        &self,
        request: &PreloadRequest,
        reporter: &mut ProgressReporter<'_>,
        phase: &mut PreloadPhase,
        cancel: &AtomicBool,
        scratch: &ScratchArea,
    ) -> Result<CacheArtifact, IcosdpError> {
        let client = self.client.as_ref();
        reporter.started("Download in progress");

        *phase = PreloadPhase::ResolvingMetadata;
        let locator = self.catalog.locator(&request.data_id, request.agg_mode)?;
        let years = resolve_years(client, locator, request.years)?;

        *phase = PreloadPhase::Downloading;
        let total = years.len();
        let mut staged = Vec::with_capacity(total);
        for (index, member) in years.iter().enumerate() {
            check_cancelled(cancel, request)?;
            let object = select_object(client, member, request.agg_mode)?;
            staged.push(stage(client, &object, scratch)?);
            let done = index + 1;
            reporter.running(
                DOWNLOAD_WEIGHT * done as f64 / total as f64,
                &format!("Downloaded {} ({done}/{total})", member.year),
            );
        }
        check_cancelled(cancel, request)?;

        *phase = PreloadPhase::Assembling;
        reporter.running(DOWNLOAD_WEIGHT, "Prepare data");
        let cube = assemble(
            self.reader.as_ref(),
            request.data_id.variable(),
            &staged,
            request.bbox.as_ref(),
        )?;
        let cube = if request.flatten_time {
            cube.flatten_time()?
        } else {
            cube
        };
        check_cancelled(cancel, request)?;

        *phase = PreloadPhase::Writing;
        reporter.running(WRITE_CHECKPOINT, "Write data");
        let writer = writer_for(request.target_format);
        writer::write(&self.cache, writer.as_ref(), cube, request)
    }
}

fn check_cancelled(cancel: &AtomicBool, request: &PreloadRequest) -> Result<(), IcosdpError> {
    if cancel.load(Ordering::SeqCst) {
        return Err(IcosdpError::Cancelled(request.data_id.to_string()));
    }
    Ok(())
}

/// Background execution of one or more preload requests. The requests run
/// one after another on a single worker thread.
///
/// Dropping the handle cancels whatever has not started yet, waits for the
/// worker and removes the scratch area.
pub struct PreloadHandle {
    data_ids: Vec<String>,
    board: StateBoard,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<Vec<PreloadOutcome>>>,
    outcomes: Vec<PreloadOutcome>,
    scratch_root: Utf8PathBuf,
    scratch_lock: Arc<Mutex<()>>,
    closed: bool,
}

impl PreloadHandle {
    pub fn spawn(
        preloader: Preloader,
        requests: Vec<PreloadRequest>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, IcosdpError> {
        let data_ids = requests
            .iter()
            .map(|request| request.data_id.to_string())
            .collect::<Vec<_>>();
        let board = StateBoard::default();
        let cancel = Arc::new(AtomicBool::new(false));
        let scratch_root = preloader.scratch_root.clone();
        let scratch_lock = preloader.scratch_lock.clone();

        let board_sink: Arc<dyn ProgressSink> = Arc::new(board.clone());
        let fan_out = FanOut(vec![board_sink, sink]);
        let worker_cancel = cancel.clone();
        let worker = thread::Builder::new()
            .name("icosdp-preload".to_string())
            .spawn(move || {
                requests
                    .iter()
                    .map(|request| preloader.run(request, &fan_out, &worker_cancel))
                    .collect::<Vec<_>>()
            })
            .map_err(|err| IcosdpError::Filesystem(format!("spawn preload worker: {err}")))?;
        debug!(?data_ids, "preload worker started");

        Ok(Self {
            data_ids,
            board,
            cancel,
            worker: Some(worker),
            outcomes: Vec::new(),
            scratch_root,
            scratch_lock,
            closed: false,
        })
    }

    pub fn data_ids(&self) -> &[String] {
        &self.data_ids
    }

    /// Latest notification per data id that has reported anything yet.
    pub fn states(&self) -> Vec<PreloadState> {
        self.board.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| worker.is_finished())
            .unwrap_or(true)
    }

    /// Requests cancellation; checked between years and between steps.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Blocks until every request has run and returns their outcomes.
    pub fn wait(&mut self) -> &[PreloadOutcome] {
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(outcomes) => self.outcomes = outcomes,
                Err(_) => {
                    self.outcomes = self
                        .data_ids
                        .iter()
                        .map(|data_id| PreloadOutcome {
                            data_id: data_id.clone(),
                            phase: PreloadPhase::Failed,
                            failed_in: None,
                            result: Err(IcosdpError::Cancelled(format!(
                                "preload worker for {data_id} panicked"
                            ))),
                        })
                        .collect();
                }
            }
        }
        &self.outcomes
    }

    pub fn into_outcomes(mut self) -> Vec<PreloadOutcome> {
        self.wait();
        std::mem::take(&mut self.outcomes)
    }

    /// Waits for the worker and removes the scratch area. Idempotent.
    pub fn close(&mut self) -> Result<(), IcosdpError> {
        if self.closed {
            return Ok(());
        }
        self.wait();
        self.closed = true;
        let _scratch = lock_scratch(&self.scratch_lock);
        remove_scratch(&self.scratch_root)
    }
}

impl Drop for PreloadHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.cancel();
        }
        if let Err(err) = self.close() {
            warn!(%err, "failed to close preload handle");
        }
    }
}
