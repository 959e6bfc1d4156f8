//! The scan scheduler
//!
//! A fixed pool of workers drains a shared unbounded job queue. Each job
//! references one meta-directory that has been created but not yet
//! scanned. A worker digests the file in a single pass, applies content
//! labels, runs the carving pipeline and enqueues every child the
//! pipeline produces. The "in flight" counter covers queued plus
//! currently processed jobs; an idle worker that observes it at zero
//! after its receive timeout terminates.

use crate::carve::carve_file;
use crate::config::ScanEnvironment;
use crate::identify;
use crate::meta_directory::MetaDirectory;
use crate::registry::ParserRegistry;
use compact_str::CompactString;
use dashmap::DashMap;
use eyre::WrapErr;
use eyre::bail;
use eyre::eyre;
use filkarv_utils::digest::digest_reader;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Result of a completed scan. Individual job failures are counted, not
/// fatal: a scan never aborts because one parser or one file failed.
#[derive(Debug)]
pub struct ScanReport {
    /// The root meta-directory
    pub root: PathBuf,
    /// Jobs processed (files scanned)
    pub jobs: u64,
    /// Jobs that failed with an I/O or internal error
    pub failed_jobs: u64,
}

/// One queued unit of work: a meta-directory awaiting its scan.
struct Job {
    name: CompactString,
}

/// Map from SHA-256 to the first meta-directory seen with that content.
type SeenHashes = DashMap<[u8; 32], CompactString, ahash::RandomState>;

pub struct Scheduler {
    env: Arc<ScanEnvironment>,
    registry: Arc<ParserRegistry>,
    cancel: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(env: Arc<ScanEnvironment>, registry: Arc<ParserRegistry>) -> Self {
        Self {
            env,
            registry,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked by workers at job boundaries; set it to drain the
    /// pool gracefully.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Scan `input` and build the meta-directory tree under the
    /// configured unpack directory.
    pub fn scan(&self, input: &Path) -> eyre::Result<ScanReport> {
        let input = input
            .canonicalize()
            .wrap_err_with(|| format!("Cannot resolve input path {input:?}"))?;
        if !input.is_file() {
            bail!("Input {input:?} is not a regular file");
        }
        std::fs::create_dir_all(&self.env.unpack_directory).wrap_err_with(|| {
            format!(
                "Failed to create unpack directory {:?}",
                self.env.unpack_directory
            )
        })?;
        std::fs::create_dir_all(&self.env.temporary_directory).wrap_err_with(|| {
            format!(
                "Failed to create temporary directory {:?}",
                self.env.temporary_directory
            )
        })?;

        let root = MetaDirectory::create_root(&self.env.unpack_directory, &input)?;
        let root_dir = root.dir();

        let (tx, rx) = flume::unbounded::<Job>();
        let in_flight = AtomicU64::new(1);
        let jobs = AtomicU64::new(0);
        let failed_jobs = AtomicU64::new(0);
        let seen: SeenHashes = SeenHashes::default();
        tx.send(Job {
            name: root.name().into(),
        })
        .expect("Unbounded queue");
        drop(root);

        std::thread::scope(|scope| {
            for worker in 0..self.env.workers.max(1) {
                let worker_ctx = WorkerContext {
                    env: self.env.as_ref(),
                    registry: self.registry.as_ref(),
                    tx: tx.clone(),
                    rx: rx.clone(),
                    in_flight: &in_flight,
                    cancel: &self.cancel,
                    seen: &seen,
                    jobs: &jobs,
                    failed_jobs: &failed_jobs,
                };
                scope
                    .spawn(move || {
                        let _span =
                            tracing::debug_span!("worker", id = worker).entered();
                        worker_loop(worker_ctx);
                    });
            }
        });

        Ok(ScanReport {
            root: root_dir,
            jobs: jobs.load(Ordering::SeqCst),
            failed_jobs: failed_jobs.load(Ordering::SeqCst),
        })
    }
}

struct WorkerContext<'a> {
    env: &'a ScanEnvironment,
    registry: &'a ParserRegistry,
    tx: flume::Sender<Job>,
    rx: flume::Receiver<Job>,
    in_flight: &'a AtomicU64,
    cancel: &'a AtomicBool,
    seen: &'a SeenHashes,
    jobs: &'a AtomicU64,
    failed_jobs: &'a AtomicU64,
}

fn worker_loop(ctx: WorkerContext<'_>) {
    loop {
        if ctx.cancel.load(Ordering::Relaxed) {
            break;
        }
        match ctx.rx.recv_timeout(ctx.env.job_wait_time) {
            Ok(job) => {
                ctx.jobs.fetch_add(1, Ordering::SeqCst);
                if let Err(err) = process_job(&ctx, &job) {
                    ctx.failed_jobs.fetch_add(1, Ordering::SeqCst);
                    tracing::error!("Scanning {} failed: {err:#}", job.name);
                }
                ctx.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                // Queue drained and nobody is producing: we are done
                if ctx.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
            }
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn process_job(ctx: &WorkerContext<'_>, job: &Job) -> eyre::Result<()> {
    let mut md = MetaDirectory::open(&ctx.env.unpack_directory, &job.name)?;
    let path = md.abs_file_path();
    if ctx.env.verbose {
        tracing::info!("Scanning {:?} ({})", md.file_path(), job.name);
    } else {
        tracing::debug!("Scanning {:?} ({})", md.file_path(), job.name);
    }

    // Size, digests and histogram in one streamed pass
    let file_len = std::fs::metadata(&path)
        .wrap_err_with(|| format!("Cannot stat {path:?}"))?
        .len();
    let with_tlsh = file_len <= ctx.env.tlsh_maximum;
    let mut file = File::open(&path).wrap_err_with(|| format!("Cannot open {path:?}"))?;
    let summary = digest_reader(&mut file, ctx.env.read_size, with_tlsh)?;
    drop(file);

    {
        let info = md.info_mut();
        info.size = Some(summary.size);
        info.hashes = Some(summary.hashes.clone());
        // Content labels augment whatever a parser already set
        for label in identify::content_labels(&summary) {
            info.labels.insert(label);
        }
    }

    // The same byte sequence is scanned once; later copies only record
    // where the canonical scan lives.
    let mut duplicate = false;
    if md.info().scanned {
        ctx.seen
            .entry(summary.hashes.sha256)
            .or_insert_with(|| md.name().into());
    } else {
        match ctx.seen.entry(summary.hashes.sha256) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                duplicate = true;
                let canonical = entry.get().clone();
                let info = md.info_mut();
                info.add_label("duplicate");
                info.metadata.insert(
                    "duplicate_of".into(),
                    serde_cbor::Value::Text(canonical.into()),
                );
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(md.name().into());
            }
        }
    }

    let unscannable =
        summary.size == 0 || md.info().has_label("padding") || duplicate;
    if md.info().scanned || unscannable {
        md.info_mut().scanned = true;
        md.persist()?;
        return Ok(());
    }

    let mut sink = |mut child: MetaDirectory| -> eyre::Result<()> {
        child.persist()?;
        // In flight goes up before the producing worker proceeds, so an
        // idle worker can never observe a false zero
        ctx.in_flight.fetch_add(1, Ordering::SeqCst);
        ctx.tx
            .send(Job {
                name: child.name().into(),
            })
            .map_err(|_| eyre!("Job queue closed while enqueueing child"))?;
        Ok(())
    };
    let carved = carve_file(ctx.env, ctx.registry, &mut md, &mut sink);
    // Close the meta-directory with whatever labels are known even if
    // the pipeline failed half way
    md.persist()?;
    carved
}
