//! Audio conversion stage
//!
//! Every source-format file under Contents/ is re-encoded next to itself with
//! the target extension. Encodes run on a bounded worker pool; a failed file
//! is held back so the patch stages never point the database at audio that
//! does not exist.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use pdbpatch_core::{ExportLayout, ExtensionMapping, FileType, MappingPolicy, RenameMap};

use crate::config::{RunConfig, Strategy};

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("Encoder not available: {0}")]
    Unavailable(String),

    #[error("Encoder exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persist error: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Worker pool closed")]
    PoolClosed,
}

/// Something that can turn one audio file into another format
#[async_trait]
pub trait Encoder: Send + Sync {
    fn name(&self) -> &str;

    /// Check the encoder can run at all, before any file is touched
    async fn validate(&self) -> Result<(), ConversionError>;

    /// Encode `input` into `output` as `target`. `output` may carry any
    /// extension, the container is chosen explicitly.
    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        target: FileType,
    ) -> Result<(), ConversionError>;
}

pub struct FfmpegEncoder {
    binary: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Codec and container arguments for each target format
    fn codec_args(target: FileType) -> &'static [&'static str] {
        match target {
            FileType::Aiff => &["-c:a", "pcm_s16be", "-write_id3v2", "1", "-f", "aiff"],
            FileType::Mp3 => &["-c:a", "libmp3lame", "-b:a", "320k", "-id3v2_version", "3", "-f", "mp3"],
            FileType::Wav => &["-c:a", "pcm_s16le", "-f", "wav"],
            FileType::M4a => &["-c:a", "aac", "-b:a", "256k", "-f", "ipod"],
            FileType::Flac => &["-c:a", "flac", "-f", "flac"],
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn validate(&self) -> Result<(), ConversionError> {
        let status = Command::new(&self.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ConversionError::Unavailable(format!("{:?}: {}", self.binary, e)))?;

        if !status.success() {
            return Err(ConversionError::Unavailable(format!(
                "{:?} -version exited with {}",
                self.binary, status
            )));
        }
        Ok(())
    }

    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        target: FileType,
    ) -> Result<(), ConversionError> {
        let mut command = Command::new(&self.binary);
        command
            .args(["-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(input)
            .args(["-map", "0:a", "-map_metadata", "0"])
            .args(Self::codec_args(target))
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {:?}", command);
        let result = command.output().await?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(ConversionError::Failed {
                status: result.status.to_string(),
                stderr: stderr.lines().last().unwrap_or("").trim().to_string(),
            });
        }
        Ok(())
    }
}

/// One planned conversion
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub source: PathBuf,
    pub target: PathBuf,
    pub mapping: ExtensionMapping,
    /// Export-relative paths as the database stores them
    pub old_rel: String,
    pub new_rel: String,
}

/// Every source-format file under Contents/, paired with its target path
pub fn plan_jobs(layout: &ExportLayout, policy: &MappingPolicy) -> Vec<ConversionJob> {
    let mut jobs = Vec::new();

    for mapping in policy.iter() {
        for source in layout.audio_files(mapping.source) {
            let target = source.with_extension(mapping.target.extension());
            match (layout.relative(&source), layout.relative(&target)) {
                (Some(old_rel), Some(new_rel)) => jobs.push(ConversionJob {
                    source,
                    target,
                    mapping: *mapping,
                    old_rel,
                    new_rel,
                }),
                _ => warn!("Skipping non UTF-8 path {:?}", source),
            }
        }
    }

    jobs
}

/// Rename map from what is on the medium: every target file whose source
/// sibling could have produced it. Source files without a target are held
/// back.
pub fn discover_converted(layout: &ExportLayout, policy: &MappingPolicy) -> RenameMap {
    let mut renames = RenameMap::new();

    for mapping in policy.iter() {
        for target in layout.audio_files(mapping.target) {
            let source = target.with_extension(mapping.source.extension());
            if let (Some(old_rel), Some(new_rel)) =
                (layout.relative(&source), layout.relative(&target))
            {
                if let Err(e) = renames.insert(&old_rel, &new_rel) {
                    warn!("Ignoring {:?}: {}", target, e);
                }
            }
        }

        for source in layout.audio_files(mapping.source) {
            if source.with_extension(mapping.target.extension()).exists() {
                continue;
            }
            if let Some(rel) = layout.relative(&source) {
                debug!("Not converted, holding back: {}", rel);
                renames.hold_back(&rel);
            }
        }
    }

    info!(
        "Found {} converted tracks ({} held back)",
        renames.len(),
        renames.held_back().count()
    );
    renames
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedConversion {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionSummary {
    pub planned: usize,
    pub converted: usize,
    /// Target already present from an earlier run
    pub reused: usize,
    /// Not finished before an interrupt
    pub cancelled: usize,
    pub interrupted: bool,
    pub failures: Vec<FailedConversion>,
}

impl ConversionSummary {
    pub fn succeeded(&self) -> usize {
        self.converted + self.reused
    }
}

#[derive(Debug)]
pub struct ConversionOutcome {
    pub renames: RenameMap,
    pub summary: ConversionSummary,
}

enum JobResult {
    Converted,
    Reused,
}

/// Per-job settings shared by every worker
#[derive(Debug, Clone)]
struct JobOptions {
    strategy: Strategy,
    staging: Option<PathBuf>,
    keep_originals: bool,
}

/// Run every planned conversion on a bounded pool and build the rename map.
/// Resolving `interrupt` stops the pool; finished files are kept and the
/// rest are held back.
pub async fn convert_all<F>(
    jobs: Vec<ConversionJob>,
    config: &RunConfig,
    encoder: Arc<dyn Encoder>,
    interrupt: F,
) -> Result<ConversionOutcome, ConversionError>
where
    F: Future<Output = ()>,
{
    let mut summary = ConversionSummary {
        planned: jobs.len(),
        ..Default::default()
    };
    let mut renames = RenameMap::new();

    if jobs.is_empty() {
        info!("No files to convert");
        return Ok(ConversionOutcome { renames, summary });
    }

    // Scratch space for cache-first runs lives until every worker is done
    let mut scratch: Option<TempDir> = None;
    let staging = match (config.strategy, &config.cache_dir) {
        (Strategy::OnDevice, _) => None,
        (Strategy::CacheFirst, Some(dir)) => {
            std::fs::create_dir_all(dir)?;
            Some(dir.clone())
        }
        (Strategy::CacheFirst, None) => {
            let dir = tempfile::Builder::new().prefix("pdbpatch-cache-").tempdir()?;
            let path = dir.path().to_path_buf();
            scratch = Some(dir);
            Some(path)
        }
    };

    let options = JobOptions {
        strategy: config.strategy,
        staging,
        keep_originals: config.keep_originals,
    };
    let workers = config.workers.max(1);
    info!(
        "Converting {} files with {} ({:?}, {} workers)",
        jobs.len(),
        encoder.name(),
        config.strategy,
        workers
    );

    let semaphore = Arc::new(Semaphore::new(workers));
    let mut pending: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut set = JoinSet::new();

    for job in jobs {
        pending.insert(job.old_rel.clone(), job.source.clone());
        let semaphore = semaphore.clone();
        let encoder = encoder.clone();
        let options = options.clone();

        set.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => convert_one(encoder.as_ref(), &job, &options).await,
                Err(_) => Err(ConversionError::PoolClosed),
            };
            (job, result)
        });
    }

    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            joined = set.join_next() => match joined {
                None => break,
                Some(Ok((job, result))) => {
                    pending.remove(&job.old_rel);
                    record(&mut renames, &mut summary, &job, result);
                }
                Some(Err(e)) => warn!("Conversion task failed: {}", e),
            },
            _ = &mut interrupt, if !summary.interrupted => {
                warn!("Interrupted, stopping conversions");
                summary.interrupted = true;
                set.abort_all();
            }
        }
    }

    for (rel, source) in pending {
        debug!("Not converted: {:?}", source);
        summary.cancelled += 1;
        renames.hold_back(&rel);
    }

    drop(scratch);
    info!(
        "Conversion: {} converted, {} reused, {} failed, {} cancelled",
        summary.converted,
        summary.reused,
        summary.failures.len(),
        summary.cancelled
    );
    Ok(ConversionOutcome { renames, summary })
}

fn record(
    renames: &mut RenameMap,
    summary: &mut ConversionSummary,
    job: &ConversionJob,
    result: Result<JobResult, ConversionError>,
) {
    match result {
        Ok(done) => {
            match done {
                JobResult::Converted => summary.converted += 1,
                JobResult::Reused => summary.reused += 1,
            }
            if let Err(e) = renames.insert(&job.old_rel, &job.new_rel) {
                warn!("Cannot record rename for {}: {}", job.old_rel, e);
                renames.hold_back(&job.old_rel);
            }
        }
        Err(e) => {
            warn!("Failed to convert {:?}: {}", job.source, e);
            renames.hold_back(&job.old_rel);
            summary.failures.push(FailedConversion {
                path: job.source.clone(),
                error: e.to_string(),
            });
        }
    }
}

async fn convert_one(
    encoder: &dyn Encoder,
    job: &ConversionJob,
    options: &JobOptions,
) -> Result<JobResult, ConversionError> {
    let target_dir = job.target.parent().unwrap_or(Path::new("."));

    let result = if job.target.exists() {
        debug!("Target exists, reusing {:?}", job.target);
        JobResult::Reused
    } else {
        // The target name only appears once the encode is complete
        let part = tempfile::Builder::new()
            .prefix(".pdbpatch-")
            .suffix(".part")
            .tempfile_in(target_dir)?;

        match (&options.strategy, &options.staging) {
            (Strategy::CacheFirst, Some(staging)) => {
                let staged = tempfile::Builder::new()
                    .prefix("pdbpatch-")
                    .suffix(".part")
                    .tempfile_in(staging)?;
                encoder
                    .encode(&job.source, staged.path(), job.mapping.target)
                    .await?;
                tokio::fs::copy(staged.path(), part.path()).await?;
            }
            _ => {
                encoder
                    .encode(&job.source, part.path(), job.mapping.target)
                    .await?;
            }
        }

        part.as_file().sync_all()?;
        part.persist(&job.target)?;
        info!("Converted {:?}", job.target);
        JobResult::Converted
    };

    if !options.keep_originals {
        if let Err(e) = tokio::fs::remove_file(&job.source).await {
            warn!("Converted but could not remove {:?}: {}", job.source, e);
        }
    }

    Ok(result)
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes a marker file, failing for inputs whose name contains `fail_on`
    pub struct MockEncoder {
        pub fail_on: &'static str,
        pub calls: AtomicUsize,
    }

    impl MockEncoder {
        pub fn failing_on(fail_on: &'static str) -> Arc<Self> {
            Arc::new(Self {
                fail_on,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Encoder for MockEncoder {
        fn name(&self) -> &str {
            "mock"
        }

        async fn validate(&self) -> Result<(), ConversionError> {
            Ok(())
        }

        async fn encode(
            &self,
            input: &Path,
            output: &Path,
            target: FileType,
        ) -> Result<(), ConversionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if input.to_string_lossy().contains(self.fail_on) {
                return Err(ConversionError::Failed {
                    status: "exit status: 1".into(),
                    stderr: "Invalid data found when processing input".into(),
                });
            }
            tokio::fs::write(output, format!("{} from {:?}", target, input)).await?;
            Ok(())
        }
    }
}
