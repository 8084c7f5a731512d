//! Run pipeline: convert, then patch databases and analysis files
//!
//! The stages only share the rename map. Both patchers run together on
//! blocking threads once conversion has finished.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};

use pdbpatch_core::{
    patch_analysis_files, patch_databases, ExportLayout, RenameMap, StageSummary, WriteOptions,
};

use crate::config::{RunConfig, Stages};
use crate::convert::{convert_all, discover_converted, plan_jobs, ConversionSummary, Encoder};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub root: PathBuf,
    pub stages: Stages,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion: Option<ConversionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub databases: Option<StageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<StageSummary>,
}

impl RunSummary {
    fn new(config: &RunConfig) -> Self {
        Self {
            root: config.root.clone(),
            stages: config.stages,
            conversion: None,
            databases: None,
            analysis: None,
        }
    }

    /// False when interrupted, or when a stage had work and none of it
    /// succeeded
    pub fn succeeded(&self) -> bool {
        if let Some(conversion) = &self.conversion {
            if conversion.interrupted {
                return false;
            }
            if conversion.planned > 0 && conversion.succeeded() == 0 {
                return false;
            }
        }
        [&self.databases, &self.analysis]
            .into_iter()
            .flatten()
            .all(|stage| stage.failed == 0 || stage.patched + stage.skipped > 0)
    }

    pub fn log(&self) {
        if let Some(c) = &self.conversion {
            info!(
                "Conversion: {} converted, {} reused, {} failed, {} cancelled",
                c.converted,
                c.reused,
                c.failures.len(),
                c.cancelled
            );
            for failure in &c.failures {
                warn!("  {:?}: {}", failure.path, failure.error);
            }
        }
        for (name, stage) in [("Databases", &self.databases), ("Analysis files", &self.analysis)] {
            if let Some(stage) = stage {
                info!(
                    "{}: {} patched, {} skipped, {} failed",
                    name, stage.patched, stage.skipped, stage.failed
                );
                for failure in stage.failures() {
                    warn!("  {:?}: {}", failure.path, failure.detail);
                }
            }
        }
    }
}

/// Run every requested stage. Errors are whole-run failures; per-file
/// problems end up in the summary.
pub async fn run<F>(
    config: &RunConfig,
    encoder: Arc<dyn Encoder>,
    interrupt: F,
) -> anyhow::Result<RunSummary>
where
    F: Future<Output = ()>,
{
    let layout = ExportLayout::discover(&config.root)?;
    let mut summary = RunSummary::new(config);

    // A missing database must stop the run before any audio is touched
    let databases = if config.stages.patches() {
        Some(layout.database_files()?)
    } else {
        None
    };

    let renames = if config.stages.converts() {
        let jobs = plan_jobs(&layout, &config.policy);
        if !jobs.is_empty() {
            encoder
                .validate()
                .await
                .with_context(|| format!("{} is required to convert audio", encoder.name()))?;
        }
        let outcome = convert_all(jobs, config, encoder, interrupt).await?;
        let interrupted = outcome.summary.interrupted;
        summary.conversion = Some(outcome.summary);
        if interrupted {
            warn!("Conversion interrupted, databases left untouched; run again to finish");
            return Ok(summary);
        }

        // Targets from earlier runs whose sources are already gone still
        // need their references patched
        let mut renames = discover_converted(&layout, &config.policy);
        for path in outcome.renames.held_back() {
            renames.hold_back(path);
        }
        renames
    } else {
        discover_converted(&layout, &config.policy)
    };

    let Some(databases) = databases else {
        return Ok(summary);
    };
    if renames.is_empty() {
        info!("No converted tracks, nothing to patch");
        return Ok(summary);
    }

    let (db, anlz) = patch_all(layout, databases, renames, config.write).await?;
    summary.databases = Some(db);
    summary.analysis = Some(anlz);
    Ok(summary)
}

async fn patch_all(
    layout: ExportLayout,
    databases: Vec<PathBuf>,
    renames: RenameMap,
    write: WriteOptions,
) -> anyhow::Result<(StageSummary, StageSummary)> {
    let renames = Arc::new(renames);
    info!(
        "Patching {} databases for {} converted tracks",
        databases.len(),
        renames.len()
    );

    let db_task = {
        let renames = renames.clone();
        tokio::task::spawn_blocking(move || patch_databases(&databases, &renames, &write))
    };
    let anlz_task = tokio::task::spawn_blocking(move || {
        let files = layout.analysis_files();
        patch_analysis_files(&files, &renames)
    });

    let (db, anlz) = tokio::try_join!(db_task, anlz_task).context("patch task panicked")?;
    Ok((db, anlz))
}
