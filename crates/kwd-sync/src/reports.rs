//! Per-run report artifacts: summary JSON, markdown brief, parquet exports and their manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use kwd_core::CategorySnapshot;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::calibration::CalibratedMetrics;
use crate::{BatchReport, CategoryRunReport};

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const DEMAND_BRIEF_FILE: &str = "demand_brief.md";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub reports_dir: PathBuf,
    pub manifest: PathBuf,
}

pub fn reports_root(workspace_root: &Path) -> PathBuf {
    workspace_root.join("reports")
}

/// Write `reports/{run_id}/` for a finished batch.
pub async fn write_reports(
    workspace_root: &Path,
    report: &BatchReport,
    snapshots: &[CategorySnapshot],
) -> Result<ReportPaths> {
    let reports_dir = reports_root(workspace_root).join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let keywords_path = reports_dir.join("keywords.parquet");
    let metrics_path = reports_dir.join("metrics.parquet");
    write_keywords_parquet(&keywords_path, snapshots)?;
    write_metrics_parquet(&metrics_path, &report.categories)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("keywords", &reports_dir, &keywords_path)?,
            manifest_entry("metrics", &reports_dir, &metrics_path)?,
        ],
    };
    let manifest_path = reports_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    let mut summary = report.clone();
    summary.reports_dir = Some(reports_dir.display().to_string());
    summary.parquet_manifest = Some(manifest_path.display().to_string());
    let json = serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
    fs::write(reports_dir.join(RUN_SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {RUN_SUMMARY_FILE}"))?;

    fs::write(reports_dir.join(DEMAND_BRIEF_FILE), demand_brief(&summary))
        .await
        .with_context(|| format!("writing {DEMAND_BRIEF_FILE}"))?;

    Ok(ReportPaths {
        reports_dir,
        manifest: manifest_path,
    })
}

pub fn demand_brief(report: &BatchReport) -> String {
    let mut lines = vec![
        "# Keyword Demand Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Resolver: {}", report.resolver),
        format!("- Categories: {}", report.categories.len()),
        String::new(),
        "| Category | Status | Lifecycle | Demand | Readiness | Spread | Partial |".to_string(),
        "|---|---|---|---|---|---|---|".to_string(),
    ];
    for category in &report.categories {
        let lifecycle = category.lifecycle.map(|l| l.as_str()).unwrap_or("-");
        let row = match &category.metrics {
            Some(m) => format!(
                "| {} | {} | {} | {} (raw {:.2}) | {:.2} {} | {:.2} {} | {} |",
                category.category_id,
                category.status.as_str(),
                lifecycle,
                m.display.demand_index.display,
                m.demand_index.raw,
                m.display.readiness_score.value,
                m.display.readiness_score.label,
                m.display.spread_score.value,
                m.display.spread_score.label,
                if m.display.quality.is_partial { "yes" } else { "no" },
            ),
            None => format!(
                "| {} | {} | {} | - | - | - | - |",
                category.category_id,
                category.status.as_str(),
                lifecycle
            ),
        };
        lines.push(row);
    }

    let problems: Vec<&CategoryRunReport> = report
        .categories
        .iter()
        .filter(|c| c.error.is_some())
        .collect();
    if !problems.is_empty() {
        lines.push(String::new());
        lines.push("## Problems".to_string());
        for category in problems {
            lines.push(format!(
                "- {}: {}",
                category.category_id,
                category.error.as_deref().unwrap_or_default()
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Most recent run summaries, newest first. No reports directory means no runs.
pub fn recent_runs(workspace_root: &Path, runs: usize) -> Result<Vec<BatchReport>> {
    let root = reports_root(workspace_root);
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(&root).with_context(|| format!("reading {}", root.display()))? {
        let entry = entry.with_context(|| format!("reading {}", root.display()))?;
        let path = entry.path().join(RUN_SUMMARY_FILE);
        if !path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: BatchReport =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        out.push(summary);
    }
    out.sort_by(|a, b| b.finished_at.cmp(&a.finished_at).then(b.run_id.cmp(&a.run_id)));
    out.truncate(runs.max(1));
    Ok(out)
}

pub fn report_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let mut lines = vec!["# Keyword Demand Runs".to_string(), String::new()];
    for run in recent_runs(&root, runs)? {
        let counts = run.status_counts();
        lines.push(format!("## Run `{}`", run.run_id));
        lines.push(format!("- finished: {}", run.finished_at));
        lines.push(format!("- resolver: {}", run.resolver));
        lines.push(format!(
            "- categories: {} ({})",
            run.categories.len(),
            counts
                .iter()
                .map(|(status, n)| format!("{status}: {n}"))
                .collect::<Vec<_>>()
                .join(", ")
        ));
        if let Some(dir) = &run.reports_dir {
            lines.push(format!("- brief: `{}`", Path::new(dir).join(DEMAND_BRIEF_FILE).display()));
        }
        if let Some(manifest) = &run.parquet_manifest {
            lines.push(format!("- parquet manifest: `{manifest}`"));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_keywords_parquet(path: &Path, snapshots: &[CategorySnapshot]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("category_id", DataType::Utf8, false),
        ArrowField::new("keyword_id", DataType::Utf8, false),
        ArrowField::new("keyword_text", DataType::Utf8, false),
        ArrowField::new("anchor_id", DataType::Utf8, false),
        ArrowField::new("intent_bucket", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("volume", DataType::UInt64, true),
        ArrowField::new("cpc", DataType::Float64, true),
        ArrowField::new("competition", DataType::Float64, true),
        ArrowField::new("active", DataType::Boolean, false),
    ]));

    let rows: Vec<_> = snapshots
        .iter()
        .flat_map(|s| s.rows.iter().map(move |r| (s.category_id.as_str(), r)))
        .collect();

    let category_ids = StringArray::from(rows.iter().map(|(c, _)| Some(*c)).collect::<Vec<_>>());
    let keyword_ids = StringArray::from(
        rows.iter()
            .map(|(_, r)| Some(r.keyword_id.to_string()))
            .collect::<Vec<_>>(),
    );
    let texts = StringArray::from(
        rows.iter()
            .map(|(_, r)| Some(r.keyword_text.as_str()))
            .collect::<Vec<_>>(),
    );
    let anchors = StringArray::from(
        rows.iter()
            .map(|(_, r)| Some(r.anchor_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let intents = StringArray::from(
        rows.iter()
            .map(|(_, r)| Some(format!("{:?}", r.intent_bucket)))
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        rows.iter()
            .map(|(_, r)| Some(format!("{:?}", r.status).to_ascii_uppercase()))
            .collect::<Vec<_>>(),
    );
    let volumes = UInt64Array::from(rows.iter().map(|(_, r)| r.volume).collect::<Vec<_>>());
    let cpcs = Float64Array::from(rows.iter().map(|(_, r)| r.cpc).collect::<Vec<_>>());
    let competition = Float64Array::from(rows.iter().map(|(_, r)| r.competition).collect::<Vec<_>>());
    let active = BooleanArray::from(rows.iter().map(|(_, r)| r.active).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(category_ids),
            Arc::new(keyword_ids),
            Arc::new(texts),
            Arc::new(anchors),
            Arc::new(intents),
            Arc::new(statuses),
            Arc::new(volumes),
            Arc::new(cpcs),
            Arc::new(competition),
            Arc::new(active),
        ],
    )
    .context("building keywords record batch")?;
    write_parquet(path, batch)
}

fn metric_column(
    rows: &[(&CategoryRunReport, &CalibratedMetrics)],
    value: impl Fn(&CalibratedMetrics) -> f64,
) -> Float64Array {
    Float64Array::from(rows.iter().map(|(_, m)| value(m)).collect::<Vec<_>>())
}

fn write_metrics_parquet(path: &Path, categories: &[CategoryRunReport]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("category_id", DataType::Utf8, false),
        ArrowField::new("lifecycle", DataType::Utf8, false),
        ArrowField::new("calibration_policy", DataType::Utf8, false),
        ArrowField::new("demand_index_raw", DataType::Float64, false),
        ArrowField::new("demand_index", DataType::Float64, false),
        ArrowField::new("readiness_raw", DataType::Float64, false),
        ArrowField::new("readiness", DataType::Float64, false),
        ArrowField::new("spread_raw", DataType::Float64, false),
        ArrowField::new("spread", DataType::Float64, false),
        ArrowField::new("buying_intent", DataType::Float64, false),
        ArrowField::new("coverage", DataType::Float64, false),
        ArrowField::new("valid_keywords", DataType::UInt32, false),
        ArrowField::new("is_partial", DataType::Boolean, false),
    ]));

    let rows: Vec<(&CategoryRunReport, &CalibratedMetrics)> = categories
        .iter()
        .filter_map(|c| c.metrics.as_ref().map(|m| (c, m)))
        .collect();

    let category_ids = StringArray::from(
        rows.iter()
            .map(|(c, _)| Some(c.category_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let lifecycles = StringArray::from(
        rows.iter()
            .map(|(_, m)| Some(m.raw.lifecycle.as_str()))
            .collect::<Vec<_>>(),
    );
    let policies = StringArray::from(
        rows.iter()
            .map(|(_, m)| Some(m.policy.as_str()))
            .collect::<Vec<_>>(),
    );
    let demand_raw = metric_column(&rows, |m| m.demand_index.raw);
    let demand = metric_column(&rows, |m| m.demand_index.display);
    let readiness_raw = metric_column(&rows, |m| m.readiness_score.raw);
    let readiness = metric_column(&rows, |m| m.readiness_score.display);
    let spread_raw = metric_column(&rows, |m| m.spread_score.raw);
    let spread = metric_column(&rows, |m| m.spread_score.display);
    let buying = metric_column(&rows, |m| m.display.buying_intent_index.value);
    let coverage = metric_column(&rows, |m| m.raw.inputs.coverage);
    let valid = UInt32Array::from(
        rows.iter()
            .map(|(_, m)| u32::try_from(m.raw.inputs.keyword_count_validated).unwrap_or(u32::MAX))
            .collect::<Vec<_>>(),
    );
    let partial = BooleanArray::from(
        rows.iter()
            .map(|(_, m)| m.display.quality.is_partial)
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(category_ids),
            Arc::new(lifecycles),
            Arc::new(policies),
            Arc::new(demand_raw),
            Arc::new(demand),
            Arc::new(readiness_raw),
            Arc::new(readiness),
            Arc::new(spread_raw),
            Arc::new(spread),
            Arc::new(buying),
            Arc::new(coverage),
            Arc::new(valid),
            Arc::new(partial),
        ],
    )
    .context("building metrics record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}
