//! Report rendering.

use comfy_table::{presets::UTF8_FULL_CONDENSED, ContentArrangement, Table};
use serde::Serialize;

use strata_core::traits::CollectionInfo;
use strata_core::RunReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

/// Store size around a run. Either side is missing when counting failed.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreSize {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points_before: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points_after: Option<u64>,
}

#[derive(Serialize)]
struct ConsolidateOutput<'a> {
    report: &'a RunReport,
    store: StoreSize,
}

pub fn render_report(
    report: &RunReport,
    store: StoreSize,
    format: OutputFormat,
    verbose: bool,
) -> serde_json::Result<String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(&ConsolidateOutput { report, store }),
        OutputFormat::Table if verbose => Ok(verbose_report(report, store)),
        OutputFormat::Table => Ok(report.summary()),
    }
}

fn verbose_report(report: &RunReport, store: StoreSize) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Run {} ({}) on '{}': {} in {} ms\n\n",
        report.run_id,
        report.mode,
        report.collection,
        report.status,
        report.duration_ms()
    ));

    let mut levels = Table::new();
    levels
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header([
            "Level",
            "Pages",
            "Scanned",
            "Skipped",
            "Sets",
            "Evaluated",
            "Merged",
            "Superseded",
            "Kept",
            "Deferred",
            "Errors",
        ]);
    for level in &report.levels {
        levels.add_row([
            level.level.to_string(),
            level.pages.to_string(),
            level.fragments_scanned.to_string(),
            level.skipped.to_string(),
            level.candidate_sets.to_string(),
            level.candidates_evaluated.to_string(),
            level.merged.to_string(),
            level.superseded.to_string(),
            level.kept_separate.to_string(),
            level.deferred.len().to_string(),
            level.errors.len().to_string(),
        ]);
    }
    out.push_str(&format!("{levels}\n"));

    let planned: Vec<_> = report.planned().collect();
    if !planned.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(["Set", "Members", "Target level", "Content"]);
        for plan in planned {
            table.add_row([
                plan.set_id.clone(),
                plan.member_ids.join(", "),
                plan.target_level.to_string(),
                plan.content.clone(),
            ]);
        }
        out.push_str(&format!("\nPlanned merges\n{table}\n"));
    }

    if report.error_count() > 0 {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(["Kind", "Level", "Set", "Fragments", "Message"]);
        for error in report.errors() {
            table.add_row([
                error.kind.to_string(),
                error.level.map(|l| l.to_string()).unwrap_or_default(),
                error.set_id.clone().unwrap_or_default(),
                error.fragment_ids.join(", "),
                error.message.clone(),
            ]);
        }
        out.push_str(&format!("\nErrors\n{table}\n"));
    }

    if let Some(failure) = &report.failure {
        out.push_str(&format!("\nRun failed: {failure}\n"));
    }
    if let (Some(before), Some(after)) = (store.points_before, store.points_after) {
        out.push_str(&format!("\nStore: {before} points before, {after} after\n"));
    }
    out.push_str(&format!("\n{}", report.summary()));
    out
}

pub fn render_check(info: &CollectionInfo, format: OutputFormat) -> serde_json::Result<String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
            "collection": info.name,
            "points": info.vector_count,
            "dimension": info.dimension,
            "distance": info.distance,
        })),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(["Collection", "Points", "Dimension", "Distance"]);
            table.add_row([
                info.name.clone(),
                info.vector_count.to_string(),
                info.dimension.to_string(),
                format!("{:?}", info.distance),
            ]);
            Ok(table.to_string())
        }
    }
}
