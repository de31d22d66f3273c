//! End-to-end conversion of one workbook.
//!
//! Phases: read -> scan -> download -> embed -> save. Every phase transition
//! publishes one progress event; `complete` or `error` closes the job.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use super::download::DownloadScheduler;
use super::embed::embed_images;
use super::progress::ProgressBus;
use super::scan::scan_document;
use crate::config::Settings;
use crate::fetch::{Fetch, ResourceFetcher};
use crate::models::Stage;
use crate::workbook::{self, WorkbookError};

/// Document-level failures. These abort the job.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Workbook(#[from] WorkbookError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What a pipeline run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Cells holding an image URL.
    pub references: usize,
    pub distinct_urls: usize,
    /// URLs downloaded successfully.
    pub fetched: usize,
    /// URLs that exhausted their retries.
    pub failed_urls: Vec<String>,
    pub embedded: usize,
    /// References that were fetched but could not be embedded.
    pub skipped: usize,
}

/// Sequences the conversion phases and reports progress.
#[derive(Clone)]
pub struct Pipeline {
    scheduler: DownloadScheduler,
    bus: ProgressBus,
}

impl Pipeline {
    pub fn new(scheduler: DownloadScheduler, bus: ProgressBus) -> Self {
        Self { scheduler, bus }
    }

    /// Build a pipeline around `transport` using the retry and concurrency
    /// settings.
    pub fn from_settings(settings: &Settings, transport: Arc<dyn Fetch>) -> Self {
        let fetcher = ResourceFetcher::new(transport, settings.fetch_policy());
        Self::new(
            DownloadScheduler::new(fetcher, settings.concurrency),
            ProgressBus::new(),
        )
    }

    pub fn bus(&self) -> &ProgressBus {
        &self.bus
    }

    /// Convert workbook bytes, returning the edited workbook.
    ///
    /// Only cells whose image was embedded change; without any, the input is
    /// returned as is.
    ///
    /// Publishes every stage up to and including `saving`; the caller
    /// publishes the terminal event once the output is stored.
    pub async fn process(
        &self,
        job_id: &str,
        input: Vec<u8>,
    ) -> Result<(Vec<u8>, PipelineReport), PipelineError> {
        let (input, mut document) = tokio::task::spawn_blocking(move || {
            let document = workbook::read_workbook(&input)?;
            Ok::<_, WorkbookError>((input, document))
        })
        .await??;
        self.bus.publish(job_id, Stage::Reading, "file read", 10);

        let index = scan_document(&document);
        let mut report = PipelineReport {
            references: index.reference_count(),
            distinct_urls: index.len(),
            ..Default::default()
        };
        self.bus.publish(
            job_id,
            Stage::Scanning,
            format!("found {} image links", report.references),
            20,
        );

        if !index.is_empty() {
            let urls: Vec<&str> = index.urls().collect();
            let results = self.scheduler.download_all(job_id, &urls, &self.bus).await;

            report.fetched = results.iter().filter(|r| r.is_success()).count();
            report.failed_urls = results
                .iter()
                .filter(|r| !r.is_success())
                .map(|r| r.url.clone())
                .collect();

            let embedded = embed_images(job_id, &mut document, &index, &results, &self.bus);
            report.embedded = embedded.embedded;
            report.skipped = embedded.skipped;
        }

        self.bus.publish(job_id, Stage::Saving, "saving file", 95);
        let output = if document.image_count() == 0 {
            input
        } else {
            tokio::task::spawn_blocking(move || workbook::save_workbook(&input, &document))
                .await??
        };

        Ok((output, report))
    }

    /// Convert `input` into `output` and publish the terminal event.
    ///
    /// The output is written atomically; on failure no output file is left
    /// behind and an `error` event is published.
    pub async fn run_file(
        &self,
        job_id: &str,
        input: &Path,
        output: &Path,
    ) -> Result<PipelineReport, PipelineError> {
        let result = self.convert_file(job_id, input, output).await;
        self.finish(job_id, result)
    }

    /// Convert `input` into `output` without publishing a terminal event.
    pub async fn convert_file(
        &self,
        job_id: &str,
        input: &Path,
        output: &Path,
    ) -> Result<PipelineReport, PipelineError> {
        let bytes = tokio::fs::read(input).await?;
        let (converted, report) = self.process(job_id, bytes).await?;

        let output = output.to_path_buf();
        tokio::task::spawn_blocking(move || write_atomic(&output, &converted)).await??;
        Ok(report)
    }

    /// Log the outcome of a run and publish `complete` or `error`.
    pub fn finish(
        &self,
        job_id: &str,
        result: Result<PipelineReport, PipelineError>,
    ) -> Result<PipelineReport, PipelineError> {
        match result {
            Ok(report) => {
                info!(
                    "Job {} complete: {} references, {}/{} urls fetched, {} embedded, {} skipped",
                    job_id,
                    report.references,
                    report.fetched,
                    report.distinct_urls,
                    report.embedded,
                    report.skipped
                );
                if !report.failed_urls.is_empty() {
                    warn!(
                        "Job {}: {} image urls could not be downloaded",
                        job_id,
                        report.failed_urls.len()
                    );
                }
                self.bus
                    .publish(job_id, Stage::Complete, "processing complete", 100);
                Ok(report)
            }
            Err(e) => {
                error!("Job {} failed: {}", job_id, e);
                self.bus.publish(
                    job_id,
                    Stage::Error,
                    format!("processing failed: {}", e),
                    0,
                );
                Err(e)
            }
        }
    }
}

/// Write via a temp file in the target directory, then rename into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::{quick_policy, ScriptedFetch};
    use crate::models::{CellValue, Document, ProgressEvent, Sheet};
    use crate::services::progress::Subscription;
    use calamine::{open_workbook_from_rs, Data, Reader as _, Xlsx};
    use rust_xlsxwriter::{Format, Workbook};

    use crate::workbook::{build_workbook, read_workbook, TINY_PNG};

    const GOOD: &str = "https://img.example.com/good.png";
    const DEAD: &str = "https://img.example.com/dead.jpg";

    fn pipeline(transport: ScriptedFetch) -> (Pipeline, Arc<ScriptedFetch>) {
        let transport = Arc::new(transport);
        let fetcher = ResourceFetcher::new(transport.clone(), quick_policy());
        let pipeline = Pipeline::new(DownloadScheduler::new(fetcher, 10), ProgressBus::new());
        (pipeline, transport)
    }

    fn workbook_bytes(cells: &[(u32, u32, CellValue)]) -> Vec<u8> {
        let mut sheet = Sheet::new("Sheet1");
        for (row, col, value) in cells {
            sheet.set_value(*row, *col, value.clone());
        }
        let mut doc = Document::new();
        doc.push_sheet(sheet);
        build_workbook(&doc)
    }

    /// A date-formatted cell, a formula and a merged range, plus `link` in A4
    /// when given.
    fn formatted_workbook(link: Option<&str>) -> Vec<u8> {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        let date = Format::new().set_num_format("yyyy-mm-dd");
        sheet.write_number_with_format(0, 0, 45292.0, &date).unwrap();
        sheet.write_number(0, 1, 4.0).unwrap();
        sheet.write_formula(0, 2, "=B1*3").unwrap();
        sheet.merge_range(2, 0, 2, 3, "Summary", &Format::new()).unwrap();
        if let Some(link) = link {
            sheet.write_string(3, 0, link).unwrap();
        }
        workbook.save_to_buffer().unwrap()
    }

    fn assert_formatting_survives(output: &[u8]) {
        let mut xlsx: Xlsx<_> = open_workbook_from_rs(std::io::Cursor::new(output)).unwrap();
        let values = xlsx.worksheet_range("Sheet1").unwrap();
        assert!(matches!(values.get_value((0, 0)), Some(Data::DateTime(_))));
        let formulas = xlsx.worksheet_formula("Sheet1").unwrap();
        assert_eq!(formulas.get_value((0, 2)).map(String::as_str), Some("B1*3"));
        xlsx.load_merged_regions().unwrap();
        let merged = xlsx.merged_regions_by_sheet("Sheet1");
        assert_eq!(merged.len(), 1);
        assert_eq!((merged[0].2.start, merged[0].2.end), ((2, 0), (2, 3)));
    }

    async fn drain(mut sub: Subscription) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = sub.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_document_without_links_is_unchanged() {
        let (pipeline, transport) = pipeline(ScriptedFetch::new());
        let input = workbook_bytes(&[
            (1, 1, CellValue::Text("name".into())),
            (2, 1, CellValue::Number(3.0)),
            (2, 2, CellValue::Text("not a link".into())),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let (in_path, out_path) = (dir.path().join("in.xlsx"), dir.path().join("out.xlsx"));
        std::fs::write(&in_path, &input).unwrap();
        let sub = pipeline.bus().subscribe("job");

        let report = pipeline.run_file("job", &in_path, &out_path).await.unwrap();
        pipeline.bus().close_subscribers("job");

        assert_eq!(report, PipelineReport::default());
        assert_eq!(
            transport
                .total_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        assert_eq!(std::fs::read(&out_path).unwrap(), input);

        let events = drain(sub).await;
        let stages: Vec<Stage> = events.iter().map(|e| e.stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::Connected,
                Stage::Reading,
                Stage::Scanning,
                Stage::Saving,
                Stage::Complete
            ]
        );
        assert_eq!(events.last().unwrap().percentage, 100);
    }

    #[tokio::test]
    async fn test_zero_link_job_keeps_formatting_formulas_and_merges() {
        let (pipeline, _) = pipeline(ScriptedFetch::new());
        let input = formatted_workbook(None);

        let (output, report) = pipeline.process("job", input.clone()).await.unwrap();

        assert_eq!(report.references, 0);
        assert_eq!(output, input);
        assert_formatting_survives(&output);
    }

    #[tokio::test]
    async fn test_image_job_keeps_formatting_formulas_and_merges() {
        let (pipeline, _) = pipeline(ScriptedFetch::new().with_body(GOOD, TINY_PNG));
        let input = formatted_workbook(Some(GOOD));

        let (output, report) = pipeline.process("job", input).await.unwrap();

        assert_eq!(report.embedded, 1);
        assert_formatting_survives(&output);
        let doc = read_workbook(&output).unwrap();
        assert!(doc.sheets[0].cell(4, 1).is_none());
        assert_eq!(
            doc.sheets[0].cell(3, 1).unwrap().value.as_text(),
            Some("Summary")
        );
    }

    #[tokio::test]
    async fn test_partial_failure_still_completes() {
        let (pipeline, transport) = pipeline(ScriptedFetch::new().with_body(GOOD, TINY_PNG));
        let input = workbook_bytes(&[
            (1, 1, CellValue::Text(GOOD.into())),
            (2, 1, CellValue::Text(DEAD.into())),
            (3, 1, CellValue::Text(GOOD.into())),
            (4, 1, CellValue::Text(DEAD.into())),
        ]);
        let sub = pipeline.bus().subscribe("job");

        let (output, report) = pipeline.process("job", input).await.unwrap();
        pipeline.bus().close_subscribers("job");

        assert_eq!(report.references, 4);
        assert_eq!(report.distinct_urls, 2);
        assert_eq!(report.fetched, 1);
        assert_eq!(report.failed_urls, vec![DEAD.to_string()]);
        assert_eq!(report.embedded, 2);
        assert_eq!(transport.calls_for(GOOD), 1);
        assert_eq!(transport.calls_for(DEAD), 3);

        let doc = read_workbook(&output).unwrap();
        let sheet = &doc.sheets[0];
        assert!(sheet.cell(1, 1).is_none());
        assert!(sheet.cell(3, 1).is_none());
        assert_eq!(sheet.cell(2, 1).unwrap().value.as_text(), Some(DEAD));
        assert_eq!(sheet.cell(4, 1).unwrap().value.as_text(), Some(DEAD));

        let events = drain(sub).await;
        assert!(events[1..]
            .windows(2)
            .all(|w| w[0].percentage <= w[1].percentage));
        assert_eq!(events[2].message, "found 4 image links");
        assert_eq!(events.last().unwrap().stage, Stage::Saving);
    }

    #[tokio::test]
    async fn test_unreadable_input_reports_error_without_output() {
        let (pipeline, _) = pipeline(ScriptedFetch::new());
        let dir = tempfile::tempdir().unwrap();
        let (in_path, out_path) = (dir.path().join("in.xlsx"), dir.path().join("out.xlsx"));
        std::fs::write(&in_path, b"this is not a workbook").unwrap();

        let err = pipeline
            .run_file("job", &in_path, &out_path)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Workbook(_)));
        assert!(!out_path.exists());
        let latest = pipeline.bus().latest("job").unwrap();
        assert_eq!(latest.stage, Stage::Error);
        assert_eq!(latest.percentage, 0);
        assert!(latest.message.starts_with("processing failed"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_input_is_an_io_error() {
        let (pipeline, _) = pipeline(ScriptedFetch::new());
        let dir = tempfile::tempdir().unwrap();

        let err = pipeline
            .run_file("job", &dir.path().join("nope.xlsx"), &dir.path().join("out.xlsx"))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Io(_)));
        assert_eq!(pipeline.bus().latest("job").unwrap().stage, Stage::Error);
    }
}
