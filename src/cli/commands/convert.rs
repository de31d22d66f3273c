//! Local conversion command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::Settings;
use crate::fetch::HttpFetcher;
use crate::models::Stage;
use crate::services::{new_job_id, Pipeline};

/// Convert a workbook on disk, rendering progress in the terminal.
pub async fn cmd_convert(
    settings: &Settings,
    input: &Path,
    output: Option<PathBuf>,
    concurrency: Option<usize>,
) -> anyhow::Result<()> {
    if !input.is_file() {
        anyhow::bail!("Input file not found: {}", input.display());
    }
    let output = output.unwrap_or_else(|| default_output_path(input));

    let mut settings = settings.clone();
    if let Some(concurrency) = concurrency {
        settings.concurrency = concurrency;
    }

    let transport = HttpFetcher::new(settings.request_timeout(), Some(&settings.user_agent))?;
    let pipeline = Pipeline::from_settings(&settings, Arc::new(transport));
    let job_id = new_job_id();

    println!(
        "{} Converting {} -> {}",
        style("→").cyan(),
        input.display(),
        output.display()
    );

    let progress = ProgressBar::new(100);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:30.cyan/blue}] {pos:>3}% {wide_msg}")?
            .progress_chars("█▓░"),
    );

    // Render bus events until the pipeline finishes
    let mut events = pipeline.bus().subscribe(&job_id);
    let bar = progress.clone();
    let event_handler = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event.stage {
                Stage::Connected => {}
                Stage::Complete | Stage::Error => {
                    bar.finish_and_clear();
                    break;
                }
                _ => {
                    bar.set_position(u64::from(event.percentage));
                    bar.set_message(event.message);
                }
            }
        }
    });

    let result = pipeline.run_file(&job_id, input, &output).await;
    pipeline.bus().close_subscribers(&job_id);
    let _ = event_handler.await;
    progress.finish_and_clear();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            eprintln!("{} Conversion failed: {}", style("✗").red(), e);
            return Err(e.into());
        }
    };

    println!(
        "{} Embedded {} images ({} links, {} distinct urls)",
        style("✓").green(),
        report.embedded,
        report.references,
        report.distinct_urls
    );
    if report.skipped > 0 {
        println!(
            "  {} {} cells kept their URL: image could not be embedded",
            style("!").yellow(),
            report.skipped
        );
    }
    if !report.failed_urls.is_empty() {
        println!(
            "  {} {} urls could not be downloaded:",
            style("!").yellow(),
            report.failed_urls.len()
        );
        for url in &report.failed_urls {
            println!("    {}", style(url).dim());
        }
    }
    println!("  {} Saved {}", style("→").dim(), output.display());

    Ok(())
}

/// `<dir>/<stem>_with_images.xlsx` next to the input.
fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    input.with_file_name(format!("{}_with_images.xlsx", stem))
}
