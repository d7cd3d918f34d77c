// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rendering of run reports.
//!
//! A [`RunReport`] is read back from storage once a run has finished. It can be rendered as
//! JSON for machines, as a Markdown summary table (appended to a CI step summary), or as
//! colored text for humans.

use crate::{
    errors::WriteReportError,
    helpers::{format_duration, percentage, plural},
};
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use orchestrator_metadata::{RunReport, TestReport, TestStatus};
use owo_colors::{OwoColorize, Style};
use std::{
    fmt,
    fs::OpenOptions,
    io::{self, Write},
};
use swrite::{SWrite, swrite};

/// The environment variable naming the CI step summary file.
pub const STEP_SUMMARY_ENV: &str = "GITHUB_STEP_SUMMARY";

/// The output format of a run report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportFormat {
    /// The raw [`RunReport`] as a single line of JSON.
    Json,

    /// A Markdown summary table.
    Markdown,

    /// Human-readable text.
    Human,
}

impl ReportFormat {
    /// Returns the name of the format.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Markdown => "markdown",
            Self::Human => "human",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a test's last duration compares with its average before that run.
#[derive(Clone, Debug, PartialEq)]
pub struct Trend {
    /// `ema - duration`, in milliseconds. Positive means the test got faster.
    pub delta: f64,

    /// `delta` relative to the average, or `None` if there was no average.
    pub percentage: Option<String>,
}

impl Trend {
    /// Computes the trend of a test report.
    pub fn of(test: &TestReport) -> Self {
        let delta = test.average_duration - test.duration;
        Self {
            delta,
            percentage: percentage(delta, test.average_duration),
        }
    }

    fn icon(&self) -> &'static str {
        if self.delta > 0.0 { "📈" } else { "📉" }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.percentage {
            Some(percentage) => write!(f, "{} {percentage}", self.icon()),
            None => f.write_str("n/a"),
        }
    }
}

/// Aggregated figures over every test of a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary<'a> {
    /// Tests that passed.
    pub passed: usize,
    /// Tests that failed.
    pub failed: usize,
    /// Tests that were claimed but never finished.
    pub ongoing: usize,
    /// Tests that were never claimed.
    pub ready: usize,
    /// The sum of all recorded durations, in milliseconds.
    pub total_duration: f64,
    /// The test with the longest recorded duration.
    pub slowest: Option<&'a TestReport>,
}

impl<'a> RunSummary<'a> {
    /// Aggregates a run report.
    pub fn new(report: &'a RunReport) -> Self {
        let mut summary = Self::default();
        for test in &report.tests {
            match test.status {
                TestStatus::Passed => summary.passed += 1,
                TestStatus::Failed => summary.failed += 1,
                TestStatus::Ongoing => summary.ongoing += 1,
                TestStatus::Ready => summary.ready += 1,
            }
            summary.total_duration += test.duration;
            if test.status.is_resolved()
                && summary
                    .slowest
                    .is_none_or(|slowest| test.duration > slowest.duration)
            {
                summary.slowest = Some(test);
            }
        }
        summary
    }

    /// Returns the number of tests in the run.
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.ongoing + self.ready
    }

    /// Returns the number of tests without a result.
    pub fn unfinished(&self) -> usize {
        self.ongoing + self.ready
    }
}

/// Writes run reports in a given format.
#[derive(Clone, Debug)]
pub struct ReportWriter {
    format: ReportFormat,
    styles: Styles,
}

impl ReportWriter {
    /// Creates a new report writer. `colorize` only affects [`ReportFormat::Human`].
    pub fn new(format: ReportFormat, colorize: bool) -> Self {
        let mut styles = Styles::default();
        if colorize && format == ReportFormat::Human {
            styles.colorize();
        }
        Self { format, styles }
    }

    /// Writes `report` to `writer`.
    pub fn write(&self, report: &RunReport, mut writer: impl Write) -> Result<(), WriteReportError> {
        match self.format {
            ReportFormat::Json => {
                serde_json::to_writer(&mut writer, report)?;
                writeln!(writer)?;
            }
            ReportFormat::Markdown => writer.write_all(render_markdown(report).as_bytes())?,
            ReportFormat::Human => writer.write_all(self.render_human(report).as_bytes())?,
        }
        writer.flush()?;
        Ok(())
    }

    /// Appends the Markdown rendering of `report` to the step summary file at `path`.
    pub fn append_step_summary(report: &RunReport, path: &Utf8Path) -> Result<(), WriteReportError> {
        let map_err = |error: io::Error| WriteReportError::StepSummary {
            path: path.to_owned(),
            error,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(map_err)?;
        file.write_all(render_markdown(report).as_bytes())
            .map_err(map_err)?;
        Ok(())
    }

    fn render_human(&self, report: &RunReport) -> String {
        let styles = &self.styles;
        let mut out = String::new();
        swrite!(
            out,
            "{:>12} {} (history window {})\n",
            "Report".style(styles.heading),
            report.run_id.style(styles.count),
            report.config.history_window,
        );

        for test in &report.tests {
            let (label, style) = match test.status {
                TestStatus::Passed => ("PASS", styles.pass),
                TestStatus::Failed => ("FAIL", styles.fail),
                TestStatus::Ongoing => ("ONGOING", styles.skip),
                TestStatus::Ready => ("NOT RUN", styles.skip),
            };
            swrite!(
                out,
                "{:>12} [{:>9.3}s] {} {}",
                label.style(style),
                test.duration / 1000.0,
                format!("[{}]", test.project).style(styles.project),
                display_title(test),
            );
            if test.status.is_resolved() {
                swrite!(out, " {}", Trend::of(test).style(styles.count));
                if test.fails > 0 {
                    swrite!(out, " ({} recent {})", test.fails, plural::failures_str(test.fails));
                }
            }
            out.push('\n');
        }

        let summary = RunSummary::new(report);
        swrite!(
            out,
            "{:>12} {} {}: {} passed, {} failed",
            "Summary".style(styles.heading),
            summary.total().style(styles.count),
            plural::tests_str(summary.total()),
            summary.passed.style(styles.pass),
            summary.failed.style(styles.fail),
        );
        if summary.unfinished() > 0 {
            swrite!(out, ", {} unfinished", summary.unfinished().style(styles.skip));
        }
        swrite!(out, "; {} in total\n", format_duration(summary.total_duration));
        if let Some(slowest) = summary.slowest {
            swrite!(
                out,
                "{:>12} {} ({})\n",
                "Slowest".style(styles.heading),
                display_title(slowest),
                format_duration(slowest.duration),
            );
        }
        out
    }
}

/// Renders the Markdown summary table.
pub fn render_markdown(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str("## 🏃 Test run summary\n\n");
    out.push_str("<details><summary>Run config</summary>\n\n");
    out.push_str("| | |\n| --- | --- |\n");
    swrite!(out, "| Run id | `{}` |\n", report.run_id);
    swrite!(out, "| History window | {} |\n", report.config.history_window);
    swrite!(out, "| Workers | {} |\n", report.config.worker_limit());
    out.push_str("\n</details>\n\n");

    out.push_str(
        "| | 📁 Project | 📝 Title | ⏱️ Duration | 📊 Trend | ✨ Last successful run | ❌ Fails |\n",
    );
    out.push_str("| --- | --- | --- | --- | --- | --- | --- |\n");
    for test in &report.tests {
        swrite!(
            out,
            "| {} | {} | {} | {} | {} | {} | {} |\n",
            status_icon(test.status),
            escape_cell(&test.project),
            escape_cell(&display_title(test).to_string()),
            format_duration(test.duration),
            Trend::of(test),
            display_timestamp(test.last_successful_run),
            test.fails,
        );
    }

    let summary = RunSummary::new(report);
    swrite!(
        out,
        "\n**{} {}**: {} passed, {} failed",
        summary.total(),
        plural::tests_str(summary.total()),
        summary.passed,
        summary.failed,
    );
    if summary.unfinished() > 0 {
        swrite!(out, ", {} unfinished", summary.unfinished());
    }
    swrite!(out, " in {}", format_duration(summary.total_duration));
    if let Some(slowest) = summary.slowest {
        swrite!(
            out,
            ". Slowest: {} ({})",
            escape_cell(&display_title(slowest).to_string()),
            format_duration(slowest.duration),
        );
    }
    out.push_str("\n\n");
    out
}

fn status_icon(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Passed => "✅",
        TestStatus::Failed => "❌",
        TestStatus::Ongoing | TestStatus::Ready => "⏳",
    }
}

fn display_timestamp(timestamp: Option<DateTime<Utc>>) -> String {
    match timestamp {
        Some(timestamp) => timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "N/A".to_owned(),
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

struct DisplayTitle<'a>(&'a TestReport);

impl fmt::Display for DisplayTitle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.title {
            Some(title) => f.write_str(title),
            None => write!(f, "{}:{}", self.0.file, self.0.position),
        }
    }
}

fn display_title(test: &TestReport) -> DisplayTitle<'_> {
    DisplayTitle(test)
}

#[derive(Clone, Debug, Default)]
struct Styles {
    heading: Style,
    count: Style,
    pass: Style,
    fail: Style,
    skip: Style,
    project: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.heading = Style::new().green().bold();
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
        self.project = Style::new().blue();
    }
}
