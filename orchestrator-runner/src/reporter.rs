// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prints the progress of a shard.
//!
//! The main structure in this module is [`ShardReporter`], which consumes the
//! [`ShardEvent`]s emitted by a [`ShardRunner`](crate::runner::ShardRunner).

use crate::{
    helpers::{DisplayTestItem, format_duration, plural},
    runner::{RunStats, ShardEvent},
};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use orchestrator_metadata::TestItem;
use owo_colors::{OwoColorize, Style};
use std::{
    collections::HashMap,
    io::{self, Write},
    time::Duration,
};
use swrite::{SWrite, swrite};

const SPINNER_TEMPLATE: &str = "{spinner:.yellow} {wide_msg}";
const SUMMARY_TITLE: &str = "Test shard results";

/// Where a [`ShardReporter`] writes its output.
pub enum ReporterOutput<'a> {
    /// Standard output, with a spinner per running test on interactive terminals.
    Terminal,

    /// An in-memory buffer. Never shows spinners.
    Buffer(&'a mut Vec<u8>),
}

/// Shard reporter builder.
#[derive(Debug, Default)]
pub struct ShardReporterBuilder {
    colorize: bool,
    hide_progress: bool,
}

impl ShardReporterBuilder {
    /// Enables colored output.
    pub fn set_colorize(&mut self, colorize: bool) -> &mut Self {
        self.colorize = colorize;
        self
    }

    /// Never shows running-test spinners, even on a terminal.
    pub fn set_hide_progress(&mut self, hide_progress: bool) -> &mut Self {
        self.hide_progress = hide_progress;
        self
    }

    /// Creates a new reporter writing to `output`.
    pub fn build<'a>(&self, output: ReporterOutput<'a>) -> ShardReporter<'a> {
        let mut styles = Styles::default();
        if self.colorize {
            styles.colorize();
        }

        let progress = match &output {
            // CI logs are not terminals even when they claim to be.
            ReporterOutput::Terminal if !self.hide_progress && !is_ci::uncached() => {
                let multi_progress = MultiProgress::new();
                multi_progress.set_draw_target(ProgressDrawTarget::stdout_with_hz(20));
                Some(RunningBars {
                    multi_progress,
                    bars: HashMap::new(),
                })
            }
            ReporterOutput::Terminal | ReporterOutput::Buffer(_) => None,
        };

        ShardReporter {
            output,
            styles,
            progress,
            passed: 0,
            failed_tests: Vec::new(),
        }
    }
}

/// Prints each finished test, the tests currently running, and a summary once the shard ends.
pub struct ShardReporter<'a> {
    output: ReporterOutput<'a>,
    styles: Styles,
    progress: Option<RunningBars>,
    passed: usize,
    failed_tests: Vec<String>,
}

impl ShardReporter<'_> {
    /// Reports an event.
    pub fn report_event(&mut self, event: ShardEvent<'_>) -> io::Result<()> {
        match event {
            ShardEvent::ShardStarted { run_id, config } => {
                let mut line = String::new();
                swrite!(
                    line,
                    "{:>12} run {} ({}, {} {})",
                    "Starting".style(self.styles.heading),
                    run_id.style(self.styles.count),
                    config.status,
                    config.worker_limit().style(self.styles.count),
                    if config.worker_limit() == 1 { "worker" } else { "workers" },
                );
                self.write_line(&line)
            }
            ShardEvent::TestStarted { item, .. } => {
                if let Some(progress) = &mut self.progress {
                    progress.add(item);
                }
                Ok(())
            }
            ShardEvent::TestFinished {
                item,
                outcome,
                elapsed,
                ..
            } => {
                if let Some(progress) = &mut self.progress {
                    progress.remove(item);
                }
                let key = DisplayTestItem(item).to_string();
                let line = if outcome.passed {
                    self.passed += 1;
                    format!(
                        "{} {key} {}",
                        "✓".style(self.styles.pass),
                        DisplayElapsed(elapsed).style(self.styles.count),
                    )
                } else {
                    let line = format!(
                        "{} {key} {}",
                        "✗".style(self.styles.fail),
                        DisplayElapsed(elapsed).style(self.styles.count),
                    );
                    self.failed_tests.push(key);
                    line
                };
                self.write_line(&line)
            }
            ShardEvent::ShardFinished { stats, elapsed } => {
                if let Some(progress) = self.progress.take() {
                    progress.finish_and_clear();
                }
                let summary = self.summary(stats, elapsed);
                self.write_line(&summary)
            }
        }
    }

    fn summary(&self, stats: &RunStats, elapsed: Duration) -> String {
        let mut lines: Vec<(String, Style)> = vec![
            (
                format!(
                    "Finished {} {} in {}",
                    stats.finished_count(),
                    plural::tests_str(stats.finished_count()),
                    format_duration(elapsed.as_millis() as f64),
                ),
                self.styles.count,
            ),
            (format!("Passed: {}", self.passed), self.styles.pass),
            (format!("Failed: {}", self.failed_tests.len()), self.styles.fail),
        ];
        lines.extend(
            self.failed_tests
                .iter()
                .map(|key| (format!("  - {key}"), self.styles.fail)),
        );
        draw_box(SUMMARY_TITLE, &lines, self.styles.border)
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        match &mut self.output {
            ReporterOutput::Terminal => match &self.progress {
                // Print above the spinners.
                Some(progress) => progress
                    .multi_progress
                    .suspend(|| writeln!(io::stdout(), "{line}")),
                None => writeln!(io::stdout(), "{line}"),
            },
            ReporterOutput::Buffer(buf) => writeln!(buf, "{line}"),
        }
    }
}

struct RunningBars {
    multi_progress: MultiProgress,
    bars: HashMap<u32, ProgressBar>,
}

impl RunningBars {
    fn add(&mut self, item: &TestItem) {
        let bar = self.multi_progress.add(ProgressBar::new_spinner());
        if let Ok(style) = ProgressStyle::default_spinner().template(SPINNER_TEMPLATE) {
            bar.set_style(style);
        }
        bar.set_message(DisplayTestItem(item).to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        self.bars.insert(item.order, bar);
    }

    fn remove(&mut self, item: &TestItem) {
        if let Some(bar) = self.bars.remove(&item.order) {
            bar.finish_and_clear();
            self.multi_progress.remove(&bar);
        }
    }

    fn finish_and_clear(self) {
        for bar in self.bars.into_values() {
            bar.finish_and_clear();
        }
        // Errors only come from a terminal that went away.
        let _ = self.multi_progress.clear();
    }
}

/// Draws `lines` inside a rounded box with `title` set into the top border.
fn draw_box(title: &str, lines: &[(String, Style)], border: Style) -> String {
    const PADDING: usize = 2;
    let content_width = lines
        .iter()
        .map(|(line, _)| line.chars().count())
        .chain(std::iter::once(title.chars().count() + 2))
        .max()
        .unwrap_or(0);
    let inner = content_width + 2 * PADDING;

    let mut out = String::new();
    let top_fill = "─".repeat(inner - title.chars().count() - 3);
    swrite!(
        out,
        "{}",
        format!("╭─ {title} {top_fill}╮").style(border)
    );
    let blank = format!("{}{}{}", "│".style(border), " ".repeat(inner), "│".style(border));
    swrite!(out, "\n{blank}");
    for (line, style) in lines {
        let pad = content_width - line.chars().count() + PADDING;
        swrite!(
            out,
            "\n{}{}{}{}{}",
            "│".style(border),
            " ".repeat(PADDING),
            line.style(*style),
            " ".repeat(pad),
            "│".style(border),
        );
    }
    swrite!(out, "\n{blank}");
    swrite!(
        out,
        "\n{}",
        format!("╰{}╯", "─".repeat(inner)).style(border)
    );
    out
}

struct DisplayElapsed(Duration);

impl std::fmt::Display for DisplayElapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.3}s)", self.0.as_secs_f64())
    }
}

#[derive(Debug, Default)]
struct Styles {
    heading: Style,
    count: Style,
    pass: Style,
    fail: Style,
    border: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.heading = Style::new().green().bold();
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.border = Style::new().yellow();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionOutcome;
    use chrono::Utc;
    use indoc::indoc;
    use orchestrator_metadata::{
        EngineTestStatus, RunConfig, RunStatus, RunUuid, TestIdentity, TestPosition,
        TestReportResult,
    };
    use pretty_assertions::assert_eq;

    fn item(file: &str, order: u32) -> TestItem {
        TestItem {
            file: file.into(),
            position: TestPosition::new(3, 1),
            project: "chromium".to_owned(),
            order,
            timeout: 1000,
            identity: TestIdentity::new(format!("chromium > {file} > t")),
        }
    }

    fn outcome(passed: bool) -> ExecutionOutcome {
        ExecutionOutcome {
            passed,
            result: TestReportResult {
                status: if passed {
                    EngineTestStatus::Passed
                } else {
                    EngineTestStatus::Failed
                },
                duration: 10.0,
                title: "t".to_owned(),
                annotations: Vec::new(),
                error: None,
                tests: Vec::new(),
            },
        }
    }

    #[test]
    fn plain_output() {
        let mut buf = Vec::new();
        let mut reporter = ShardReporterBuilder::default().build(ReporterOutput::Buffer(&mut buf));
        let config = RunConfig {
            workers: 2,
            projects: Vec::new(),
            config_file: None,
            args: Vec::new(),
            history_window: 10,
            status: RunStatus::Run,
            updated: Utc::now(),
        };
        let run_id = RunUuid::new_v4();
        let a = item("a.spec", 1);
        let b = item("b.spec", 2);

        reporter
            .report_event(ShardEvent::ShardStarted {
                run_id,
                config: &config,
            })
            .unwrap();
        for (item, passed) in [(&a, true), (&b, false)] {
            reporter
                .report_event(ShardEvent::TestStarted { item, running: 1 })
                .unwrap();
            reporter
                .report_event(ShardEvent::TestFinished {
                    item,
                    outcome: &outcome(passed),
                    elapsed: Duration::from_millis(1500),
                    running: 0,
                })
                .unwrap();
        }
        let stats = RunStats {
            claimed: 2,
            passed: 1,
            failed: 1,
        };
        reporter
            .report_event(ShardEvent::ShardFinished {
                stats: &stats,
                elapsed: Duration::from_secs(3),
            })
            .unwrap();
        drop(reporter);

        let output = String::from_utf8(buf).unwrap();
        let expected = format!(
            indoc! {"
                    Starting run {} (run, 2 workers)
                ✓ [chromium] a.spec:3:1 (1.500s)
                ✗ [chromium] b.spec:3:1 (1.500s)
                ╭─ Test shard results ─────────╮
                │                              │
                │  Finished 2 tests in 3 secs  │
                │  Passed: 1                   │
                │  Failed: 1                   │
                │    - [chromium] b.spec:3:1   │
                │                              │
                ╰──────────────────────────────╯
            "},
            run_id
        );
        assert_eq!(output, expected);
    }

    #[test]
    fn box_fits_title() {
        let drawn = draw_box(SUMMARY_TITLE, &[("x".to_owned(), Style::new())], Style::new());
        let widths: Vec<_> = drawn.lines().map(|l| l.chars().count()).collect();
        assert!(
            widths.iter().all(|w| *w == widths[0]),
            "all rows have the same width: {drawn}"
        );
    }
}
