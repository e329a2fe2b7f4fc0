//! Console reporter
//!
//! Prints one line per finished test attempt and a summary box at the end,
//! or the same information as JSON lines.

use serde::Serialize;
use std::io::Write;

use super::{Reporter, RunStatus, RunSummary};
use crate::config::FullConfig;
use crate::models::{TestCase, TestError, TestResult, TestStatus};

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Line,
    Json,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "line" | "list" => Some(OutputFormat::Line),
            "json" => Some(OutputFormat::Json),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TestEndLine<'a> {
    id: &'a str,
    title: String,
    retry: u32,
    status: TestStatus,
    duration_ms: u64,
    errors: &'a [TestError],
}

struct Failure {
    title: String,
    retry: u32,
    errors: Vec<TestError>,
}

pub struct LineReporter {
    format: OutputFormat,
    colorize: bool,
    show_output: bool,
    out: Box<dyn Write + Send>,
    total: usize,
    finished: usize,
    failures: Vec<Failure>,
    errors: Vec<TestError>,
}

impl LineReporter {
    pub fn new(format: OutputFormat) -> Self {
        Self::with_writer(format, Box::new(std::io::stdout()))
    }

    pub fn with_writer(format: OutputFormat, out: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            colorize: true,
            show_output: false,
            out,
            total: 0,
            finished: 0,
            failures: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    /// Echo test stdout/stderr as it arrives.
    pub fn show_output(mut self) -> Self {
        self.show_output = true;
        self
    }

    fn write(&mut self, text: &str) {
        // Reporting must never abort the run.
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
    }

    fn paint(&self, text: &str, color: &str) -> String {
        if self.colorize {
            format!("\x1b[{color}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    fn status_str(&self, test: &TestCase, result: &TestResult) -> String {
        let label = format!("{} {:>11}", result.status.symbol(), result.status.to_string());
        let color = match result.status {
            TestStatus::Skipped => "33",
            TestStatus::Interrupted => "90",
            status if status == test.expected_status => "32",
            _ => "31",
        };
        self.paint(&label, color)
    }

    fn format_test_end(&self, test: &TestCase, result: &TestResult) -> String {
        let retry = if result.retry > 0 {
            format!(" (retry #{})", result.retry)
        } else {
            String::new()
        };
        format!(
            "{} [{:>3}/{:<3}] {} › {}{} [{:>6}ms]\n",
            self.status_str(test, result),
            self.finished,
            self.total,
            test.location,
            test.full_title(),
            retry,
            result.duration_ms
        )
    }

    fn format_summary_table(&self, summary: &RunSummary) -> String {
        let mut output = String::new();

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        let status = match summary.status {
            RunStatus::Passed => self.paint("PASSED", "32"),
            RunStatus::Failed => self.paint("FAILED", "31"),
        };
        output.push_str(&format!("║  Run {}{:50}║\n", status, ""));
        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");

        let unexpected = if summary.unexpected > 0 {
            self.paint(&format!("{:3}", summary.unexpected), "31")
        } else {
            format!("{:3}", summary.unexpected)
        };
        output.push_str(&format!(
            "║  Total: {:3} | Expected: {:3} | Unexpected: {} | Flaky: {:3}  ║\n",
            summary.total, summary.expected, unexpected, summary.flaky
        ));
        output.push_str(&format!(
            "║  Skipped: {:3} | Interrupted: {:3} | Duration: {:8}ms     ║\n",
            summary.skipped, summary.interrupted, summary.duration_ms
        ));
        if summary.max_failures_reached {
            output.push_str("║  Stopped early: maximum allowed failures reached             ║\n");
        }
        if summary.worker_errors {
            output.push_str("║  Errors occurred outside of tests                            ║\n");
        }
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");
        output
    }

    fn format_failures(&self) -> String {
        let mut output = String::new();
        for (index, failure) in self.failures.iter().enumerate() {
            let retry = if failure.retry > 0 {
                format!(" (retry #{})", failure.retry)
            } else {
                String::new()
            };
            output.push_str(&format!(
                "\n  {}) {}{}\n",
                index + 1,
                self.paint(&failure.title, "31"),
                retry
            ));
            for error in &failure.errors {
                output.push_str(&indent(&format_error(error), "    "));
            }
        }
        for error in &self.errors {
            output.push_str(&format!("\n  {}\n", self.paint("Error:", "31")));
            output.push_str(&indent(&format_error(error), "    "));
        }
        output
    }
}

fn format_error(error: &TestError) -> String {
    let mut text = error.message.clone();
    if let Some(location) = &error.location {
        text.push_str(&format!("\n  at {location}"));
    }
    if let Some(stack) = &error.stack {
        if !stack.is_empty() && !text.contains(stack.as_str()) {
            text.push('\n');
            text.push_str(stack);
        }
    }
    text
}

fn indent(text: &str, prefix: &str) -> String {
    text.lines().map(|l| format!("{prefix}{l}\n")).collect()
}

impl Reporter for LineReporter {
    fn on_begin(&mut self, config: &FullConfig, tests: &[&TestCase]) {
        self.total = tests.len();
        if self.format == OutputFormat::Line {
            let line = format!(
                "\nRunning {} tests using {} workers\n\n",
                tests.len(),
                config.workers
            );
            self.write(&line);
        }
    }

    fn on_test_end(&mut self, test: &TestCase, result: &TestResult) {
        self.finished += 1;
        let failed = !matches!(result.status, TestStatus::Skipped | TestStatus::Interrupted)
            && result.status != test.expected_status;
        if failed {
            self.failures.push(Failure {
                title: test.full_title(),
                retry: result.retry,
                errors: result.errors.clone(),
            });
        }
        match self.format {
            OutputFormat::Line => {
                let line = self.format_test_end(test, result);
                self.write(&line);
            }
            OutputFormat::Json => {
                let line = TestEndLine {
                    id: &test.id,
                    title: test.full_title(),
                    retry: result.retry,
                    status: result.status,
                    duration_ms: result.duration_ms,
                    errors: &result.errors,
                };
                let json = serde_json::to_string(&line).unwrap_or_default();
                self.write(&format!("{json}\n"));
            }
            OutputFormat::Summary => {}
        }
    }

    fn on_std_out(&mut self, chunk: &str, _test: Option<&TestCase>, _result: Option<&TestResult>) {
        if self.show_output && self.format == OutputFormat::Line {
            self.write(chunk);
        }
    }

    fn on_std_err(&mut self, chunk: &str, _test: Option<&TestCase>, _result: Option<&TestResult>) {
        if self.show_output && self.format == OutputFormat::Line {
            let _ = std::io::stderr().write_all(chunk.as_bytes());
        }
    }

    fn on_error(&mut self, error: &TestError) {
        self.errors.push(error.clone());
    }

    fn on_end(&mut self, summary: &RunSummary) {
        let text = match self.format {
            OutputFormat::Json => {
                let mut json = serde_json::to_string(summary).unwrap_or_default();
                json.push('\n');
                json
            }
            OutputFormat::Line | OutputFormat::Summary => {
                let mut text = self.format_failures();
                text.push_str(&self.format_summary_table(summary));
                text
            }
        };
        self.write(&text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Suite;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    fn failed_test() -> (TestCase, TestResult) {
        let mut suite = Suite::file("a.spec");
        suite.test("breaks", &[], |_args, _info| async { Ok(()) });
        let mut test = suite.into_tests().remove(0);
        test.title_path = vec!["".into(), "p".into(), "a.spec".into(), "breaks".into()];
        let result = test.append_result();
        result.status = TestStatus::Failed;
        result.errors.push(TestError::new("boom"));
        result.retry = 1;
        let result = result.clone();
        (test, result)
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(OutputFormat::from_str("json"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::from_str("LINE"), Some(OutputFormat::Line));
        assert_eq!(OutputFormat::from_str("unknown"), None);
    }

    #[test]
    fn test_line_output_lists_failures() {
        let buffer = Buffer::default();
        let mut reporter =
            LineReporter::with_writer(OutputFormat::Line, Box::new(buffer.clone())).no_color();
        let (test, result) = failed_test();
        reporter.on_begin(&FullConfig::default(), &[&test]);
        reporter.on_test_end(&test, &result);
        let tests = [&test];
        reporter.on_end(&RunSummary::from_tests(&tests, 5, false, false));

        let text = buffer.text();
        assert!(text.contains("p › a.spec › breaks (retry #1)"));
        assert!(text.contains("1) p › a.spec › breaks"));
        assert!(text.contains("    boom"));
        assert!(text.contains("Run FAILED"));
    }

    #[test]
    fn test_json_lines() {
        let buffer = Buffer::default();
        let mut reporter = LineReporter::with_writer(OutputFormat::Json, Box::new(buffer.clone()));
        let (test, result) = failed_test();
        reporter.on_test_end(&test, &result);
        let first = buffer.text().lines().next().unwrap().to_string();
        let value: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["retry"], 1);
    }
}
