//! Progress UI (spinner) for harvest runs.

use std::time::Duration;

use harvester_core::{FetchProgress, ProgressSink, Server};
use indicatif::{ProgressBar, ProgressStyle};

/// Spinner showing pages fetched and an estimate of records seen.
///
/// Hidden when disabled, so it can always be passed to the harvester.
pub(crate) struct TerminalProgress {
    spinner: ProgressBar,
}

impl TerminalProgress {
    pub(crate) fn new(enabled: bool) -> Self {
        let spinner = if enabled {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::with_template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner
        } else {
            ProgressBar::hidden()
        };
        Self { spinner }
    }

    pub(crate) fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressSink for TerminalProgress {
    fn server_started(&self, server: Server, pages_done: u64) {
        self.spinner
            .set_message(format!("[{server}] starting ({pages_done} pages already saved)"));
    }

    fn page_completed(&self, progress: &FetchProgress) {
        self.spinner.set_message(page_message(progress));
    }

    fn server_finished(&self, server: Server, records: usize) {
        self.spinner
            .println(format!("[{server}] {records} records after filtering and deduplication"));
    }
}

fn page_message(progress: &FetchProgress) -> String {
    match progress.declared_total {
        Some(total) => format!(
            "[{}] {} pages, ~{}/{} records",
            progress.server,
            progress.pages_done,
            progress.estimated_records.min(total),
            total
        ),
        None => format!(
            "[{}] {} pages, ~{} records",
            progress.server, progress.pages_done, progress.estimated_records
        ),
    }
}
