/*!
 * Terminal progress bars for the CLI
 *
 * One bar per transfer name, created on the first snapshot and closed on the
 * final one. Bars for byte transfers show throughput and ETA; bulk operations
 * count objects.
 */

use std::collections::HashMap;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::core::progress::{ProgressState, ProgressUpdate, ReportProgress, Units};

const BYTES_TEMPLATE: &str =
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const OBJECTS_TEMPLATE: &str =
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} objects";

/// [`ReportProgress`] implementation rendering `indicatif` bars
pub struct BarReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl Default for BarReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl BarReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn new_bar(&self, update: &ProgressUpdate) -> ProgressBar {
        let template = match update.units {
            Units::Bytes => BYTES_TEMPLATE,
            Units::Objects => OBJECTS_TEMPLATE,
        };
        let style = ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        let bar = self.multi.add(ProgressBar::new(update.total));
        bar.set_style(style);
        bar.set_message(update.name.clone());
        bar
    }
}

impl ReportProgress for BarReporter {
    fn report(&self, update: &ProgressUpdate) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        let bar = bars
            .entry(update.name.clone())
            .or_insert_with(|| self.new_bar(update));
        bar.set_length(update.total);
        bar.set_position(update.done);

        match &update.state {
            ProgressState::Running => {}
            ProgressState::Done => {
                let summary = match update.units {
                    Units::Bytes => format_bytes(update.done),
                    Units::Objects => format!("{} objects", update.done),
                };
                bar.finish_with_message(format!("✓ {} ({})", update.name, summary));
                bars.remove(&update.name);
            }
            ProgressState::Failed(error) => {
                bar.abandon_with_message(format!("✗ {}: {}", update.name, error));
                bars.remove(&update.name);
            }
        }
    }
}

/// Human-readable byte count, e.g. `1.50 MB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1_572_864), "1.50 MB");
    }

    #[test]
    fn test_bars_are_dropped_when_finished() {
        let reporter = BarReporter {
            multi: MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden()),
            bars: Mutex::new(HashMap::new()),
        };
        let mut update = ProgressUpdate {
            name: "s3://bucket/key".to_string(),
            done: 10,
            total: 100,
            units: Units::Bytes,
            state: ProgressState::Running,
        };
        reporter.report(&update);
        assert_eq!(reporter.bars.lock().unwrap().len(), 1);

        update.done = 100;
        update.state = ProgressState::Done;
        reporter.report(&update);
        assert!(reporter.bars.lock().unwrap().is_empty());
    }
}
