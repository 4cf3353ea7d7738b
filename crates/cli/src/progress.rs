use std::time::Duration;

use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};

const TRANSFER_TEMPLATE: &str =
    "{prefix:>8.cyan.bold} [{bar:32.cyan/dim}] {binary_bytes}/{binary_total_bytes} {binary_bytes_per_sec} {wide_msg:.dim}";
const COUNT_TEMPLATE: &str = "{prefix:>8.cyan.bold} [{bar:32.cyan/dim}] {pos}/{len} parts {wide_msg:.dim}";

/// Bars draw on stderr and only when it is a terminal, so piped output
/// (`ls --json`, redirected logs) stays clean.
fn bar(len: u64, template: &str, label: &str) -> ProgressBar {
    let pb = ProgressBar::with_draw_target(Some(len), draw_target());
    pb.set_style(
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb.set_prefix(label.to_string());
    pb
}

fn draw_target() -> ProgressDrawTarget {
    if console::Term::stderr().is_term() {
        ProgressDrawTarget::stderr()
    } else {
        ProgressDrawTarget::hidden()
    }
}

/// Byte progress for moving part bodies; `label` names the operation.
pub fn transfer_bar(total: u64, label: &str) -> ProgressBar {
    bar(total, TRANSFER_TEMPLATE, label)
}

/// Byte progress for a single part, with its path as the message.
pub fn part_bar(part: &partstore_core::Part, label: &str) -> ProgressBar {
    let pb = transfer_bar(part.size, label);
    pb.set_message(part.path.clone());
    pb
}

/// Counts parts for operations that don't move bodies, such as deletes.
pub fn part_counter(total: u64, label: &str) -> ProgressBar {
    bar(total, COUNT_TEMPLATE, label)
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::with_draw_target(None, draw_target());
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Sizes as shown to operators: binary units, `1.50 MiB`.
pub fn size(bytes: u64) -> String {
    HumanBytes(bytes).to_string()
}
