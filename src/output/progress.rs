use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::styling::Tone;

/// Spinner reporting the steps of a long-running stage.
///
/// Draws to stderr so it never mixes with the stage's stdout, and stays
/// hidden when stderr is not a terminal.
pub struct StepProgress {
    pb: ProgressBar,
    title: String,
    total: u64,
    current: u64,
}

impl StepProgress {
    pub fn start(title: impl Into<String>, total: u64) -> Self {
        let title = title.into();
        eprintln!("⚙️  {}", Tone::Heading.paint(&title));
        Self {
            pb: create_spinner(),
            title,
            total,
            current: 0,
        }
    }

    /// Moves on to the next step.
    pub fn step(&mut self, message: impl Into<String>) {
        self.current += 1;
        let label = step_label(self.current, self.total, &message.into());
        self.pb.set_message(Tone::Running.paint(label).to_string());
    }

    pub fn finish(self) {
        self.pb.finish_with_message(
            Tone::Passed
                .paint(format!("{} finished successfully ✓", self.title))
                .to_string(),
        );
        eprintln!();
    }
}

fn step_label(current: u64, total: u64, message: &str) -> String {
    format!("Step {current}/{total}: {message}")
}

fn create_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    if let Ok(style) = ProgressStyle::default_spinner().template("  {msg} {spinner}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
