mod progress;
mod styling;
mod summary;
mod tables;
pub mod xunit;

pub use progress::StepProgress;
pub use styling::Tone;
pub use summary::{print_results_summary, print_stage_summary};

/// Prints the distgit-ci banner to stderr.
///
/// Displays the tool name, version, and description at the start of execution.
pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        Tone::Brand.paint("🧰 distgit-ci"),
        Tone::Muted.paint(env!("CARGO_PKG_VERSION")),
        Tone::Muted.paint("Fedora dist-git CI pipeline stages")
    );
}
