//! xUnit rendering of merged test results.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;
use crate::stages::results::TestResult;

const SUITE_NAME: &str = "dist-git";

/// Escapes a value for use inside a double-quoted XML attribute.
pub fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn log_href(base: &str, log: &str) -> String {
    format!("{}/{log}", base.trim_end_matches('/'))
}

/// Writes `results` as a single `dist-git` test suite.
///
/// Log links point at `<base>/<log>`. A testcase with no `logs` key links
/// to `base` itself; an empty `logs` list writes no link.
pub fn write(results: &[TestResult], base: &str, output: &mut dyn Write) -> std::io::Result<()> {
    let failures = results.iter().filter(|r| !r.passed()).count();

    writeln!(output, "<?xml version=\"1.0\" ?>")?;
    writeln!(output, "<testsuites>")?;
    writeln!(
        output,
        "  <testsuite name=\"{SUITE_NAME}\" tests=\"{}\" failures=\"{failures}\">",
        results.len()
    )?;
    for result in results {
        writeln!(output, "    <testcase name=\"{}\">", escape_attr(&result.test))?;
        if !result.passed() {
            writeln!(output, "      <failure/>")?;
        }
        writeln!(output, "      <logs>")?;
        match result.logs.as_deref() {
            Some(logs) => {
                for log in logs {
                    writeln!(
                        output,
                        "        <log name=\"{}\" href=\"{}\"/>",
                        escape_attr(log),
                        escape_attr(&log_href(base, log))
                    )?;
                }
            }
            None => writeln!(
                output,
                "        <log name=\"{}\" href=\"{}\"/>",
                escape_attr(&result.test),
                escape_attr(base)
            )?,
        }
        writeln!(output, "      </logs>")?;
        writeln!(output, "    </testcase>")?;
    }
    writeln!(output, "  </testsuite>")?;
    writeln!(output, "</testsuites>")?;
    Ok(())
}

/// Writes the xUnit document to `path`, creating its directory.
pub fn save(results: &[TestResult], base: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = BufWriter::new(File::create(path)?);
    write(results, base, &mut file)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(results: &[TestResult], base: &str) -> String {
        let mut buf = Vec::new();
        write(results, base, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_suite_counts_and_failures() {
        let results = vec![
            TestResult::new("smoke", true, vec!["smoke.log".into()]),
            TestResult::new("upgrade", false, vec!["upgrade.log".into(), "dmesg".into()]),
        ];
        let xml = render(&results, "https://ci.example.org/logs/");

        assert!(xml.starts_with("<?xml version=\"1.0\" ?>\n<testsuites>\n"));
        assert!(xml.contains("<testsuite name=\"dist-git\" tests=\"2\" failures=\"1\">"));
        assert!(xml.contains(
            "    <testcase name=\"upgrade\">\n      <failure/>\n      <logs>\n        <log name=\"upgrade.log\" href=\"https://ci.example.org/logs/upgrade.log\"/>"
        ));
        assert!(xml.contains("<log name=\"dmesg\" href=\"https://ci.example.org/logs/dmesg\"/>"));
        assert_eq!(xml.matches("<failure/>").count(), 1);
        assert!(xml.ends_with("</testsuites>\n"));
    }

    #[test]
    fn test_missing_and_empty_logs() {
        let mut result = TestResult::new("rpmlint", false, vec![]);
        result.result = "error".into();
        let mut no_logs = TestResult::new("rpminspect", true, vec![]);
        no_logs.logs = None;

        let xml = render(&[result, no_logs], "/var/results");
        assert!(xml.contains("<log name=\"rpminspect\" href=\"/var/results\"/>"));
        assert!(!xml.contains("<log name=\"rpmlint\""));
        assert!(xml.contains(
            "    <testcase name=\"rpmlint\">\n      <failure/>\n      <logs>\n      </logs>\n"
        ));
        assert!(xml.contains("failures=\"1\""));
    }

    #[test]
    fn test_attributes_are_escaped() {
        assert_eq!(
            escape_attr(r#"a<b> & "c" 'd'"#),
            "a&lt;b&gt; &amp; &quot;c&quot; &apos;d&apos;"
        );
        let xml = render(&[TestResult::new("x & y", true, vec![])], "base");
        assert!(xml.contains("<testcase name=\"x &amp; y\">"));
    }

    #[test]
    fn test_save_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/xunit.xml");
        save(&[TestResult::new("smoke", true, vec![])], "base", &path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("smoke"));
    }
}
