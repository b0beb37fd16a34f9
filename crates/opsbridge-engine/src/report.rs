//! Human-readable incident note formatting.
//!
//! Two shapes land on the incident timeline: the success report (normalized
//! job output in a code fence) and the failure report (guidance plus raw
//! error details). The machine-readable `ROUTING::<CATEGORY>` signal is a
//! separate note, produced by the failure classifier.

use chrono::Utc;

/// Title of a successful job report note.
const REPORT_TITLE: &str = "Diagnosis / Remediation Job Results";

/// Title of a failed job report note.
const FAILURE_TITLE: &str = "Diagnosis / Remediation Job Failed";

/// Guidance paragraph shown with every failure report.
const FAILURE_GUIDANCE: &str = "The job runner rejected the request (likely a *required option \
is missing*). For diagnosis, ensure env_orn is set. For remediation, fill the required inputs \
on the incident form before retrying.";

/// Maximum characters of failure details rendered in a note.
const DETAILS_CAP: usize = 6000;

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn selector_line(selector: &str) -> String {
    if selector.is_empty() {
        String::new()
    } else {
        format!("\n_Selector: {selector}_")
    }
}

/// Formats a successful job report.
#[must_use]
pub fn format_report(cleaned: &str, auto: bool, selector: &str) -> String {
    let title = if auto {
        format!("{REPORT_TITLE} (auto)")
    } else {
        REPORT_TITLE.to_string()
    };
    let pretty = cleaned.trim();
    let pretty = if pretty.is_empty() { "(no output)" } else { pretty };
    format!(
        "*{title}*{}\n\n```\n{pretty}\n```\n\n_Processed at {}_\n",
        selector_line(selector),
        timestamp(),
    )
}

/// Formats a failure report with guidance and truncated details.
#[must_use]
pub fn format_failure(details: &str, auto: bool, selector: &str) -> String {
    let title = if auto {
        format!("{FAILURE_TITLE} (auto)")
    } else {
        FAILURE_TITLE.to_string()
    };
    let details: String = details.trim().chars().take(DETAILS_CAP).collect();
    format!(
        "*{title}*{}\n\n{FAILURE_GUIDANCE}\n\n```\n{details}\n```\n\n_Processed at {}_\n",
        selector_line(selector),
        timestamp(),
    )
}
