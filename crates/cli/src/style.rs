//! Terminal styling shared by the subcommands.

use console::Style;

/// Green check mark followed by `msg`.
pub fn success(msg: &str) -> String {
    format!("{} {}", Style::new().green().apply_to("✓"), msg)
}

/// Red cross followed by `msg`.
pub fn error(msg: &str) -> String {
    format!("{} {}", Style::new().red().apply_to("✗"), msg)
}

pub fn warn(msg: &str) -> String {
    format!("{} {}", Style::new().yellow().apply_to("⚠"), msg)
}

pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Colored label for a task or build state.
pub fn state(label: &str) -> String {
    let style = match label {
        "succeeded" | "success" => Style::new().green(),
        "conflicted" | "unstable" => Style::new().yellow(),
        "failed" | "failure" | "aborted" => Style::new().red(),
        _ => Style::new().dim(),
    };
    style.apply_to(label).to_string()
}

/// `r<N>`, or a dash for unknown revisions.
pub fn revision(rev: Option<i64>) -> String {
    match rev {
        Some(r) if r > 0 => format!("r{}", r),
        _ => "—".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_label() {
        assert_eq!(revision(Some(42)), "r42");
        assert_eq!(revision(Some(0)), "—");
        assert_eq!(revision(None), "—");
    }
}
