//! Prompt detection.
//!
//! A stateless classifier applied to freshly arrived subprocess output.
//! It recognizes "the process is now waiting for input" and extracts a
//! structured set of choices. Detection is heuristic and advisory: a
//! false positive degrades to an ignored prompt, never to corrupted run
//! state.
//!
//! Matchers are tried in declaration order and the first match wins; a
//! line matching both the bracketed yes/no and the generic confirmation
//! pattern therefore resolves as yes/no.

use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;

/// Lines of the fresh tail considered by the matchers. Prompts sit at the
/// very end of output; scanning further would re-trigger on old text.
const SCAN_LINES: usize = 12;

/// Upper bound on extracted options, as a guard against degenerate
/// counters like `Select [1/400]:`.
const MAX_OPTIONS: usize = 12;

static SELECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)select\s*\[(\d+(?:/\d+)+)\]\s*:?\s*$").unwrap());

static YES_NO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[\[(]\s*y(?:es)?\s*/\s*no?\s*[)\]]").unwrap());

static CONFIRM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:continue|proceed|apply)\s*\?\s*$").unwrap());

static MENU_ROW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(>|❯)?\s*\[( |x|X|\*)\]\s+(\S.*)$").unwrap());

/// What kind of prompt was recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// `Select [1/2/3]:` style counter with numbered options.
    Select,
    /// Bracketed yes/no confirmation.
    YesNo,
    /// Generic `Continue?` / `Proceed?` / `Apply?` confirmation.
    Confirm,
    /// Arrow-key menu rows with checkboxes.
    Menu,
}

/// One selectable choice: the label shown to the user and the literal
/// text written to the process stdin when chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOption {
    pub label: String,
    pub reply: String,
}

/// An active prompt attached to a run while awaiting input.
#[derive(Debug, Clone)]
pub struct PromptState {
    pub kind: PromptKind,
    /// Option labels in source order.
    pub options: Vec<PromptOption>,
    pub raised_at: Instant,
}

impl PromptState {
    fn new(kind: PromptKind, options: Vec<PromptOption>) -> Self {
        Self {
            kind,
            options,
            raised_at: Instant::now(),
        }
    }

    /// Resolve a remote selection (option label, 1-based index, or raw
    /// reply token) to the text written to stdin.
    pub fn reply_for(&self, selection: &str) -> String {
        let trimmed = selection.trim();
        if let Some(opt) = self.options.iter().find(|o| {
            o.label.eq_ignore_ascii_case(trimmed) || o.reply.eq_ignore_ascii_case(trimmed)
        }) {
            return opt.reply.clone();
        }
        if let Ok(index) = trimmed.parse::<usize>() {
            if index >= 1 && index <= self.options.len() {
                return self.options[index - 1].reply.clone();
            }
        }
        trimmed.to_string()
    }
}

/// Scan the tail of freshly produced output for a prompt. Returns `None`
/// when nothing matches; this is the overwhelmingly common case.
pub fn detect(recent_output: &str) -> Option<PromptState> {
    if recent_output.is_empty() {
        return None;
    }

    let lines: Vec<&str> = recent_output
        .lines()
        .rev()
        .take(SCAN_LINES)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    detect_select(&lines)
        .or_else(|| detect_yes_no(&lines))
        .or_else(|| detect_confirm(&lines))
        .or_else(|| detect_menu(&lines))
}

fn detect_select(lines: &[&str]) -> Option<PromptState> {
    let (index, caps) = lines
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, line)| SELECT_RE.captures(line.trim_end()).map(|c| (i, c)))?;

    let numbers: Vec<usize> = caps[1]
        .split('/')
        .filter_map(|n| n.parse().ok())
        .collect();
    // `[1/2/3]` lists the choices; `[1/5]` is an i-of-n counter.
    let count = match numbers.len() {
        0 | 1 => return None,
        2 => numbers[1],
        n => n,
    }
    .min(MAX_OPTIONS);
    if count == 0 {
        return None;
    }

    // Option labels usually follow the prompt line; some menus print them
    // first, so fall back to the preceding lines.
    let mut labels: Vec<String> = lines[index + 1..]
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .take(count)
        .map(|l| l.to_string())
        .collect();
    if labels.is_empty() {
        labels = lines[..index]
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .rev()
            .take(count)
            .map(|l| l.to_string())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
    }

    let options = (1..=count)
        .map(|i| PromptOption {
            label: labels.get(i - 1).cloned().unwrap_or_else(|| i.to_string()),
            reply: i.to_string(),
        })
        .collect();

    Some(PromptState::new(PromptKind::Select, options))
}

fn detect_yes_no(lines: &[&str]) -> Option<PromptState> {
    let last = last_nonempty(lines)?;
    if !YES_NO_RE.is_match(last) {
        return None;
    }
    Some(PromptState::new(PromptKind::YesNo, yes_no_options()))
}

fn detect_confirm(lines: &[&str]) -> Option<PromptState> {
    let last = last_nonempty(lines)?;
    if !CONFIRM_RE.is_match(last.trim_end()) {
        return None;
    }
    Some(PromptState::new(PromptKind::Confirm, yes_no_options()))
}

fn detect_menu(lines: &[&str]) -> Option<PromptState> {
    let captures: Vec<regex::Captures> = lines
        .iter()
        .filter_map(|line| MENU_ROW_RE.captures(line))
        .collect();
    if captures.len() < 2 {
        return None;
    }
    // A real menu carries a cursor on at least one row.
    if !captures.iter().any(|c| c.get(1).is_some()) {
        return None;
    }

    let options = captures
        .iter()
        .take(MAX_OPTIONS)
        .enumerate()
        .map(|(i, c)| PromptOption {
            label: c[3].trim().to_string(),
            reply: (i + 1).to_string(),
        })
        .collect();

    Some(PromptState::new(PromptKind::Menu, options))
}

fn yes_no_options() -> Vec<PromptOption> {
    vec![
        PromptOption {
            label: "Yes".to_string(),
            reply: "y".to_string(),
        },
        PromptOption {
            label: "No".to_string(),
            reply: "n".to_string(),
        },
    ]
}

fn last_nonempty<'a>(lines: &[&'a str]) -> Option<&'a str> {
    lines.iter().rev().find(|l| !l.trim().is_empty()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_counter_with_following_options() {
        let output = "Select [1/2/3]:\nDeploy to staging\nDeploy to production\nAbort\n";
        let prompt = detect(output).unwrap();
        assert_eq!(prompt.kind, PromptKind::Select);
        assert_eq!(prompt.options.len(), 3);
        let labels: Vec<&str> = prompt.options.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["Deploy to staging", "Deploy to production", "Abort"]
        );
        assert_eq!(prompt.options[1].reply, "2");
    }

    #[test]
    fn test_select_counter_with_preceding_options() {
        let output = "alpha\nbeta\ngamma\nSelect [1/2/3]:";
        let prompt = detect(output).unwrap();
        assert_eq!(prompt.options.len(), 3);
        assert_eq!(prompt.options[0].label, "alpha");
        assert_eq!(prompt.options[2].label, "gamma");
    }

    #[test]
    fn test_i_of_n_counter() {
        let output = "Select [1/4]:\n";
        let prompt = detect(output).unwrap();
        assert_eq!(prompt.options.len(), 4);
        assert_eq!(prompt.options[3].reply, "4");
    }

    #[test]
    fn test_yes_no_bracket_notations() {
        for line in [
            "Overwrite existing file? [y/n]",
            "Overwrite existing file? [Y/n]:",
            "Delete branch (yes/no)?",
            "Install dependencies (y/N)",
        ] {
            let prompt = detect(line).unwrap_or_else(|| panic!("no match for {line:?}"));
            assert_eq!(prompt.kind, PromptKind::YesNo, "line: {line:?}");
            assert_eq!(prompt.options.len(), 2);
            assert_eq!(prompt.options[0].reply, "y");
            assert_eq!(prompt.options[1].reply, "n");
        }
    }

    #[test]
    fn test_generic_confirmation() {
        for line in ["Continue?", "Proceed?", "Apply changes... Apply?"] {
            let prompt = detect(line).unwrap_or_else(|| panic!("no match for {line:?}"));
            assert_eq!(prompt.kind, PromptKind::Confirm);
        }
    }

    #[test]
    fn test_yes_no_takes_precedence_over_confirm() {
        // Matches both the bracket and the generic pattern; the bracket
        // matcher is declared first.
        let prompt = detect("Continue? [y/n]").unwrap();
        assert_eq!(prompt.kind, PromptKind::YesNo);
    }

    #[test]
    fn test_menu_rows() {
        let output = "> [ ] Use defaults\n  [x] Customize settings\n  [ ] Skip\n";
        let prompt = detect(output).unwrap();
        assert_eq!(prompt.kind, PromptKind::Menu);
        assert_eq!(prompt.options.len(), 3);
        assert_eq!(prompt.options[0].label, "Use defaults");
        assert_eq!(prompt.options[2].reply, "3");
    }

    #[test]
    fn test_menu_requires_cursor() {
        // Checkbox-looking lines without any cursor row are log output,
        // not a menu.
        let output = "[ ] task one queued\n[ ] task two queued\n";
        assert!(detect(output).is_none());
    }

    #[test]
    fn test_plain_output_never_matches() {
        let samples = [
            "Compiling chatrun v0.2.1",
            "Finished release [optimized] target(s) in 3.42s",
            "copied 14 files to /srv/app",
            "warning: unused variable `x`",
            "",
        ];
        let mut grown = String::new();
        for sample in samples {
            // No false positive drift as the buffer grows.
            grown.push_str(sample);
            grown.push('\n');
            assert!(detect(sample).is_none(), "matched {sample:?}");
            assert!(detect(&grown).is_none(), "matched grown buffer");
        }
    }

    #[test]
    fn test_prompt_not_on_last_line_is_stale() {
        // A yes/no followed by more output means the process moved on.
        let output = "Continue? [y/n]\nalready answered, running...\n";
        assert!(detect(output).is_none());
    }

    #[test]
    fn test_reply_resolution() {
        let prompt = detect("Continue? [y/n]").unwrap();
        assert_eq!(prompt.reply_for("Yes"), "y");
        assert_eq!(prompt.reply_for("2"), "n");
        assert_eq!(prompt.reply_for("n"), "n");
        // Free text passes through for unstructured confirmations.
        assert_eq!(prompt.reply_for("maybe later"), "maybe later");
    }
}
