use unicode_normalization::UnicodeNormalization;

/// Stage 2 of `process` (§4.1 "Clean"): NFKC-normalizes the text, drops control
/// characters other than newline, collapses runs of horizontal whitespace, strips
/// leading/trailing whitespace per line, and drops lines shorter than
/// `min_line_len` characters (boilerplate like lone page numbers or nav crumbs).
pub fn clean_text(raw: &str, min_line_len: usize) -> String {
    let normalized: String = raw.nfkc().collect();

    let mut lines = Vec::new();
    for line in normalized.lines() {
        let without_control: String = line
            .chars()
            .filter(|c| !c.is_control() || *c == '\t')
            .collect();
        let collapsed = collapse_whitespace(&without_control);
        let trimmed = collapsed.trim();
        if trimmed.chars().count() < min_line_len {
            continue;
        }
        lines.push(trimmed.to_string());
    }

    lines.join("\n")
}

fn collapse_whitespace(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut last_was_space = false;
    for c in line.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_drops_short_lines() {
        let input = "Hello    world\n\n\nhi\nThis line survives just fine";
        let cleaned = clean_text(input, 3);
        assert_eq!(cleaned, "Hello world\nThis line survives just fine");
    }

    #[test]
    fn strips_control_characters_but_keeps_newlines() {
        let input = "one\u{0007}two\nthree four five";
        let cleaned = clean_text(input, 1);
        assert_eq!(cleaned, "onetwo\nthree four five");
    }

    #[test]
    fn nfkc_normalizes_compatibility_forms() {
        let input = "\u{FB01}rst line of real content"; // "ﬁrst" ligature
        let cleaned = clean_text(input, 1);
        assert!(cleaned.starts_with("first"));
    }
}
