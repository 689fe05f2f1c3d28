// ============================================================
// Layer 4 — Turn Preprocessor
// ============================================================
// Cleans one field of a dialogue line before it reaches the
// dictionary.
//
// fbdialog files store multi-line turns on a single physical line,
// with the literal two characters `\n` marking the breaks, e.g.
//
//   1 your persona: i like cats.\nhi there!\thello!
//
// Cleaning steps:
//   1. Expand `\n` escapes into real newlines
//   2. Map tabs / odd Unicode spaces / control characters to spaces
//   3. Collapse runs of spaces and trim every line
//   4. Drop lines that end up empty

pub struct Preprocessor;

impl Preprocessor {
    pub fn new() -> Self {
        Self
    }

    /// Clean a raw turn field. Returns an owned String.
    pub fn clean(&self, raw: &str) -> String {
        let expanded = raw.replace("\\n", "\n").replace('\r', "\n");

        let normalised: String = expanded
            .chars()
            .map(|c| match c {
                '\u{00A0}' | '\u{200B}' | '\u{FEFF}' | '\t' => ' ',
                c if c.is_control() && c != '\n' => ' ',
                c => c,
            })
            .collect();

        normalised
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}
