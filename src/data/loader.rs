// ============================================================
// Layer 4 — fbdialog Loader
// ============================================================
// Reads dialogue files in the ParlAI "fbdialog" text format.
//
// Each line is:
//   <turn id> <text>\t<label|label...>\t<reward>\t<cand|cand|...>
//
// Rules:
//   - Turn id 1 starts a new conversation.
//   - A line with no tab carries context only (e.g. persona
//     sentences). It is prepended, '\n'-joined, to the text of the
//     next labelled line.
//   - The last message of a conversation gets episode_done = true.
//
// Example:
//   1 your persona: i like to ski.
//   2 hi!\thello, do you ski?\t\thello, do you ski?|i hate snow
//   3 yes, every winter.\tme too!
//   1 ...next conversation...

use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::data::preprocessor::Preprocessor;
use crate::domain::dialogue::{Episode, Message};
use crate::domain::traits::DialogueSource;

/// Loads every episode of one fbdialog file.
pub struct FbDialogLoader {
    path: PathBuf,
    /// Stop after this many episodes (useful for quick runs)
    max_episodes: Option<usize>,
}

impl FbDialogLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_episodes: None,
        }
    }

    pub fn with_max_episodes(mut self, max: Option<usize>) -> Self {
        self.max_episodes = max;
        self
    }
}

impl DialogueSource for FbDialogLoader {
    fn load_all(&self) -> Result<Vec<Episode>> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("Cannot read dialogue file '{}'", self.path.display()))?;

        let mut episodes = parse_fbdialog(&raw, &self.path);
        if let Some(max) = self.max_episodes {
            episodes.truncate(max);
        }

        let turns: usize = episodes.iter().map(|e| e.len()).sum();
        tracing::info!(
            "Loaded {} episodes ({} turns) from '{}'",
            episodes.len(),
            turns,
            self.path.display()
        );
        Ok(episodes)
    }
}

/// Parse the contents of an fbdialog file. `origin` is only used in logs.
pub fn parse_fbdialog(raw: &str, origin: &Path) -> Vec<Episode> {
    let prep = Preprocessor::new();
    let mut episodes: Vec<Episode> = Vec::new();
    let mut current: Episode = Vec::new();
    // Context lines waiting for the next labelled line
    let mut pending: Vec<String> = Vec::new();

    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (id_part, rest) = match line.split_once(' ') {
            Some((id, rest)) => (id, rest),
            None => (line, ""),
        };
        let turn_id: usize = match id_part.parse() {
            Ok(n) => n,
            Err(_) => {
                tracing::warn!(
                    "{}:{}: skipping line without a turn id",
                    origin.display(),
                    lineno + 1
                );
                continue;
            }
        };

        if turn_id == 1 {
            close_episode(&mut current, &mut episodes);
            pending.clear();
        }

        let fields: Vec<&str> = rest.split('\t').collect();
        let text = prep.clean(fields[0]);

        if fields.len() == 1 {
            if !text.is_empty() {
                pending.push(text);
            }
            continue;
        }

        pending.push(text);
        let full_text = pending
            .drain(..)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let labels = split_alternatives(fields[1], &prep);
        let candidates = fields
            .get(3)
            .map(|c| split_alternatives(c, &prep))
            .unwrap_or_default();

        current.push(
            Message::new(full_text)
                .with_labels(labels)
                .with_candidates(candidates),
        );
    }

    // A trailing context-only line still deserves a turn
    if !pending.is_empty() {
        current.push(Message::new(pending.join("\n")));
    }
    close_episode(&mut current, &mut episodes);
    episodes
}

fn split_alternatives(field: &str, prep: &Preprocessor) -> Vec<String> {
    field
        .split('|')
        .map(|s| prep.clean(s))
        .filter(|s| !s.is_empty())
        .collect()
}

fn close_episode(current: &mut Episode, episodes: &mut Vec<Episode>) {
    if let Some(last) = current.last_mut() {
        last.episode_done = true;
        episodes.push(std::mem::take(current));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
1 your persona: i like to ski.
2 hi!\thello, do you ski?\t\thello, do you ski?|i hate snow
3 yes, every winter.\tme too!
1 hey\tyo
";

    fn parse(raw: &str) -> Vec<Episode> {
        parse_fbdialog(raw, Path::new("test.txt"))
    }

    #[test]
    fn test_splits_episodes_on_turn_one() {
        let eps = parse(SAMPLE);
        assert_eq!(eps.len(), 2);
        assert_eq!(eps[0].len(), 2);
        assert_eq!(eps[1].len(), 1);
    }

    #[test]
    fn test_context_lines_prefix_next_text() {
        let eps = parse(SAMPLE);
        assert_eq!(eps[0][0].text, "your persona: i like to ski.\nhi!");
        assert_eq!(eps[0][1].text, "yes, every winter.");
    }

    #[test]
    fn test_labels_and_candidates() {
        let eps = parse(SAMPLE);
        assert_eq!(eps[0][0].labels, vec!["hello, do you ski?"]);
        assert_eq!(eps[0][0].label_candidates.len(), 2);
        assert!(eps[0][1].label_candidates.is_empty());
    }

    #[test]
    fn test_only_last_turn_is_done() {
        let eps = parse(SAMPLE);
        assert!(!eps[0][0].episode_done);
        assert!(eps[0][1].episode_done);
        assert!(eps[1][0].episode_done);
    }

    #[test]
    fn test_bad_lines_are_skipped() {
        let eps = parse("garbage line\n1 hi\tthere\n");
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0][0].labels, vec!["there"]);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let loader = FbDialogLoader::new("/definitely/not/here.txt");
        assert!(loader.load_all().is_err());
    }
}
