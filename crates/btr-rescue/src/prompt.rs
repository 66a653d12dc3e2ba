//! Confirmation policy for destructive rescue steps.

use btr_error::Result;
use std::io::{BufRead, Write};

/// Asks the user before a destructive commit. Rescue machines take a
/// prompter so scripted runs and tests can fix the answer.
pub trait Prompter {
    fn confirm(&mut self, question: &str) -> Result<bool>;
}

/// Interactive prompter reading `y`/`yes` from stdin.
pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn confirm(&mut self, question: &str) -> Result<bool> {
        let mut stdout = std::io::stdout();
        write!(stdout, "{question} [y/N]: ")?;
        stdout.flush()?;
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        let answer = answer.trim().to_ascii_lowercase();
        Ok(answer == "y" || answer == "yes")
    }
}

/// Fixed answer, for `--yes` runs and tests.
pub struct AutoConfirm(pub bool);

impl Prompter for AutoConfirm {
    fn confirm(&mut self, _question: &str) -> Result<bool> {
        Ok(self.0)
    }
}

/// Test prompter that records every question it was asked.
#[cfg(test)]
pub(crate) struct RecordingPrompter {
    pub answer: bool,
    pub questions: Vec<String>,
}

#[cfg(test)]
impl RecordingPrompter {
    pub(crate) fn new(answer: bool) -> Self {
        Self {
            answer,
            questions: Vec::new(),
        }
    }
}

#[cfg(test)]
impl Prompter for RecordingPrompter {
    fn confirm(&mut self, question: &str) -> Result<bool> {
        self.questions.push(question.to_owned());
        Ok(self.answer)
    }
}
