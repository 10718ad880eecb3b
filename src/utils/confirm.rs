//! Yes/no confirmation for destructive commands.
//!
//! Prompts go through a trait so cron runs (`--force`) and tests never
//! block on a terminal.

use anyhow::Result;
use std::io::{self, Write};

pub trait Confirmer {
    /// Print `prompt` and return whether the user answered yes.
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Reads the answer from stdin. `y`/`yes` in any case counts as yes.
pub struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        print!("{} [y/N]: ", prompt);
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let answer = input.trim().to_lowercase();
        Ok(answer == "y" || answer == "yes")
    }
}

/// Always answers without prompting. Backs `--force` and tests.
pub struct PresetConfirmer(pub bool);

impl Confirmer for PresetConfirmer {
    fn confirm(&self, _prompt: &str) -> Result<bool> {
        Ok(self.0)
    }
}
