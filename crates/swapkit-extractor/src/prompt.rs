//! Asking the user what to do about a locked file.

use std::io::{self, IsTerminal};

use dialoguer::{Confirm, theme::ColorfulTheme};
use swapkit_updater::{LockDecision, LockDiagnosis, LockPrompt, LockingProcess};
use tracing::warn;

/// Asks on the terminal whether to retry once the holder is known.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolePrompt;

impl LockPrompt for ConsolePrompt {
    fn on_locked(&self, diagnosis: &LockDiagnosis, holder: &LockingProcess) -> LockDecision {
        let question = format!(
            "{} is in use by {}. Close it and retry?",
            diagnosis.file_path.display(),
            holder
        );
        match Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(question)
            .default(true)
            .interact()
        {
            Ok(true) => LockDecision::Retry,
            Ok(false) => LockDecision::Abort,
            Err(e) => {
                warn!("Could not ask about the locked file, retrying: {}", e);
                LockDecision::Retry
            }
        }
    }
}

/// Whether someone is at a terminal to answer [`ConsolePrompt`].
pub fn is_interactive(unattended: bool) -> bool {
    !unattended && io::stdin().is_terminal() && io::stderr().is_terminal()
}
