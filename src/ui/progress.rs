use std::time::Duration;

use console::{Emoji, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::ui::icons::{CHECK, CROSS, PAUSE, PEN, PERSON, REVIEW, ROUTE, SHIELD, SPARKLE, STOP};
use crate::workflow::{
    BlackboardState, EngineStatus, SafetyFlag, Severity, StageName, WorkflowEvent,
};

/// Width drafts are wrapped to when printed.
const DRAFT_WIDTH: usize = 88;

/// Terminal view of one thread's run, rendered via `indicatif`.
///
/// Two bars are stacked vertically:
/// - Iteration bar, sized to the drafting budget
/// - Stage spinner, with the stage that just finished and its note
///
/// Step lines go through `MultiProgress::println` so they don't tear the bars.
pub struct RunUI {
    multi: MultiProgress,
    iteration_bar: ProgressBar,
    stage_bar: ProgressBar,
    verbose: bool,
}

impl RunUI {
    pub fn new(max_iterations: u32, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let iteration_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let iteration_bar = multi.add(ProgressBar::new(u64::from(max_iterations)));
        iteration_bar.set_style(iteration_style);
        iteration_bar.set_prefix("Drafts");

        let stage_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let stage_bar = multi.add(ProgressBar::new_spinner());
        stage_bar.set_style(stage_style);
        stage_bar.set_prefix(" Stage");
        stage_bar.enable_steady_tick(Duration::from_millis(120));
        stage_bar.set_message("starting...");

        Self {
            multi,
            iteration_bar,
            stage_bar,
            verbose,
        }
    }

    fn println(&self, line: impl AsRef<str>) {
        if self.multi.println(line.as_ref()).is_err() {
            eprintln!("{}", line.as_ref());
        }
    }

    /// Fold one engine event into the display.
    pub fn handle_event(&self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::StateUpdate {
                sequence_no,
                stage,
                state,
                ..
            } => {
                self.iteration_bar
                    .set_position(u64::from(state.iteration_count));
                self.iteration_bar.set_message(format!(
                    "safety {} · quality {}",
                    state.safety_score, state.quality_score
                ));
                let note = state
                    .last_note()
                    .filter(|n| n.stage == *stage)
                    .map(|n| n.message.clone())
                    .unwrap_or_default();
                self.stage_bar
                    .set_message(format!("{} {}", stage_icon(*stage), stage));
                if self.verbose {
                    self.println(format!(
                        "  {} {} {}",
                        style(format!("#{:<3}", sequence_no)).dim(),
                        stage_icon(*stage),
                        note
                    ));
                } else {
                    self.println(format!("  {}{}", stage_icon(*stage), style(stage).bold()));
                }
            }
            WorkflowEvent::Paused { pending_stage, .. } => {
                self.stage_bar
                    .set_message(format!("{}waiting before {}", PAUSE, pending_stage));
            }
            WorkflowEvent::Terminal { status, .. } => {
                self.stage_bar
                    .set_message(format!("{}{}", status_icon(*status), status));
            }
            WorkflowEvent::Error { message, .. } => {
                self.println(format!("  {}{}", CROSS, style(message).red()));
            }
        }
    }

    /// Stop the bars; anything printed afterwards goes straight to stdout.
    pub fn finish(&self) {
        self.stage_bar.finish_and_clear();
        self.iteration_bar.abandon();
    }
}

fn stage_icon(stage: StageName) -> &'static Emoji<'static, 'static> {
    match stage {
        StageName::Drafter => &PEN,
        StageName::SafetyReviewer => &SHIELD,
        StageName::QualityReviewer => &REVIEW,
        StageName::Coordinator => &ROUTE,
        StageName::HumanGate => &PERSON,
        StageName::Finalizer => &SPARKLE,
    }
}

fn status_icon(status: EngineStatus) -> &'static Emoji<'static, 'static> {
    match status {
        EngineStatus::TerminalApproved => &CHECK,
        EngineStatus::TerminalCancelled => &STOP,
        EngineStatus::PausedAtHumanGate => &PAUSE,
        EngineStatus::TerminalFailed => &CROSS,
        EngineStatus::NotStarted | EngineStatus::Running => &ROUTE,
    }
}

/// Print the draft awaiting review along with scores and flags.
pub fn print_review_summary(state: &BlackboardState) {
    println!();
    println!(
        "{} {}",
        PAUSE,
        style("Draft ready for review").bold().yellow()
    );
    println!(
        "  iterations: {}   safety: {}   quality: {}",
        state.iteration_count,
        score(state.safety_score),
        score(state.quality_score)
    );
    print_flags(&state.safety_flags);
    print_draft(&state.current_draft);
}

/// Print the outcome of a finished run.
pub fn print_outcome(status: EngineStatus, state: &BlackboardState) {
    println!();
    match status {
        EngineStatus::TerminalApproved => {
            println!("{}{}", CHECK, style("Draft approved").bold().green());
            print_draft(&state.current_draft);
        }
        EngineStatus::TerminalCancelled => {
            println!("{}{}", STOP, style("Run cancelled").bold().dim());
        }
        other => {
            println!("{}{}", CROSS, style(format!("Run ended: {}", other)).bold().red());
        }
    }
}

pub fn print_draft(draft: &str) {
    println!();
    if draft.trim().is_empty() {
        println!("  {}", style("(no draft)").dim());
    } else {
        let wrapped = textwrap::fill(draft, DRAFT_WIDTH - 4);
        println!("{}", textwrap::indent(&wrapped, "    "));
    }
}

fn print_flags(flags: &[SafetyFlag]) {
    for flag in flags {
        let severity = match flag.severity {
            Severity::Critical => style(flag.severity.as_str()).red().bold(),
            Severity::Warning => style(flag.severity.as_str()).yellow(),
        };
        println!("  {} [{}] {}: {}", SHIELD, severity, flag.location, flag.reason);
    }
}

fn score(value: u8) -> console::StyledObject<u8> {
    match value {
        80.. => style(value).green(),
        50..80 => style(value).yellow(),
        _ => style(value).red(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_stage_has_an_icon() {
        for stage in StageName::ALL {
            assert!(!stage_icon(stage).to_string().is_empty());
        }
    }

    #[test]
    fn test_ui_handles_each_event_kind() {
        let ui = RunUI::new(3, true);
        let mut state = BlackboardState::new("t-1", "intent");
        state.iteration_count = 1;
        ui.handle_event(&WorkflowEvent::StateUpdate {
            thread_id: "t-1".into(),
            sequence_no: 1,
            stage: StageName::Drafter,
            state: Box::new(state.clone()),
        });
        assert_eq!(ui.iteration_bar.position(), 1);
        ui.handle_event(&WorkflowEvent::Paused {
            thread_id: "t-1".into(),
            sequence_no: 2,
            pending_stage: StageName::HumanGate,
            state: Box::new(state),
        });
        assert!(ui.stage_bar.message().contains("human_gate"));
        ui.finish();
    }
}
