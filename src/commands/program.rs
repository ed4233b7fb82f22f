//! Program command implementation
//!
//! Runs one full programming session against an emulated card. The card is
//! presented through the dispatch gate from a separate reader thread, the
//! same way a platform tag callback would hand it over.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use rfaccess_core::error::Severity;
use rfaccess_core::handoff;
use rfaccess_core::profile::ReaderConfig;
use rfaccess_core::protocol::{ProtocolProgress, ProtocolState};
use rfaccess_core::tag::{CardSize, TagLink};
use rfaccess_core::ProtocolOutcome;
use rfaccess_dummy::{EmulatedCard, Fault};
use rfaccess_session::{Attempt, ProgramSession, Reader, RecordStore, SessionReport, UserId};

use crate::store::{DetachedStore, FileStore};

/// Delay before the emulated card enters the field
const TAP_DELAY: Duration = Duration::from_millis(300);

/// Options of the program command
pub struct ProgramArgs<'a> {
    pub uri: Option<&'a str>,
    pub user: Option<&'a str>,
    pub store: Option<&'a Path>,
    pub image: Option<&'a Path>,
    pub card: CardSize,
    pub remove_after: Option<usize>,
}

/// Program a request onto an emulated card
pub fn run_program(
    config: &ReaderConfig,
    args: &ProgramArgs<'_>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn RecordStore> = match args.store {
        Some(path) => Arc::new(FileStore::open(path, config.profile.clone())?),
        None => Arc::new(DetachedStore),
    };

    let card = load_card(args.image, args.card)?;
    if let Some(ops) = args.remove_after {
        card.inject(Fault::RemoveAfter { ops });
    }

    let reader = Reader::new(TagLink::new(config.key_policy.clone()));
    let session = ProgramSession::new(reader.clone(), store);

    let Some(attempt) = start_attempt(&session, config, args)? else {
        return Ok(());
    };
    println!(
        "Programming request {} ({} blocks)",
        attempt.request().id(),
        attempt.request().payload().len()
    );

    let tap = {
        let reader = reader.clone();
        let card = card.clone();
        thread::spawn(move || {
            thread::sleep(TAP_DELAY);
            reader.deliver(Box::new(card)).is_ok()
        })
    };

    let mut progress = SpinnerProgress::new()?;
    let report = attempt.run_with_progress(&mut progress);
    progress.clear();

    if !tap.join().unwrap_or(false) {
        log::warn!("Card entered the field with no armed session");
    }

    if let Some(path) = args.image {
        fs::write(path, card.image())?;
        println!("Saved card image to {}", path.display());
    }

    print_report(&report);
    if report.sync_pending {
        let flush = session.retry_sync();
        if flush.remaining > 0 {
            println!(
                "Record store still not updated, {} request(s) waiting to sync",
                flush.remaining
            );
        }
    }

    if report.outcome.is_success() {
        Ok(())
    } else {
        Err(format!("Card not programmed: {}", report.outcome).into())
    }
}

fn start_attempt(
    session: &ProgramSession,
    config: &ReaderConfig,
    args: &ProgramArgs<'_>,
) -> Result<Option<Attempt>, Box<dyn std::error::Error>> {
    match (args.uri, args.user) {
        (Some(uri), _) => {
            let request = handoff::resolve(uri, &config.profile)?;
            Ok(Some(session.start(request)?))
        }
        (None, Some(user)) => {
            let attempt = session.start_pending(&UserId::new(user))?;
            if attempt.is_none() {
                println!("No pending requests for {}", user);
            }
            Ok(attempt)
        }
        (None, None) => Err("Either --uri or --user is required".into()),
    }
}

/// Load the card image, or create a blank card when there is none yet
fn load_card(image: Option<&Path>, size: CardSize) -> Result<EmulatedCard, Box<dyn std::error::Error>> {
    match image {
        Some(path) if path.exists() => {
            let raw = fs::read(path)?;
            let card = EmulatedCard::from_image(&raw).ok_or_else(|| {
                format!("{} is not a card image ({} bytes)", path.display(), raw.len())
            })?;
            log::info!(
                "Loaded {} card from {}",
                card.config().size.name(),
                path.display()
            );
            Ok(card)
        }
        Some(path) => {
            log::info!("{} does not exist, starting from a blank {} card", path.display(), size.name());
            Ok(EmulatedCard::new(size))
        }
        None => Ok(EmulatedCard::new(size)),
    }
}

/// What to tell the operator after a failed attempt
fn outcome_hint(outcome: &ProtocolOutcome) -> Option<&'static str> {
    match outcome.class()?.severity() {
        Severity::Expected => Some("Tap again to retry"),
        Severity::Failure => Some("Card not programmed; use another card or ask an administrator"),
        Severity::Background => None,
    }
}

fn print_report(report: &SessionReport) {
    if report.cancelled {
        println!("Attempt cancelled");
        return;
    }

    match report.outcome.class().map(|class| class.severity()) {
        None | Some(Severity::Background) => println!("Outcome: {}", report.outcome),
        Some(Severity::Expected) => log::info!("Outcome: {}", report.outcome),
        Some(Severity::Failure) => eprintln!("Error: {}", report.outcome),
    }
    if let Some(message) = report.user_message() {
        println!("{}", message);
    }
    if let Some(hint) = outcome_hint(&report.outcome) {
        println!("{}", hint);
    }
    if report.sync_pending {
        println!(
            "Card programmed, but request {} is not yet marked consumed",
            report.request_id
        );
    }
}

/// Spinner reporting protocol progress
struct SpinnerProgress {
    pb: ProgressBar,
}

impl SpinnerProgress {
    fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
        pb.set_message("Hold the card to the reader...");
        pb.enable_steady_tick(Duration::from_millis(100));
        Ok(Self { pb })
    }

    fn clear(&self) {
        if !self.pb.is_finished() {
            self.pb.finish_and_clear();
        }
    }
}

impl ProtocolProgress for SpinnerProgress {
    fn state_changed(&mut self, state: ProtocolState) {
        if state.is_done() {
            self.clear();
        } else {
            self.pb.set_message(format!("{}...", state));
        }
    }

    fn block_written(&mut self, block: u16, done: usize, total: usize) {
        self.pb
            .set_message(format!("Writing block {} ({}/{})", block, done, total));
    }

    fn block_verified(&mut self, block: u16, done: usize, total: usize) {
        self.pb
            .set_message(format!("Verifying block {} ({}/{})", block, done, total));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfaccess_core::error::{Incompatibility, RejectReason};

    #[test]
    fn test_outcome_hint_follows_severity() {
        assert_eq!(outcome_hint(&ProtocolOutcome::Success), None);
        assert_eq!(
            outcome_hint(&ProtocolOutcome::LinkLost),
            Some("Tap again to retry")
        );

        let rejected = outcome_hint(&ProtocolOutcome::Rejected(RejectReason::Authentication { sector: 1 }));
        let incompatible = outcome_hint(&ProtocolOutcome::IncompatibleTag(Incompatibility::Technology));
        assert!(rejected.unwrap().starts_with("Card not programmed"));
        assert_eq!(rejected, incompatible);
    }
}
