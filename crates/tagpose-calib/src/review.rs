use crate::BoardObservation;
use std::io::{BufRead, Write};
use tagpose_core::ColorFrame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReviewDecision {
    Accept,
    Skip,
    Abort,
}

/// Operator gate for each detected checkerboard.
pub trait ObservationReview {
    /// `accepted` is the number of views kept so far.
    fn review(
        &mut self,
        frame: &ColorFrame,
        observation: &BoardObservation,
        accepted: usize,
    ) -> ReviewDecision;
}

impl<R: ObservationReview + ?Sized> ObservationReview for Box<R> {
    fn review(
        &mut self,
        frame: &ColorFrame,
        observation: &BoardObservation,
        accepted: usize,
    ) -> ReviewDecision {
        (**self).review(frame, observation, accepted)
    }
}

/// Keeps every complete board. Used for unattended runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl ObservationReview for AcceptAll {
    fn review(&mut self, _: &ColorFrame, _: &BoardObservation, _: usize) -> ReviewDecision {
        ReviewDecision::Accept
    }
}

/// Line-based review: an empty line accepts, `q` aborts, anything else
/// skips. End of input aborts.
pub struct ConsoleReview<R, W> {
    input: R,
    prompt: W,
}

impl<R: BufRead, W: Write> ConsoleReview<R, W> {
    pub fn new(input: R, prompt: W) -> Self {
        Self { input, prompt }
    }
}

impl ConsoleReview<std::io::StdinLock<'static>, std::io::Stderr> {
    pub fn stdin() -> Self {
        Self::new(std::io::stdin().lock(), std::io::stderr())
    }
}

impl<R: BufRead, W: Write> ObservationReview for ConsoleReview<R, W> {
    fn review(
        &mut self,
        frame: &ColorFrame,
        observation: &BoardObservation,
        accepted: usize,
    ) -> ReviewDecision {
        // A broken prompt stream is not fatal; the answer still decides.
        let _ = write!(
            self.prompt,
            "board found ({} corners, {}x{} frame, {} kept). [enter] keep, s skip, q quit: ",
            observation.corners.len(),
            frame.width,
            frame.height,
            accepted
        );
        let _ = self.prompt.flush();

        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) => ReviewDecision::Abort,
            Ok(_) => match line.trim() {
                "" => ReviewDecision::Accept,
                "q" | "Q" => ReviewDecision::Abort,
                _ => ReviewDecision::Skip,
            },
            Err(e) => {
                log::warn!("review input failed: {e}");
                ReviewDecision::Abort
            }
        }
    }
}
