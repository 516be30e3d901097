//! Supervisor state machine.
//!
//! Pure decision logic mapping `{stage, qualification score, escalation
//! count}` to the next move. All re-routing passes back through here;
//! handlers never hand control to one another directly.

use thiserror::Error;

use crate::domain::conversation::{ConversationState, HandlerKind, Stage, MAX_SCORE, MIN_SCORE};

pub const DEFAULT_MAX_ESCALATIONS: u32 = 2;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("score bands must satisfy {min} <= low_max < mid_max < {max}, got low_max={low_max} mid_max={mid_max}", min = MIN_SCORE, max = MAX_SCORE)]
    InvalidBands { low_max: u8, mid_max: u8 },
}

/// Three disjoint, contiguous score bands over `MIN_SCORE..=MAX_SCORE`.
/// Boundaries are inclusive on the lower edge of each band:
/// low = `[MIN, low_max]`, mid = `[low_max+1, mid_max]`, hot = `[mid_max+1, MAX]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScoreBands {
    low_max: u8,
    mid_max: u8,
}

impl ScoreBands {
    pub fn new(low_max: u8, mid_max: u8) -> Result<Self, RouteError> {
        if low_max < MIN_SCORE || low_max >= mid_max || mid_max >= MAX_SCORE {
            return Err(RouteError::InvalidBands { low_max, mid_max });
        }
        Ok(Self { low_max, mid_max })
    }

    pub fn band(&self, score: u8) -> HandlerKind {
        let score = score.clamp(MIN_SCORE, MAX_SCORE);
        if score <= self.low_max {
            HandlerKind::Cold
        } else if score <= self.mid_max {
            HandlerKind::Warm
        } else {
            HandlerKind::Hot
        }
    }
}

impl Default for ScoreBands {
    fn default() -> Self {
        Self { low_max: 4, mid_max: 7 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoutingPolicy {
    pub bands: ScoreBands,
    pub max_escalations: u32,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self { bands: ScoreBands::default(), max_escalations: DEFAULT_MAX_ESCALATIONS }
    }
}

/// Router decision for one evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Routing {
    /// Engage the handler for the score's band.
    Engage(HandlerKind),
    /// The escalation bound was hit; move to the terminal stage. The
    /// responder may still flush pending messages.
    Terminate,
    /// The conversation is already terminal; terminal is absorbing.
    AlreadyTerminal,
}

/// Evaluate the transition rule once, after scoring, for one inbound event.
///
/// The escalation bound is checked first and wins regardless of score, which
/// is what keeps handler/router loops finite.
pub fn route(state: &ConversationState, policy: &RoutingPolicy) -> Routing {
    if state.stage == Stage::Terminal {
        return Routing::AlreadyTerminal;
    }
    if state.escalation_count >= policy.max_escalations {
        return Routing::Terminate;
    }
    Routing::Engage(policy.bands.band(state.qualification_score))
}
