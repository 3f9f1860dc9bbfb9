//! FUD-attack override
//!
//! A fresh coordinated attack puts a symbol into override mode: the combinator
//! is skipped, the loop waits for the coin's own Ichimoku to turn SHORT and
//! then forces a SHORT. The mode ends once the attack has gone quiet for long
//! enough and the coin is no longer bearish, or when an engaged short sees the
//! coin turn LONG.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::advisory::FudAttackResult;
use crate::config::FudConfig;
use crate::types::TradeSignal;

pub const REASON_FUD_ATTACK_FORCED: &str = "fud_attack_forced";
pub const REASON_FUD_MODE_SWITCH: &str = "fud_mode_switch";
pub const REASON_FUD_MODE_EXIT: &str = "fud_mode_exit";
pub const REASON_FUD_MODE_LONG_SIGNAL: &str = "fud_mode_long_signal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FudMode {
    Inactive,
    WaitingForShort { last_attack_at: DateTime<Utc> },
    ShortEngaged { last_attack_at: DateTime<Utc> },
}

impl Default for FudMode {
    fn default() -> Self {
        FudMode::Inactive
    }
}

impl FudMode {
    pub fn is_active(&self) -> bool {
        !matches!(self, FudMode::Inactive)
    }

    pub fn last_attack_at(&self) -> Option<DateTime<Utc>> {
        match self {
            FudMode::Inactive => None,
            FudMode::WaitingForShort { last_attack_at } | FudMode::ShortEngaged { last_attack_at } => {
                Some(*last_attack_at)
            }
        }
    }

    fn with_last_attack(self, at: DateTime<Utc>) -> Self {
        match self {
            FudMode::Inactive => FudMode::Inactive,
            FudMode::WaitingForShort { .. } => FudMode::WaitingForShort { last_attack_at: at },
            FudMode::ShortEngaged { .. } => FudMode::ShortEngaged { last_attack_at: at },
        }
    }
}

impl fmt::Display for FudMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FudMode::Inactive => write!(f, "inactive"),
            FudMode::WaitingForShort { .. } => write!(f, "active-waiting-for-short"),
            FudMode::ShortEngaged { .. } => write!(f, "active-short-engaged"),
        }
    }
}

/// What the loop must do this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FudAction {
    /// Override not active, run the combinator
    PassThrough,
    /// Override active, take no position action
    Hold,
    /// Close any LONG and hold a SHORT
    ForceShort,
    /// Close any SHORT and leave override mode
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FudStep {
    /// Mode to commit once `action` has been carried out
    pub next: FudMode,
    pub action: FudAction,
    pub reason: Option<&'static str>,
}

/// Advance the override by one cycle.
///
/// Only a fresh attack activates the override. Once active, the quiet period
/// runs from the latest attack time reported, fresh or not. Activation and
/// the first evaluation happen in the same cycle, so an attack that arrives
/// while the coin is already SHORT forces the short immediately.
pub fn step(
    mode: FudMode,
    attack: Option<&FudAttackResult>,
    coin_signal: TradeSignal,
    now: DateTime<Utc>,
    cfg: &FudConfig,
) -> FudStep {
    let reported_at = attack.filter(|a| a.has_attack).and_then(|a| a.last_attack_time);
    let fresh_at = attack
        .filter(|a| a.is_fresh(now, cfg.fresh_window()))
        .and_then(|a| a.last_attack_time);

    let (mode, switched) = match mode {
        FudMode::Inactive => match fresh_at {
            Some(at) => (FudMode::WaitingForShort { last_attack_at: at }, true),
            None => {
                return FudStep {
                    next: FudMode::Inactive,
                    action: FudAction::PassThrough,
                    reason: None,
                }
            }
        },
        active => match reported_at {
            Some(at) => {
                let latest = active.last_attack_at().map_or(at, |prev| prev.max(at));
                (active.with_last_attack(latest), false)
            }
            None => (active, false),
        },
    };

    let quiet_for = mode
        .last_attack_at()
        .map(|at| now - at)
        .unwrap_or_else(Duration::zero);
    let attack_over = quiet_for > cfg.exit_after()
        && matches!(coin_signal, TradeSignal::Long | TradeSignal::Empty);

    let hold_reason = if switched {
        Some(REASON_FUD_MODE_SWITCH)
    } else {
        None
    };

    match mode {
        _ if attack_over => FudStep {
            next: FudMode::Inactive,
            action: FudAction::Exit,
            reason: Some(REASON_FUD_MODE_EXIT),
        },
        FudMode::ShortEngaged { .. } if coin_signal == TradeSignal::Long => FudStep {
            next: FudMode::Inactive,
            action: FudAction::Exit,
            reason: Some(REASON_FUD_MODE_LONG_SIGNAL),
        },
        FudMode::WaitingForShort { last_attack_at } if coin_signal == TradeSignal::Short => FudStep {
            next: FudMode::ShortEngaged { last_attack_at },
            action: FudAction::ForceShort,
            reason: Some(REASON_FUD_ATTACK_FORCED),
        },
        _ => FudStep {
            next: mode,
            action: FudAction::Hold,
            reason: hold_reason,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FudConfig {
        FudConfig {
            fresh_window_secs: 3600,
            exit_after_secs: 12 * 3600,
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn attack_at(at: DateTime<Utc>) -> FudAttackResult {
        FudAttackResult {
            has_attack: true,
            confidence: 0.9,
            last_attack_time: Some(at),
            ..FudAttackResult::none("")
        }
    }

    #[test]
    fn no_attack_passes_through() {
        let step = step(FudMode::Inactive, None, TradeSignal::Short, t0(), &cfg());
        assert_eq!(step.action, FudAction::PassThrough);
        assert_eq!(step.next, FudMode::Inactive);
    }

    #[test]
    fn stale_attack_does_not_activate() {
        let old = attack_at(t0() - Duration::minutes(61));
        let step = step(FudMode::Inactive, Some(&old), TradeSignal::Short, t0(), &cfg());
        assert_eq!(step.action, FudAction::PassThrough);
    }

    #[test]
    fn fresh_attack_waits_for_coin_short() {
        let attack = attack_at(t0() - Duration::minutes(30));
        let first = step(FudMode::Inactive, Some(&attack), TradeSignal::Long, t0(), &cfg());
        assert_eq!(first.action, FudAction::Hold);
        assert_eq!(first.reason, Some(REASON_FUD_MODE_SWITCH));
        assert_eq!(
            first.next,
            FudMode::WaitingForShort {
                last_attack_at: t0() - Duration::minutes(30)
            }
        );

        let later = t0() + Duration::minutes(5);
        let second = step(first.next, Some(&attack), TradeSignal::Short, later, &cfg());
        assert_eq!(second.action, FudAction::ForceShort);
        assert_eq!(second.reason, Some(REASON_FUD_ATTACK_FORCED));
        assert!(matches!(second.next, FudMode::ShortEngaged { .. }));
    }

    #[test]
    fn activation_with_short_coin_forces_immediately() {
        let attack = attack_at(t0() - Duration::minutes(10));
        let step = step(FudMode::Inactive, Some(&attack), TradeSignal::Short, t0(), &cfg());
        assert_eq!(step.action, FudAction::ForceShort);
    }

    #[test]
    fn engaged_short_exits_on_long_signal() {
        let mode = FudMode::ShortEngaged {
            last_attack_at: t0() - Duration::hours(1),
        };
        let step = step(mode, None, TradeSignal::Long, t0(), &cfg());
        assert_eq!(step.action, FudAction::Exit);
        assert_eq!(step.reason, Some(REASON_FUD_MODE_LONG_SIGNAL));
        assert_eq!(step.next, FudMode::Inactive);
    }

    #[test]
    fn quiet_attack_exits_unless_coin_is_short() {
        let mode = FudMode::WaitingForShort {
            last_attack_at: t0() - Duration::hours(13),
        };
        let exit = step(mode, None, TradeSignal::Empty, t0(), &cfg());
        assert_eq!(exit.action, FudAction::Exit);
        assert_eq!(exit.reason, Some(REASON_FUD_MODE_EXIT));

        let engaged = FudMode::ShortEngaged {
            last_attack_at: t0() - Duration::hours(13),
        };
        let stay = step(engaged, None, TradeSignal::Short, t0(), &cfg());
        assert_eq!(stay.action, FudAction::Hold);
        assert_eq!(stay.next, engaged);
    }

    #[test]
    fn newer_attack_extends_the_window() {
        let mode = FudMode::ShortEngaged {
            last_attack_at: t0() - Duration::hours(13),
        };
        let renewed = attack_at(t0() - Duration::minutes(20));
        let step = step(mode, Some(&renewed), TradeSignal::Empty, t0(), &cfg());
        assert_eq!(step.action, FudAction::Hold);
        assert_eq!(step.next.last_attack_at(), Some(t0() - Duration::minutes(20)));
    }

    #[test]
    fn stale_report_still_moves_the_quiet_period() {
        let mode = FudMode::WaitingForShort {
            last_attack_at: t0() - Duration::hours(13),
        };
        // outside the fresh window, yet newer than what the mode holds
        let report = attack_at(t0() - Duration::hours(3));
        let held = step(mode, Some(&report), TradeSignal::Empty, t0(), &cfg());
        assert_eq!(held.action, FudAction::Hold);
        assert_eq!(held.next.last_attack_at(), Some(t0() - Duration::hours(3)));

        // an older report never moves it back
        let older = attack_at(t0() - Duration::hours(20));
        let exit = step(mode, Some(&older), TradeSignal::Empty, t0(), &cfg());
        assert_eq!(exit.action, FudAction::Exit);
    }

    #[test]
    fn engaged_short_holds_on_empty_signal() {
        let mode = FudMode::ShortEngaged {
            last_attack_at: t0() - Duration::hours(2),
        };
        let step = step(mode, None, TradeSignal::Empty, t0(), &cfg());
        assert_eq!(step.action, FudAction::Hold);
        assert_eq!(step.reason, None);
    }
}
