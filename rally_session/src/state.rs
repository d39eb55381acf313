// Joiner connection state as one explicit tagged enum.
//
// A joiner is always in exactly one `JoinerPhase`, and every change goes
// through `transition`, a pure function of (phase, input). There is no
// separate "connected" flag or "host left on purpose" flag to drift out of
// sync with the phase: an announced departure is the `Departing` phase, and
// the channel closing afterwards ends the session instead of retrying.
//
//   Connecting{0} --welcome--> Waiting --startGame--> Playing
//        |                        |                     |
//        | fail                   +------ lost ---------+--> Reconnecting{n}
//        v                                                      |   ^
//   Ended(Failed)        Reconnecting{n} --retry--> Connecting{n}   | fail
//                                                          |--------+
//   any --hostLeft/kicked--> Departing(r) --closed--> Ended(r)
//   any --leave--> Ended(Left)
//
// `JoinerStatus` is the UI-facing projection of the phase.

/// Why a joiner session ended (or is about to).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// The host announced it was leaving.
    HostLeft,
    /// The host removed us.
    Kicked { reason: Option<String> },
    /// We left on our own.
    Left,
    /// Joining or rejoining gave up.
    Failed(String),
}

/// Lifecycle phase of a joiner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinerPhase {
    /// Dialing or waiting for `welcome`. Attempt 0 is the initial join;
    /// higher attempts are automatic rejoins.
    Connecting { attempt: u32 },
    /// Admitted, match not started.
    Waiting,
    /// Admitted, match running.
    Playing,
    /// Channel lost without notice; rejoin attempt `attempt` is scheduled.
    Reconnecting { attempt: u32 },
    /// The host announced a departure; the channel close is expected next.
    Departing(EndReason),
    /// Terminal.
    Ended(EndReason),
}

/// Something that happened to a joiner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinerInput {
    Welcomed { game_running: bool },
    GameStarted,
    HostLeftNotice,
    KickedNotice { reason: Option<String> },
    /// The channel closed or errored.
    ChannelLost,
    /// The current attempt could not open, timed out, or was refused.
    AttemptFailed { reason: String },
    /// A scheduled rejoin is starting now.
    RetryStarted,
    LeaveRequested,
}

/// What the UI shows for a joiner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinerStatus {
    Connecting,
    ConnectedWaiting,
    InGame,
    Reconnecting { attempt: u32 },
    HostLeft,
    Kicked { reason: Option<String> },
    Left,
    Failed(String),
}

/// Compute the next phase. `max_attempts` bounds automatic rejoins.
pub fn transition(phase: JoinerPhase, input: JoinerInput, max_attempts: u32) -> JoinerPhase {
    use JoinerInput as I;
    use JoinerPhase as P;

    match (phase, input) {
        (P::Ended(r), _) => P::Ended(r),
        (_, I::LeaveRequested) => P::Ended(EndReason::Left),

        (P::Departing(r), I::ChannelLost | I::AttemptFailed { .. }) => P::Ended(r),
        (P::Departing(r), _) => P::Departing(r),
        (_, I::HostLeftNotice) => P::Departing(EndReason::HostLeft),
        (_, I::KickedNotice { reason }) => P::Departing(EndReason::Kicked { reason }),

        (P::Connecting { .. }, I::Welcomed { game_running: true }) => P::Playing,
        (P::Connecting { .. }, I::Welcomed { game_running: false }) => P::Waiting,
        (P::Waiting, I::GameStarted) => P::Playing,

        (P::Waiting | P::Playing, I::ChannelLost) => P::Reconnecting { attempt: 1 },
        (P::Connecting { attempt: 0 }, I::AttemptFailed { reason }) => {
            P::Ended(EndReason::Failed(reason))
        }
        (P::Connecting { attempt: 0 }, I::ChannelLost) => {
            P::Ended(EndReason::Failed("connection closed during join".into()))
        }
        (P::Connecting { attempt }, I::AttemptFailed { .. } | I::ChannelLost) => {
            if attempt >= max_attempts {
                P::Ended(EndReason::Failed(format!(
                    "gave up after {attempt} reconnect attempts"
                )))
            } else {
                P::Reconnecting {
                    attempt: attempt + 1,
                }
            }
        }
        (P::Reconnecting { attempt }, I::RetryStarted) => P::Connecting { attempt },

        (phase, _) => phase,
    }
}

impl JoinerPhase {
    pub fn status(&self) -> JoinerStatus {
        match self {
            JoinerPhase::Connecting { attempt: 0 } => JoinerStatus::Connecting,
            JoinerPhase::Connecting { attempt } | JoinerPhase::Reconnecting { attempt } => {
                JoinerStatus::Reconnecting { attempt: *attempt }
            }
            JoinerPhase::Waiting => JoinerStatus::ConnectedWaiting,
            JoinerPhase::Playing => JoinerStatus::InGame,
            JoinerPhase::Departing(r) | JoinerPhase::Ended(r) => match r {
                EndReason::HostLeft => JoinerStatus::HostLeft,
                EndReason::Kicked { reason } => JoinerStatus::Kicked {
                    reason: reason.clone(),
                },
                EndReason::Left => JoinerStatus::Left,
                EndReason::Failed(why) => JoinerStatus::Failed(why.clone()),
            },
        }
    }

    /// True once admitted and not yet lost.
    pub fn is_admitted(&self) -> bool {
        matches!(self, JoinerPhase::Waiting | JoinerPhase::Playing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JoinerPhase::Ended(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(start: JoinerPhase, inputs: Vec<JoinerInput>) -> JoinerPhase {
        inputs
            .into_iter()
            .fold(start, |phase, input| transition(phase, input, 3))
    }

    #[test]
    fn join_then_start() {
        let phase = run(
            JoinerPhase::Connecting { attempt: 0 },
            vec![
                JoinerInput::Welcomed {
                    game_running: false,
                },
                JoinerInput::GameStarted,
            ],
        );
        assert_eq!(phase, JoinerPhase::Playing);
    }

    #[test]
    fn rejoin_mid_game_goes_straight_to_playing() {
        let phase = run(
            JoinerPhase::Connecting { attempt: 2 },
            vec![JoinerInput::Welcomed { game_running: true }],
        );
        assert_eq!(phase.status(), JoinerStatus::InGame);
    }

    #[test]
    fn unannounced_loss_reconnects() {
        let phase = run(JoinerPhase::Playing, vec![JoinerInput::ChannelLost]);
        assert_eq!(phase, JoinerPhase::Reconnecting { attempt: 1 });
        assert_eq!(phase.status(), JoinerStatus::Reconnecting { attempt: 1 });
    }

    #[test]
    fn announced_departure_never_reconnects() {
        let phase = run(
            JoinerPhase::Playing,
            vec![JoinerInput::HostLeftNotice, JoinerInput::ChannelLost],
        );
        assert_eq!(phase, JoinerPhase::Ended(EndReason::HostLeft));

        let phase = run(
            JoinerPhase::Waiting,
            vec![
                JoinerInput::KickedNotice {
                    reason: Some("afk".into()),
                },
                JoinerInput::ChannelLost,
                JoinerInput::RetryStarted,
            ],
        );
        assert_eq!(
            phase.status(),
            JoinerStatus::Kicked {
                reason: Some("afk".into())
            }
        );
    }

    #[test]
    fn initial_join_failure_is_terminal() {
        let phase = run(
            JoinerPhase::Connecting { attempt: 0 },
            vec![JoinerInput::AttemptFailed {
                reason: "timed out".into(),
            }],
        );
        assert_eq!(phase, JoinerPhase::Ended(EndReason::Failed("timed out".into())));
    }

    #[test]
    fn retries_are_bounded() {
        let mut phase = JoinerPhase::Reconnecting { attempt: 1 };
        for _ in 0..3 {
            phase = transition(phase, JoinerInput::RetryStarted, 3);
            phase = transition(
                phase,
                JoinerInput::AttemptFailed {
                    reason: "refused".into(),
                },
                3,
            );
        }
        assert!(phase.is_terminal());
        assert!(matches!(phase.status(), JoinerStatus::Failed(_)));
    }

    #[test]
    fn ended_absorbs_everything() {
        let phase = run(
            JoinerPhase::Ended(EndReason::Left),
            vec![
                JoinerInput::Welcomed { game_running: true },
                JoinerInput::RetryStarted,
            ],
        );
        assert_eq!(phase, JoinerPhase::Ended(EndReason::Left));
    }
}
