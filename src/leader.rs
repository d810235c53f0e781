//! Leader election among clients sharing one local store.
//!
//! Exactly one client per store talks to the remote at any time. Candidates
//! announce a `(client_id, tiebreak)` tuple on the broadcast channel; when the
//! election window closes, the highest tuple wins. The winner heartbeats;
//! followers call a fresh election when heartbeats go quiet or the leader
//! leaves. The channel is lossy, so every rule here must converge from
//! repeated announcements rather than reliable delivery.

use std::time::Duration;

use crate::config::NetworkSettings;

// ============================================================================
// Wire messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionMessage {
    /// A candidate announces itself for the current election.
    Propose { client_id: String, tiebreak: String },
    /// The winner announces (and keeps announcing) its claim.
    Heartbeat { client_id: String },
    /// A leader steps down (shutdown).
    Resign { client_id: String },
}

// ============================================================================
// Election state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Waiting out an election window after proposing.
    Candidate,
    Follower,
    Leader,
}

/// What the coordinator driving the machine should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionAction {
    /// Broadcast our proposal.
    Announce { client_id: String, tiebreak: String },
    /// Broadcast a heartbeat.
    Heartbeat { client_id: String },
    /// We just won: open the remote.
    BecomeLeader,
    /// We just lost leadership (a higher claim appeared or we resigned).
    StepDown,
    None,
}

/// Pure election logic; the coordinator owns the clocks and the channel.
///
/// Timers are expressed as "call [`Election::tick`] after [`Election::next_deadline`]".
#[derive(Debug)]
pub struct Election {
    client_id: String,
    tiebreak: String,
    role: Role,
    /// Best tuple observed during the current election window (ours included).
    best: (String, String),
    settings: NetworkSettings,
    /// Milliseconds of leader silence accumulated by `tick`.
    silence_ms: u64,
}

impl Election {
    pub fn new(client_id: impl Into<String>, settings: NetworkSettings) -> Self {
        let client_id = client_id.into();
        let tiebreak = uuid::Uuid::new_v4().to_string();
        Self {
            best: (client_id.clone(), tiebreak.clone()),
            client_id,
            tiebreak,
            role: Role::Candidate,
            settings,
            silence_ms: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Start (or restart) an election: become a candidate and announce.
    pub fn start(&mut self) -> ElectionAction {
        self.role = Role::Candidate;
        self.best = (self.client_id.clone(), self.tiebreak.clone());
        self.silence_ms = 0;
        ElectionAction::Announce {
            client_id: self.client_id.clone(),
            tiebreak: self.tiebreak.clone(),
        }
    }

    /// The election window elapsed: resolve the winner.
    pub fn close_window(&mut self) -> ElectionAction {
        if self.role != Role::Candidate {
            return ElectionAction::None;
        }
        if self.best.0 == self.client_id {
            self.role = Role::Leader;
            ElectionAction::BecomeLeader
        } else {
            self.role = Role::Follower;
            self.silence_ms = 0;
            ElectionAction::None
        }
    }

    /// Feed an incoming election message.
    pub fn on_message(&mut self, msg: &ElectionMessage) -> ElectionAction {
        match msg {
            ElectionMessage::Propose {
                client_id,
                tiebreak,
            } => {
                if *client_id == self.client_id {
                    return ElectionAction::None;
                }
                let claim = (client_id.clone(), tiebreak.clone());
                match self.role {
                    Role::Candidate => {
                        if claim > self.best {
                            self.best = claim;
                            ElectionAction::None
                        } else {
                            // The weaker candidate may not have seen our
                            // proposal; repeating ours keeps it from winning.
                            ElectionAction::Announce {
                                client_id: self.client_id.clone(),
                                tiebreak: self.tiebreak.clone(),
                            }
                        }
                    }
                    Role::Leader => {
                        // Someone is electing over our head; assert the claim.
                        ElectionAction::Heartbeat {
                            client_id: self.client_id.clone(),
                        }
                    }
                    Role::Follower => ElectionAction::None,
                }
            }
            ElectionMessage::Heartbeat { client_id } => {
                if *client_id == self.client_id {
                    return ElectionAction::None;
                }
                match self.role {
                    // An established leader outranks any election in progress.
                    Role::Candidate => {
                        self.role = Role::Follower;
                        self.silence_ms = 0;
                        ElectionAction::None
                    }
                    Role::Follower => {
                        self.silence_ms = 0;
                        ElectionAction::None
                    }
                    Role::Leader => {
                        // Two leaders: highest client id keeps the seat.
                        if client_id.as_str() > self.client_id.as_str() {
                            self.role = Role::Follower;
                            self.silence_ms = 0;
                            ElectionAction::StepDown
                        } else {
                            ElectionAction::Heartbeat {
                                client_id: self.client_id.clone(),
                            }
                        }
                    }
                }
            }
            ElectionMessage::Resign { client_id } => {
                if *client_id == self.client_id || self.role == Role::Leader {
                    return ElectionAction::None;
                }
                self.start()
            }
        }
    }

    /// Advance follower silence tracking by `elapsed_ms`. Returns a fresh
    /// proposal when the leader has been quiet past the heartbeat timeout.
    pub fn tick(&mut self, elapsed_ms: u64) -> ElectionAction {
        if self.role != Role::Follower || self.settings.heartbeat_timeout_ms == 0 {
            return ElectionAction::None;
        }
        self.silence_ms = self.silence_ms.saturating_add(elapsed_ms);
        if self.silence_ms >= self.settings.heartbeat_timeout_ms {
            self.start()
        } else {
            ElectionAction::None
        }
    }

    /// How long the coordinator should sleep before the next `close_window`
    /// (candidates) or `tick` (followers / leader heartbeats).
    pub fn next_deadline(&self) -> Duration {
        let ms = match self.role {
            Role::Candidate => self.settings.election_timeout_ms,
            Role::Leader => self.settings.heartbeat_interval_ms.max(1),
            Role::Follower => self
                .settings
                .heartbeat_interval_ms
                .max(1)
                .min(self.settings.heartbeat_timeout_ms.max(1)),
        };
        Duration::from_millis(ms)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> NetworkSettings {
        NetworkSettings {
            election_timeout_ms: 10,
            heartbeat_interval_ms: 5,
            heartbeat_timeout_ms: 20,
            ..NetworkSettings::default()
        }
    }

    #[test]
    fn lone_candidate_wins_its_own_election() {
        let mut e = Election::new("c1", settings());
        assert!(matches!(e.start(), ElectionAction::Announce { .. }));
        assert_eq!(e.close_window(), ElectionAction::BecomeLeader);
        assert!(e.is_leader());
    }

    #[test]
    fn highest_tuple_wins() {
        let mut low = Election::new("a-client", settings());
        low.start();
        low.on_message(&ElectionMessage::Propose {
            client_id: "z-client".to_string(),
            tiebreak: "t".to_string(),
        });
        assert_eq!(low.close_window(), ElectionAction::None);
        assert_eq!(low.role(), Role::Follower);

        let mut high = Election::new("z-client", settings());
        high.start();
        high.on_message(&ElectionMessage::Propose {
            client_id: "a-client".to_string(),
            tiebreak: "t".to_string(),
        });
        assert_eq!(high.close_window(), ElectionAction::BecomeLeader);
    }

    #[test]
    fn candidate_defers_to_established_leader() {
        let mut e = Election::new("z-client", settings());
        e.start();
        e.on_message(&ElectionMessage::Heartbeat {
            client_id: "a-client".to_string(),
        });
        assert_eq!(e.role(), Role::Follower);
        assert_eq!(e.close_window(), ElectionAction::None);
    }

    #[test]
    fn follower_calls_election_after_heartbeat_timeout() {
        let mut e = Election::new("c1", settings());
        e.start();
        e.on_message(&ElectionMessage::Heartbeat {
            client_id: "z".to_string(),
        });
        assert_eq!(e.role(), Role::Follower);

        assert_eq!(e.tick(10), ElectionAction::None);
        // Heartbeat arrives: silence resets.
        e.on_message(&ElectionMessage::Heartbeat {
            client_id: "z".to_string(),
        });
        assert_eq!(e.tick(10), ElectionAction::None);
        assert!(matches!(e.tick(10), ElectionAction::Announce { .. }));
        assert_eq!(e.role(), Role::Candidate);
    }

    #[test]
    fn follower_reacts_to_resignation() {
        let mut e = Election::new("c1", settings());
        e.start();
        e.on_message(&ElectionMessage::Heartbeat {
            client_id: "z".to_string(),
        });
        let action = e.on_message(&ElectionMessage::Resign {
            client_id: "z".to_string(),
        });
        assert!(matches!(action, ElectionAction::Announce { .. }));
        assert_eq!(e.role(), Role::Candidate);
    }

    #[test]
    fn dueling_leaders_resolve_by_client_id() {
        let mut low = Election::new("a-client", settings());
        low.start();
        low.close_window();
        assert!(low.is_leader());

        assert_eq!(
            low.on_message(&ElectionMessage::Heartbeat {
                client_id: "z-client".to_string(),
            }),
            ElectionAction::StepDown
        );
        assert_eq!(low.role(), Role::Follower);

        let mut high = Election::new("z-client", settings());
        high.start();
        high.close_window();
        assert!(matches!(
            high.on_message(&ElectionMessage::Heartbeat {
                client_id: "a-client".to_string(),
            }),
            ElectionAction::Heartbeat { .. }
        ));
        assert!(high.is_leader());
    }

    #[test]
    fn zero_heartbeat_timeout_disables_failover() {
        let mut e = Election::new("c1", settings());
        e.settings.heartbeat_timeout_ms = 0;
        e.start();
        e.on_message(&ElectionMessage::Heartbeat {
            client_id: "z".to_string(),
        });
        assert_eq!(e.tick(1_000_000), ElectionAction::None);
    }
}
