//! Loop guard: own-message and message-loop detection.
//!
//! The mesh has no central routing table, so the only loop signal is the
//! hop history carried in each request. Presence anywhere in `path` (not
//! only the immediate predecessor) catches loops of any length.

use actmesh_types::{CheckConfig, Envelope, Failure, InstanceId, WarnConfig};
use std::fmt;

/// What to do when a check fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Off,
    Warn,
    Reject,
}

impl Policy {
    fn from_toggles(check: bool, warn: bool) -> Self {
        match (check, warn) {
            (false, _) => Self::Off,
            (true, true) => Self::Warn,
            (true, false) => Self::Reject,
        }
    }
}

/// A detected routing pathology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// The request chain originated here and came back.
    OwnMessage,
    /// This instance already handled an earlier hop of the chain.
    MessageLoop,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OwnMessage => write!(f, "own message"),
            Self::MessageLoop => write!(f, "message loop"),
        }
    }
}

/// Result of inspecting an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Process, but log each violation.
    Warn(Vec<Violation>),
    /// Respond with an error without invoking the handler.
    Reject(Violation),
}

/// Per-listener guard bound to the local instance id.
#[derive(Debug, Clone)]
pub struct LoopGuard {
    local: InstanceId,
    own_message: Policy,
    message_loop: Policy,
}

impl LoopGuard {
    pub fn new(local: InstanceId, check: &CheckConfig, warn: &WarnConfig) -> Self {
        Self {
            local,
            own_message: Policy::from_toggles(check.own_message, warn.own_message),
            message_loop: Policy::from_toggles(check.message_loop, warn.message_loop),
        }
    }

    pub fn local(&self) -> &InstanceId {
        &self.local
    }

    pub fn own_message_policy(&self) -> Policy {
        self.own_message
    }

    pub fn message_loop_policy(&self) -> Policy {
        self.message_loop
    }

    /// Run both checks. A rejecting check wins over a warning one.
    pub fn inspect(&self, envelope: &Envelope) -> Verdict {
        let mut warnings = Vec::new();
        let checks = [
            (
                Violation::OwnMessage,
                self.own_message,
                envelope.instance_id == self.local,
            ),
            (
                Violation::MessageLoop,
                self.message_loop,
                envelope.path.contains(&self.local),
            ),
        ];

        for (violation, policy, fired) in checks {
            if !fired {
                continue;
            }
            match policy {
                Policy::Off => {}
                Policy::Warn => warnings.push(violation),
                Policy::Reject => return Verdict::Reject(violation),
            }
        }

        if warnings.is_empty() {
            Verdict::Accept
        } else {
            Verdict::Warn(warnings)
        }
    }

    /// The caller-visible failure for a rejected request.
    pub fn failure(&self, violation: Violation, envelope: &Envelope) -> Failure {
        match violation {
            Violation::OwnMessage => Failure::OwnMessage {
                message: format!(
                    "own message: request {} returned to originating instance {}",
                    envelope.correlation_id, self.local
                ),
            },
            Violation::MessageLoop => Failure::MessageLoop {
                message: format!(
                    "message loop: instance {} already on path [{}]",
                    self.local,
                    join_path(&envelope.path)
                ),
            },
        }
    }
}

fn join_path(path: &[InstanceId]) -> String {
    path.iter()
        .map(InstanceId::as_str)
        .collect::<Vec<_>>()
        .join(" > ")
}
