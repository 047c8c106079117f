//! Role and term of the local member.
//!
//! The election component drives the transitions; the file store only reads the
//! role to gate its mutating operations, and moves the member to follower when a
//! truncate is accepted from a new leader.

use std::fmt::{self, Display};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::{StoreError, StoreResult};

pub type MemberId = String;

/// Member state shared between the election component and the store.
pub type SharedMemberState = Arc<RwLock<MemberState>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Candidate,
    Follower { term: u64, leader_id: MemberId },
    Leader { term: u64 },
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Candidate => write!(f, "Candidate"),
            Role::Follower { term, leader_id } => {
                write!(f, "Follower(term={}, leader={})", term, leader_id)
            }
            Role::Leader { term } => write!(f, "Leader(term={})", term),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemberState {
    self_id: MemberId,
    current_term: u64,
    role: Role,
}

impl MemberState {
    pub fn new(self_id: impl Into<MemberId>) -> Self {
        Self::with_term(self_id, 0)
    }

    /// Start as candidate at a term restored by the election component.
    pub fn with_term(self_id: impl Into<MemberId>, current_term: u64) -> Self {
        Self {
            self_id: self_id.into(),
            current_term,
            role: Role::Candidate,
        }
    }

    pub fn into_shared(self) -> SharedMemberState {
        Arc::new(RwLock::new(self))
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    pub fn is_follower(&self) -> bool {
        matches!(self.role, Role::Follower { .. })
    }

    pub fn leader_id(&self) -> Option<&str> {
        match &self.role {
            Role::Leader { .. } => Some(&self.self_id),
            Role::Follower { leader_id, .. } => Some(leader_id),
            Role::Candidate => None,
        }
    }

    pub fn change_to_leader(&mut self, term: u64) -> StoreResult<()> {
        self.check_term(term)?;
        self.current_term = term;
        self.role = Role::Leader { term };
        info!("[{}] changed to {}", self.self_id, self.role);
        Ok(())
    }

    pub fn change_to_follower(&mut self, term: u64, leader_id: impl Into<MemberId>) -> StoreResult<()> {
        self.check_term(term)?;
        self.current_term = term;
        self.role = Role::Follower {
            term,
            leader_id: leader_id.into(),
        };
        info!("[{}] changed to {}", self.self_id, self.role);
        Ok(())
    }

    /// Fail with `IllegalRole` unless the member is leader; returns the term to stamp.
    pub(crate) fn require_leader(&self, operation: &'static str) -> StoreResult<u64> {
        match &self.role {
            Role::Leader { term } => Ok(*term),
            other => Err(StoreError::IllegalRole {
                operation,
                role: other.to_string(),
            }),
        }
    }

    /// Fail unless the member is a follower and `term` is not stale. Any leader is
    /// accepted; the caller moves the member to that leader.
    pub(crate) fn require_follower(&self, operation: &'static str, term: u64) -> StoreResult<()> {
        if !self.is_follower() {
            return Err(StoreError::IllegalRole {
                operation,
                role: self.role.to_string(),
            });
        }
        if term < self.current_term {
            return Err(StoreError::InconsistentState(format!(
                "{} carries stale term {} (current {})",
                operation, term, self.current_term
            )));
        }
        Ok(())
    }

    /// Fail unless the member follows `leader_id` and `term` is not stale.
    pub(crate) fn require_follower_of(
        &self,
        operation: &'static str,
        term: u64,
        leader_id: &str,
    ) -> StoreResult<()> {
        self.require_follower(operation, term)?;
        match self.leader_id() {
            Some(current_leader) if current_leader != leader_id => {
                Err(StoreError::InconsistentState(format!(
                    "{} from {} but following {}",
                    operation, leader_id, current_leader
                )))
            }
            _ => Ok(()),
        }
    }

    fn check_term(&self, term: u64) -> StoreResult<()> {
        if term < self.current_term {
            return Err(StoreError::InconsistentState(format!(
                "term {} is behind current term {}",
                term, self.current_term
            )));
        }
        Ok(())
    }
}
