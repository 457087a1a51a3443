//! Per-user rate limiting
//!
//! Sliding 24-hour windows over creation and invocation timestamps. A
//! denial never consumes quota. Ordinary throttling is not worth an audit
//! event; only denials repeated beyond a small tolerance escalate, and at
//! most once per window.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

use crate::config::RateQuotas;
use crate::types::UserId;

/// Which quota an action draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    ToolCreate,
    ToolInvoke,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::ToolCreate => "tool_create",
            ActionKind::ToolInvoke => "tool_invoke",
        }
    }
}

/// A denied action.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDenial {
    pub action: ActionKind,
    pub limit: u32,
    /// True when this denial crossed the tolerance and should be recorded
    /// as a security event.
    pub escalate: bool,
}

/// Sliding window of action timestamps for one user and action kind.
#[derive(Debug, Default)]
struct SlidingWindow {
    timestamps: VecDeque<DateTime<Utc>>,
    denials: VecDeque<DateTime<Utc>>,
    last_escalated: Option<DateTime<Utc>>,
}

impl SlidingWindow {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.timestamps.front().is_some_and(|ts| *ts < cutoff) {
            self.timestamps.pop_front();
        }
        while self.denials.front().is_some_and(|ts| *ts < cutoff) {
            self.denials.pop_front();
        }
    }

    fn check_and_record(
        &mut self,
        action: ActionKind,
        limit: u32,
        tolerance: u32,
        now: DateTime<Utc>,
    ) -> Result<(), RateLimitDenial> {
        let cutoff = now - Duration::hours(24);
        self.prune(cutoff);

        if self.timestamps.len() < limit as usize {
            self.timestamps.push_back(now);
            return Ok(());
        }

        // Denied: record the denial but never consume quota.
        self.denials.push_back(now);
        let escalate = self.denials.len() > tolerance as usize
            && self.last_escalated.map_or(true, |at| at < cutoff);
        if escalate {
            self.last_escalated = Some(now);
        }
        Err(RateLimitDenial {
            action,
            limit,
            escalate,
        })
    }
}

/// Rate limiter - enforces per-user rolling daily quotas.
///
/// Owned behind a mutex by the sandbox service; critical sections are
/// O(window) and never held across awaits.
#[derive(Debug)]
pub struct RateLimiter {
    quotas: RateQuotas,
    windows: HashMap<(UserId, ActionKind), SlidingWindow>,
}

impl RateLimiter {
    pub fn new(quotas: RateQuotas) -> Self {
        Self {
            quotas,
            windows: HashMap::new(),
        }
    }

    /// Check the quota for an action and record it if allowed.
    pub fn check_and_record(
        &mut self,
        user: &UserId,
        action: ActionKind,
    ) -> Result<(), RateLimitDenial> {
        self.check_and_record_at(user, action, Utc::now())
    }

    /// As [`check_and_record`](Self::check_and_record), at an explicit
    /// instant. Lets callers and tests drive the window deterministically.
    pub fn check_and_record_at(
        &mut self,
        user: &UserId,
        action: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<(), RateLimitDenial> {
        let limit = match action {
            ActionKind::ToolCreate => self.quotas.tool_creations_per_day,
            ActionKind::ToolInvoke => self.quotas.tool_executions_per_day,
        };
        let tolerance = self.quotas.denial_tolerance;
        let window = self
            .windows
            .entry((user.clone(), action))
            .or_default();
        window.check_and_record(action, limit, tolerance, now)
    }

    /// Actions recorded for a user inside the current window.
    pub fn current_count(&self, user: &UserId, action: ActionKind) -> usize {
        self.windows
            .get(&(user.clone(), action))
            .map_or(0, |w| {
                let cutoff = Utc::now() - Duration::hours(24);
                w.timestamps.iter().filter(|ts| **ts >= cutoff).count()
            })
    }

    /// Drop a user's windows (e.g. after an admin reset).
    pub fn clear_user(&mut self, user: &UserId) {
        self.windows
            .retain(|(window_user, _), _| window_user != user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quotas(creations: u32, executions: u32, tolerance: u32) -> RateQuotas {
        RateQuotas {
            tool_creations_per_day: creations,
            tool_executions_per_day: executions,
            denial_tolerance: tolerance,
        }
    }

    #[test]
    fn test_allows_up_to_quota_then_denies() {
        let mut limiter = RateLimiter::new(quotas(2, 100, 3));
        let user = UserId::from("alice");

        assert!(limiter.check_and_record(&user, ActionKind::ToolCreate).is_ok());
        assert!(limiter.check_and_record(&user, ActionKind::ToolCreate).is_ok());
        let denial = limiter
            .check_and_record(&user, ActionKind::ToolCreate)
            .unwrap_err();
        assert_eq!(denial.limit, 2);
        assert!(!denial.escalate);
    }

    #[test]
    fn test_denial_does_not_consume_quota() {
        let mut limiter = RateLimiter::new(quotas(1, 100, 3));
        let user = UserId::from("alice");

        assert!(limiter.check_and_record(&user, ActionKind::ToolCreate).is_ok());
        for _ in 0..3 {
            assert!(limiter.check_and_record(&user, ActionKind::ToolCreate).is_err());
        }
        assert_eq!(limiter.current_count(&user, ActionKind::ToolCreate), 1);
    }

    #[test]
    fn test_window_rolls_forward() {
        let mut limiter = RateLimiter::new(quotas(1, 100, 3));
        let user = UserId::from("alice");
        let start = Utc::now();

        assert!(limiter
            .check_and_record_at(&user, ActionKind::ToolCreate, start)
            .is_ok());
        assert!(limiter
            .check_and_record_at(&user, ActionKind::ToolCreate, start + Duration::hours(1))
            .is_err());
        // one window later the action is allowed again
        assert!(limiter
            .check_and_record_at(&user, ActionKind::ToolCreate, start + Duration::hours(25))
            .is_ok());
    }

    #[test]
    fn test_quotas_are_independent() {
        let mut limiter = RateLimiter::new(quotas(1, 2, 3));
        let user = UserId::from("alice");

        assert!(limiter.check_and_record(&user, ActionKind::ToolCreate).is_ok());
        assert!(limiter.check_and_record(&user, ActionKind::ToolCreate).is_err());
        // invocation quota untouched by creation denials
        assert!(limiter.check_and_record(&user, ActionKind::ToolInvoke).is_ok());
        assert!(limiter.check_and_record(&user, ActionKind::ToolInvoke).is_ok());
        assert!(limiter.check_and_record(&user, ActionKind::ToolInvoke).is_err());
    }

    #[test]
    fn test_users_are_independent() {
        let mut limiter = RateLimiter::new(quotas(1, 100, 3));

        assert!(limiter
            .check_and_record(&UserId::from("alice"), ActionKind::ToolCreate)
            .is_ok());
        assert!(limiter
            .check_and_record(&UserId::from("bob"), ActionKind::ToolCreate)
            .is_ok());
    }

    #[test]
    fn test_escalates_once_beyond_tolerance() {
        let mut limiter = RateLimiter::new(quotas(0, 100, 2));
        let user = UserId::from("alice");
        let now = Utc::now();

        let mut escalations = 0;
        for i in 0..6 {
            let denial = limiter
                .check_and_record_at(&user, ActionKind::ToolCreate, now + Duration::seconds(i))
                .unwrap_err();
            if denial.escalate {
                escalations += 1;
            }
        }
        // crossed tolerance once; later denials in the same window stay quiet
        assert_eq!(escalations, 1);
    }
}
