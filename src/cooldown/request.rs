use crate::core::{EntityKey, Platform};
use chrono::Duration;

/// One cooldown check: which action, who, where, and how strict.
#[derive(Debug, Clone)]
pub struct CooldownRequest {
    /// Logical action identifier, distinct from the command name
    pub key: String,

    pub user: EntityKey,

    /// Channel the invocation happened in (same platform as the user)
    pub channel: EntityKey,

    pub user_cooldown: Duration,

    pub global_cooldown: Duration,

    /// Restart the personal cooldown when a check is rejected by it
    pub reset_on_reject: bool,

    /// Apply cooldowns even to privileged users
    pub ignore_privilege_bypass: bool,

    /// Only check the personal cooldown for this call
    pub ignore_global_cooldown: bool,

    /// Caller-asserted privilege (e.g. platform moderator)
    pub privileged: bool,
}

impl CooldownRequest {
    pub fn new(key: &str, platform: Platform, user_id: &str, channel_id: &str) -> Self {
        Self {
            key: key.to_string(),
            user: EntityKey::new(platform, user_id),
            channel: EntityKey::new(platform, channel_id),
            user_cooldown: Duration::zero(),
            global_cooldown: Duration::zero(),
            reset_on_reject: true,
            ignore_privilege_bypass: false,
            ignore_global_cooldown: false,
            privileged: false,
        }
    }

    pub fn user_cooldown(mut self, cooldown: Duration) -> Self {
        self.user_cooldown = cooldown;
        self
    }

    pub fn user_cooldown_secs(self, secs: i64) -> Self {
        self.user_cooldown(Duration::seconds(secs))
    }

    pub fn global_cooldown(mut self, cooldown: Duration) -> Self {
        self.global_cooldown = cooldown;
        self
    }

    pub fn global_cooldown_secs(self, secs: i64) -> Self {
        self.global_cooldown(Duration::seconds(secs))
    }

    pub fn reset_on_reject(mut self, reset: bool) -> Self {
        self.reset_on_reject = reset;
        self
    }

    pub fn ignore_privilege_bypass(mut self, ignore: bool) -> Self {
        self.ignore_privilege_bypass = ignore;
        self
    }

    pub fn ignore_global_cooldown(mut self, ignore: bool) -> Self {
        self.ignore_global_cooldown = ignore;
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    Privileged,
    FirstUse,
    Passed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    UserCooldown { remaining: Duration },
    GlobalCooldown { remaining: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    Allowed(AllowReason),
    Denied(DenyReason),
}

impl CooldownDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    /// Time until the blocking cooldown ends, if denied.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Allowed(_) => None,
            Self::Denied(DenyReason::UserCooldown { remaining })
            | Self::Denied(DenyReason::GlobalCooldown { remaining }) => Some(*remaining),
        }
    }
}
