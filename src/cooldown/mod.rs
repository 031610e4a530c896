//! Per-user and per-channel command cooldowns.
//!
//! Personal timestamps live on the user document as `LU_<cooldownKey>`.
//! Channel-wide timestamps live in the channel's `CDD` document under the
//! bare cooldown key. The user-side read-modify-write expects the caller to
//! hold the user's slot in the interaction serializer; the channel-side one
//! is shared by every user in the channel and is done as a single atomic
//! store update instead.

mod request;

pub use request::{AllowReason, CooldownDecision, CooldownRequest, DenyReason};

use crate::core::{Clock, EntityKey};
use crate::storage::EntityStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;

pub const USER_COOLDOWN_PREFIX: &str = "LU_";
pub const MODERATOR_ATTRIBUTE: &str = "isBotModerator";
pub const DEVELOPER_ATTRIBUTE: &str = "isBotDeveloper";

/// Attribute name of a personal cooldown record.
pub fn user_cooldown_attribute(cooldown_key: &str) -> String {
    format!("{}{}", USER_COOLDOWN_PREFIX, cooldown_key)
}

pub struct CooldownCoordinator {
    users: Arc<EntityStore>,
    channels: Arc<EntityStore>,
    clock: Arc<dyn Clock>,
}

impl CooldownCoordinator {
    /// `users` holds personal records, `channels` holds the `CDD` documents.
    pub fn new(users: Arc<EntityStore>, channels: Arc<EntityStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            users,
            channels,
            clock,
        }
    }

    /// Decides whether an invocation may run, updating timestamps on the way.
    ///
    /// Order matters and is fixed:
    /// 1. privileged users pass untouched (unless the bypass is disabled);
    /// 2. no personal record: record now, allow;
    /// 3. personal cooldown running: deny, optionally restarting it;
    /// 4. otherwise record now, then check the channel unless ignored;
    /// 5. channel cooldown running: deny without rolling back step 4.
    pub fn check(&self, request: &CooldownRequest) -> CooldownDecision {
        let decision = self.evaluate(request);
        debug!(
            sector = "cooldown",
            user = %request.user,
            channel = %request.channel,
            key = %request.key,
            ?decision,
            "cooldown checked"
        );
        decision
    }

    fn evaluate(&self, request: &CooldownRequest) -> CooldownDecision {
        if !request.ignore_privilege_bypass
            && (request.privileged || self.is_privileged(&request.user))
        {
            return CooldownDecision::Allowed(AllowReason::Privileged);
        }

        let now = self.clock.now_utc();
        let attr = user_cooldown_attribute(&request.key);

        let Some(last_use) = self.users.peek::<DateTime<Utc>>(&request.user, &attr) else {
            self.users.save(&request.user, &attr, now);
            return CooldownDecision::Allowed(AllowReason::FirstUse);
        };

        let elapsed = now - last_use;
        if elapsed < request.user_cooldown {
            if request.reset_on_reject {
                self.users.save(&request.user, &attr, now);
            }
            return CooldownDecision::Denied(DenyReason::UserCooldown {
                remaining: request.user_cooldown - elapsed,
            });
        }

        self.users.save(&request.user, &attr, now);

        if request.ignore_global_cooldown {
            return CooldownDecision::Allowed(AllowReason::Passed);
        }

        let global = request.global_cooldown;
        self.channels.update::<DateTime<Utc>, _, _>(
            &request.channel,
            &request.key,
            |last_global| match last_global {
                Some(last) if now - last < global => (
                    None,
                    CooldownDecision::Denied(DenyReason::GlobalCooldown {
                        remaining: global - (now - last),
                    }),
                ),
                _ => (Some(now), CooldownDecision::Allowed(AllowReason::Passed)),
            },
        )
    }

    /// `user_cooldown - (now - LU_<key>)`. Negative once the user is eligible
    /// again; zero when there is no record. Never writes.
    pub fn remaining(&self, user: &EntityKey, cooldown_key: &str, user_cooldown: Duration) -> Duration {
        let attr = user_cooldown_attribute(cooldown_key);
        match self.users.peek::<DateTime<Utc>>(user, &attr) {
            Some(last_use) => user_cooldown - (self.clock.now_utc() - last_use),
            None => Duration::zero(),
        }
    }

    fn is_privileged(&self, user: &EntityKey) -> bool {
        [MODERATOR_ATTRIBUTE, DEVELOPER_ATTRIBUTE]
            .iter()
            .any(|attr| self.users.peek::<bool>(user, attr).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateConfig;
    use crate::core::{ManualClock, Platform};
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        clock: Arc<ManualClock>,
        users: Arc<EntityStore>,
        channels: Arc<EntityStore>,
        coordinator: CooldownCoordinator,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let config = StateConfig::new(temp_dir.path());
        let clock = Arc::new(ManualClock::default());
        let users = Arc::new(EntityStore::new(config.users_namespace()));
        let channels = Arc::new(EntityStore::new(config.channel_cooldowns_namespace()));
        let coordinator = CooldownCoordinator::new(users.clone(), channels.clone(), clock.clone());
        Fixture {
            _temp_dir: temp_dir,
            clock,
            users,
            channels,
            coordinator,
        }
    }

    fn request(user: &str) -> CooldownRequest {
        CooldownRequest::new("cookie", Platform::Twitch, user, "chan")
            .user_cooldown_secs(10)
            .global_cooldown_secs(5)
    }

    #[test]
    fn test_privileged_user_mutates_nothing() {
        let f = fixture();
        let req = request("1").privileged(true);

        assert_eq!(
            f.coordinator.check(&req),
            CooldownDecision::Allowed(AllowReason::Privileged)
        );
        assert!(!f.users.contains(&req.user, "LU_cookie"));
    }

    #[test]
    fn test_stored_moderator_flag_bypasses() {
        let f = fixture();
        let req = request("1");
        f.users.save(&req.user, MODERATOR_ATTRIBUTE, true);

        assert!(f.coordinator.check(&req).is_allowed());
        assert!(f.coordinator.check(&req).is_allowed());

        let strict = req.ignore_privilege_bypass(true);
        assert!(f.coordinator.check(&strict).is_allowed());
        assert!(!f.coordinator.check(&strict).is_allowed());
    }

    #[test]
    fn test_reject_without_reset_keeps_timestamp() {
        let f = fixture();
        let req = request("1").reset_on_reject(false);

        assert!(f.coordinator.check(&req).is_allowed());
        let first = f.users.peek::<DateTime<Utc>>(&req.user, "LU_cookie").unwrap();

        f.clock.advance_secs(3);
        assert!(!f.coordinator.check(&req).is_allowed());
        assert_eq!(f.users.peek::<DateTime<Utc>>(&req.user, "LU_cookie"), Some(first));

        f.clock.advance_secs(8);
        assert!(f.coordinator.check(&req).is_allowed());
    }

    #[test]
    fn test_reject_with_reset_slides_window() {
        let f = fixture();
        let req = request("1");

        assert!(f.coordinator.check(&req).is_allowed());
        f.clock.advance_secs(8);
        assert!(!f.coordinator.check(&req).is_allowed());
        f.clock.advance_secs(8);
        // 16s after first use but only 8s after the penalised attempt
        assert!(!f.coordinator.check(&req).is_allowed());
    }

    #[test]
    fn test_global_denial_keeps_personal_timestamp() {
        let f = fixture();
        let a = request("a");
        let b = request("b");

        assert!(f.coordinator.check(&a).is_allowed());
        f.clock.advance_secs(11);
        assert!(f.coordinator.check(&a).is_allowed());

        assert!(f.coordinator.check(&b).is_allowed());
        f.clock.advance_secs(11);
        assert!(f.coordinator.check(&b).is_allowed());
        let stamped = f.users.peek::<DateTime<Utc>>(&b.user, "LU_cookie").unwrap();

        f.clock.advance_secs(11);
        assert!(f.coordinator.check(&a).is_allowed());
        let decision = f.coordinator.check(&b);
        assert!(matches!(
            decision,
            CooldownDecision::Denied(DenyReason::GlobalCooldown { .. })
        ));
        assert!(f.users.peek::<DateTime<Utc>>(&b.user, "LU_cookie").unwrap() > stamped);
        assert!(f.channels.contains(&a.channel, "cookie"));
    }

    #[test]
    fn test_ignore_global_cooldown() {
        let f = fixture();
        let a = request("a").ignore_global_cooldown(true);
        let b = request("b").ignore_global_cooldown(true);

        for req in [&a, &b] {
            f.coordinator.check(req);
        }
        f.clock.advance_secs(11);
        assert!(f.coordinator.check(&a).is_allowed());
        assert!(f.coordinator.check(&b).is_allowed());
        assert!(!f.channels.contains(&a.channel, "cookie"));
    }

    #[test]
    fn test_remaining_is_pure() {
        let f = fixture();
        let req = request("1");
        let cooldown = Duration::seconds(10);

        assert_eq!(f.coordinator.remaining(&req.user, "cookie", cooldown), Duration::zero());
        assert!(!f.users.contains(&req.user, "LU_cookie"));

        f.coordinator.check(&req);
        f.clock.advance_secs(4);
        assert_eq!(
            f.coordinator.remaining(&req.user, "cookie", cooldown),
            Duration::seconds(6)
        );
        f.clock.advance_secs(10);
        assert_eq!(
            f.coordinator.remaining(&req.user, "cookie", cooldown),
            Duration::seconds(-4)
        );
    }
}
