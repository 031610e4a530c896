//! Integration tests for cooldown decisions against a manual clock.

use chatstate::{
    AllowReason, CooldownDecision, CooldownRequest, DenyReason, EntityKey, ManualClock, Platform,
    StateConfig, StateLayer,
};
use chrono::Duration;
use std::sync::{Arc, Barrier};
use tempfile::TempDir;

fn open(dir: &TempDir) -> (StateLayer, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let state = StateLayer::open_with_clock(StateConfig::new(dir.path()), clock.clone()).unwrap();
    (state, clock)
}

fn request(user: &str, channel: &str) -> CooldownRequest {
    CooldownRequest::new("!points", Platform::Twitch, user, channel)
        .user_cooldown_secs(10)
        .global_cooldown_secs(30)
}

#[test]
fn test_first_use_is_always_allowed() {
    let dir = TempDir::new().unwrap();
    let (state, _clock) = open(&dir);

    let decision = state.check_cooldown(&request("1", "chan"));
    assert_eq!(decision, CooldownDecision::Allowed(AllowReason::FirstUse));
}

#[test]
fn test_checks_three_seconds_apart_deny_the_second() {
    let dir = TempDir::new().unwrap();
    let (state, clock) = open(&dir);
    let req = request("1", "chan").ignore_global_cooldown(true);

    assert!(state.check_cooldown(&req).is_allowed());
    clock.advance_secs(3);
    let second = state.check_cooldown(&req);
    assert!(!second.is_allowed());
    assert_eq!(second.remaining(), Some(Duration::seconds(7)));
}

#[test]
fn test_checks_eleven_seconds_apart_both_pass() {
    let dir = TempDir::new().unwrap();
    let (state, clock) = open(&dir);
    let req = request("1", "chan").ignore_global_cooldown(true);

    assert!(state.check_cooldown(&req).is_allowed());
    clock.advance_secs(11);
    assert_eq!(
        state.check_cooldown(&req),
        CooldownDecision::Allowed(AllowReason::Passed)
    );
}

#[test]
fn test_rejection_restarts_personal_cooldown_by_default() {
    let dir = TempDir::new().unwrap();
    let (state, clock) = open(&dir);
    let user = EntityKey::new(Platform::Twitch, "1");
    let req = request("1", "chan").ignore_global_cooldown(true);

    state.check_cooldown(&req);
    clock.advance_secs(8);
    assert!(!state.check_cooldown(&req).is_allowed());
    clock.advance_secs(5);
    assert!(!state.check_cooldown(&req).is_allowed());
    assert_eq!(
        state.remaining_cooldown(&user, "!points", Duration::seconds(10)),
        Duration::seconds(10)
    );

    let lenient = req.reset_on_reject(false);
    clock.advance_secs(4);
    assert!(!state.check_cooldown(&lenient).is_allowed());
    clock.advance_secs(6);
    assert!(state.check_cooldown(&lenient).is_allowed());
}

#[test]
fn test_channel_cooldown_applies_across_users() {
    let dir = TempDir::new().unwrap();
    let (state, clock) = open(&dir);

    // Both users have a personal record so the channel check is reached.
    assert!(state.check_cooldown(&request("a", "chan")).is_allowed());
    assert!(state.check_cooldown(&request("b", "chan")).is_allowed());
    clock.advance_secs(20);

    assert_eq!(
        state.check_cooldown(&request("a", "chan")),
        CooldownDecision::Allowed(AllowReason::Passed)
    );
    clock.advance_secs(1);
    assert_eq!(
        state.check_cooldown(&request("b", "chan")),
        CooldownDecision::Denied(DenyReason::GlobalCooldown {
            remaining: Duration::seconds(29)
        })
    );

    // Another channel keeps its own timestamp.
    assert!(state.check_cooldown(&request("c", "other")).is_allowed());
    clock.advance_secs(15);
    assert!(state.check_cooldown(&request("c", "other")).is_allowed());
}

#[test]
fn test_concurrent_checks_let_one_user_through_the_channel_cooldown() {
    let dir = TempDir::new().unwrap();
    let (state, clock) = open(&dir);
    let users: Vec<String> = (0..16).map(|n| format!("viewer{}", n)).collect();

    for user in &users {
        let first = state.check_cooldown(&request(user, "chan").ignore_global_cooldown(true));
        assert_eq!(first, CooldownDecision::Allowed(AllowReason::FirstUse));
    }
    clock.advance_secs(11);

    let start = Barrier::new(users.len());
    let decisions: Vec<CooldownDecision> = std::thread::scope(|scope| {
        let workers: Vec<_> = users
            .iter()
            .map(|user| {
                let (state, start) = (&state, &start);
                scope.spawn(move || {
                    start.wait();
                    state.check_cooldown(&request(user, "chan"))
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect()
    });

    let passed = decisions
        .iter()
        .filter(|decision| **decision == CooldownDecision::Allowed(AllowReason::Passed))
        .count();
    let blocked = decisions
        .iter()
        .filter(|decision| matches!(decision, CooldownDecision::Denied(DenyReason::GlobalCooldown { .. })))
        .count();
    assert_eq!(passed, 1);
    assert_eq!(blocked, users.len() - 1);
}

#[test]
fn test_privileged_users_bypass_and_leave_no_record() {
    let dir = TempDir::new().unwrap();
    let (state, _clock) = open(&dir);
    let moderator = EntityKey::new(Platform::Twitch, "mod");
    state.user(&moderator).save("isBotModerator", true);

    for _ in 0..3 {
        assert_eq!(
            state.check_cooldown(&request("mod", "chan")),
            CooldownDecision::Allowed(AllowReason::Privileged)
        );
    }
    assert!(!state.user(&moderator).contains("LU_!points"));

    let strict = request("mod", "chan").ignore_privilege_bypass(true);
    assert_eq!(
        state.check_cooldown(&strict),
        CooldownDecision::Allowed(AllowReason::FirstUse)
    );
    assert!(!state.check_cooldown(&strict).is_allowed());
}

#[test]
fn test_channel_timestamps_land_in_cdd_file() {
    let dir = TempDir::new().unwrap();
    let (state, clock) = open(&dir);

    state.check_cooldown(&request("a", "chan"));
    clock.advance_secs(11);
    state.check_cooldown(&request("a", "chan"));

    let cdd = dir
        .path()
        .join("channels")
        .join("twitch")
        .join("chan")
        .join("CDD.json");
    assert!(cdd.exists());
}
