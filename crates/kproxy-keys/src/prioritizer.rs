//! Pure candidate ordering. No IO, no locking; callers pass `now` so the
//! ordering is deterministic and testable.

use std::cmp::Ordering;

use crate::key::Key;

pub type Tiebreaker<'a> = &'a dyn Fn(&Key, &Key) -> Ordering;

/// Sort candidates from most to least preferred:
///
/// 1. keys that are not rate-limited before keys that are;
/// 2. among rate-limited keys, the earliest `rate_limited_until` wins;
/// 3. the caller's tiebreaker, if any;
/// 4. least-recently-used wins.
///
/// The sort is stable, so equal keys keep their configured order.
pub fn prioritize(candidates: &mut [&Key], now_ms: u64, tiebreaker: Option<Tiebreaker<'_>>) {
    candidates.sort_by(|a, b| {
        let a_limited = a.is_rate_limited(now_ms);
        let b_limited = b.is_rate_limited(now_ms);
        a_limited
            .cmp(&b_limited)
            .then_with(|| {
                if a_limited && b_limited {
                    a.rate_limited_until.cmp(&b.rate_limited_until)
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| match tiebreaker {
                Some(tiebreak) => tiebreak(a, b),
                None => Ordering::Equal,
            })
            .then_with(|| a.last_used.cmp(&b.last_used))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use kproxy_common::Service;

    fn key(secret: &str) -> Key {
        Key::parse(Service::Anthropic, secret).unwrap()
    }

    #[test]
    fn unlimited_keys_sort_before_limited() {
        let mut limited = key("sk-a");
        limited.rate_limited_until = 10_000;
        let free = key("sk-b");

        let mut candidates = vec![&limited, &free];
        prioritize(&mut candidates, 5_000, None);
        assert_eq!(candidates[0].hash, free.hash);
    }

    #[test]
    fn earliest_lockout_wins_among_limited() {
        let mut late = key("sk-a");
        late.rate_limited_until = 20_000;
        let mut early = key("sk-b");
        early.rate_limited_until = 12_000;

        let mut candidates = vec![&late, &early];
        prioritize(&mut candidates, 5_000, None);
        assert_eq!(candidates[0].hash, early.hash);
    }

    #[test]
    fn least_recently_used_breaks_remaining_ties() {
        let mut fresh = key("sk-a");
        fresh.last_used = 9_000;
        let mut stale = key("sk-b");
        stale.last_used = 1_000;

        let mut candidates = vec![&fresh, &stale];
        prioritize(&mut candidates, 10_000, None);
        assert_eq!(candidates[0].hash, stale.hash);
    }

    #[test]
    fn tiebreaker_runs_before_lru() {
        let mut preferred = key("sk-a");
        preferred.last_used = 9_000;
        preferred.prompt_count = 1;
        let mut other = key("sk-b");
        other.last_used = 1_000;

        let by_prompt_count: Tiebreaker<'_> = &|a, b| b.prompt_count.cmp(&a.prompt_count);
        let mut candidates = vec![&other, &preferred];
        prioritize(&mut candidates, 10_000, Some(by_prompt_count));
        assert_eq!(candidates[0].hash, preferred.hash);
    }

    #[test]
    fn expired_lockout_counts_as_unlimited() {
        let mut expired = key("sk-a");
        expired.rate_limited_until = 4_000;
        expired.last_used = 1_000;
        let mut fresh = key("sk-b");
        fresh.last_used = 2_000;

        let mut candidates = vec![&fresh, &expired];
        prioritize(&mut candidates, 5_000, None);
        assert_eq!(candidates[0].hash, expired.hash);
    }
}
