use crate::interfaces::ConnectivityCheck;
use std::time::Duration;

/// Delays actually slept before each reconnect attempt.
///
/// Walks `delays`, repeating the last entry, and trims the final delay so the
/// total never exceeds `cap_secs`.
pub fn backoff_schedule(delays: &[u64], cap_secs: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let Some(&last) = delays.last() else {
        return out;
    };
    if last == 0 {
        return out;
    }

    let mut elapsed = 0u64;
    let mut iter = delays.iter().copied().chain(std::iter::repeat(last));
    while elapsed < cap_secs {
        let Some(next) = iter.next() else { break };
        let d = next.min(cap_secs - elapsed);
        if d == 0 {
            break;
        }
        out.push(d);
        elapsed += d;
    }
    out
}

/// Outcome of the reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectOutcome {
    pub reconnected: bool,
    pub attempts: u32,
    pub waited_secs: u64,
}

/// Sleep, then check real connectivity, per schedule entry. Stops at the
/// first successful check. Bounded by the schedule's total.
pub async fn reconnect_with_backoff(link: &dyn ConnectivityCheck, delays: &[u64], cap_secs: u64) -> ReconnectOutcome {
    let mut attempts = 0u32;
    let mut waited_secs = 0u64;

    for delay in backoff_schedule(delays, cap_secs) {
        tokio::time::sleep(Duration::from_secs(delay)).await;
        waited_secs += delay;
        attempts += 1;

        let ok = tokio::time::timeout(Duration::from_secs(10), link.is_reachable())
            .await
            .unwrap_or(false);
        tracing::info!(attempt = attempts, waited = waited_secs, ok = ok, "reconnect attempt");
        if ok {
            return ReconnectOutcome { reconnected: true, attempts, waited_secs };
        }
    }

    ReconnectOutcome { reconnected: false, attempts, waited_secs }
}
