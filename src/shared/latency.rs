use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinSet;

use crate::candidate::CandidateConfig;

/// Outcome of a single TCP reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latency {
    Reachable(Duration),
    Unreachable,
}

impl Latency {
    #[must_use]
    pub fn duration(self) -> Option<Duration> {
        match self {
            Latency::Reachable(d) => Some(d),
            Latency::Unreachable => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub config: CandidateConfig,
    pub latency: Latency,
}

/// Probe every candidate concurrently and join on all of them.
///
/// Returns one result per input candidate, in input order. Every connect is
/// in flight at once, so the whole call is bounded by a single `timeout`.
/// Dropping the returned future aborts whatever is still connecting.
pub async fn probe_all(configs: &[CandidateConfig], timeout: Duration) -> Vec<ProbeResult> {
    if configs.is_empty() {
        return Vec::new();
    }

    let mut latencies = vec![Latency::Unreachable; configs.len()];
    let mut set = JoinSet::new();

    for (idx, config) in configs.iter().enumerate() {
        let Some((host, port)) = config.endpoint() else {
            tracing::debug!(label = %config.label(), "probe_skipped_no_endpoint");
            continue;
        };
        set.spawn(async move { (idx, probe_tcp_once(&host, port, timeout).await) });
    }

    while let Some(joined) = set.join_next().await {
        if let Ok((idx, latency)) = joined {
            latencies[idx] = latency;
        }
    }

    configs
        .iter()
        .cloned()
        .zip(latencies)
        .map(|(config, latency)| ProbeResult { config, latency })
        .collect()
}

/// Probe one candidate; used for on-demand pings.
pub async fn probe_one(config: &CandidateConfig, timeout: Duration) -> Latency {
    match config.endpoint() {
        Some((host, port)) => probe_tcp_once(&host, port, timeout).await,
        None => Latency::Unreachable,
    }
}

/// Drop unreachable candidates and order the rest by ascending latency.
/// Ties keep their input order.
#[must_use]
pub fn rank(results: Vec<ProbeResult>) -> Vec<(CandidateConfig, Duration)> {
    let mut reachable: Vec<(CandidateConfig, Duration)> = results
        .into_iter()
        .filter_map(|r| r.latency.duration().map(|d| (r.config, d)))
        .collect();
    reachable.sort_by_key(|(_, latency)| *latency);
    reachable
}

async fn probe_tcp_once(host: &str, port: u16, timeout: Duration) -> Latency {
    let started = tokio::time::Instant::now();
    let bare = host.trim_matches(['[', ']']);
    let address = if bare.contains(':') {
        format!("[{}]:{}", bare, port)
    } else {
        format!("{}:{}", bare, port)
    };
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => Latency::Reachable(started.elapsed()),
        Ok(Err(e)) => {
            tracing::trace!(host = %host, port, error = %e, "probe_connect_failed");
            Latency::Unreachable
        }
        Err(_) => {
            tracing::trace!(host = %host, port, "probe_timeout");
            Latency::Unreachable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::tests::sample;

    async fn open_listener() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let port = listener.local_addr().expect("listener local addr").port();
        let handle = tokio::spawn(async move {
            while listener.accept().await.is_ok() {}
        });
        (port, handle)
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        listener.local_addr().expect("addr").port()
    }

    fn result(label: &str, latency: Latency) -> ProbeResult {
        ProbeResult {
            config: sample(label, "198.51.100.1", 443),
            latency,
        }
    }

    #[tokio::test]
    async fn probe_all_preserves_order_and_marks_failures() {
        let (open, _server) = open_listener().await;
        let refused = closed_port().await;

        let configs = vec![
            sample("open", "127.0.0.1", open),
            sample("refused", "127.0.0.1", refused),
            sample("bad-host", "no-such-host.invalid", 9),
        ];
        let results = probe_all(&configs, Duration::from_millis(500)).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].config.label(), "open");
        assert!(matches!(results[0].latency, Latency::Reachable(_)));
        assert_eq!(results[1].latency, Latency::Unreachable);
        assert_eq!(results[2].latency, Latency::Unreachable);
    }

    #[tokio::test]
    async fn large_list_finishes_within_one_timeout() {
        // 10.255.255.1 is non-routable; every probe should hit the timeout.
        let configs: Vec<_> = (0..96)
            .map(|i| sample(&format!("blackhole-{}", i), "10.255.255.1", 443))
            .collect();
        let started = std::time::Instant::now();
        let results = probe_all(&configs, Duration::from_millis(500)).await;

        assert_eq!(results.len(), 96);
        assert!(results.iter().all(|r| r.latency == Latency::Unreachable));
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn probe_one_without_endpoint_is_unreachable() {
        let cfg = crate::candidate::CandidateConfig::from_json(r#"{"outbounds":[]}"#)
            .expect("parse");
        assert_eq!(
            probe_one(&cfg, Duration::from_millis(100)).await,
            Latency::Unreachable
        );
    }

    #[test]
    fn rank_sorts_ascending_and_drops_unreachable() {
        let ranked = rank(vec![
            result("slow", Latency::Reachable(Duration::from_millis(50))),
            result("dead", Latency::Unreachable),
            result("fast", Latency::Reachable(Duration::from_millis(10))),
            result("mid", Latency::Reachable(Duration::from_millis(30))),
        ]);
        let labels: Vec<String> = ranked.iter().map(|(c, _)| c.label()).collect();
        assert_eq!(labels, vec!["fast", "mid", "slow"]);
    }

    #[test]
    fn rank_is_stable_on_ties() {
        let ranked = rank(vec![
            result("a", Latency::Reachable(Duration::from_millis(20))),
            result("b", Latency::Reachable(Duration::from_millis(5))),
            result("c", Latency::Reachable(Duration::from_millis(20))),
        ]);
        let labels: Vec<String> = ranked.iter().map(|(c, _)| c.label()).collect();
        assert_eq!(labels, vec!["b", "a", "c"]);
    }
}
