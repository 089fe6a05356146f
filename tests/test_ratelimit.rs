//! Integration tests for the Rate Limiter (C7) beyond ratelimit.rs's own
//! `#[cfg(test)]` module: concurrent access to a single bucket, and the
//! limiter as `Manager` actually wires it up.

use std::sync::Arc;

use terminal_mcp::config::Config;
use terminal_mcp::manager::Manager;
use terminal_mcp::ratelimit::RateLimiter;

#[tokio::test]
async fn concurrent_callers_never_consume_more_than_the_burst_capacity() {
    let limiter = Arc::new(RateLimiter::new(5, 60));
    let mut handles = Vec::new();
    for _ in 0..20 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move { limiter.check().await.is_ok() }));
    }

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 5, "a burst-of-5 bucket must reject every caller past the 5th, even under concurrency");
}

#[tokio::test]
async fn manager_check_rate_limit_rejects_once_burst_is_exhausted() {
    let mut config = Config::default();
    config.server.rate_limit_burst = 2;
    config.server.rate_limit_per_minute = 60;
    let mgr = Manager::new(config, None);

    mgr.check_rate_limit().await.unwrap();
    mgr.check_rate_limit().await.unwrap();
    let err = mgr.check_rate_limit().await.unwrap_err();
    assert!(err.as_secs() >= 1);
}
