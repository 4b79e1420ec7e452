use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ApiError;

use super::AppState;

/// Fixed-window request counter keyed by client address. Lives entirely
/// outside the query path; the handler never sees throttled requests.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_minute: u32,
    windows: Mutex<HashMap<IpAddr, Window>>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    minute: u64,
    hits: u32,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        RateLimiter {
            max_per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, client: IpAddr) -> bool {
        let minute = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            / 60;
        self.try_acquire_at(client, minute)
    }

    fn try_acquire_at(&self, client: IpAddr, minute: u64) -> bool {
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(client).or_insert(Window { minute, hits: 0 });

        if window.minute != minute {
            *window = Window { minute, hits: 0 };
        }
        if window.hits >= self.max_per_minute {
            return false;
        }

        window.hits += 1;
        true
    }
}

pub async fn enforce(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.limiter.try_acquire(addr.ip()) {
        log::warn!("rate limit exceeded for {}", addr.ip());
        return Err(ApiError::RateLimited);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(octet: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, octet])
    }

    #[test]
    fn allows_up_to_the_limit_then_blocks() {
        let limiter = RateLimiter::new(3);

        for _ in 0..3 {
            assert!(limiter.try_acquire_at(client(1), 0));
        }
        assert!(!limiter.try_acquire_at(client(1), 0));
    }

    #[test]
    fn window_rollover_resets_the_count() {
        let limiter = RateLimiter::new(1);

        assert!(limiter.try_acquire_at(client(1), 0));
        assert!(!limiter.try_acquire_at(client(1), 0));
        assert!(limiter.try_acquire_at(client(1), 1));
    }

    #[test]
    fn clients_are_counted_independently() {
        let limiter = RateLimiter::new(1);

        assert!(limiter.try_acquire_at(client(1), 0));
        assert!(limiter.try_acquire_at(client(2), 0));
        assert!(!limiter.try_acquire_at(client(1), 0));
    }
}
