// =============================================================================
// Request Budget — local sliding-window accounting for the venue's rate limits
// =============================================================================
//
// OKX does not echo usage counters in response headers, so the budget is kept
// locally: a 2-second window for REST reads (the venue allows 20 per endpoint
// per 2 s; we cap well below that across all endpoints) and a 2-second window
// for order submissions (venue limit 60 per 2 s; we cap at 10).
// =============================================================================

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

/// Window length for both budgets.
const WINDOW: Duration = Duration::from_secs(2);
/// Self-imposed ceiling on REST requests per window.
const REQUEST_LIMIT: usize = 10;
/// Self-imposed ceiling on order submissions per window.
const ORDER_LIMIT: usize = 10;

/// Serialisable snapshot for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub requests_in_window: usize,
    pub orders_in_window: usize,
    pub request_limit: usize,
    pub order_limit: usize,
}

/// Thread-safe sliding-window counters.
pub struct RequestBudget {
    requests: Mutex<VecDeque<Instant>>,
    orders: Mutex<VecDeque<Instant>>,
}

impl RequestBudget {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(VecDeque::new()),
            orders: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a REST read and report whether the budget allowed it.
    pub fn try_request(&self) -> bool {
        let now = Instant::now();
        let mut window = self.requests.lock();
        Self::prune(&mut window, now);
        if window.len() >= REQUEST_LIMIT {
            warn!(in_window = window.len(), limit = REQUEST_LIMIT, "request budget exhausted");
            return false;
        }
        window.push_back(now);
        true
    }

    /// Record an order submission and report whether the budget allowed it.
    pub fn try_order(&self) -> bool {
        let now = Instant::now();
        let mut window = self.orders.lock();
        Self::prune(&mut window, now);
        if window.len() >= ORDER_LIMIT {
            warn!(in_window = window.len(), limit = ORDER_LIMIT, "order budget exhausted");
            return false;
        }
        window.push_back(now);
        true
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let now = Instant::now();
        let mut requests = self.requests.lock();
        Self::prune(&mut requests, now);
        let mut orders = self.orders.lock();
        Self::prune(&mut orders, now);
        BudgetSnapshot {
            requests_in_window: requests.len(),
            orders_in_window: orders.len(),
            request_limit: REQUEST_LIMIT,
            order_limit: ORDER_LIMIT,
        }
    }
}

impl Default for RequestBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("RequestBudget")
            .field("requests_in_window", &snap.requests_in_window)
            .field("orders_in_window", &snap.orders_in_window)
            .finish()
    }
}
