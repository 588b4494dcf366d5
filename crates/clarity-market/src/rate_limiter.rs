//! 이름 있는 요청 예산별 sliding-log rate limiter.
//!
//! 예산 식별자마다 최근 `window` 동안의 허용 시각을 기록하고, 그 수가 `max_requests`에
//! 도달하면 호출을 대기열에 넣습니다. 대기열은 우선순위가 높은 순, 같은 우선순위는
//! 도착 순으로 풀리며, 대기 시간이 `priority_aging`만큼 지날 때마다 유효 우선순위가 1씩
//! 올라 기아 상태를 막습니다. 대기열이 가득 차면 즉시 [`MarketError::RateLimitExceeded`].
//!
//! 카운터는 프로세스 로컬입니다.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use clarity_core::AppConfig;

use crate::error::{MarketError, Result};

/// 예산 하나의 한도.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateBudgetConfig {
    pub identifier: String,
    /// 윈도우당 최대 실행 수
    pub max_requests: u32,
    pub window: Duration,
    /// 대기열 최대 길이
    pub max_queue_depth: usize,
    /// 유효 우선순위가 1 오르는 대기 시간
    pub priority_aging: Duration,
}

impl RateBudgetConfig {
    pub fn new(identifier: impl Into<String>, max_requests: u32, window: Duration) -> Self {
        Self {
            identifier: identifier.into(),
            max_requests: max_requests.max(1),
            window,
            max_queue_depth: 100,
            priority_aging: window,
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn with_priority_aging(mut self, aging: Duration) -> Self {
        self.priority_aging = aging;
        self
    }

    /// 앱 설정(요금제 + 덮어쓰기)에서 예산을 만듭니다.
    pub fn from_app_config(identifier: impl Into<String>, config: &AppConfig) -> Self {
        let (max_requests, window) = config.rate_limit.effective_limits(config.provider.plan);
        let aging = config
            .rate_limit
            .priority_aging_secs
            .map(Duration::from_secs)
            .unwrap_or(window);
        Self::new(identifier, max_requests, window)
            .with_queue_depth(config.rate_limit.max_queue_depth)
            .with_priority_aging(aging)
    }
}

/// 예산 상태 스냅샷 (헬스 체크용).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub identifier: String,
    pub max_requests: u32,
    pub window_secs: u64,
    /// 현재 윈도우 안의 실행 수
    pub count: u32,
    /// 지금 바로 실행할 수 있는 수
    pub remaining: u32,
    /// 다음 슬롯이 열리는 시각. 여유가 있으면 `None`
    pub reset_time: Option<DateTime<Utc>>,
    /// 대기 중인 호출 수
    pub queued: usize,
    pub total_admitted: u64,
    pub total_rejected: u64,
}

struct Ticket {
    id: u64,
    priority: i32,
    enqueued_at: Instant,
}

struct BudgetState {
    config: RateBudgetConfig,
    /// 현재 윈도우 안의 허용 시각 (오래된 순)
    admissions: VecDeque<Instant>,
    waiting: Vec<Ticket>,
    next_ticket: u64,
    /// 제공자가 요청 한도 초과를 알린 경우 이 시각까지 막음
    blocked_until: Option<Instant>,
    total_admitted: u64,
    total_rejected: u64,
}

impl BudgetState {
    fn new(config: RateBudgetConfig) -> Self {
        Self {
            config,
            admissions: VecDeque::new(),
            waiting: Vec::new(),
            next_ticket: 0,
            blocked_until: None,
            total_admitted: 0,
            total_rejected: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.admissions.front() {
            if front + self.config.window <= now {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
        if self.blocked_until.is_some_and(|t| t <= now) {
            self.blocked_until = None;
        }
    }

    /// 다음 허용까지 기다려야 하는 시간. 지금 가능하면 `None`.
    fn wait_time(&self, now: Instant) -> Option<Duration> {
        let blocked = self
            .blocked_until
            .filter(|t| *t > now)
            .map(|t| t - now);
        let window = if self.admissions.len() < self.config.max_requests as usize {
            None
        } else {
            self.admissions
                .front()
                .map(|&front| (front + self.config.window).saturating_duration_since(now))
        };
        match (blocked, window) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or_default().max(b.unwrap_or_default())),
        }
    }

    fn admit(&mut self, now: Instant) {
        self.admissions.push_back(now);
        self.total_admitted += 1;
    }

    fn effective_priority(&self, ticket: &Ticket, now: Instant) -> i64 {
        let aging = self.config.priority_aging.as_nanos().max(1);
        let waited = now.saturating_duration_since(ticket.enqueued_at).as_nanos();
        ticket.priority as i64 + (waited / aging).min(i64::MAX as u128) as i64
    }

    /// 다음에 풀려날 대기표.
    fn head(&self, now: Instant) -> Option<u64> {
        self.waiting
            .iter()
            .max_by(|a, b| {
                self.effective_priority(a, now)
                    .cmp(&self.effective_priority(b, now))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|t| t.id)
    }

    fn remove_ticket(&mut self, id: u64) {
        self.waiting.retain(|t| t.id != id);
    }

    fn snapshot(&self, now: Instant) -> BudgetSnapshot {
        let count = self.admissions.len() as u32;
        let reset_time = self.wait_time(now).map(|wait| {
            Utc::now() + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero())
        });
        let remaining = if self.blocked_until.is_some() {
            0
        } else {
            self.config.max_requests.saturating_sub(count)
        };
        BudgetSnapshot {
            identifier: self.config.identifier.clone(),
            max_requests: self.config.max_requests,
            window_secs: self.config.window.as_secs(),
            count,
            remaining,
            reset_time,
            queued: self.waiting.len(),
            total_admitted: self.total_admitted,
            total_rejected: self.total_rejected,
        }
    }
}

struct Budget {
    state: Mutex<BudgetState>,
    notify: Notify,
}

impl Budget {
    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 대기 중 future가 drop 되면 대기열에서 즉시 빠집니다.
struct TicketGuard<'a> {
    budget: &'a Budget,
    id: u64,
    armed: bool,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.budget.lock().remove_ticket(self.id);
            self.budget.notify.notify_waiters();
        }
    }
}

/// 예산 식별자별 rate limiter.
pub struct RateLimiter {
    budgets: Mutex<HashMap<String, Arc<Budget>>>,
    /// 처음 보는 식별자에 적용할 한도
    template: RateBudgetConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("template", &self.template)
            .finish()
    }
}

impl RateLimiter {
    /// `template` 한도로 예산을 지연 생성하는 limiter.
    pub fn new(template: RateBudgetConfig) -> Self {
        Self {
            budgets: Mutex::new(HashMap::new()),
            template,
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::new(RateBudgetConfig::from_app_config(
            config.fetcher.budget_identifier.clone(),
            config,
        ))
    }

    /// 특정 식별자의 한도를 등록합니다. 이미 있으면 교체합니다.
    pub fn configure_budget(&self, config: RateBudgetConfig) {
        let identifier = config.identifier.clone();
        let budget = Arc::new(Budget {
            state: Mutex::new(BudgetState::new(config)),
            notify: Notify::new(),
        });
        self.lock_budgets().insert(identifier, budget);
    }

    fn lock_budgets(&self) -> MutexGuard<'_, HashMap<String, Arc<Budget>>> {
        self.budgets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn budget(&self, identifier: &str) -> Arc<Budget> {
        let mut budgets = self.lock_budgets();
        budgets
            .entry(identifier.to_string())
            .or_insert_with(|| {
                let config = RateBudgetConfig {
                    identifier: identifier.to_string(),
                    ..self.template.clone()
                };
                Arc::new(Budget {
                    state: Mutex::new(BudgetState::new(config)),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// 예산 슬롯 하나를 얻을 때까지 기다립니다.
    pub async fn acquire(&self, identifier: &str, priority: i32) -> Result<()> {
        let budget = self.budget(identifier);

        let id = {
            let mut state = budget.lock();
            let now = Instant::now();
            state.prune(now);

            if state.waiting.is_empty() && state.wait_time(now).is_none() {
                state.admit(now);
                return Ok(());
            }

            if state.waiting.len() >= state.config.max_queue_depth {
                state.total_rejected += 1;
                let retry_after = state.wait_time(now).unwrap_or(state.config.window);
                warn!(
                    identifier,
                    queued = state.waiting.len(),
                    "Rate budget queue full, rejecting request"
                );
                return Err(MarketError::RateLimitExceeded {
                    identifier: identifier.to_string(),
                    retry_after,
                });
            }

            let id = state.next_ticket;
            state.next_ticket += 1;
            state.waiting.push(Ticket {
                id,
                priority,
                enqueued_at: now,
            });
            debug!(identifier, priority, queued = state.waiting.len(), "Request queued");
            id
        };

        let mut guard = TicketGuard {
            budget: &budget,
            id,
            armed: true,
        };

        loop {
            let notified = budget.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut state = budget.lock();
                let now = Instant::now();
                state.prune(now);
                let is_head = state.head(now) == Some(id);
                match state.wait_time(now) {
                    None if is_head => {
                        state.remove_ticket(id);
                        state.admit(now);
                        drop(state);
                        guard.armed = false;
                        budget.notify.notify_waiters();
                        return Ok(());
                    }
                    Some(wait) if is_head => Some(wait),
                    _ => None,
                }
            };

            match wait {
                Some(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            // 자는 동안 다른 대기표가 head가 되었을 수 있음
                            let lost_head = {
                                let state = budget.lock();
                                state.head(Instant::now()) != Some(id)
                            };
                            if lost_head {
                                budget.notify.notify_waiters();
                            }
                        }
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// 예산 안에서 작업을 실행합니다.
    pub async fn execute_with_rate_limit<T, F, Fut>(
        &self,
        identifier: &str,
        priority: i32,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire(identifier, priority).await?;
        operation().await
    }

    /// 최대 `concurrency`개씩 동시에 실행합니다. 항목 하나의 실패는 다른 항목에 영향을 주지 않습니다.
    pub async fn batch_execute<K, T, F, Fut>(
        &self,
        items: Vec<(K, F)>,
        identifier: &str,
        concurrency: usize,
        priority: i32,
    ) -> HashMap<K, Result<T>>
    where
        K: Eq + Hash,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let items = items
            .into_iter()
            .map(|(id, operation)| (id, move || Ok::<_, MarketError>(operation)))
            .collect();
        self.batch_execute_prepared(items, identifier, concurrency, priority)
            .await
    }

    /// `batch_execute`와 같지만, 항목마다 예산 슬롯을 요청하기 직전에 `prepare`를 호출합니다.
    ///
    /// `prepare`가 실패하면 슬롯을 쓰지 않고 그 에러가 항목의 결과가 됩니다.
    pub async fn batch_execute_prepared<K, T, P, F, Fut>(
        &self,
        items: Vec<(K, P)>,
        identifier: &str,
        concurrency: usize,
        priority: i32,
    ) -> HashMap<K, Result<T>>
    where
        K: Eq + Hash,
        P: FnOnce() -> Result<F>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        stream::iter(items.into_iter().map(|(id, prepare)| async move {
            let result = match prepare() {
                Ok(operation) => {
                    self.execute_with_rate_limit(identifier, priority, operation)
                        .await
                }
                Err(e) => Err(e),
            };
            (id, result)
        }))
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
    }

    /// 제공자가 요청 한도 초과를 알렸을 때 `retry_after` 동안 예산을 닫습니다.
    pub fn defer(&self, identifier: &str, retry_after: Duration) {
        let budget = self.budget(identifier);
        let mut state = budget.lock();
        let until = Instant::now() + retry_after;
        if state.blocked_until.map_or(true, |current| current < until) {
            state.blocked_until = Some(until);
            warn!(identifier, retry_after_ms = retry_after.as_millis() as u64, "Rate budget deferred by provider");
        }
    }

    /// 예산 상태 스냅샷.
    pub fn get_rate_limit_status(&self, identifier: &str) -> BudgetSnapshot {
        let budget = self.budget(identifier);
        let mut state = budget.lock();
        let now = Instant::now();
        state.prune(now);
        state.snapshot(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(max_requests: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateBudgetConfig::new(
            "test",
            max_requests,
            Duration::from_secs(window_secs),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit_immediately() {
        let limiter = limiter(3, 60);
        for _ in 0..3 {
            limiter.acquire("test", 0).await.unwrap();
        }
        let status = limiter.get_rate_limit_status("test");
        assert_eq!(status.count, 3);
        assert_eq!(status.remaining, 0);
        assert!(status.reset_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_next_window() {
        let limiter = limiter(1, 10);
        let start = Instant::now();
        limiter.acquire("test", 0).await.unwrap();
        limiter.acquire("test", 0).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_overflow_fails_fast() {
        let limiter = Arc::new(RateLimiter::new(
            RateBudgetConfig::new("test", 1, Duration::from_secs(60)).with_queue_depth(1),
        ));
        limiter.acquire("test", 0).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire("test", 0).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.get_rate_limit_status("test").queued, 1);

        let rejected = limiter.acquire("test", 0).await;
        assert!(matches!(rejected, Err(MarketError::RateLimitExceeded { .. })));
        assert_eq!(limiter.get_rate_limit_status("test").total_rejected, 1);

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_leaves_queue() {
        let limiter = limiter(1, 60);
        limiter.acquire("test", 0).await.unwrap();

        let pending = tokio::time::timeout(Duration::from_secs(1), limiter.acquire("test", 0)).await;
        assert!(pending.is_err());
        assert_eq!(limiter.get_rate_limit_status("test").queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_defer_blocks_budget() {
        let limiter = limiter(10, 60);
        limiter.defer("test", Duration::from_secs(5));
        assert_eq!(limiter.get_rate_limit_status("test").remaining, 0);

        let start = Instant::now();
        limiter.acquire("test", 0).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_execute_isolates_failures() {
        let limiter = limiter(100, 60);
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let items: Vec<(&str, _)> = ["AAA", "BBB", "CCC"]
            .into_iter()
            .map(|symbol| {
                (symbol, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if symbol == "BBB" {
                        Err(MarketError::SymbolNotFound(symbol.to_string()))
                    } else {
                        Ok(symbol.len())
                    }
                })
            })
            .collect();

        let results = limiter.batch_execute(items, "test", 2, 0).await;
        assert_eq!(results.len(), 3);
        assert!(results["AAA"].is_ok());
        assert!(results["BBB"].is_err());
        assert!(results["CCC"].is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budgets_are_independent() {
        let limiter = limiter(1, 60);
        limiter.acquire("a", 0).await.unwrap();
        limiter.acquire("b", 0).await.unwrap();
        assert_eq!(limiter.get_rate_limit_status("a").count, 1);
        assert_eq!(limiter.get_rate_limit_status("b").count, 1);
    }
}
