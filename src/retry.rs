use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, interval: Duration) -> Self {
        Self { retries, interval }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now().checked_add(budget),
        }
    }

    pub fn none() -> Self {
        Self { expires_at: None }
    }

    pub fn expired(&self) -> bool {
        self.expires_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }

    fn allows_sleep(&self, interval: Duration) -> bool {
        match self.expires_at {
            Some(at) => Instant::now()
                .checked_add(interval)
                .is_some_and(|wake| wake < at),
            None => true,
        }
    }
}

#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub error: E,
}

pub fn retry<T, E, F, P>(
    policy: &RetryPolicy,
    deadline: &Deadline,
    is_retryable: P,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Result<T, E>,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(error) => {
                let can_retry = attempt < max_attempts
                    && is_retryable(&error)
                    && deadline.allows_sleep(policy.interval);
                if !can_retry {
                    return Err(Exhausted {
                        attempts: attempt,
                        error,
                    });
                }
                tracing::debug!(attempt, max_attempts, "retrying after failure");
                thread::sleep(policy.interval);
            }
        }
    }
}
