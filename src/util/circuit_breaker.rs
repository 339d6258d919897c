use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use crate::error::PipelineError;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Guards the sink stage's ClickHouse connection pool (§4.8). One instance
/// per sink — there is no process-wide circuit breaker, since all state in
/// this crate is owned per-pipeline (§9, "Global mutable state: None").
pub struct CircuitBreaker {
    state: AtomicU8,
    error_count: AtomicU64,
    last_error_time: Arc<Mutex<Option<Instant>>>,
    last_state_change: Arc<Mutex<Instant>>,

    errors_to_open: u64,
    window_ms: u64,
    cooldown_ms: u64,
}

impl CircuitBreaker {
    pub fn new(errors_to_open: u64, window: Duration, cooldown: Duration) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            error_count: AtomicU64::new(0),
            last_error_time: Arc::new(Mutex::new(None)),
            last_state_change: Arc::new(Mutex::new(Instant::now())),
            errors_to_open,
            window_ms: window.as_millis() as u64,
            cooldown_ms: cooldown.as_millis() as u64,
        }
    }

    pub async fn call<F, T>(&self, op: &str, f: F) -> Result<T, PipelineError>
    where
        F: std::future::Future<Output = Result<T, PipelineError>>,
    {
        // Check if circuit is open
        let current_state = self.get_state().await;
        
        match current_state {
            CircuitState::Open => {
                metrics::inc_clickhouse_errors(op);
                Err(PipelineError::transient(
                    "circuit breaker open - clickhouse unavailable",
                ))
            },
            CircuitState::HalfOpen => {
                // Allow one probe request
                match f.await {
                    Ok(result) => {
                        // Success - close the circuit
                        self.close().await;
                        Ok(result)
                    }
                    Err(e) => {
                        // Failed - reopen
                        self.open().await;
                        metrics::inc_clickhouse_errors(op);
                        Err(e)
                    }
                }
            },
            CircuitState::Closed => {
                // Normal operation
                match f.await {
                    Ok(result) => {
                        // Reset error count on success
                        self.error_count.store(0, Ordering::Relaxed);
                        Ok(result)
                    }
                    Err(e) => {
                        self.record_error().await;
                        metrics::inc_clickhouse_errors(op);
                        Err(e)
                    }
                }
            }
        }
    }
    
    async fn get_state(&self) -> CircuitState {
        let state = CircuitState::from(self.state.load(Ordering::Relaxed));
        
        // Check if we should transition from Open to HalfOpen
        if state == CircuitState::Open {
            let last_change = *self.last_state_change.lock().await;
            if last_change.elapsed() > Duration::from_millis(self.cooldown_ms) {
                self.state.store(CircuitState::HalfOpen as u8, Ordering::Relaxed);
                self.update_metrics();
                return CircuitState::HalfOpen;
            }
        }
        
        state
    }
    
    async fn record_error(&self) {
        let mut last_error = self.last_error_time.lock().await;
        let now = Instant::now();
        
        // Check if we're within the error window
        if let Some(last) = *last_error {
            if last.elapsed() > Duration::from_millis(self.window_ms) {
                // Reset counter if outside window
                self.error_count.store(1, Ordering::Relaxed);
            } else {
                // Increment counter
                let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.errors_to_open {
                    self.open().await;
                }
            }
        } else {
            self.error_count.store(1, Ordering::Relaxed);
        }
        
        *last_error = Some(now);
    }
    
    async fn open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Relaxed);
        *self.last_state_change.lock().await = Instant::now();
        self.update_metrics();
    }
    
    async fn close(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Relaxed);
        self.error_count.store(0, Ordering::Relaxed);
        *self.last_state_change.lock().await = Instant::now();
        self.update_metrics();
    }
    
    fn update_metrics(&self) {
        let state = CircuitState::from(self.state.load(Ordering::Relaxed));
        
        // Update all states to 0 first
        metrics::set_clickhouse_circuit_state("closed", 0);
        metrics::set_clickhouse_circuit_state("open", 0);
        metrics::set_clickhouse_circuit_state("half_open", 0);
        
        // Set current state to 1
        match state {
            CircuitState::Closed => metrics::set_clickhouse_circuit_state("closed", 1),
            CircuitState::Open => metrics::set_clickhouse_circuit_state("open", 1),
            CircuitState::HalfOpen => metrics::set_clickhouse_circuit_state("half_open", 1),
        }
    }
    
    pub fn is_healthy(&self) -> bool {
        self.state.load(Ordering::Relaxed) == CircuitState::Closed as u8
    }
}

/// Classify a raw ClickHouse error into a `PipelineError`, used by the sink
/// stage to decide retry vs. split-and-DLQ (§4.8).
pub fn wrap_ch_error(e: clickhouse::error::Error) -> PipelineError {
    let msg = e.to_string();
    if msg.contains("timeout") || msg.contains("Timeout") || msg.contains("connection") {
        PipelineError::transient(format!("clickhouse: {msg}"))
    } else {
        let trimmed = if msg.len() > 200 {
            format!("{}...", &msg[..200])
        } else {
            msg
        };
        PipelineError::permanent(format!("clickhouse: {trimmed}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_errors() {
        let cb = CircuitBreaker::new(5, Duration::from_secs(60), Duration::from_secs(5));

        for _ in 0..5 {
            cb.record_error().await;
        }

        assert_eq!(cb.get_state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_circuit_breaker_transitions_to_half_open() {
        let cb = CircuitBreaker::new(5, Duration::from_secs(60), Duration::from_millis(10));

        cb.open().await;
        assert_eq!(cb.get_state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.get_state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_circuit() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(60), Duration::from_millis(1));
        cb.record_error().await;
        cb.record_error().await;
        assert_eq!(cb.get_state().await, CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result: Result<(), PipelineError> = cb.call("probe", async { Ok(()) }).await;
        assert!(result.is_ok());
        assert!(cb.is_healthy());
    }
}
