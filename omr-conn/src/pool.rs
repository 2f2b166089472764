// =====================
// 有界引擎进程池（复用识别引擎）
// =====================

use crate::engine::{EngineOptions, EngineProcess};
use crate::{Recognition, RecognizeError, Recognizer};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const CIRCUIT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
const CIRCUIT_COOLDOWN_SECS: u64 = 30;
const MAX_POOL_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    open_until_epoch: Option<SystemTime>,
}

#[derive(Default)]
struct Slots {
    idle: Vec<EngineProcess>,
    spawned: usize,
}

pub struct EnginePool {
    slots: Mutex<Slots>,
    available: Condvar,
    circuit: Mutex<CircuitState>,
    options: EngineOptions,
    capacity: usize,
    started: AtomicU64,
    restarted: AtomicU64,
    failures: AtomicU64,
}

/// 借出的引擎，drop 时归还
struct EngineHandle<'a> {
    pool: &'a EnginePool,
    engine: Option<EngineProcess>,
}

impl EngineHandle<'_> {
    fn restart(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        match engine.restart() {
            Ok(()) => {
                self.pool.restarted.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(event = "engine.restart_failed", error = %err);
                // 丢弃坏进程，槽位交还给后续的懒创建
                self.engine = None;
            }
        }
    }
}

impl Drop for EngineHandle<'_> {
    fn drop(&mut self) {
        let mut slots = self.pool.slots.lock();
        match self.engine.take() {
            Some(engine) => slots.idle.push(engine),
            None => slots.spawned = slots.spawned.saturating_sub(1),
        }
        drop(slots);
        self.pool.available.notify_one();
    }
}

impl EnginePool {
    /// 启动进程池，第一个引擎立即启动作为可用性探测
    pub fn start(options: EngineOptions, capacity: usize) -> Result<Self, RecognizeError> {
        let capacity = capacity.clamp(1, MAX_POOL_CAPACITY);
        let probe = EngineProcess::spawn(options.clone())?;
        info!(
            event = "engine.pool.started",
            capacity,
            binary = %options.binary.display(),
            model = %options.model_path.display()
        );
        Ok(Self {
            slots: Mutex::new(Slots {
                idle: vec![probe],
                spawned: 1,
            }),
            available: Condvar::new(),
            circuit: Mutex::new(CircuitState::default()),
            options,
            capacity,
            started: AtomicU64::new(1),
            restarted: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    /// 识别引擎是 CPU 密集型，默认取物理核数的一半
    pub fn auto_capacity() -> usize {
        (num_cpus::get_physical() / 2).clamp(1, 8)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn acquire(&self) -> Result<EngineHandle<'_>, RecognizeError> {
        self.ensure_circuit_allows_acquire()?;

        let mut slots = self.slots.lock();
        loop {
            if let Some(engine) = slots.idle.pop() {
                return Ok(EngineHandle {
                    pool: self,
                    engine: Some(engine),
                });
            }

            if slots.spawned < self.capacity {
                slots.spawned += 1;
                drop(slots);
                return match EngineProcess::spawn(self.options.clone()) {
                    Ok(engine) => {
                        self.started.fetch_add(1, Ordering::Relaxed);
                        Ok(EngineHandle {
                            pool: self,
                            engine: Some(engine),
                        })
                    }
                    Err(err) => {
                        let mut slots = self.slots.lock();
                        slots.spawned = slots.spawned.saturating_sub(1);
                        drop(slots);
                        self.available.notify_one();
                        Err(err)
                    }
                };
            }

            self.available.wait(&mut slots);
        }
    }

    fn ensure_circuit_allows_acquire(&self) -> Result<(), RecognizeError> {
        let mut circuit = self.circuit.lock();
        if let Some(until) = circuit.open_until {
            let now = Instant::now();
            if until > now {
                let secs = until.saturating_duration_since(now).as_secs().max(1);
                return Err(RecognizeError::CircuitOpen(secs));
            }
            circuit.open_until = None;
            circuit.open_until_epoch = None;
            circuit.consecutive_failures = 0;
            info!(event = "engine.circuit.closed", "引擎池熔断期结束，恢复服务");
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut circuit = self.circuit.lock();
        circuit.consecutive_failures = 0;
        circuit.open_until = None;
        circuit.open_until_epoch = None;
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut circuit = self.circuit.lock();
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
        if circuit.consecutive_failures >= CIRCUIT_MAX_CONSECUTIVE_FAILURES {
            let cooldown = Duration::from_secs(CIRCUIT_COOLDOWN_SECS);
            circuit.open_until = Some(Instant::now() + cooldown);
            circuit.open_until_epoch = Some(SystemTime::now() + cooldown);
            circuit.consecutive_failures = 0;
            warn!(
                event = "engine.circuit.open",
                cooldown_secs = CIRCUIT_COOLDOWN_SECS,
                "引擎池因连续失败进入熔断"
            );
        }
    }

    pub fn stats(&self) -> PoolStats {
        let (idle, spawned) = {
            let slots = self.slots.lock();
            (slots.idle.len(), slots.spawned)
        };
        let circuit = self.circuit.lock();
        let now = Instant::now();
        PoolStats {
            capacity: self.capacity,
            spawned,
            idle,
            in_use: spawned.saturating_sub(idle),
            total_started: self.started.load(Ordering::Relaxed),
            total_restarted: self.restarted.load(Ordering::Relaxed),
            total_failures: self.failures.load(Ordering::Relaxed),
            consecutive_failures: circuit.consecutive_failures,
            circuit_open: circuit.open_until.is_some_and(|until| until > now),
            circuit_open_until_epoch: circuit
                .open_until_epoch
                .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
        }
    }
}

impl Recognizer for EnginePool {
    fn recognize(&self, image_path: &Path) -> Result<Recognition, RecognizeError> {
        let mut handle = self.acquire()?;

        let running = match handle.engine.as_mut() {
            Some(engine) => engine.is_running(),
            None => false,
        };
        if !running {
            handle.restart();
        }
        let Some(engine) = handle.engine.as_mut() else {
            self.record_failure();
            return Err(RecognizeError::Protocol(
                "no live engine available".to_string(),
            ));
        };

        let result = engine.recognize(image_path);
        match &result {
            Ok(_) => self.record_success(),
            Err(err) if err.is_engine_fault() => {
                self.record_failure();
                handle.restart();
            }
            Err(err) => {
                info!(event = "engine.rejected", error = %err, "图片被引擎拒绝，不计入引擎失败");
            }
        }
        result
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub spawned: usize,
    pub idle: usize,
    pub in_use: usize,
    pub total_started: u64,
    pub total_restarted: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub circuit_open: bool,
    pub circuit_open_until_epoch: Option<u64>,
}
