//! Fixed-size interpreter pool.
//!
//! Each slot is a dedicated OS thread that evaluates JavaScript programs in a
//! fresh engine context. Checkout blocks (asynchronously) while every slot
//! is busy; dropping the [`PooledInterpreter`] hands the slot back, also
//! when the evaluation panicked.

use crate::error::ScriptError;
use crate::scatter::panic_message;
use boa_engine::{Context, Source};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Engine threads get a generous stack: the interpreter recurses deeply on
/// nested scripts.
const INTERPRETER_STACK_SIZE: usize = 16 * 1024 * 1024;

struct Job {
    program: String,
    reply: oneshot::Sender<Result<String, ScriptError>>,
}

struct Inner {
    slots: Vec<Sender<Job>>,
    free: Mutex<Vec<usize>>,
    permits: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct InterpreterPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for InterpreterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterPool")
            .field("size", &self.size())
            .field("available", &self.available())
            .finish()
    }
}

impl InterpreterPool {
    pub fn new(size: usize) -> Result<Self, ScriptError> {
        let size = size.max(1);
        let mut slots = Vec::with_capacity(size);
        for index in 0..size {
            let (tx, rx) = unbounded::<Job>();
            std::thread::Builder::new()
                .name(format!("sum-interpreter-{index}"))
                .stack_size(INTERPRETER_STACK_SIZE)
                .spawn(move || {
                    for job in rx.iter() {
                        let outcome = catch_unwind(AssertUnwindSafe(|| evaluate(&job.program)))
                            .unwrap_or_else(|panic| {
                                Err(ScriptError::Runtime(format!(
                                    "interpreter panicked: {}",
                                    panic_message(panic)
                                )))
                            });
                        let _ = job.reply.send(outcome);
                    }
                    debug!(slot = index, "interpreter thread stopped");
                })
                .map_err(|e| ScriptError::Spawn(e.to_string()))?;
            slots.push(tx);
        }
        Ok(Self {
            inner: Arc::new(Inner {
                slots,
                free: Mutex::new((0..size).rev().collect()),
                permits: Arc::new(Semaphore::new(size)),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Wait for a free interpreter.
    pub async fn checkout(&self) -> Result<PooledInterpreter, ScriptError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ScriptError::PoolClosed)?;
        let slot = self.inner.free.lock().pop().ok_or(ScriptError::PoolClosed)?;
        Ok(PooledInterpreter {
            inner: self.inner.clone(),
            slot,
            _permit: permit,
        })
    }

    /// Check out an interpreter, evaluate `program` and give it back.
    pub async fn eval(&self, program: String) -> Result<String, ScriptError> {
        self.checkout().await?.eval(program).await
    }
}

/// Exclusive use of one pool slot.
pub struct PooledInterpreter {
    inner: Arc<Inner>,
    slot: usize,
    _permit: OwnedSemaphorePermit,
}

impl PooledInterpreter {
    /// Evaluate `program` and return its completion value as a string.
    pub async fn eval(&self, program: String) -> Result<String, ScriptError> {
        let (reply, outcome) = oneshot::channel();
        self.inner.slots[self.slot]
            .send(Job { program, reply })
            .map_err(|_| ScriptError::PoolClosed)?;
        outcome.await.map_err(|_| ScriptError::PoolClosed)?
    }
}

impl Drop for PooledInterpreter {
    fn drop(&mut self) {
        self.inner.free.lock().push(self.slot);
    }
}

fn evaluate(program: &str) -> Result<String, ScriptError> {
    let mut context = Context::default();
    let value = context
        .eval(Source::from_bytes(program.as_bytes()))
        .map_err(|e| ScriptError::Runtime(e.to_string()))?;
    let text = value
        .to_string(&mut context)
        .map_err(|e| ScriptError::Runtime(e.to_string()))?;
    Ok(text.to_std_string_escaped())
}
