//! IdGenerator port - ID 生成の抽象化
//!
//! Task rows are created by whichever worker's poller gets there first, so ids
//! must be generated without coordination. ULIDs give that, and the increment
//! below keeps ids strictly increasing within one generator even when the
//! clock does not move (FixedClock in tests, or several ids in the same ms).

use std::sync::Mutex;

use ulid::Ulid;

use crate::domain::ids::{TaskId, WorkerId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_worker_id(&self) -> WorkerId;
}

/// UlidGenerator は ULID ベースの ID 生成器
pub struct UlidGenerator<C> {
    clock: C,
    last: Mutex<Option<Ulid>>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            last: Mutex::new(None),
        }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let candidate = Ulid::from_parts(timestamp_ms, rand::random());

        // a poisoned lock only means another thread panicked mid-generate;
        // the stored value is still a valid ulid
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = match *last {
            Some(prev) if candidate <= prev => prev.increment().unwrap_or(candidate),
            _ => candidate,
        };
        *last = Some(next);
        next
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_worker_id(&self) -> WorkerId {
        WorkerId::from(self.next_ulid())
    }
}
