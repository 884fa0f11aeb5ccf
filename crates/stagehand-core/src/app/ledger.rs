//! ResourceLedger - ワーカー 1 台分の容量と確保済みリソース
//!
//! 純粋な帳簿（I/O なし）。engine が std::sync::Mutex で包んで使う。

use tracing::warn;

use crate::domain::Resources;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLedger {
    capacity: Resources,
    committed: Resources,
}

impl ResourceLedger {
    pub fn new(capacity: Resources) -> Self {
        Self {
            capacity,
            committed: Resources::ZERO,
        }
    }

    pub fn capacity(&self) -> Resources {
        self.capacity
    }

    pub fn committed(&self) -> Resources {
        self.committed
    }

    /// まだ確保されていない容量
    pub fn available(&self) -> Resources {
        // committed <= capacity holds after every reserve/release
        self.capacity
            .checked_sub(&self.committed)
            .unwrap_or(Resources::ZERO)
    }

    pub fn fits(&self, cost: &Resources) -> bool {
        cost.fits_within(&self.available())
    }

    /// 収まるなら `cost` を確保する。超過確保はしない
    pub fn reserve(&mut self, cost: &Resources) -> bool {
        if !self.fits(cost) {
            return false;
        }
        match self.committed.checked_add(cost) {
            Some(committed) => {
                self.committed = committed;
                true
            }
            None => false,
        }
    }

    /// `reserve` で確保した分を返す
    ///
    /// 確保量を超える解放は帳簿のバグ（二重解放）。debug ビルドでは assert、
    /// release ビルドでは warn を出して無視する。
    pub fn release(&mut self, cost: &Resources) {
        match self.committed.checked_sub(cost) {
            Some(committed) => self.committed = committed,
            None => {
                debug_assert!(
                    false,
                    "release of {cost} exceeds committed {}",
                    self.committed
                );
                warn!(cost = %cost, committed = %self.committed, "ignoring over-release");
            }
        }
    }
}
