//! シミュレーション時間
//!
//! ナノ秒単位の単調増加時刻。`NEVER` はすべての実時刻より後に並ぶ番兵。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// シミュレーション時刻（ナノ秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);
    /// 決して来ない時刻
    pub const NEVER: SimTime = SimTime(u64::MAX);

    pub const fn from_nsec(ns: u64) -> Self {
        SimTime(ns)
    }

    pub const fn from_usec(us: u64) -> Self {
        SimTime(us * 1_000)
    }

    pub const fn from_msec(ms: u64) -> Self {
        SimTime(ms * 1_000_000)
    }

    #[inline]
    pub const fn as_nsec(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_never(self) -> bool {
        self.0 == u64::MAX
    }

    /// 符号付きオフセットを加える（NEVERはNEVERのまま）
    #[inline]
    pub fn offset(self, delta: i64) -> SimTime {
        if self.is_never() {
            return self;
        }
        if delta >= 0 {
            SimTime(self.0.saturating_add(delta as u64))
        } else {
            SimTime(self.0.saturating_sub(delta.unsigned_abs()))
        }
    }

    /// `self - earlier` を符号付きで返す
    #[inline]
    pub fn delta_from(self, earlier: SimTime) -> i64 {
        self.0 as i64 - earlier.0 as i64
    }

    /// 整数倍
    #[inline]
    pub fn times(self, n: u64) -> SimTime {
        SimTime(self.0.saturating_mul(n))
    }
}

impl Add for SimTime {
    type Output = SimTime;

    #[inline]
    fn add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl Sub for SimTime {
    type Output = SimTime;

    #[inline]
    fn sub(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            write!(f, "never")
        } else {
            write!(f, "{}.{:03}us", self.0 / 1_000, self.0 % 1_000)
        }
    }
}
