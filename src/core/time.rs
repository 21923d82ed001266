//! Wall-clock time with a swappable source for tests.

use std::sync::{Arc, OnceLock, RwLock};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallClock(pub u64);

pub trait WallClockSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

struct SystemWallClockSource;

impl WallClockSource for SystemWallClockSource {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

fn wall_clock_source() -> &'static RwLock<Arc<dyn WallClockSource>> {
    static SOURCE: OnceLock<RwLock<Arc<dyn WallClockSource>>> = OnceLock::new();
    SOURCE.get_or_init(|| RwLock::new(Arc::new(SystemWallClockSource)))
}

impl WallClock {
    pub fn now() -> Self {
        let source = wall_clock_source()
            .read()
            .unwrap_or_else(|err| err.into_inner());
        Self(source.now_ms())
    }

    pub fn ms(self) -> u64 {
        self.0
    }
}

/// Install a custom wall-clock source. Tests use this to freeze time.
pub fn set_wall_clock_source(source: Arc<dyn WallClockSource>) {
    let lock = wall_clock_source();
    *lock.write().unwrap_or_else(|err| err.into_inner()) = source;
}
