//! Injectable time source.
//!
//! Every deadline, idle check and persisted timestamp in this crate goes
//! through a `Clock` instead of calling `Instant::now`/`Utc::now` directly,
//! so manager/session tests can advance time deterministically instead of
//! sleeping real wall-clock seconds.

use std::time::Instant;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now_instant(&self) -> Instant;
    fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    pub struct FakeClock {
        instant: Mutex<Instant>,
        utc: Mutex<DateTime<Utc>>,
    }

    impl FakeClock {
        pub fn new() -> Self {
            Self {
                instant: Mutex::new(Instant::now()),
                utc: Mutex::new(DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default()),
            }
        }

        pub fn advance(&self, d: Duration) {
            #[allow(clippy::unwrap_used)]
            let mut i = self.instant.lock().unwrap();
            *i += d;
            #[allow(clippy::unwrap_used)]
            let mut u = self.utc.lock().unwrap();
            *u += chrono::Duration::from_std(d).unwrap_or_default();
        }
    }

    impl Clock for FakeClock {
        fn now_instant(&self) -> Instant {
            #[allow(clippy::unwrap_used)]
            {
                *self.instant.lock().unwrap()
            }
        }

        fn now_utc(&self) -> DateTime<Utc> {
            #[allow(clippy::unwrap_used)]
            {
                *self.utc.lock().unwrap()
            }
        }
    }
}
