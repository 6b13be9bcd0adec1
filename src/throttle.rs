use std::cmp::max;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

// Timers only have millisecond granularity. Closer than this to the next admission the
// throttle admits right away, which never accrues credit as the schedule stays anchored.
const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

/// Limits how fast actions are admitted to execution across all workers.
///
/// Workers call [`Throttle::take`] before executing each action. When enabled, `take`
/// hands a token over a zero capacity [`flume`](https://docs.rs/flume) channel to the
/// throttle task, which only accepts one token every `1 / rate` seconds. Waiting workers
/// are admitted in the order they arrived. Idle time never accrues credit, so admissions
/// are never bursty.
#[derive(Clone, Debug)]
pub struct Throttle {
    admissions: Option<flume::Sender<()>>,
}
impl Throttle {
    /// A throttle that admits everything immediately.
    pub fn disabled() -> Self {
        Throttle { admissions: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.admissions.is_some()
    }

    /// Wait until admitted.
    pub async fn take(&self) {
        if let Some(admissions) = self.admissions.as_ref() {
            // Only fails if the throttle task is gone, then nothing is throttled.
            if admissions.send_async(()).await.is_err() {
                debug!("throttle closed, admitting without delay");
            }
        }
    }
}

/// Start a throttle admitting at most `rate` actions per second. A rate of 0 disables
/// throttling and no task is started.
///
/// The throttle task exits once every clone of the returned [`Throttle`] is dropped.
pub fn start(rate: usize) -> (Throttle, Option<JoinHandle<()>>) {
    if rate == 0 {
        return (Throttle::disabled(), None);
    }
    let (sender, receiver) = flume::bounded(0);
    let handle = tokio::spawn(throttle_main(rate, receiver));
    (
        Throttle {
            admissions: Some(sender),
        },
        Some(handle),
    )
}

async fn throttle_main(rate: usize, receiver: flume::Receiver<()>) {
    let period = Duration::from_secs_f64(1.0 / rate as f64);
    info!("throttle allowing 1 action every {:?}", period);

    let mut admitted: usize = 0;
    // The earliest instant the next admission may happen.
    let mut next = Instant::now();
    loop {
        if next.saturating_duration_since(Instant::now()) > TIMER_RESOLUTION {
            time::sleep_until(next - TIMER_RESOLUTION).await;
        }

        if receiver.recv_async().await.is_err() {
            break;
        }
        admitted += 1;
        next = max(next, Instant::now()) + period;
    }
    info!("throttle closed after {} admissions", admitted);
}
