//! # ハートビート
//!
//! ワーカースレッドごとに 1 つ動き、登録された全コネクションの
//! [`TimeoutControl::tick`] を一定間隔で呼び出します。
//! 登録は弱参照なので、コネクションが破棄されれば次のティックで自動的に外れます。

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use super::control::TimeoutControl;
use super::HEARTBEAT_INTERVAL;

#[derive(Default)]
struct Registry {
    controls: RefCell<Vec<Weak<TimeoutControl>>>,
    stopped: Cell<bool>,
}

/// ハートビート
#[derive(Clone)]
pub struct Heartbeat {
    registry: Rc<Registry>,
    interval: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(HEARTBEAT_INTERVAL)
    }
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self { registry: Rc::new(Registry::default()), interval }
    }

    /// コネクションのタイムアウト制御を登録
    pub fn register(&self, control: &Rc<TimeoutControl>) {
        self.registry.controls.borrow_mut().push(Rc::downgrade(control));
    }

    /// 生きている登録数
    pub fn len(&self) -> usize {
        self.registry.controls.borrow().iter().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 全コネクションを 1 回ティックし、破棄されたものを取り除く
    pub fn tick_all(&self, now: Instant) {
        let live: Vec<Rc<TimeoutControl>> = {
            let mut controls = self.registry.controls.borrow_mut();
            controls.retain(|w| w.strong_count() > 0);
            controls.iter().filter_map(Weak::upgrade).collect()
        };
        // ハンドラが新しい登録を行っても借用が衝突しないよう、ロック外でティックする
        for control in live {
            control.tick(now);
        }
    }

    /// monoio タスクとして定期ティックを開始
    pub fn spawn(&self) {
        let heartbeat = self.clone();
        monoio::spawn(async move {
            while !heartbeat.registry.stopped.get() {
                monoio::time::sleep(heartbeat.interval).await;
                heartbeat.tick_all(Instant::now());
            }
            ftlog::debug!("[Timeout] Heartbeat stopped");
        });
    }

    /// 定期ティックを停止
    pub fn stop(&self) {
        self.registry.stopped.set(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeout::{FixedDebugger, TimeoutReason};

    #[test]
    fn test_dropped_controls_are_unregistered() {
        let heartbeat = Heartbeat::default();
        let now = Instant::now();
        let fired = Rc::new(Cell::new(0));

        let handler_fired = fired.clone();
        let control = Rc::new(TimeoutControl::with_debugger(
            move |_: TimeoutReason| handler_fired.set(handler_fired.get() + 1),
            FixedDebugger(false),
            now,
        ));
        control.set_timeout(Duration::ZERO, TimeoutReason::KeepAlive);
        heartbeat.register(&control);

        let other = Rc::new(TimeoutControl::with_debugger(|_: TimeoutReason| {}, FixedDebugger(false), now));
        heartbeat.register(&other);
        assert_eq!(heartbeat.len(), 2);

        drop(other);
        heartbeat.tick_all(now + Duration::from_secs(2));
        assert_eq!(fired.get(), 1);
        assert_eq!(heartbeat.len(), 1);
    }

    #[test]
    fn test_spawned_heartbeat_ticks() {
        let mut rt = monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
            .enable_timer()
            .build()
            .unwrap();
        rt.block_on(async {
            let heartbeat = Heartbeat::new(Duration::from_millis(10));
            let fired = Rc::new(Cell::new(false));
            let handler_fired = fired.clone();
            let control = Rc::new(TimeoutControl::with_debugger(
                move |_: TimeoutReason| handler_fired.set(true),
                FixedDebugger(false),
                Instant::now(),
            ));
            // 締め切りは最後のティック + ハートビート (1s) なので、書き込み計測で確認する
            let rate = crate::timeout::MinDataRate::new(1e9, Duration::ZERO);
            let _handle = control.start_timing_write(rate, 1);
            heartbeat.register(&control);
            heartbeat.spawn();

            monoio::time::sleep(Duration::from_millis(1300)).await;
            heartbeat.stop();
            assert!(fired.get());
        });
    }
}
