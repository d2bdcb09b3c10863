//! # 中断シグナル
//!
//! ストリーム (または HTTP/1.1 のリクエスト) ごとに 1 つ持ち、
//! RST_STREAM・GOAWAY・コネクションエラー・タイムアウト・アプリケーションの
//! いずれから中断されても同じ [`AbortReason`] を全員が観測します。
//! 最初の `abort` だけが有効で、通知は 1 回しか行われません。

use std::cell::RefCell;
use std::rc::Rc;

use futures::channel::oneshot;

use super::AbortReason;

type AbortCallback = Box<dyn FnOnce(&AbortReason)>;

#[derive(Default)]
struct AbortInner {
    reason: Option<AbortReason>,
    callbacks: Vec<AbortCallback>,
    waiters: Vec<oneshot::Sender<()>>,
}

/// 中断シグナル
#[derive(Clone, Default)]
pub struct AbortToken(Rc<RefCell<AbortInner>>);

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 中断する。既に中断済みなら何もせず `false`
    pub fn abort(&self, reason: AbortReason) -> bool {
        let (callbacks, waiters) = {
            let mut inner = self.0.borrow_mut();
            if inner.reason.is_some() {
                return false;
            }
            inner.reason = Some(reason.clone());
            (std::mem::take(&mut inner.callbacks), std::mem::take(&mut inner.waiters))
        };

        // コールバックから再度 abort されても借用が衝突しないよう、借用を外してから呼ぶ
        for callback in callbacks {
            callback(&reason);
        }
        for waiter in waiters {
            let _ = waiter.send(());
        }
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.0.borrow().reason.is_some()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.0.borrow().reason.clone()
    }

    /// 中断時のコールバックを登録。中断済みなら即座に呼ぶ
    pub fn on_abort(&self, callback: impl FnOnce(&AbortReason) + 'static) {
        let reason = {
            let mut inner = self.0.borrow_mut();
            match &inner.reason {
                Some(reason) => reason.clone(),
                None => {
                    inner.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&reason);
    }

    /// 中断されるまで待つ
    pub async fn aborted(&self) -> AbortReason {
        let rx = {
            let mut inner = self.0.borrow_mut();
            if let Some(reason) = &inner.reason {
                return reason.clone();
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);
            rx
        };
        let _ = rx.await;
        self.reason().unwrap_or(AbortReason::Application)
    }
}

impl std::fmt::Debug for AbortToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AbortToken").field(&self.0.borrow().reason).finish()
    }
}
