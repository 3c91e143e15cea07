//! Change notification: IDLE controller and NOOP polling fallback
//!
//! Both modes surface the same event stream: EXISTS/RECENT/EXPUNGE/
//! FETCH notifications translated to typed events, everything else as
//! raw notifications. `stop()` leaves the idle state with `DONE` (or
//! cancels the poll loop) and releases the session's watch slot.

use crate::engine::{Engine, IdleHandle};
use crate::error::{Error, Result};
use crate::parser::{FetchValue, UntaggedData, UntaggedResponse};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

/// One mailbox change notification.
#[derive(Debug)]
pub enum WatchEvent {
    /// New message count (`* N EXISTS`).
    Exists(u32),
    /// Recent count (`* N RECENT`).
    Recent(u32),
    /// A message was removed (`* N EXPUNGE`).
    Expunge(u32),
    /// Flag or attribute change pushed by the server.
    Fetch {
        seqno: u32,
        flags: Option<Vec<String>>,
        uid: Option<u32>,
    },
    /// Any other untagged response, parsed.
    Notification(UntaggedResponse),
    /// The watch failed; no further events follow.
    Error(Error),
    /// The notification stream ended.
    End,
}

fn translate(response: UntaggedResponse) -> WatchEvent {
    let translated = match (&response.data, response.kind.as_str()) {
        (UntaggedData::Count { number, .. }, "EXISTS") => Some(WatchEvent::Exists(*number)),
        (UntaggedData::Count { number, .. }, "RECENT") => Some(WatchEvent::Recent(*number)),
        (UntaggedData::Count { number, .. }, "EXPUNGE") => Some(WatchEvent::Expunge(*number)),
        (UntaggedData::Fetch { seqno, attributes }, _) => {
            let flags = attributes.iter().find_map(|(key, value)| match value {
                FetchValue::List(flags) if key == "FLAGS" => Some(flags.clone()),
                _ => None,
            });
            let uid = attributes.iter().find_map(|(key, value)| match value {
                FetchValue::Text(text) if key == "UID" => text.parse().ok(),
                _ => None,
            });
            Some(WatchEvent::Fetch {
                seqno: *seqno,
                flags,
                uid,
            })
        }
        _ => None,
    };
    translated.unwrap_or_else(|| WatchEvent::Notification(response))
}

enum Mode {
    Idle {
        engine: Engine,
        handle: Option<IdleHandle>,
    },
    Poll {
        stop: Option<oneshot::Sender<()>>,
    },
}

/// Live subscription to mailbox changes, returned by `Session::idle`
/// and `Session::watch`.
pub struct MailboxWatch {
    events: mpsc::Receiver<WatchEvent>,
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
    mode: Mode,
}

impl MailboxWatch {
    /// Receive the next event; `None` after the stream ends.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Leave the watch: send `DONE` and await the tagged completion
    /// (IDLE mode) or cancel the poll loop. A no-op when the
    /// transport already closed.
    pub async fn stop(mut self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        let result = match &mut self.mode {
            Mode::Idle { engine, handle } => match handle.take() {
                Some(handle) => engine.finish_idle(handle, None).await.map(|_| ()),
                None => Ok(()),
            },
            Mode::Poll { stop } => {
                if let Some(stop) = stop.take() {
                    let _ = stop.send(());
                }
                Ok(())
            }
        };
        self.task.abort();
        result
    }

    fn claim(active: &Arc<AtomicBool>) -> Result<()> {
        if active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::protocol(
                "another watch is already active on this session",
                "",
            ));
        }
        Ok(())
    }

    /// Enter IDLE and translate pushed notifications.
    pub(crate) async fn start_idle(engine: Engine, active: Arc<AtomicBool>) -> Result<Self> {
        Self::claim(&active)?;
        // Subscribe before entering idle so nothing pushed right
        // after the continuation is missed.
        let mut subscription = engine.subscribe();
        let handle = match engine.enter_idle(None).await {
            Ok(handle) => handle,
            Err(e) => {
                active.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let (events_tx, events_rx) = mpsc::channel(64);
        let task = tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(response) => {
                        if events_tx.send(translate(response)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("watch lagged, {skipped} notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = events_tx.send(WatchEvent::End).await;
                        break;
                    }
                }
            }
        });

        Ok(Self {
            events: events_rx,
            active,
            task,
            mode: Mode::Idle {
                engine,
                handle: Some(handle),
            },
        })
    }

    /// Poll with NOOP on a fixed interval, surfacing each round's
    /// untagged responses through the same event stream.
    pub(crate) fn start_polling(
        engine: Engine,
        active: Arc<AtomicBool>,
        interval: Duration,
    ) -> Result<Self> {
        Self::claim(&active)?;
        let (events_tx, events_rx) = mpsc::channel(64);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let poll_engine = engine;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match poll_engine.execute("NOOP", None).await {
                            Ok(outcome) => {
                                for response in outcome.untagged {
                                    if events_tx.send(translate(response)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = events_tx.send(WatchEvent::Error(e)).await;
                                let _ = events_tx.send(WatchEvent::End).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            events: events_rx,
            active,
            task,
            mode: Mode::Poll {
                stop: Some(stop_tx),
            },
        })
    }
}

impl Drop for MailboxWatch {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ResponseLine, parse_untagged};

    fn untagged(text: &str) -> UntaggedResponse {
        parse_untagged(&ResponseLine::new(text)).unwrap()
    }

    #[test]
    fn translation() {
        assert!(matches!(
            translate(untagged("* 173 EXISTS")),
            WatchEvent::Exists(173)
        ));
        assert!(matches!(
            translate(untagged("* 3 EXPUNGE")),
            WatchEvent::Expunge(3)
        ));
        assert!(matches!(
            translate(untagged("* 2 RECENT")),
            WatchEvent::Recent(2)
        ));
        match translate(untagged("* 5 FETCH (UID 99 FLAGS (\\Seen))")) {
            WatchEvent::Fetch { seqno, flags, uid } => {
                assert_eq!(seqno, 5);
                assert_eq!(flags.unwrap(), vec!["\\Seen"]);
                assert_eq!(uid, Some(99));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            translate(untagged("* OK still here")),
            WatchEvent::Notification(_)
        ));
    }
}
