use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Fraction(f64),
    Completed,
    Failed(String),
}

#[derive(Debug)]
struct ChannelState {
    last: f64,
    terminated: bool,
}

/// Per-operation progress sink. Emission is strictly increasing and exactly
/// one terminal event is ever forwarded; everything after the terminal event
/// is dropped. Cloneable so an operation can hand it to its transfer task and
/// still deliver the terminal event itself.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    inner: Arc<ProgressInner>,
}

#[derive(Debug)]
struct ProgressInner {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    state: Mutex<ChannelState>,
}

pub fn progress_channel() -> (ProgressSender, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ProgressSender {
            inner: Arc::new(ProgressInner {
                tx,
                state: Mutex::new(ChannelState {
                    last: f64::NEG_INFINITY,
                    terminated: false,
                }),
            }),
        },
        rx,
    )
}

impl ProgressSender {
    /// Forward `fraction` unless it regresses or the channel is terminated.
    pub fn emit(&self, fraction: f64) {
        let mut state = self.inner.state.lock().expect("progress lock poisoned");
        if state.terminated || fraction <= state.last {
            return;
        }
        state.last = fraction;
        let _ = self.inner.tx.send(ProgressEvent::Fraction(fraction));
    }

    pub fn complete(&self) {
        self.terminal(ProgressEvent::Completed);
    }

    pub fn fail(&self, message: impl Into<String>) {
        self.terminal(ProgressEvent::Failed(message.into()));
    }

    fn terminal(&self, event: ProgressEvent) {
        let mut state = self.inner.state.lock().expect("progress lock poisoned");
        if state.terminated {
            return;
        }
        state.terminated = true;
        let _ = self.inner.tx.send(event);
    }
}
